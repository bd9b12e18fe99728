use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// The long-term identity key pair of a local actor.
///
/// Identity is an Ed25519 keypair. The same secret, mapped to its X25519
/// form, takes part in the X3DH key agreement, so one 32-byte public key both
/// signs prekeys and anchors session derivation.
#[derive(Clone, ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from its 32-byte private key.
    pub fn from_private_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn from_private_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity private key must be 32 bytes".into()))?;
        Ok(Self::from_private_bytes(&bytes))
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Private key bytes, for the persistence collaborator only.
    pub fn private_key_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify `signature` over `message` against an Ed25519 identity key.
    pub fn verify(
        identity_key: &[u8; 32],
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let verifying_key =
            VerifyingKey::from_bytes(identity_key).map_err(|_| CryptoError::InvalidSignature)?;
        let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
        verifying_key
            .verify_strict(message, &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// X25519 secret for Diffie-Hellman, taken from the SHA-512-expanded
    /// scalar so that it pairs with [`Self::peer_dh_public`] on the other side.
    pub fn dh_secret(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.signing_key.to_scalar_bytes())
    }

    pub fn dh_public(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(&self.dh_secret())
    }

    /// Map a peer's Ed25519 identity key onto X25519 (Edwards to Montgomery).
    pub fn peer_dh_public(identity_key: &[u8; 32]) -> Result<x25519_dalek::PublicKey, CryptoError> {
        let verifying_key = VerifyingKey::from_bytes(identity_key)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid Ed25519 identity key: {e}")))?;
        Ok(x25519_dalek::PublicKey::from(
            verifying_key.to_montgomery().to_bytes(),
        ))
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Human-comparable fingerprint of a pair of identities.
///
/// Both sides compute the same value regardless of which key is "ours":
/// the keys are hashed in sorted order and rendered as twelve groups of
/// five digits.
pub fn fingerprint(a: &[u8; 32], b: &[u8; 32]) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(b"murmur-fingerprint-v1");
    hasher.update(first);
    hasher.update(second);
    let digest = hasher.finalize();

    let groups: Vec<String> = digest
        .chunks(2)
        .take(12)
        .map(|chunk| {
            let value = u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
            format!("{:05}", value % 100_000)
        })
        .collect();
    groups.join(" ")
}
