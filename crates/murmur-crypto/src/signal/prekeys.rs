//! Prekey material owned by the local key store.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::identity::IdentityKeyPair;
use crate::signal::bundle::{OneTimePreKeyPublic, SignedPreKeyPublic};
use crate::CryptoError;

/// An X25519 key pair.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct KeyPair {
    public: [u8; 32],
    private: [u8; 32],
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret(&StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_private_bytes(private: [u8; 32]) -> Self {
        Self::from_secret(&StaticSecret::from(private))
    }

    fn from_secret(secret: &StaticSecret) -> Self {
        Self {
            public: PublicKey::from(secret).to_bytes(),
            private: secret.to_bytes(),
        }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public
    }

    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.private)
    }

    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        self.secret()
            .diffie_hellman(&PublicKey::from(*their_public))
            .to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// A medium-term prekey signed by the identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub key_id: u32,
    pub key_pair: KeyPair,
    /// Ed25519 signature by the identity key over the X25519 public bytes.
    pub signature: Vec<u8>,
}

impl SignedPreKey {
    pub fn generate(identity: &IdentityKeyPair, key_id: u32) -> Self {
        let key_pair = KeyPair::generate();
        let signature = identity.sign(&key_pair.public_bytes()).to_vec();
        Self {
            key_id,
            key_pair,
            signature,
        }
    }

    pub fn public(&self) -> SignedPreKeyPublic {
        SignedPreKeyPublic {
            key_id: self.key_id,
            public_key: self.key_pair.public_bytes(),
            signature: self.signature.clone(),
        }
    }

    pub(crate) fn to_record(&self) -> Result<Vec<u8>, CryptoError> {
        bincode::serialize(self).map_err(|e| CryptoError::StorageFailure(format!("encode signed prekey: {e}")))
    }

    pub(crate) fn from_record(record: &[u8]) -> Result<Self, CryptoError> {
        bincode::deserialize(record)
            .map_err(|e| CryptoError::StorageFailure(format!("corrupt signed prekey record: {e}")))
    }
}

/// A single-use prekey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKey {
    pub key_id: u32,
    pub key_pair: KeyPair,
}

impl OneTimePreKey {
    pub fn generate(key_id: u32) -> Self {
        Self {
            key_id,
            key_pair: KeyPair::generate(),
        }
    }

    pub fn public(&self) -> OneTimePreKeyPublic {
        OneTimePreKeyPublic {
            key_id: self.key_id,
            public_key: self.key_pair.public_bytes(),
        }
    }

    pub(crate) fn to_record(&self) -> Result<Vec<u8>, CryptoError> {
        bincode::serialize(self).map_err(|e| CryptoError::StorageFailure(format!("encode prekey: {e}")))
    }

    pub(crate) fn from_record(record: &[u8]) -> Result<Self, CryptoError> {
        bincode::deserialize(record)
            .map_err(|e| CryptoError::StorageFailure(format!("corrupt prekey record: {e}")))
    }
}
