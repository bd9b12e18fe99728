//! X3DH session establishment.
//!
//! DH order (A = initiator, B = responder):
//!   DH1 = DH(IK_A, SPK_B)
//!   DH2 = DH(EK_A, IK_B)
//!   DH3 = DH(EK_A, SPK_B)
//!   DH4 = DH(EK_A, OPK_B)   only when B's bundle carried a one-time prekey
//!
//! Identity keys are Ed25519 and take part in DH through their X25519 form.
//! root_key || chain_key = HKDF-SHA256(ikm = 0xFF*32 || DH1..DH4, "MurmurX3DH").

use std::collections::VecDeque;

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::PublicKey as X25519Public;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::identity::IdentityKeyPair;
use crate::signal::bundle::PreKeyBundle;
use crate::signal::keystore::KeyStore;
use crate::signal::message::PreKeyMessage;
use crate::signal::prekeys::KeyPair;
use crate::signal::ratchet::root_step;
use crate::signal::state::{ChainState, PendingPreKey, ReceivingChain, SessionState};
use crate::signal::trust::{check_identity, IdentityTrustPolicy, TrustDecision};
use crate::CryptoError;

const X3DH_INFO: &[u8] = b"MurmurX3DH";

/// Output of the X3DH key agreement.
#[derive(Clone, ZeroizeOnDrop)]
pub struct X3dhSecrets {
    pub(crate) root_key: [u8; 32],
    pub(crate) chain_key: [u8; 32],
}

impl X3dhSecrets {
    pub fn root_key(&self) -> &[u8; 32] {
        &self.root_key
    }
}

fn derive_secrets(dh_outputs: &[[u8; 32]]) -> Result<X3dhSecrets, CryptoError> {
    if dh_outputs.iter().any(|dh| dh.iter().all(|b| *b == 0)) {
        return Err(CryptoError::InvalidKey("low-order key in handshake".into()));
    }

    let mut ikm = Vec::with_capacity(32 * (dh_outputs.len() + 1));
    ikm.extend_from_slice(&[0xFF; 32]);
    for dh in dh_outputs {
        ikm.extend_from_slice(dh);
    }

    let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32][..]), &ikm);
    let mut okm = [0u8; 64];
    hk.expand(X3DH_INFO, &mut okm)
        .expect("64-byte output is valid for HKDF-SHA256");
    ikm.zeroize();

    let mut secrets = X3dhSecrets {
        root_key: [0; 32],
        chain_key: [0; 32],
    };
    secrets.root_key.copy_from_slice(&okm[..32]);
    secrets.chain_key.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok(secrets)
}

/// Initiator side of the key agreement.
pub fn initiator_secrets(
    identity: &IdentityKeyPair,
    base_key: &KeyPair,
    bundle: &PreKeyBundle,
) -> Result<X3dhSecrets, CryptoError> {
    let their_identity = IdentityKeyPair::peer_dh_public(&bundle.identity_key)?;
    let their_signed_prekey = &bundle.signed_prekey.public_key;

    let mut dh = vec![
        identity
            .dh_secret()
            .diffie_hellman(&X25519Public::from(*their_signed_prekey))
            .to_bytes(),
        base_key.diffie_hellman(their_identity.as_bytes()),
        base_key.diffie_hellman(their_signed_prekey),
    ];
    if let Some(one_time) = &bundle.one_time_prekey {
        dh.push(base_key.diffie_hellman(&one_time.public_key));
    }
    let secrets = derive_secrets(&dh);
    dh.zeroize();
    secrets
}

/// Responder side of the key agreement; mirrors [`initiator_secrets`].
pub fn responder_secrets(
    identity: &IdentityKeyPair,
    signed_prekey: &KeyPair,
    one_time_prekey: Option<&KeyPair>,
    their_identity_key: &[u8; 32],
    their_base_key: &[u8; 32],
) -> Result<X3dhSecrets, CryptoError> {
    let their_identity = IdentityKeyPair::peer_dh_public(their_identity_key)?;

    let mut dh = vec![
        signed_prekey.diffie_hellman(their_identity.as_bytes()),
        identity
            .dh_secret()
            .diffie_hellman(&X25519Public::from(*their_base_key))
            .to_bytes(),
        signed_prekey.diffie_hellman(their_base_key),
    ];
    if let Some(one_time) = one_time_prekey {
        dh.push(one_time.diffie_hellman(their_base_key));
    }
    let secrets = derive_secrets(&dh);
    dh.zeroize();
    secrets
}

fn associated_data(initiator_identity: &[u8; 32], responder_identity: &[u8; 32]) -> Vec<u8> {
    let mut ad = Vec::with_capacity(64);
    ad.extend_from_slice(initiator_identity);
    ad.extend_from_slice(responder_identity);
    ad
}

/// Initial state for the side that ran [`initiator_secrets`].
///
/// The handshake's base key doubles as the first ratchet key, and the X3DH
/// chain key becomes the first sending chain.
pub(crate) fn initiator_state(
    secrets: &X3dhSecrets,
    base_key: KeyPair,
    local_identity_key: [u8; 32],
    remote_identity_key: [u8; 32],
    remote_registration_id: u32,
    signed_prekey_id: u32,
    one_time_prekey_id: Option<u32>,
) -> SessionState {
    SessionState {
        root_key: secrets.root_key,
        base_key: base_key.public_bytes(),
        local_ratchet: base_key,
        remote_ratchet: None,
        sending_chain: ChainState::new(secrets.chain_key),
        receiving_chains: VecDeque::new(),
        previous_counter: 0,
        skipped_keys: VecDeque::new(),
        local_identity_key,
        remote_identity_key,
        remote_registration_id,
        pending_prekey: Some(PendingPreKey {
            signed_prekey_id,
            one_time_prekey_id,
        }),
        associated_data: associated_data(&local_identity_key, &remote_identity_key),
        superseded_base_keys: VecDeque::new(),
    }
}

/// Initial state for the side that ran [`responder_secrets`].
///
/// The X3DH chain key receives the initiator's first chain; a fresh ratchet
/// key is mixed into the root right away so replies use a new chain.
pub(crate) fn responder_state(
    secrets: &X3dhSecrets,
    their_base_key: [u8; 32],
    local_identity_key: [u8; 32],
    remote_identity_key: [u8; 32],
    remote_registration_id: u32,
) -> SessionState {
    let local_ratchet = KeyPair::generate();
    let (root_key, sending_chain_key) =
        root_step(&secrets.root_key, &local_ratchet.diffie_hellman(&their_base_key));

    let mut receiving_chains = VecDeque::new();
    receiving_chains.push_back(ReceivingChain {
        ratchet_key: their_base_key,
        chain: ChainState::new(secrets.chain_key),
    });

    SessionState {
        root_key,
        local_ratchet,
        remote_ratchet: Some(their_base_key),
        sending_chain: ChainState::new(sending_chain_key),
        receiving_chains,
        previous_counter: 0,
        skipped_keys: VecDeque::new(),
        local_identity_key,
        remote_identity_key,
        remote_registration_id,
        base_key: their_base_key,
        pending_prekey: None,
        associated_data: associated_data(&remote_identity_key, &local_identity_key),
        superseded_base_keys: VecDeque::new(),
    }
}

/// A freshly derived session and the trust decision that admitted it.
///
/// The caller persists `state` and then pins the peer identity according to
/// `trust`; nothing is written by the establisher itself.
#[derive(Debug)]
pub struct EstablishedSession {
    pub state: SessionState,
    pub trust: TrustDecision,
}

/// Runs X3DH against a peer bundle (initiator) or an incoming prekey
/// message (responder).
pub struct SessionEstablisher<'a> {
    key_store: &'a KeyStore,
    trust_policy: &'a dyn IdentityTrustPolicy,
}

impl<'a> SessionEstablisher<'a> {
    pub fn new(key_store: &'a KeyStore, trust_policy: &'a dyn IdentityTrustPolicy) -> Self {
        Self {
            key_store,
            trust_policy,
        }
    }

    /// Derive an initiator session from `peer`'s published bundle.
    ///
    /// Fails with `InvalidSignature` when the signed prekey does not verify
    /// and with `UntrustedIdentity` when the trust policy refuses the peer.
    pub fn initiate(&self, peer: &str, bundle: &PreKeyBundle) -> Result<EstablishedSession, CryptoError> {
        bundle.verify_signature()?;
        let identity = self.key_store.load_identity()?;
        let base_key = KeyPair::generate();
        let secrets = initiator_secrets(&identity, &base_key, bundle)?;
        let trust = check_identity(self.trust_policy, self.key_store, peer, &bundle.identity_key)?;

        tracing::debug!(
            peer,
            signed_prekey_id = bundle.signed_prekey.key_id,
            one_time_prekey_id = ?bundle.one_time_prekey.as_ref().map(|k| k.key_id),
            "initiated X3DH session"
        );
        let state = initiator_state(
            &secrets,
            base_key,
            identity.public_key_bytes(),
            bundle.identity_key,
            bundle.registration_id,
            bundle.signed_prekey.key_id,
            bundle.one_time_prekey.as_ref().map(|k| k.key_id),
        );
        Ok(EstablishedSession { state, trust })
    }

    /// Derive the responder session for an incoming prekey message.
    ///
    /// The referenced one-time prekey is only read here. The caller consumes
    /// it with [`KeyStore::consume_one_time_prekey`] once the enclosed
    /// message decrypted, and must discard the session if that returns
    /// `None`.
    pub fn respond(&self, peer: &str, message: &PreKeyMessage) -> Result<EstablishedSession, CryptoError> {
        let trust = check_identity(self.trust_policy, self.key_store, peer, &message.identity_key)?;
        let identity = self.key_store.load_identity()?;

        let signed_prekey = self
            .key_store
            .load_signed_prekey(message.signed_prekey_id)?
            .ok_or_else(|| {
                CryptoError::InvalidMessage(format!("unknown signed prekey {}", message.signed_prekey_id))
            })?;
        let one_time_prekey = match message.one_time_prekey_id {
            Some(key_id) => Some(
                self.key_store
                    .load_one_time_prekey(key_id)?
                    .ok_or(CryptoError::KeyExhausted)?,
            ),
            None => None,
        };

        let secrets = responder_secrets(
            &identity,
            &signed_prekey.key_pair,
            one_time_prekey.as_ref(),
            &message.identity_key,
            &message.base_key,
        )?;

        tracing::debug!(
            peer,
            signed_prekey_id = message.signed_prekey_id,
            one_time_prekey_id = ?message.one_time_prekey_id,
            "responded to X3DH session"
        );
        let state = responder_state(
            &secrets,
            message.base_key,
            identity.public_key_bytes(),
            message.identity_key,
            message.registration_id,
        );
        Ok(EstablishedSession { state, trust })
    }
}
