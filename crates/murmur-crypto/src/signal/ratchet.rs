//! Double Ratchet: symmetric chain steps, DH ratchet steps, and the
//! per-message AEAD.
//!
//! Chain step (HMAC-SHA256 keyed by the chain key):
//!   message_key = HMAC(ck, 0x01), next_ck = HMAC(ck, 0x02)
//! Root step (HKDF-SHA256, salt = root key, ikm = DH output):
//!   root_key' || chain_key = HKDF(..., "MurmurRatchet")[0..64]
//! Message encryption: AES-256-GCM, key and nonce expanded from the message
//! key; the header and the session's associated data are authenticated.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::config::ProtocolConfig;
use crate::signal::message::{MessageHeader, RatchetMessage};
use crate::signal::prekeys::KeyPair;
use crate::signal::state::{ChainState, SessionState};
use crate::CryptoError;

type HmacSha256 = Hmac<Sha256>;

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;
const ROOT_INFO: &[u8] = b"MurmurRatchet";
const MESSAGE_INFO: &[u8] = b"MurmurMessageKeys";

fn hmac_sha256(key: &[u8; 32], seed: u8) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(&[seed]);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Advance a chain by one step. Returns `(next_chain_key, message_key)`.
pub(crate) fn chain_step(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    (
        hmac_sha256(chain_key, CHAIN_KEY_SEED),
        hmac_sha256(chain_key, MESSAGE_KEY_SEED),
    )
}

/// Mix a DH output into the root key. Returns `(root_key, chain_key)`.
pub(crate) fn root_step(root_key: &[u8; 32], dh_output: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let hk = Hkdf::<Sha256>::new(Some(root_key.as_slice()), dh_output);
    let mut okm = [0u8; 64];
    hk.expand(ROOT_INFO, &mut okm)
        .expect("64-byte output is valid for HKDF-SHA256");
    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    okm.zeroize();
    (root, chain)
}

fn message_cipher(message_key: &[u8; 32]) -> (Aes256Gcm, [u8; 12]) {
    let hk = Hkdf::<Sha256>::new(None, message_key);
    let mut okm = [0u8; 44];
    hk.expand(MESSAGE_INFO, &mut okm)
        .expect("44-byte output is valid for HKDF-SHA256");
    let cipher = Aes256Gcm::new_from_slice(&okm[..32]).expect("AES-256 key is 32 bytes");
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&okm[32..]);
    okm.zeroize();
    (cipher, nonce)
}

fn aad(associated_data: &[u8], header: MessageHeader) -> Vec<u8> {
    let mut aad = Vec::with_capacity(associated_data.len() + 40);
    aad.extend_from_slice(associated_data);
    aad.extend_from_slice(&header.to_bytes());
    aad
}

fn seal(
    message_key: &[u8; 32],
    header: MessageHeader,
    associated_data: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let (cipher, nonce) = message_cipher(message_key);
    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad(associated_data, header),
            },
        )
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))
}

fn open(
    message_key: &[u8; 32],
    header: MessageHeader,
    associated_data: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let (cipher, nonce) = message_cipher(message_key);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad: &aad(associated_data, header),
            },
        )
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))
}

/// Applies ratchet steps to a [`SessionState`].
///
/// The engine mutates the state it is given and never persists anything.
/// Callers work on a copy and only commit it once the operation succeeded,
/// so a failed decrypt leaves the stored session untouched.
#[derive(Debug, Clone)]
pub struct RatchetEngine {
    max_skip: u32,
    max_skipped_keys: usize,
    max_receiving_chains: usize,
}

impl RatchetEngine {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            max_skip: config.max_skip,
            max_skipped_keys: config.max_skipped_keys,
            max_receiving_chains: config.max_receiving_chains,
        }
    }

    /// Encrypt with the next key of the sending chain.
    pub fn encrypt(&self, state: &mut SessionState, plaintext: &[u8]) -> Result<RatchetMessage, CryptoError> {
        let chain = &mut state.sending_chain;
        let header = MessageHeader {
            ratchet_key: state.local_ratchet.public_bytes(),
            previous_counter: state.previous_counter,
            counter: chain.counter,
        };
        let next_counter = chain
            .counter
            .checked_add(1)
            .ok_or_else(|| CryptoError::EncryptionError("sending chain exhausted".into()))?;

        let (next_chain_key, mut message_key) = chain_step(&chain.chain_key);
        chain.chain_key = next_chain_key;
        chain.counter = next_counter;

        let ciphertext = seal(&message_key, header, &state.associated_data, plaintext);
        message_key.zeroize();

        tracing::trace!(counter = header.counter, "ratchet encrypt");
        Ok(RatchetMessage {
            header,
            ciphertext: ciphertext?,
        })
    }

    /// Decrypt, performing a DH ratchet step when the sender's ratchet key
    /// is new and caching keys for any messages skipped on the way.
    ///
    /// `state` is only updated when the message authenticates.
    pub fn decrypt(&self, state: &mut SessionState, message: &RatchetMessage) -> Result<Vec<u8>, CryptoError> {
        let mut working = state.clone();
        let plaintext = self.decrypt_in_place(&mut working, message)?;
        *state = working;
        Ok(plaintext)
    }

    fn decrypt_in_place(&self, state: &mut SessionState, message: &RatchetMessage) -> Result<Vec<u8>, CryptoError> {
        let header = message.header;

        if let Some(mut message_key) = state.take_skipped_key(&header.ratchet_key, header.counter) {
            tracing::debug!(counter = header.counter, "decrypting with skipped message key");
            let plaintext = open(&message_key, header, &state.associated_data, &message.ciphertext);
            message_key.zeroize();
            return plaintext;
        }

        if state.receiving_chain_mut(&header.ratchet_key).is_none() {
            self.dh_ratchet_step(state, header)?;
        }

        let mut message_key = self.advance_receiving_chain(state, &header.ratchet_key, header.counter)?;
        let plaintext = open(&message_key, header, &state.associated_data, &message.ciphertext);
        message_key.zeroize();
        let plaintext = plaintext?;

        // Any message from the peer proves it holds the session.
        state.pending_prekey = None;
        Ok(plaintext)
    }

    /// Walk the receiving chain for `ratchet_key` up to `counter`, caching
    /// skipped keys, and return the message key for `counter`.
    fn advance_receiving_chain(
        &self,
        state: &mut SessionState,
        ratchet_key: &[u8; 32],
        counter: u32,
    ) -> Result<[u8; 32], CryptoError> {
        let max_skip = self.max_skip;
        let chain = state
            .receiving_chain_mut(ratchet_key)
            .ok_or_else(|| CryptoError::DecryptionError("missing receiving chain".into()))?;

        if counter < chain.counter {
            return Err(CryptoError::DuplicateOrUnknownMessage { counter });
        }
        let gap = counter - chain.counter;
        if gap > max_skip {
            return Err(CryptoError::TooManySkippedMessages {
                requested: gap,
                limit: max_skip,
            });
        }

        let mut skipped = Vec::with_capacity(gap as usize);
        while chain.counter < counter {
            let (next, message_key) = chain_step(&chain.chain_key);
            skipped.push((chain.counter, message_key));
            chain.chain_key = next;
            chain.counter += 1;
        }
        let (next, message_key) = chain_step(&chain.chain_key);
        chain.chain_key = next;
        chain.counter += 1;

        if !skipped.is_empty() {
            tracing::debug!(skipped = skipped.len(), "caching skipped message keys");
        }
        for (skipped_counter, key) in skipped {
            state.push_skipped_key(*ratchet_key, skipped_counter, key, self.max_skipped_keys);
        }
        Ok(message_key)
    }

    fn dh_ratchet_step(&self, state: &mut SessionState, header: MessageHeader) -> Result<(), CryptoError> {
        if header.counter > self.max_skip {
            return Err(CryptoError::TooManySkippedMessages {
                requested: header.counter,
                limit: self.max_skip,
            });
        }

        // Close out the current receiving chain up to the sender's previous
        // chain length so late messages from it stay decryptable.
        if let Some(current) = state.remote_ratchet {
            if state.receiving_chain_mut(&current).is_some() {
                self.skip_to(state, &current, header.previous_counter)?;
            }
        }

        let (root_key, receiving_chain_key) =
            root_step(&state.root_key, &state.local_ratchet.diffie_hellman(&header.ratchet_key));
        state.push_receiving_chain(
            header.ratchet_key,
            ChainState::new(receiving_chain_key),
            self.max_receiving_chains,
        );

        let next_ratchet = KeyPair::generate();
        let (root_key, sending_chain_key) =
            root_step(&root_key, &next_ratchet.diffie_hellman(&header.ratchet_key));

        state.root_key = root_key;
        state.previous_counter = state.sending_chain.counter;
        state.sending_chain = ChainState::new(sending_chain_key);
        state.local_ratchet = next_ratchet;
        state.remote_ratchet = Some(header.ratchet_key);

        tracing::debug!(
            remote_ratchet = hex::encode(header.ratchet_key),
            previous_counter = state.previous_counter,
            "performed DH ratchet step"
        );
        Ok(())
    }

    /// Cache message keys of `ratchet_key`'s chain up to (excluding) `until`.
    fn skip_to(&self, state: &mut SessionState, ratchet_key: &[u8; 32], until: u32) -> Result<(), CryptoError> {
        let max_skip = self.max_skip;
        let chain = state
            .receiving_chain_mut(ratchet_key)
            .ok_or_else(|| CryptoError::DecryptionError("missing receiving chain".into()))?;
        let gap = until.saturating_sub(chain.counter);
        if gap > max_skip {
            return Err(CryptoError::TooManySkippedMessages {
                requested: gap,
                limit: max_skip,
            });
        }

        let mut skipped = Vec::with_capacity(gap as usize);
        while chain.counter < until {
            let (next, message_key) = chain_step(&chain.chain_key);
            skipped.push((chain.counter, message_key));
            chain.chain_key = next;
            chain.counter += 1;
        }
        for (counter, key) in skipped {
            state.push_skipped_key(*ratchet_key, counter, key, self.max_skipped_keys);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::identity::IdentityKeyPair;
    use crate::signal::x3dh::{initiator_state, responder_state, X3dhSecrets};

    fn engine_with(max_skip: u32, max_skipped_keys: usize) -> RatchetEngine {
        RatchetEngine::new(&ProtocolConfig {
            max_skip,
            max_skipped_keys,
            ..ProtocolConfig::default()
        })
    }

    fn engine() -> RatchetEngine {
        RatchetEngine::new(&ProtocolConfig::default())
    }

    /// A connected (initiator, responder) pair built from a fixed secret.
    fn session_pair() -> (SessionState, SessionState) {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let base = KeyPair::generate();
        let secrets = X3dhSecrets {
            root_key: [7; 32],
            chain_key: [8; 32],
        };
        let initiator = initiator_state(
            &secrets,
            base.clone(),
            alice.public_key_bytes(),
            bob.public_key_bytes(),
            2,
            1,
            None,
        );
        let responder = responder_state(
            &secrets,
            base.public_bytes(),
            bob.public_key_bytes(),
            alice.public_key_bytes(),
            1,
        );
        (initiator, responder)
    }

    #[test]
    fn chain_message_keys_are_pairwise_distinct() {
        let mut chain_key = [42u8; 32];
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let (next, message_key) = chain_step(&chain_key);
            assert!(seen.insert(message_key));
            assert_ne!(next, message_key);
            chain_key = next;
        }
    }

    #[test]
    fn encrypt_uses_fresh_key_per_message() {
        let (mut alice, _) = session_pair();
        let engine = engine();

        let ciphertexts: HashSet<Vec<u8>> = (0..50)
            .map(|_| engine.encrypt(&mut alice, b"same plaintext").unwrap().ciphertext)
            .collect();
        assert_eq!(ciphertexts.len(), 50);
        assert_eq!(alice.sending_counter(), 50);
    }

    #[test]
    fn round_trip_both_directions() {
        let (mut alice, mut bob) = session_pair();
        let engine = engine();

        let m = engine.encrypt(&mut alice, b"hello bob").unwrap();
        assert_eq!(engine.decrypt(&mut bob, &m).unwrap(), b"hello bob");

        let reply = engine.encrypt(&mut bob, b"hello alice").unwrap();
        assert_eq!(engine.decrypt(&mut alice, &reply).unwrap(), b"hello alice");
        assert!(!alice.has_pending_prekey());

        let again = engine.encrypt(&mut alice, b"second round").unwrap();
        assert_ne!(again.header.ratchet_key, m.header.ratchet_key);
        assert_eq!(engine.decrypt(&mut bob, &again).unwrap(), b"second round");
    }

    #[test]
    fn root_key_changes_on_dh_ratchet() {
        let (mut alice, mut bob) = session_pair();
        let engine = engine();

        let before = *alice.root_key();
        let reply = engine.encrypt(&mut bob, b"ping").unwrap();
        engine.decrypt(&mut alice, &reply).unwrap();
        assert_ne!(*alice.root_key(), before);
    }

    #[test]
    fn out_of_order_then_duplicate() {
        let (mut alice, mut bob) = session_pair();
        let engine = engine();

        let m1 = engine.encrypt(&mut alice, b"m1").unwrap();
        let m2 = engine.encrypt(&mut alice, b"m2").unwrap();
        let m3 = engine.encrypt(&mut alice, b"m3").unwrap();

        assert_eq!(engine.decrypt(&mut bob, &m2).unwrap(), b"m2");
        assert_eq!(bob.skipped_key_count(), 1);
        assert_eq!(engine.decrypt(&mut bob, &m1).unwrap(), b"m1");
        assert_eq!(engine.decrypt(&mut bob, &m3).unwrap(), b"m3");
        assert_eq!(bob.skipped_key_count(), 0);

        let replay = engine.decrypt(&mut bob, &m1);
        assert!(matches!(replay, Err(CryptoError::DuplicateOrUnknownMessage { counter: 0 })));
    }

    #[test]
    fn late_message_from_previous_chain_is_decryptable() {
        let (mut alice, mut bob) = session_pair();
        let engine = engine();

        let first = engine.encrypt(&mut alice, b"first").unwrap();
        let late = engine.encrypt(&mut alice, b"late").unwrap();
        engine.decrypt(&mut bob, &first).unwrap();

        let reply = engine.encrypt(&mut bob, b"reply").unwrap();
        engine.decrypt(&mut alice, &reply).unwrap();
        let new_chain = engine.encrypt(&mut alice, b"new chain").unwrap();
        assert_eq!(new_chain.header.previous_counter, 2);

        assert_eq!(engine.decrypt(&mut bob, &new_chain).unwrap(), b"new chain");
        assert_eq!(engine.decrypt(&mut bob, &late).unwrap(), b"late");
    }

    #[test]
    fn gap_beyond_max_skip_is_rejected() {
        let (mut alice, mut bob) = session_pair();
        let engine = engine_with(3, 2000);

        let messages: Vec<_> = (0..6).map(|_| engine.encrypt(&mut alice, b"x").unwrap()).collect();

        let result = engine.decrypt(&mut bob, &messages[5]);
        assert!(matches!(
            result,
            Err(CryptoError::TooManySkippedMessages { requested: 5, limit: 3 })
        ));
        assert_eq!(engine.decrypt(&mut bob, &messages[3]).unwrap(), b"x");
    }

    #[test]
    fn skipped_keys_are_bounded_oldest_first() {
        let (mut alice, mut bob) = session_pair();
        let engine = engine_with(1000, 3);

        let messages: Vec<_> = (0..6).map(|_| engine.encrypt(&mut alice, b"x").unwrap()).collect();
        engine.decrypt(&mut bob, &messages[5]).unwrap();
        assert_eq!(bob.skipped_key_count(), 3);

        assert!(matches!(
            engine.decrypt(&mut bob, &messages[0]),
            Err(CryptoError::DuplicateOrUnknownMessage { .. })
        ));
        assert_eq!(engine.decrypt(&mut bob, &messages[4]).unwrap(), b"x");
    }

    #[test]
    fn tampered_header_fails_without_advancing_state() {
        let (mut alice, mut bob) = session_pair();
        let engine = engine();

        let m1 = engine.encrypt(&mut alice, b"m1").unwrap();
        let mut forged = engine.encrypt(&mut alice, b"m2").unwrap();
        forged.header.previous_counter = 9;

        assert!(matches!(
            engine.decrypt(&mut bob, &forged),
            Err(CryptoError::DecryptionError(_))
        ));
        assert_eq!(bob.skipped_key_count(), 0);
        assert_eq!(engine.decrypt(&mut bob, &m1).unwrap(), b"m1");
    }

    #[test]
    fn state_survives_serialization() {
        let (mut alice, bob) = session_pair();
        let engine = engine();

        let m = engine.encrypt(&mut alice, b"persisted").unwrap();
        let mut restored = SessionState::from_bytes(&bob.to_bytes().unwrap()).unwrap();
        assert_eq!(engine.decrypt(&mut restored, &m).unwrap(), b"persisted");
    }
}
