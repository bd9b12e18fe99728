use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ProtocolConfig;
use crate::error::CryptoError;
use crate::identity::fingerprint;
use crate::signal::bundle::PreKeyBundle;
use crate::signal::keystore::KeyStore;
use crate::signal::message::{EncryptedMessage, MessageType, PreKeyMessage, RatchetMessage};
use crate::signal::ratchet::RatchetEngine;
use crate::signal::state::SessionState;
use crate::signal::store::{SessionAddress, SessionStore};
use crate::signal::trust::{pin_identity, IdentityTrustPolicy, TrustDecision};
use crate::signal::x3dh::SessionEstablisher;

/// One mutex per session address.
///
/// Held around load, ratchet step and save of a single session, so
/// operations on different peers never wait on each other. Entries live as
/// long as the manager: a waiter may still hold a clone of the mutex after
/// the session itself is deleted.
#[derive(Default)]
struct SessionLocks {
    locks: Mutex<HashMap<SessionAddress, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    fn get(&self, address: &SessionAddress) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.lock().entry(address.clone()).or_default())
    }
}

/// Manages Signal-style sessions for 1:1 encrypted messaging.
///
/// Uses X3DH for session establishment and the Double Ratchet for
/// forward-secret message encryption. Every state change is persisted
/// before its result (ciphertext or plaintext) is handed back.
pub struct SignalSessionManager {
    key_store: KeyStore,
    session_store: Box<dyn SessionStore>,
    trust_policy: Box<dyn IdentityTrustPolicy>,
    ratchet: RatchetEngine,
    locks: SessionLocks,
}

impl SignalSessionManager {
    pub fn new(
        key_store: KeyStore,
        session_store: Box<dyn SessionStore>,
        trust_policy: Box<dyn IdentityTrustPolicy>,
        config: &ProtocolConfig,
    ) -> Self {
        Self {
            key_store,
            session_store,
            trust_policy,
            ratchet: RatchetEngine::new(config),
            locks: SessionLocks::default(),
        }
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.key_store
    }

    /// Establish a session with a peer from their `PreKeyBundle` (X3DH).
    ///
    /// This is the initiator side. Any existing session with `address` is
    /// replaced. The bundle must have been fetched before calling; no I/O
    /// other than the stores happens under the session lock.
    pub fn establish_session(
        &self,
        address: &SessionAddress,
        bundle: &PreKeyBundle,
    ) -> Result<TrustDecision, CryptoError> {
        let lock = self.locks.get(address);
        let _guard = lock.lock();
        let existing = self.load_session_unlocked(address)?;
        self.initiate(address, bundle, existing.as_ref())
    }

    /// Like [`establish_session`](Self::establish_session), but keeps a
    /// session that already exists. Returns `None` when nothing was done.
    ///
    /// The check and the handshake happen under one lock, so concurrent
    /// first sends to a peer end up sharing a single session.
    pub fn establish_session_if_absent(
        &self,
        address: &SessionAddress,
        bundle: &PreKeyBundle,
    ) -> Result<Option<TrustDecision>, CryptoError> {
        let lock = self.locks.get(address);
        let _guard = lock.lock();
        if self.session_store.has_session(address)? {
            tracing::debug!(peer = %address, "session already established");
            return Ok(None);
        }
        self.initiate(address, bundle, None).map(Some)
    }

    fn initiate(
        &self,
        address: &SessionAddress,
        bundle: &PreKeyBundle,
        existing: Option<&SessionState>,
    ) -> Result<TrustDecision, CryptoError> {
        let mut established = SessionEstablisher::new(&self.key_store, self.trust_policy.as_ref())
            .initiate(&address.name, bundle)?;
        if let Some(existing) = existing {
            established.state.inherit_history(existing);
        }
        self.save(address, &established.state)?;
        pin_identity(&self.key_store, &address.name, &bundle.identity_key, &established.trust)?;

        tracing::info!(peer = %address, trust = ?established.trust, "established session");
        Ok(established.trust)
    }

    /// Encrypt `plaintext` for `address`.
    ///
    /// Until the peer has answered, the output is a prekey message carrying
    /// the handshake so the peer can build its side of the session.
    pub fn encrypt(&self, address: &SessionAddress, plaintext: &[u8]) -> Result<EncryptedMessage, CryptoError> {
        let registration_id = self.key_store.registration_id()?;
        let lock = self.locks.get(address);
        let _guard = lock.lock();

        let mut state = self.load_existing(address)?;
        let message = self.ratchet.encrypt(&mut state, plaintext)?;

        let encrypted = match &state.pending_prekey {
            Some(pending) => EncryptedMessage::prekey(
                registration_id,
                &PreKeyMessage {
                    registration_id,
                    identity_key: state.local_identity_key,
                    base_key: state.base_key,
                    signed_prekey_id: pending.signed_prekey_id,
                    one_time_prekey_id: pending.one_time_prekey_id,
                    message,
                },
            )?,
            None => EncryptedMessage::regular(registration_id, &message)?,
        };

        self.save(address, &state)?;
        tracing::trace!(peer = %address, message_type = ?encrypted.message_type, "encrypted message");
        Ok(encrypted)
    }

    /// Decrypt a message received from `address`.
    ///
    /// A prekey message whose handshake does not match the current session
    /// creates a new responder session; the one-time prekey it references is
    /// consumed only once the enclosed message authenticated.
    pub fn decrypt(&self, address: &SessionAddress, message: &EncryptedMessage) -> Result<Vec<u8>, CryptoError> {
        match message.message_type {
            MessageType::Regular => {
                let ratchet_message = message.ratchet_message()?;
                let lock = self.locks.get(address);
                let _guard = lock.lock();
                self.decrypt_existing(address, &ratchet_message)
            }
            MessageType::PreKeyBundle => {
                let prekey_message = message.prekey_message()?;
                let lock = self.locks.get(address);
                let _guard = lock.lock();
                self.decrypt_prekey(address, &prekey_message)
            }
        }
    }

    fn decrypt_existing(&self, address: &SessionAddress, message: &RatchetMessage) -> Result<Vec<u8>, CryptoError> {
        let mut state = self.load_existing(address)?;
        let plaintext = self.ratchet.decrypt(&mut state, message)?;
        self.save(address, &state)?;
        Ok(plaintext)
    }

    fn decrypt_prekey(&self, address: &SessionAddress, message: &PreKeyMessage) -> Result<Vec<u8>, CryptoError> {
        let existing = self.load_session_unlocked(address)?;
        if let Some(existing) = &existing {
            if existing.base_key == message.base_key {
                return self.decrypt_existing(address, &message.message);
            }
            if existing.supersedes(&message.base_key) {
                tracing::debug!(peer = %address, "handshake belongs to a replaced session");
                return Err(CryptoError::DuplicateOrUnknownMessage {
                    counter: message.message.header.counter,
                });
            }
            tracing::info!(peer = %address, "peer started a new session; replacing the existing one");
        }

        let mut established = SessionEstablisher::new(&self.key_store, self.trust_policy.as_ref())
            .respond(&address.name, message)?;
        if let Some(existing) = &existing {
            established.state.inherit_history(existing);
        }
        let plaintext = self.ratchet.decrypt(&mut established.state, &message.message)?;
        self.save(address, &established.state)?;

        // The one-time prekey goes last: a failed save above leaves it
        // available for the retried message.
        if let Some(key_id) = message.one_time_prekey_id {
            let consumed = self.key_store.consume_one_time_prekey(key_id);
            if !matches!(consumed, Ok(Some(_))) {
                tracing::warn!(peer = %address, key_id, "one-time prekey already consumed");
                self.restore(address, existing.as_ref())?;
                return Err(consumed.err().unwrap_or(CryptoError::KeyExhausted));
            }
        }

        pin_identity(&self.key_store, &address.name, &message.identity_key, &established.trust)?;
        tracing::info!(peer = %address, trust = ?established.trust, "accepted incoming session");
        Ok(plaintext)
    }

    fn restore(&self, address: &SessionAddress, previous: Option<&SessionState>) -> Result<(), CryptoError> {
        match previous {
            Some(state) => self.save(address, state),
            None => self.session_store.delete_session(address),
        }
    }

    pub fn has_session(&self, address: &SessionAddress) -> Result<bool, CryptoError> {
        self.session_store.has_session(address)
    }

    pub fn delete_session(&self, address: &SessionAddress) -> Result<(), CryptoError> {
        let lock = self.locks.get(address);
        let _guard = lock.lock();
        self.session_store.delete_session(address)?;
        tracing::info!(peer = %address, "deleted session");
        Ok(())
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionAddress>, CryptoError> {
        self.session_store.list_sessions()
    }

    /// Snapshot of the persisted session, for inspection.
    pub fn load_session(&self, address: &SessionAddress) -> Result<Option<SessionState>, CryptoError> {
        let lock = self.locks.get(address);
        let _guard = lock.lock();
        self.load_session_unlocked(address)
    }

    /// Safety number for the session with `address`.
    pub fn fingerprint(&self, address: &SessionAddress) -> Result<String, CryptoError> {
        let state = self
            .load_session(address)?
            .ok_or_else(|| CryptoError::NoSession(address.to_string()))?;
        Ok(fingerprint(state.local_identity_key(), state.remote_identity_key()))
    }

    fn load_session_unlocked(&self, address: &SessionAddress) -> Result<Option<SessionState>, CryptoError> {
        self.session_store
            .load_session(address)?
            .map(|record| SessionState::from_bytes(&record))
            .transpose()
    }

    fn load_existing(&self, address: &SessionAddress) -> Result<SessionState, CryptoError> {
        self.load_session_unlocked(address)?
            .ok_or_else(|| CryptoError::NoSession(address.to_string()))
    }

    fn save(&self, address: &SessionAddress, state: &SessionState) -> Result<(), CryptoError> {
        self.session_store
            .store_session(address, &state.to_bytes()?)
            .map_err(|e| match e {
                CryptoError::StorageFailure(_) => e,
                other => CryptoError::StorageFailure(other.to_string()),
            })
    }
}
