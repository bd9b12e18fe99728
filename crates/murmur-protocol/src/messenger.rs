use std::sync::Arc;

use murmur_crypto::signal::{
    BundlePublisher, EncryptedMessage, IdentityTrustPolicy, KeyStore, PreKeyBundle, SessionAddress, SessionStore,
};
use murmur_crypto::{CryptoError, ProtocolConfig, SignalSessionManager};

use crate::directory::Directory;
use crate::error::ProtocolError;
use crate::mailbox::Mailbox;

/// Result of [`Messenger::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub registration_id: u32,
    pub bundle: PreKeyBundle,
}

/// A decrypted incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub sender: String,
    pub plaintext: Vec<u8>,
}

/// One local user talking to peers through a directory and a mailbox.
///
/// Directory and mailbox calls are made outside of any session lock; only
/// the session manager's load, ratchet step and save are serialized per peer.
pub struct Messenger {
    username: String,
    sessions: SignalSessionManager,
    directory: Arc<dyn Directory>,
    mailbox: Arc<dyn Mailbox>,
    config: ProtocolConfig,
}

impl Messenger {
    pub fn new(
        username: impl Into<String>,
        key_store: KeyStore,
        session_store: Box<dyn SessionStore>,
        trust_policy: Box<dyn IdentityTrustPolicy>,
        directory: Arc<dyn Directory>,
        mailbox: Arc<dyn Mailbox>,
        config: ProtocolConfig,
    ) -> Self {
        Self {
            username: username.into(),
            sessions: SignalSessionManager::new(key_store, session_store, trust_policy, &config),
            directory,
            mailbox,
            config,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn sessions(&self) -> &SignalSessionManager {
        &self.sessions
    }

    fn key_store(&self) -> &KeyStore {
        self.sessions.key_store()
    }

    fn address(&self, peer: &str) -> SessionAddress {
        SessionAddress::new(peer, self.config.device_id)
    }

    /// Create the local keys and register them with the directory.
    ///
    /// Safe to call again after a failed directory upload: existing identity
    /// and signed prekey are reused.
    pub fn register(&self) -> Result<Registration, ProtocolError> {
        let key_store = self.key_store();
        let identity = key_store.generate_identity()?;
        match key_store.current_signed_prekey() {
            Ok(_) => {}
            Err(CryptoError::Uninitialized) => {
                key_store.generate_signed_prekey(&identity, 1)?;
            }
            Err(e) => return Err(e.into()),
        }

        let batch = self.config.one_time_prekey_batch;
        let unissued = u32::try_from(key_store.unissued_one_time_prekeys()?).unwrap_or(u32::MAX);
        if unissued < batch {
            key_store.generate_one_time_prekeys(batch - unissued)?;
        }

        let upload = BundlePublisher::new(key_store).registration_upload(batch)?;
        let record = self.directory.register(&self.username, &upload)?;
        tracing::info!(
            user = %self.username,
            registration_id = record.registration_id,
            one_time_prekeys = upload.one_time_prekeys.len(),
            "registered"
        );
        Ok(Registration {
            registration_id: record.registration_id,
            bundle: upload.bundle,
        })
    }

    pub fn registration_id(&self) -> Result<u32, ProtocolError> {
        match self.key_store().registration_id() {
            Ok(id) => Ok(id),
            Err(CryptoError::Uninitialized) => Err(ProtocolError::NotRegistered),
            Err(e) => Err(e.into()),
        }
    }

    /// Encrypt `plaintext` for `peer` and queue it in the peer's mailbox.
    ///
    /// Starts a session from the peer's published bundle when none exists.
    pub fn send_message(&self, peer: &str, plaintext: &[u8]) -> Result<EncryptedMessage, ProtocolError> {
        let address = self.address(peer);
        let recipient = self
            .directory
            .lookup(peer)?
            .ok_or_else(|| ProtocolError::UnknownUser(peer.to_string()))?;

        if !self.sessions.has_session(&address)? {
            let bundle = self.directory.fetch_bundle(peer)?;
            if self.sessions.establish_session_if_absent(&address, &bundle)?.is_none() {
                tracing::debug!(peer, "another send established the session first");
            }
        }

        let message = self.sessions.encrypt(&address, plaintext)?;
        let delivery_id = self.mailbox.deliver(recipient.registration_id, &message)?;
        tracing::debug!(peer, delivery_id, message_type = ?message.message_type, "sent message");
        Ok(message)
    }

    /// Decrypt one incoming message, identifying the sender through the
    /// directory.
    pub fn receive_message(&self, message: &EncryptedMessage) -> Result<ReceivedMessage, ProtocolError> {
        let sender = self
            .directory
            .lookup_by_registration_id(message.sender_registration_id)?
            .ok_or(ProtocolError::UnknownRegistrationId(message.sender_registration_id))?;
        let plaintext = self.sessions.decrypt(&self.address(&sender.name), message)?;
        Ok(ReceivedMessage {
            sender: sender.name,
            plaintext,
        })
    }

    /// Fetch, decrypt and acknowledge everything waiting in our mailbox.
    ///
    /// Messages that can never be decrypted (duplicates, forgeries, unknown
    /// senders) are logged and acknowledged so they are not fetched again.
    /// A transient failure stops the batch and leaves the failing message
    /// and everything after it unacknowledged; it is returned as an error
    /// only when nothing was received before it. A failed acknowledge stops
    /// the batch the same way, after the message it belongs to.
    pub fn receive_pending(&self) -> Result<Vec<ReceivedMessage>, ProtocolError> {
        let registration_id = self.registration_id()?;
        let deliveries = self.mailbox.fetch_unread(registration_id)?;
        let mut received = Vec::with_capacity(deliveries.len());

        for delivery in deliveries {
            match self.receive_message(&delivery.message) {
                Ok(message) => received.push(message),
                Err(e) if e.is_transient() => {
                    tracing::error!(delivery_id = delivery.id, error = %e, "stopping mailbox fetch");
                    if received.is_empty() {
                        return Err(e);
                    }
                    break;
                }
                Err(ProtocolError::Crypto(e)) if e.is_droppable() => {
                    tracing::warn!(delivery_id = delivery.id, error = %e, "dropping duplicate message");
                }
                Err(ProtocolError::Crypto(e)) if e.is_fatal_to_session() => {
                    tracing::warn!(
                        delivery_id = delivery.id,
                        sender_registration_id = delivery.message.sender_registration_id,
                        error = %e,
                        "session can no longer advance; reset it to recover"
                    );
                }
                Err(e) => {
                    tracing::warn!(delivery_id = delivery.id, error = %e, "dropping undecryptable message");
                }
            }
            if let Err(e) = self.mailbox.acknowledge(registration_id, &[delivery.id]) {
                // The session has moved past this message; it will not decrypt again.
                tracing::error!(delivery_id = delivery.id, error = %e, "acknowledge failed; stopping mailbox fetch");
                if received.is_empty() {
                    return Err(e);
                }
                break;
            }
        }
        Ok(received)
    }

    pub fn has_session(&self, peer: &str) -> Result<bool, ProtocolError> {
        Ok(self.sessions.has_session(&self.address(peer))?)
    }

    /// Drop the session with `peer`; the next send starts a new handshake.
    pub fn reset_session(&self, peer: &str) -> Result<(), ProtocolError> {
        Ok(self.sessions.delete_session(&self.address(peer))?)
    }

    /// Generate a batch of one-time prekeys and upload them. Returns how
    /// many were uploaded.
    pub fn replenish_pre_keys(&self) -> Result<usize, ProtocolError> {
        let key_store = self.key_store();
        let batch = self.config.one_time_prekey_batch;
        key_store.generate_one_time_prekeys(batch)?;
        let prekeys = BundlePublisher::new(key_store).issue_one_time_prekeys(batch)?;
        self.directory.replenish(&self.username, &prekeys)?;
        tracing::info!(user = %self.username, count = prekeys.len(), "replenished one-time prekeys");
        Ok(prekeys.len())
    }

    /// Rotate the signed prekey and publish the new one. Returns its id.
    pub fn rotate_signed_pre_key(&self) -> Result<u32, ProtocolError> {
        let signed_prekey = self.key_store().rotate_signed_prekey()?;
        self.directory
            .update_signed_prekey(&self.username, &signed_prekey.public())?;
        Ok(signed_prekey.key_id)
    }

    /// Safety number shared with `peer`, for out-of-band verification.
    pub fn fingerprint(&self, peer: &str) -> Result<String, ProtocolError> {
        Ok(self.sessions.fingerprint(&self.address(peer))?)
    }

    /// Peers we hold a session with.
    pub fn peers(&self) -> Result<Vec<String>, ProtocolError> {
        Ok(self
            .sessions
            .list_sessions()?
            .into_iter()
            .map(|address| address.name)
            .collect())
    }
}
