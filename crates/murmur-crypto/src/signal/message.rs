use serde::{Deserialize, Serialize};

use crate::CryptoError;

/// Kind of [`EncryptedMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Carries handshake material; the receiver builds a session from it.
    PreKeyBundle,
    /// Ordinary ratchet message for an established session.
    Regular,
}

/// The opaque unit handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub message_type: MessageType,
    pub sender_registration_id: u32,
    pub body: Vec<u8>,
}

impl EncryptedMessage {
    pub fn regular(sender_registration_id: u32, message: &RatchetMessage) -> Result<Self, CryptoError> {
        Ok(Self {
            message_type: MessageType::Regular,
            sender_registration_id,
            body: bincode::serialize(message)?,
        })
    }

    pub fn prekey(sender_registration_id: u32, message: &PreKeyMessage) -> Result<Self, CryptoError> {
        Ok(Self {
            message_type: MessageType::PreKeyBundle,
            sender_registration_id,
            body: bincode::serialize(message)?,
        })
    }

    pub fn ratchet_message(&self) -> Result<RatchetMessage, CryptoError> {
        if self.message_type != MessageType::Regular {
            return Err(CryptoError::InvalidMessage("expected a regular message".into()));
        }
        Ok(bincode::deserialize(&self.body)?)
    }

    pub fn prekey_message(&self) -> Result<PreKeyMessage, CryptoError> {
        if self.message_type != MessageType::PreKeyBundle {
            return Err(CryptoError::InvalidMessage("expected a prekey message".into()));
        }
        let message: PreKeyMessage = bincode::deserialize(&self.body)?;
        if message.registration_id != self.sender_registration_id {
            return Err(CryptoError::InvalidMessage(
                "prekey message registration id does not match sender".into(),
            ));
        }
        Ok(message)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Cleartext header authenticated alongside each ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current DH ratchet public key.
    pub ratchet_key: [u8; 32],
    /// Length of the sender's previous sending chain.
    pub previous_counter: u32,
    /// Position in the current sending chain.
    pub counter: u32,
}

impl MessageHeader {
    pub(crate) fn to_bytes(self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[..32].copy_from_slice(&self.ratchet_key);
        out[32..36].copy_from_slice(&self.previous_counter.to_be_bytes());
        out[36..].copy_from_slice(&self.counter.to_be_bytes());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    pub header: MessageHeader,
    /// AES-256-GCM ciphertext including the tag.
    pub ciphertext: Vec<u8>,
}

/// First message(s) of an initiator: handshake material plus a ratchet message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyMessage {
    pub registration_id: u32,
    /// Initiator's Ed25519 identity key.
    pub identity_key: [u8; 32],
    /// Initiator's ephemeral X25519 key (also its first ratchet key).
    pub base_key: [u8; 32],
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
    pub message: RatchetMessage,
}
