use base64::Engine as _;
use murmur_crypto::signal::{EncryptedMessage, MessageType};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Text-safe wire form of an [`EncryptedMessage`].
///
/// Encoded as JSON with the opaque body in standard base64, so it can travel
/// over transports that only carry strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub message_type: WireMessageType,
    pub sender_registration_id: u32,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireMessageType {
    Prekey,
    Regular,
}

impl From<MessageType> for WireMessageType {
    fn from(message_type: MessageType) -> Self {
        match message_type {
            MessageType::PreKeyBundle => Self::Prekey,
            MessageType::Regular => Self::Regular,
        }
    }
}

impl From<WireMessageType> for MessageType {
    fn from(message_type: WireMessageType) -> Self {
        match message_type {
            WireMessageType::Prekey => Self::PreKeyBundle,
            WireMessageType::Regular => Self::Regular,
        }
    }
}

impl From<&EncryptedMessage> for WireMessage {
    fn from(message: &EncryptedMessage) -> Self {
        Self {
            message_type: message.message_type.into(),
            sender_registration_id: message.sender_registration_id,
            body: base64::engine::general_purpose::STANDARD.encode(&message.body),
        }
    }
}

impl TryFrom<WireMessage> for EncryptedMessage {
    type Error = ProtocolError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let body = base64::engine::general_purpose::STANDARD
            .decode(wire.body.as_bytes())
            .map_err(|e| ProtocolError::Deserialization(format!("invalid base64 body: {e}")))?;
        Ok(Self {
            message_type: wire.message_type.into(),
            sender_registration_id: wire.sender_registration_id,
            body,
        })
    }
}

/// Encode a message as a JSON string for the transport.
pub fn encode_message(message: &EncryptedMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(&WireMessage::from(message))
        .map_err(|e| ProtocolError::Serialization(format!("wire message: {e}")))
}

/// Decode a message received from the transport.
pub fn decode_message(data: &str) -> Result<EncryptedMessage, ProtocolError> {
    let wire: WireMessage = serde_json::from_str(data)
        .map_err(|e| ProtocolError::Deserialization(format!("wire message: {e}")))?;
    EncryptedMessage::try_from(wire)
}
