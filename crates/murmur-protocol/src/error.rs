use murmur_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("username already registered: {0}")]
    UserExists(String),

    #[error("registration id {0} is already in use")]
    RegistrationIdTaken(u32),

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("no user with registration id {0}")]
    UnknownRegistrationId(u32),

    #[error("not registered yet")]
    NotRegistered,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Directory or mailbox backend failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl ProtocolError {
    /// Whether retrying later may succeed without any change to the message.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Crypto(CryptoError::StorageFailure(_))
        )
    }
}
