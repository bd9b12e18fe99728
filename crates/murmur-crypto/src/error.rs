use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The local identity has not been generated yet.
    #[error("local identity is not initialized")]
    Uninitialized,

    /// A peer bundle's signed prekey signature does not verify.
    #[error("signed prekey signature does not verify against identity key")]
    InvalidSignature,

    #[error("identity key for {peer} is not trusted")]
    UntrustedIdentity { peer: String },

    /// No one-time prekey is available. Callers degrade to a bundle without one.
    #[error("no one-time prekey available")]
    KeyExhausted,

    /// Replayed message, or a message whose key can no longer be derived.
    #[error("duplicate or unknown message (counter {counter})")]
    DuplicateOrUnknownMessage { counter: u32 },

    /// The gap to the requested counter exceeds the skip bound. The session
    /// must be re-established.
    #[error("too many skipped messages: {requested} exceeds limit of {limit}")]
    TooManySkippedMessages { requested: u32, limit: u32 },

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("no session for {0}")]
    NoSession(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("decryption failed: {0}")]
    DecryptionError(String),
}

impl CryptoError {
    /// Whether the message that produced this error should be dropped
    /// without touching the session.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::DuplicateOrUnknownMessage { .. })
    }

    /// Whether the session can no longer make progress and needs a fresh
    /// handshake.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Self::TooManySkippedMessages { .. })
    }
}

impl From<bincode::Error> for CryptoError {
    fn from(e: bincode::Error) -> Self {
        Self::InvalidMessage(format!("bincode: {e}"))
    }
}
