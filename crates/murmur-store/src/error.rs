use murmur_crypto::CryptoError;
use murmur_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("unsupported schema version {found} (expected {expected})")]
    SchemaVersion { found: i64, expected: i64 },

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<StoreError> for CryptoError {
    fn from(e: StoreError) -> Self {
        Self::StorageFailure(e.to_string())
    }
}

impl From<StoreError> for ProtocolError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e.to_string())
    }
}
