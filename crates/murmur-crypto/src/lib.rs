pub mod config;
pub mod error;
pub mod identity;
pub mod serde_hex;
pub mod signal;

pub use config::ProtocolConfig;
pub use error::CryptoError;
pub use identity::{fingerprint, IdentityKeyPair};
pub use signal::SignalSessionManager;
