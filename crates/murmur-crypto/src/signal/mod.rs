pub mod bundle;
pub mod keystore;
pub mod memory_stores;
pub mod message;
pub mod prekeys;
pub mod ratchet;
pub mod session;
pub mod state;
pub mod store;
pub mod trust;
pub mod x3dh;

pub use bundle::{BundlePublisher, OneTimePreKeyPublic, PreKeyBundle, RegistrationUpload, SignedPreKeyPublic};
pub use keystore::KeyStore;
pub use memory_stores::{MemoryIdentityStore, MemoryPreKeyStore, MemorySessionStore};
pub use message::{EncryptedMessage, MessageType};
pub use ratchet::RatchetEngine;
pub use session::SignalSessionManager;
pub use state::SessionState;
pub use store::{IdentityKeyStore, PreKeyStore, SessionAddress, SessionStore};
pub use trust::{IdentityChangeListener, IdentityTrustPolicy, TrustDecision, TrustOnFirstUse, TrustStrictness};
pub use x3dh::SessionEstablisher;
