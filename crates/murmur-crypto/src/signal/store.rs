use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CryptoError;

/// Address of a peer session: the peer's registered name plus a device id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionAddress {
    pub name: String,
    pub device_id: u32,
}

impl SessionAddress {
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: name.into(),
            device_id,
        }
    }
}

impl fmt::Display for SessionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

impl FromStr for SessionAddress {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, device) = s
            .rsplit_once('.')
            .ok_or_else(|| CryptoError::InvalidKey(format!("malformed session address: {s}")))?;
        let device_id = device
            .parse()
            .map_err(|_| CryptoError::InvalidKey(format!("malformed device id in: {s}")))?;
        Ok(Self::new(name, device_id))
    }
}

/// Storage for the local identity and pinned peer identities.
pub trait IdentityKeyStore: Send + Sync {
    /// Our identity private key (32 bytes), if one was generated.
    fn load_identity_key_pair(&self) -> Result<Option<Vec<u8>>, CryptoError>;

    fn store_identity_key_pair(&self, private_key: &[u8]) -> Result<(), CryptoError>;

    /// Our local registration ID, if one was assigned.
    fn get_local_registration_id(&self) -> Result<Option<u32>, CryptoError>;

    fn store_local_registration_id(&self, registration_id: u32) -> Result<(), CryptoError>;

    /// The identity key pinned for a peer (Trust On First Use).
    fn load_trusted_identity(&self, peer: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    /// Pin (or re-pin) a peer's identity key.
    fn save_trusted_identity(&self, peer: &str, identity_key: &[u8]) -> Result<(), CryptoError>;
}

/// Storage for signed and one-time prekeys.
///
/// Records are opaque bytes; encoding is owned by the key store.
pub trait PreKeyStore: Send + Sync {
    /// Reserve `count` consecutive one-time prekey ids and return the first.
    /// Ids are never handed out twice, even after the keys are consumed.
    fn allocate_prekey_ids(&self, count: u32) -> Result<u32, CryptoError>;

    fn store_prekey(&self, prekey_id: u32, record: &[u8]) -> Result<(), CryptoError>;

    fn load_prekey(&self, prekey_id: u32) -> Result<Option<Vec<u8>>, CryptoError>;

    /// Remove and return a one-time prekey in a single atomic step.
    ///
    /// Two concurrent calls for the same id must not both return `Some`.
    fn take_prekey(&self, prekey_id: u32) -> Result<Option<Vec<u8>>, CryptoError>;

    /// Mark the lowest not-yet-issued prekey as issued and return it.
    ///
    /// The record stays loadable until taken; it is just never issued again.
    fn issue_prekey(&self) -> Result<Option<(u32, Vec<u8>)>, CryptoError>;

    /// Number of prekeys that have not been issued yet.
    fn unissued_prekey_count(&self) -> Result<usize, CryptoError>;

    fn store_signed_prekey(&self, signed_prekey_id: u32, record: &[u8])
        -> Result<(), CryptoError>;

    fn load_signed_prekey(&self, signed_prekey_id: u32) -> Result<Option<Vec<u8>>, CryptoError>;

    /// Highest stored signed prekey id, i.e. the current one.
    fn latest_signed_prekey_id(&self) -> Result<Option<u32>, CryptoError>;

    /// Remove every signed prekey with an id lower than `signed_prekey_id`.
    /// Returns how many were removed.
    fn remove_signed_prekeys_below(&self, signed_prekey_id: u32) -> Result<usize, CryptoError>;
}

/// Storage for per-peer session state.
///
/// `store_session` must replace the prior record atomically: a subsequent
/// `load_session` sees either the old or the new bytes, never a mix.
pub trait SessionStore: Send + Sync {
    fn load_session(&self, address: &SessionAddress) -> Result<Option<Vec<u8>>, CryptoError>;

    fn store_session(&self, address: &SessionAddress, session_data: &[u8])
        -> Result<(), CryptoError>;

    fn has_session(&self, address: &SessionAddress) -> Result<bool, CryptoError>;

    fn delete_session(&self, address: &SessionAddress) -> Result<(), CryptoError>;

    fn list_sessions(&self) -> Result<Vec<SessionAddress>, CryptoError>;
}
