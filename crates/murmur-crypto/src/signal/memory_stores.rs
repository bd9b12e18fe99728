//! In-memory implementations of the storage traits.
//!
//! Suitable for tests and for short-lived processes. Data is lost on exit;
//! `murmur-store` provides the SQLite-backed equivalents.
//!
//! Every store is cheaply cloneable and clones share state, so a test can
//! keep a handle and inspect what a session manager wrote.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::signal::store::{IdentityKeyStore, PreKeyStore, SessionAddress, SessionStore};
use crate::CryptoError;

#[derive(Default)]
struct IdentityState {
    identity_private: Option<Vec<u8>>,
    registration_id: Option<u32>,
    trusted: HashMap<String, Vec<u8>>,
}

/// In-memory identity key store.
#[derive(Clone, Default)]
pub struct MemoryIdentityStore {
    inner: Arc<Mutex<IdentityState>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityKeyStore for MemoryIdentityStore {
    fn load_identity_key_pair(&self) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self.inner.lock().identity_private.clone())
    }

    fn store_identity_key_pair(&self, private_key: &[u8]) -> Result<(), CryptoError> {
        self.inner.lock().identity_private = Some(private_key.to_vec());
        Ok(())
    }

    fn get_local_registration_id(&self) -> Result<Option<u32>, CryptoError> {
        Ok(self.inner.lock().registration_id)
    }

    fn store_local_registration_id(&self, registration_id: u32) -> Result<(), CryptoError> {
        self.inner.lock().registration_id = Some(registration_id);
        Ok(())
    }

    fn load_trusted_identity(&self, peer: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self.inner.lock().trusted.get(peer).cloned())
    }

    fn save_trusted_identity(&self, peer: &str, identity_key: &[u8]) -> Result<(), CryptoError> {
        self.inner
            .lock()
            .trusted
            .insert(peer.to_string(), identity_key.to_vec());
        Ok(())
    }
}

struct StoredPreKey {
    record: Vec<u8>,
    issued: bool,
}

#[derive(Default)]
struct PreKeyState {
    next_prekey_id: u32,
    prekeys: BTreeMap<u32, StoredPreKey>,
    signed_prekeys: BTreeMap<u32, Vec<u8>>,
}

/// In-memory prekey store.
#[derive(Clone)]
pub struct MemoryPreKeyStore {
    inner: Arc<Mutex<PreKeyState>>,
}

impl MemoryPreKeyStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PreKeyState {
                next_prekey_id: 1,
                ..PreKeyState::default()
            })),
        }
    }
}

impl Default for MemoryPreKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PreKeyStore for MemoryPreKeyStore {
    fn allocate_prekey_ids(&self, count: u32) -> Result<u32, CryptoError> {
        let mut state = self.inner.lock();
        let first = state.next_prekey_id;
        state.next_prekey_id = first
            .checked_add(count)
            .ok_or_else(|| CryptoError::StorageFailure("prekey id space exhausted".into()))?;
        Ok(first)
    }

    fn store_prekey(&self, prekey_id: u32, record: &[u8]) -> Result<(), CryptoError> {
        self.inner.lock().prekeys.insert(
            prekey_id,
            StoredPreKey {
                record: record.to_vec(),
                issued: false,
            },
        );
        Ok(())
    }

    fn load_prekey(&self, prekey_id: u32) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self
            .inner
            .lock()
            .prekeys
            .get(&prekey_id)
            .map(|stored| stored.record.clone()))
    }

    fn take_prekey(&self, prekey_id: u32) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self
            .inner
            .lock()
            .prekeys
            .remove(&prekey_id)
            .map(|stored| stored.record))
    }

    fn issue_prekey(&self) -> Result<Option<(u32, Vec<u8>)>, CryptoError> {
        let mut state = self.inner.lock();
        let issued = state
            .prekeys
            .iter_mut()
            .find(|(_, stored)| !stored.issued)
            .map(|(id, stored)| {
                stored.issued = true;
                (*id, stored.record.clone())
            });
        Ok(issued)
    }

    fn unissued_prekey_count(&self) -> Result<usize, CryptoError> {
        Ok(self
            .inner
            .lock()
            .prekeys
            .values()
            .filter(|stored| !stored.issued)
            .count())
    }

    fn store_signed_prekey(
        &self,
        signed_prekey_id: u32,
        record: &[u8],
    ) -> Result<(), CryptoError> {
        self.inner
            .lock()
            .signed_prekeys
            .insert(signed_prekey_id, record.to_vec());
        Ok(())
    }

    fn load_signed_prekey(&self, signed_prekey_id: u32) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self
            .inner
            .lock()
            .signed_prekeys
            .get(&signed_prekey_id)
            .cloned())
    }

    fn latest_signed_prekey_id(&self) -> Result<Option<u32>, CryptoError> {
        Ok(self.inner.lock().signed_prekeys.keys().next_back().copied())
    }

    fn remove_signed_prekeys_below(&self, signed_prekey_id: u32) -> Result<usize, CryptoError> {
        let mut inner = self.inner.lock();
        let kept = inner.signed_prekeys.split_off(&signed_prekey_id);
        let removed = std::mem::replace(&mut inner.signed_prekeys, kept);
        Ok(removed.len())
    }
}

/// In-memory session store.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<Mutex<HashMap<SessionAddress, Vec<u8>>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load_session(&self, address: &SessionAddress) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self.sessions.lock().get(address).cloned())
    }

    fn store_session(
        &self,
        address: &SessionAddress,
        session_data: &[u8],
    ) -> Result<(), CryptoError> {
        self.sessions
            .lock()
            .insert(address.clone(), session_data.to_vec());
        Ok(())
    }

    fn has_session(&self, address: &SessionAddress) -> Result<bool, CryptoError> {
        Ok(self.sessions.lock().contains_key(address))
    }

    fn delete_session(&self, address: &SessionAddress) -> Result<(), CryptoError> {
        self.sessions.lock().remove(address);
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<SessionAddress>, CryptoError> {
        let mut addresses: Vec<SessionAddress> = self.sessions.lock().keys().cloned().collect();
        addresses.sort();
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_prekey_removes_record() {
        let store = MemoryPreKeyStore::new();
        store.store_prekey(1, b"one").unwrap();

        assert_eq!(store.take_prekey(1).unwrap().as_deref(), Some(&b"one"[..]));
        assert!(store.take_prekey(1).unwrap().is_none());
        assert!(store.load_prekey(1).unwrap().is_none());
    }

    #[test]
    fn issue_prekey_walks_ids_in_order_and_keeps_records() {
        let store = MemoryPreKeyStore::new();
        store.store_prekey(2, b"two").unwrap();
        store.store_prekey(1, b"one").unwrap();

        assert_eq!(store.issue_prekey().unwrap().map(|(id, _)| id), Some(1));
        assert_eq!(store.issue_prekey().unwrap().map(|(id, _)| id), Some(2));
        assert!(store.issue_prekey().unwrap().is_none());
        assert_eq!(store.unissued_prekey_count().unwrap(), 0);
        assert!(store.load_prekey(1).unwrap().is_some());
    }

    #[test]
    fn allocated_ids_do_not_overlap() {
        let store = MemoryPreKeyStore::new();
        let first = store.allocate_prekey_ids(10).unwrap();
        let second = store.allocate_prekey_ids(5).unwrap();
        assert_eq!(second, first + 10);
    }

    #[test]
    fn latest_signed_prekey_is_highest_id() {
        let store = MemoryPreKeyStore::new();
        assert!(store.latest_signed_prekey_id().unwrap().is_none());
        store.store_signed_prekey(3, b"c").unwrap();
        store.store_signed_prekey(7, b"g").unwrap();
        assert_eq!(store.latest_signed_prekey_id().unwrap(), Some(7));

        assert_eq!(store.remove_signed_prekeys_below(7).unwrap(), 1);
        assert!(store.load_signed_prekey(3).unwrap().is_none());
        assert!(store.load_signed_prekey(7).unwrap().is_some());
    }

    #[test]
    fn session_store_clones_share_state() {
        let store = MemorySessionStore::new();
        let handle = store.clone();
        let address = SessionAddress::new("bob", 0);

        store.store_session(&address, b"state").unwrap();
        assert!(handle.has_session(&address).unwrap());
        assert_eq!(handle.list_sessions().unwrap(), vec![address.clone()]);

        handle.delete_session(&address).unwrap();
        assert!(!store.has_session(&address).unwrap());
    }
}
