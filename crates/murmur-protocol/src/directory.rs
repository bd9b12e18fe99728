//! Registration directory: maps usernames to registration ids and public
//! key bundles, and hands out each uploaded one-time prekey at most once.

use std::collections::{BTreeMap, HashMap};

use murmur_crypto::signal::{OneTimePreKeyPublic, PreKeyBundle, RegistrationUpload, SignedPreKeyPublic};
use murmur_crypto::IdentityKeyPair;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// A registered user as the directory knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: u64,
    pub name: String,
    pub registration_id: u32,
    /// Identity and current signed prekey; never carries a one-time prekey.
    pub bundle: PreKeyBundle,
}

pub trait Directory: Send + Sync {
    /// Register `name` with the uploaded bundle and one-time prekeys.
    fn register(&self, name: &str, upload: &RegistrationUpload) -> Result<UserRecord, ProtocolError>;

    fn lookup(&self, name: &str) -> Result<Option<UserRecord>, ProtocolError>;

    fn lookup_by_registration_id(&self, registration_id: u32) -> Result<Option<UserRecord>, ProtocolError>;

    fn list(&self) -> Result<Vec<UserRecord>, ProtocolError>;

    /// Bundle for starting a session with `name`.
    ///
    /// Removes the lowest remaining one-time prekey and includes it; two
    /// fetches never receive the same one. With the pool empty the bundle
    /// is returned without a one-time prekey.
    fn fetch_bundle(&self, name: &str) -> Result<PreKeyBundle, ProtocolError>;

    /// Add freshly generated one-time prekeys to `name`'s pool.
    fn replenish(&self, name: &str, prekeys: &[OneTimePreKeyPublic]) -> Result<(), ProtocolError>;

    /// Replace `name`'s signed prekey after a rotation.
    fn update_signed_prekey(&self, name: &str, signed_prekey: &SignedPreKeyPublic) -> Result<(), ProtocolError>;

    fn one_time_prekey_count(&self, name: &str) -> Result<usize, ProtocolError>;
}

/// Reject uploads whose signed prekey was not signed by the identity key.
pub fn verify_signed_prekey(identity_key: &[u8; 32], signed_prekey: &SignedPreKeyPublic) -> Result<(), ProtocolError> {
    IdentityKeyPair::verify(identity_key, &signed_prekey.public_key, &signed_prekey.signature)?;
    Ok(())
}

/// Log the outcome of a bundle fetch; warns when the prekey pool is empty.
pub fn log_bundle_fetch(name: &str, one_time_prekey: Option<&OneTimePreKeyPublic>) {
    match one_time_prekey {
        Some(prekey) => tracing::debug!(user = name, key_id = prekey.key_id, "handed out one-time prekey"),
        None => tracing::warn!(user = name, "one-time prekeys exhausted; serving bundle without one"),
    }
}

#[derive(Default)]
struct DirectoryInner {
    users: BTreeMap<String, UserRecord>,
    one_time_prekeys: HashMap<String, BTreeMap<u32, [u8; 32]>>,
    next_id: u64,
}

/// In-memory directory, used by tests and embedded relays.
#[derive(Default)]
pub struct MemoryDirectory {
    inner: Mutex<DirectoryInner>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Directory for MemoryDirectory {
    fn register(&self, name: &str, upload: &RegistrationUpload) -> Result<UserRecord, ProtocolError> {
        upload.bundle.verify_signature()?;

        let mut inner = self.inner.lock();
        if inner.users.contains_key(name) {
            return Err(ProtocolError::UserExists(name.to_string()));
        }
        let registration_id = upload.bundle.registration_id;
        if inner.users.values().any(|u| u.registration_id == registration_id) {
            return Err(ProtocolError::RegistrationIdTaken(registration_id));
        }

        inner.next_id += 1;
        let record = UserRecord {
            id: inner.next_id,
            name: name.to_string(),
            registration_id,
            bundle: upload.bundle.clone().with_one_time_prekey(None),
        };
        inner.users.insert(name.to_string(), record.clone());
        inner.one_time_prekeys.insert(
            name.to_string(),
            upload
                .one_time_prekeys
                .iter()
                .map(|k| (k.key_id, k.public_key))
                .collect(),
        );
        tracing::info!(user = name, registration_id, "registered user");
        Ok(record)
    }

    fn lookup(&self, name: &str) -> Result<Option<UserRecord>, ProtocolError> {
        Ok(self.inner.lock().users.get(name).cloned())
    }

    fn lookup_by_registration_id(&self, registration_id: u32) -> Result<Option<UserRecord>, ProtocolError> {
        Ok(self
            .inner
            .lock()
            .users
            .values()
            .find(|u| u.registration_id == registration_id)
            .cloned())
    }

    fn list(&self) -> Result<Vec<UserRecord>, ProtocolError> {
        let mut users: Vec<UserRecord> = self.inner.lock().users.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    fn fetch_bundle(&self, name: &str) -> Result<PreKeyBundle, ProtocolError> {
        let mut inner = self.inner.lock();
        let bundle = inner
            .users
            .get(name)
            .map(|u| u.bundle.clone())
            .ok_or_else(|| ProtocolError::UnknownUser(name.to_string()))?;
        let one_time_prekey = inner
            .one_time_prekeys
            .get_mut(name)
            .and_then(BTreeMap::pop_first)
            .map(|(key_id, public_key)| OneTimePreKeyPublic { key_id, public_key });
        drop(inner);

        log_bundle_fetch(name, one_time_prekey.as_ref());
        Ok(bundle.with_one_time_prekey(one_time_prekey))
    }

    fn replenish(&self, name: &str, prekeys: &[OneTimePreKeyPublic]) -> Result<(), ProtocolError> {
        let mut inner = self.inner.lock();
        if !inner.users.contains_key(name) {
            return Err(ProtocolError::UnknownUser(name.to_string()));
        }
        let pool = inner.one_time_prekeys.entry(name.to_string()).or_default();
        pool.extend(prekeys.iter().map(|k| (k.key_id, k.public_key)));
        tracing::debug!(user = name, added = prekeys.len(), remaining = pool.len(), "replenished one-time prekeys");
        Ok(())
    }

    fn update_signed_prekey(&self, name: &str, signed_prekey: &SignedPreKeyPublic) -> Result<(), ProtocolError> {
        let mut inner = self.inner.lock();
        let user = inner
            .users
            .get_mut(name)
            .ok_or_else(|| ProtocolError::UnknownUser(name.to_string()))?;
        verify_signed_prekey(&user.bundle.identity_key, signed_prekey)?;
        user.bundle.signed_prekey = signed_prekey.clone();
        tracing::info!(user = name, key_id = signed_prekey.key_id, "updated signed prekey");
        Ok(())
    }

    fn one_time_prekey_count(&self, name: &str) -> Result<usize, ProtocolError> {
        let inner = self.inner.lock();
        if !inner.users.contains_key(name) {
            return Err(ProtocolError::UnknownUser(name.to_string()));
        }
        Ok(inner.one_time_prekeys.get(name).map_or(0, BTreeMap::len))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use murmur_crypto::signal::{BundlePublisher, KeyStore, MemoryIdentityStore, MemoryPreKeyStore};
    use murmur_crypto::CryptoError;

    use super::*;

    fn upload(one_time_prekeys: u32) -> (KeyStore, RegistrationUpload) {
        let store = KeyStore::new(
            Box::new(MemoryIdentityStore::new()),
            Box::new(MemoryPreKeyStore::new()),
        );
        let identity = store.generate_identity().unwrap();
        store.generate_signed_prekey(&identity, 1).unwrap();
        store.generate_one_time_prekeys(one_time_prekeys).unwrap();
        let upload = BundlePublisher::new(&store)
            .registration_upload(one_time_prekeys)
            .unwrap();
        (store, upload)
    }

    #[test]
    fn register_and_lookup() {
        let directory = MemoryDirectory::new();
        let (_, alice) = upload(3);
        let record = directory.register("alice", &alice).unwrap();

        assert_eq!(record.id, 1);
        assert_eq!(directory.lookup("alice").unwrap(), Some(record.clone()));
        assert_eq!(
            directory.lookup_by_registration_id(record.registration_id).unwrap(),
            Some(record)
        );
        assert!(directory.lookup("bob").unwrap().is_none());
        assert_eq!(directory.one_time_prekey_count("alice").unwrap(), 3);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let directory = MemoryDirectory::new();
        directory.register("alice", &upload(0).1).unwrap();
        let result = directory.register("alice", &upload(0).1);
        assert!(matches!(result, Err(ProtocolError::UserExists(name)) if name == "alice"));
    }

    #[test]
    fn forged_bundle_is_rejected() {
        let directory = MemoryDirectory::new();
        let (_, mut forged) = upload(0);
        forged.bundle.signed_prekey.public_key[0] ^= 0xFF;
        let result = directory.register("mallory", &forged);
        assert!(matches!(result, Err(ProtocolError::Crypto(CryptoError::InvalidSignature))));
    }

    #[test]
    fn fetch_pops_lowest_key_then_degrades() {
        let directory = MemoryDirectory::new();
        let (_, alice) = upload(2);
        let first_id = alice.one_time_prekeys[0].key_id;
        directory.register("alice", &alice).unwrap();

        let first = directory.fetch_bundle("alice").unwrap();
        let second = directory.fetch_bundle("alice").unwrap();
        let third = directory.fetch_bundle("alice").unwrap();

        assert_eq!(first.one_time_prekey.map(|k| k.key_id), Some(first_id));
        assert_eq!(second.one_time_prekey.map(|k| k.key_id), Some(first_id + 1));
        assert!(third.one_time_prekey.is_none());
        third.verify_signature().unwrap();
    }

    #[test]
    fn concurrent_fetches_never_share_a_key() {
        let directory = Arc::new(MemoryDirectory::new());
        directory.register("alice", &upload(50).1).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let directory = Arc::clone(&directory);
                thread::spawn(move || {
                    (0..10)
                        .filter_map(|_| directory.fetch_bundle("alice").unwrap().one_time_prekey)
                        .map(|k| k.key_id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids: Vec<u32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 50);
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 50);
    }

    #[test]
    fn signed_prekey_update_is_verified() {
        let directory = MemoryDirectory::new();
        let (store, alice) = upload(0);
        directory.register("alice", &alice).unwrap();

        let rotated = store.rotate_signed_prekey().unwrap().public();
        directory.update_signed_prekey("alice", &rotated).unwrap();
        assert_eq!(directory.fetch_bundle("alice").unwrap().signed_prekey, rotated);

        let (_, other) = upload(0);
        let result = directory.update_signed_prekey("alice", &other.bundle.signed_prekey);
        assert!(matches!(result, Err(ProtocolError::Crypto(CryptoError::InvalidSignature))));
    }

    #[test]
    fn unknown_user_errors() {
        let directory = MemoryDirectory::new();
        assert!(matches!(directory.fetch_bundle("ghost"), Err(ProtocolError::UnknownUser(_))));
        assert!(matches!(directory.replenish("ghost", &[]), Err(ProtocolError::UnknownUser(_))));
    }
}
