use rand::Rng;

use crate::identity::IdentityKeyPair;
use crate::signal::bundle::OneTimePreKeyPublic;
use crate::signal::prekeys::{KeyPair, OneTimePreKey, SignedPreKey};
use crate::signal::store::{IdentityKeyStore, PreKeyStore};
use crate::CryptoError;

/// Registration ids are drawn from the same 14-bit range Signal clients use.
const MAX_REGISTRATION_ID: u32 = 16380;

/// Owns the local identity, signed prekeys and the one-time prekey pool.
///
/// Persists through the [`IdentityKeyStore`] and [`PreKeyStore`]
/// collaborators; nothing else holds private key material.
pub struct KeyStore {
    identity_store: Box<dyn IdentityKeyStore>,
    prekey_store: Box<dyn PreKeyStore>,
}

impl KeyStore {
    pub fn new(identity_store: Box<dyn IdentityKeyStore>, prekey_store: Box<dyn PreKeyStore>) -> Self {
        Self {
            identity_store,
            prekey_store,
        }
    }

    /// Generate the local identity and registration id.
    ///
    /// The identity is immutable once created: calling this again returns the
    /// stored identity instead of replacing it.
    pub fn generate_identity(&self) -> Result<IdentityKeyPair, CryptoError> {
        if let Some(existing) = self.identity_store.load_identity_key_pair()? {
            tracing::debug!("identity already generated; keeping existing key");
            return IdentityKeyPair::from_private_slice(&existing);
        }

        let identity = IdentityKeyPair::generate();
        let registration_id = rand::thread_rng().gen_range(1..=MAX_REGISTRATION_ID);
        self.identity_store
            .store_identity_key_pair(identity.private_key_bytes())?;
        self.identity_store
            .store_local_registration_id(registration_id)?;

        tracing::info!(
            identity = identity.public_key_hex(),
            registration_id,
            "generated local identity"
        );
        Ok(identity)
    }

    pub fn load_identity(&self) -> Result<IdentityKeyPair, CryptoError> {
        let private = self
            .identity_store
            .load_identity_key_pair()?
            .ok_or(CryptoError::Uninitialized)?;
        IdentityKeyPair::from_private_slice(&private)
    }

    pub fn registration_id(&self) -> Result<u32, CryptoError> {
        self.identity_store
            .get_local_registration_id()?
            .ok_or(CryptoError::Uninitialized)
    }

    /// Generate, sign and store a signed prekey under `key_id`.
    pub fn generate_signed_prekey(
        &self,
        identity: &IdentityKeyPair,
        key_id: u32,
    ) -> Result<SignedPreKey, CryptoError> {
        let signed_prekey = SignedPreKey::generate(identity, key_id);
        self.prekey_store
            .store_signed_prekey(key_id, &signed_prekey.to_record()?)?;
        tracing::debug!(key_id, "generated signed prekey");
        Ok(signed_prekey)
    }

    /// Replace the current signed prekey with a fresh one.
    ///
    /// The previous key is retained so handshakes already in flight against
    /// it still complete; every key with a lower id is removed.
    pub fn rotate_signed_prekey(&self) -> Result<SignedPreKey, CryptoError> {
        let identity = self.load_identity()?;
        let current = self.prekey_store.latest_signed_prekey_id()?;
        let next_id = current.map_or(1, |id| id.wrapping_add(1).max(1));
        let signed_prekey = self.generate_signed_prekey(&identity, next_id)?;

        let mut removed = 0;
        if let Some(previous) = current.filter(|id| *id < next_id) {
            removed = self.prekey_store.remove_signed_prekeys_below(previous)?;
        }
        tracing::info!(key_id = next_id, removed, "rotated signed prekey");
        Ok(signed_prekey)
    }

    pub fn current_signed_prekey(&self) -> Result<SignedPreKey, CryptoError> {
        let key_id = self
            .prekey_store
            .latest_signed_prekey_id()?
            .ok_or(CryptoError::Uninitialized)?;
        self.load_signed_prekey(key_id)?
            .ok_or(CryptoError::Uninitialized)
    }

    pub fn load_signed_prekey(&self, key_id: u32) -> Result<Option<SignedPreKey>, CryptoError> {
        self.prekey_store
            .load_signed_prekey(key_id)?
            .map(|record| SignedPreKey::from_record(&record))
            .transpose()
    }

    /// Generate and store `count` one-time prekeys with fresh ids.
    pub fn generate_one_time_prekeys(&self, count: u32) -> Result<Vec<OneTimePreKey>, CryptoError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let first_id = self.prekey_store.allocate_prekey_ids(count)?;
        let mut prekeys = Vec::with_capacity(count as usize);
        for key_id in first_id..first_id + count {
            let prekey = OneTimePreKey::generate(key_id);
            self.prekey_store.store_prekey(key_id, &prekey.to_record()?)?;
            prekeys.push(prekey);
        }
        tracing::debug!(first_id, count, "generated one-time prekeys");
        Ok(prekeys)
    }

    /// Remove a one-time prekey and return its key pair.
    ///
    /// Returns `None` when the key was never stored or was already consumed;
    /// of two concurrent calls for the same id at most one gets `Some`.
    pub fn consume_one_time_prekey(&self, key_id: u32) -> Result<Option<KeyPair>, CryptoError> {
        let consumed = self
            .prekey_store
            .take_prekey(key_id)?
            .map(|record| OneTimePreKey::from_record(&record))
            .transpose()?
            .map(|prekey| prekey.key_pair);
        if consumed.is_some() {
            tracing::debug!(key_id, "consumed one-time prekey");
        }
        Ok(consumed)
    }

    /// Read a one-time prekey without consuming it.
    pub fn load_one_time_prekey(&self, key_id: u32) -> Result<Option<KeyPair>, CryptoError> {
        self.prekey_store
            .load_prekey(key_id)?
            .map(|record| OneTimePreKey::from_record(&record).map(|prekey| prekey.key_pair))
            .transpose()
    }

    /// Hand out the next one-time prekey for inclusion in a bundle.
    pub fn issue_one_time_prekey(&self) -> Result<OneTimePreKeyPublic, CryptoError> {
        let (_, record) = self
            .prekey_store
            .issue_prekey()?
            .ok_or(CryptoError::KeyExhausted)?;
        Ok(OneTimePreKey::from_record(&record)?.public())
    }

    pub fn unissued_one_time_prekeys(&self) -> Result<usize, CryptoError> {
        self.prekey_store.unissued_prekey_count()
    }

    pub fn trusted_identity(&self, peer: &str) -> Result<Option<[u8; 32]>, CryptoError> {
        self.identity_store
            .load_trusted_identity(peer)?
            .map(|bytes| {
                <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
                    CryptoError::StorageFailure(format!("pinned identity for {peer} is not 32 bytes"))
                })
            })
            .transpose()
    }

    pub fn pin_identity(&self, peer: &str, identity_key: &[u8; 32]) -> Result<(), CryptoError> {
        self.identity_store.save_trusted_identity(peer, identity_key)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::signal::memory_stores::{MemoryIdentityStore, MemoryPreKeyStore};

    fn key_store() -> KeyStore {
        KeyStore::new(
            Box::new(MemoryIdentityStore::new()),
            Box::new(MemoryPreKeyStore::new()),
        )
    }

    #[test]
    fn load_before_generate_is_uninitialized() {
        let store = key_store();
        assert!(matches!(store.load_identity(), Err(CryptoError::Uninitialized)));
        assert!(matches!(store.registration_id(), Err(CryptoError::Uninitialized)));
        assert!(matches!(store.current_signed_prekey(), Err(CryptoError::Uninitialized)));
    }

    #[test]
    fn generate_identity_is_idempotent() {
        let store = key_store();
        let first = store.generate_identity().unwrap();
        let second = store.generate_identity().unwrap();
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());

        let registration_id = store.registration_id().unwrap();
        assert!((1..=MAX_REGISTRATION_ID).contains(&registration_id));
    }

    #[test]
    fn one_time_prekeys_get_unique_ids() {
        let store = key_store();
        let first = store.generate_one_time_prekeys(3).unwrap();
        let second = store.generate_one_time_prekeys(3).unwrap();

        let ids: HashSet<u32> = first.iter().chain(&second).map(|k| k.key_id).collect();
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn consume_is_destructive() {
        let store = key_store();
        let prekey = store.generate_one_time_prekeys(1).unwrap().remove(0);

        let consumed = store.consume_one_time_prekey(prekey.key_id).unwrap().unwrap();
        assert_eq!(consumed.public_bytes(), prekey.key_pair.public_bytes());
        assert!(store.consume_one_time_prekey(prekey.key_id).unwrap().is_none());
    }

    #[test]
    fn concurrent_consume_succeeds_once() {
        for _ in 0..20 {
            let store = Arc::new(key_store());
            let key_id = store.generate_one_time_prekeys(1).unwrap()[0].key_id;

            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let store = Arc::clone(&store);
                    thread::spawn(move || store.consume_one_time_prekey(key_id).unwrap().is_some())
                })
                .collect();
            let successes = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(successes, 1);
        }
    }

    #[test]
    fn issue_signals_exhaustion() {
        let store = key_store();
        store.generate_one_time_prekeys(1).unwrap();
        store.issue_one_time_prekey().unwrap();
        assert!(matches!(store.issue_one_time_prekey(), Err(CryptoError::KeyExhausted)));
    }

    #[test]
    fn issued_prekey_can_still_be_consumed() {
        let store = key_store();
        store.generate_one_time_prekeys(1).unwrap();
        let issued = store.issue_one_time_prekey().unwrap();
        assert!(store.consume_one_time_prekey(issued.key_id).unwrap().is_some());
    }

    #[test]
    fn rotation_keeps_previous_signed_prekey_only() {
        let store = key_store();
        let identity = store.generate_identity().unwrap();
        store.generate_signed_prekey(&identity, 1).unwrap();

        let second = store.rotate_signed_prekey().unwrap();
        assert_eq!(second.key_id, 2);
        assert!(store.load_signed_prekey(1).unwrap().is_some());

        let third = store.rotate_signed_prekey().unwrap();
        assert_eq!(third.key_id, 3);
        assert!(store.load_signed_prekey(1).unwrap().is_none());
        assert!(store.load_signed_prekey(2).unwrap().is_some());
        assert_eq!(store.current_signed_prekey().unwrap().key_id, 3);
    }

    #[test]
    fn rotation_prunes_every_older_signed_prekey() {
        let store = key_store();
        let identity = store.generate_identity().unwrap();
        for key_id in [1, 4, 9] {
            store.generate_signed_prekey(&identity, key_id).unwrap();
        }

        let rotated = store.rotate_signed_prekey().unwrap();
        assert_eq!(rotated.key_id, 10);
        assert!(store.load_signed_prekey(1).unwrap().is_none());
        assert!(store.load_signed_prekey(4).unwrap().is_none());
        assert!(store.load_signed_prekey(9).unwrap().is_some());
        assert_eq!(store.current_signed_prekey().unwrap().key_id, 10);
    }

    #[test]
    fn pinned_identity_round_trips() {
        let store = key_store();
        assert!(store.trusted_identity("bob").unwrap().is_none());
        store.pin_identity("bob", &[7u8; 32]).unwrap();
        assert_eq!(store.trusted_identity("bob").unwrap(), Some([7u8; 32]));
    }
}
