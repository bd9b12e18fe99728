//! Client-side key, trust and session storage.

use std::sync::Arc;

use murmur_crypto::signal::{IdentityKeyStore, PreKeyStore, SessionAddress, SessionStore};
use murmur_crypto::CryptoError;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{open_client_db, timestamp_now};
use crate::error::StoreError;

/// SQLite implementation of the identity, prekey and session stores.
///
/// Cheap to clone; clones share one connection, so each store trait can be
/// handed out as its own box while writes stay serialized.
#[derive(Clone)]
pub struct SqliteClientStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteClientStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Ok(Self::from_connection(open_client_db(path)?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T, rusqlite::Error>) -> Result<T, CryptoError> {
        let mut conn = self.conn.lock();
        f(&mut conn).map_err(|e| StoreError::from(e).into())
    }
}

impl IdentityKeyStore for SqliteClientStore {
    fn load_identity_key_pair(&self) -> Result<Option<Vec<u8>>, CryptoError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT private_key FROM local_identity WHERE id = 1", [], |row| {
                row.get::<_, Option<Vec<u8>>>(0)
            })
            .optional()
            .map(Option::flatten)
        })
    }

    fn store_identity_key_pair(&self, private_key: &[u8]) -> Result<(), CryptoError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO local_identity (id, private_key) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET private_key = excluded.private_key",
                params![private_key],
            )
            .map(drop)
        })
    }

    fn get_local_registration_id(&self) -> Result<Option<u32>, CryptoError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT registration_id FROM local_identity WHERE id = 1", [], |row| {
                row.get::<_, Option<u32>>(0)
            })
            .optional()
            .map(Option::flatten)
        })
    }

    fn store_local_registration_id(&self, registration_id: u32) -> Result<(), CryptoError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO local_identity (id, registration_id) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET registration_id = excluded.registration_id",
                params![registration_id],
            )
            .map(drop)
        })
    }

    fn load_trusted_identity(&self, peer: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT identity_key FROM trusted_identities WHERE peer = ?1",
                params![peer],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn save_trusted_identity(&self, peer: &str, identity_key: &[u8]) -> Result<(), CryptoError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO trusted_identities (peer, identity_key, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(peer) DO UPDATE SET identity_key = excluded.identity_key,
                                                 updated_at = excluded.updated_at",
                params![peer, identity_key, timestamp_now()],
            )
            .map(drop)
        })
    }
}

impl PreKeyStore for SqliteClientStore {
    fn allocate_prekey_ids(&self, count: u32) -> Result<u32, CryptoError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let first: u32 = tx
                .query_row("SELECT next_id FROM prekey_sequence WHERE id = 1", [], |row| row.get(0))
                .optional()?
                .unwrap_or(1);
            tx.execute(
                "INSERT INTO prekey_sequence (id, next_id) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET next_id = excluded.next_id",
                params![i64::from(first) + i64::from(count)],
            )?;
            tx.commit()?;
            Ok(first)
        })
    }

    fn store_prekey(&self, prekey_id: u32, record: &[u8]) -> Result<(), CryptoError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO prekeys (id, record, issued) VALUES (?1, ?2, 0)",
                params![prekey_id, record],
            )
            .map(drop)
        })
    }

    fn load_prekey(&self, prekey_id: u32) -> Result<Option<Vec<u8>>, CryptoError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT record FROM prekeys WHERE id = ?1", params![prekey_id], |row| {
                row.get(0)
            })
            .optional()
        })
    }

    fn take_prekey(&self, prekey_id: u32) -> Result<Option<Vec<u8>>, CryptoError> {
        self.with_conn(|conn| {
            conn.query_row(
                "DELETE FROM prekeys WHERE id = ?1 RETURNING record",
                params![prekey_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn issue_prekey(&self) -> Result<Option<(u32, Vec<u8>)>, CryptoError> {
        self.with_conn(|conn| {
            conn.query_row(
                "UPDATE prekeys SET issued = 1
                 WHERE id = (SELECT id FROM prekeys WHERE issued = 0 ORDER BY id LIMIT 1)
                 RETURNING id, record",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })
    }

    fn unissued_prekey_count(&self) -> Result<usize, CryptoError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM prekeys WHERE issued = 0", [], |row| {
                row.get(0)
            })
        })
    }

    fn store_signed_prekey(&self, signed_prekey_id: u32, record: &[u8]) -> Result<(), CryptoError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO signed_prekeys (id, record, created_at) VALUES (?1, ?2, ?3)",
                params![signed_prekey_id, record, timestamp_now()],
            )
            .map(drop)
        })
    }

    fn load_signed_prekey(&self, signed_prekey_id: u32) -> Result<Option<Vec<u8>>, CryptoError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT record FROM signed_prekeys WHERE id = ?1",
                params![signed_prekey_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn latest_signed_prekey_id(&self) -> Result<Option<u32>, CryptoError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT MAX(id) FROM signed_prekeys", [], |row| row.get(0))
        })
    }

    fn remove_signed_prekeys_below(&self, signed_prekey_id: u32) -> Result<usize, CryptoError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM signed_prekeys WHERE id < ?1", params![signed_prekey_id])
        })
    }
}

impl SessionStore for SqliteClientStore {
    fn load_session(&self, address: &SessionAddress) -> Result<Option<Vec<u8>>, CryptoError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT record FROM sessions WHERE name = ?1 AND device_id = ?2",
                params![address.name, address.device_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn store_session(&self, address: &SessionAddress, session_data: &[u8]) -> Result<(), CryptoError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (name, device_id, record, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name, device_id) DO UPDATE SET record = excluded.record,
                                                            updated_at = excluded.updated_at",
                params![address.name, address.device_id, session_data, timestamp_now()],
            )
            .map(drop)
        })
    }

    fn has_session(&self, address: &SessionAddress) -> Result<bool, CryptoError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sessions WHERE name = ?1 AND device_id = ?2)",
                params![address.name, address.device_id],
                |row| row.get(0),
            )
        })
    }

    fn delete_session(&self, address: &SessionAddress) -> Result<(), CryptoError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM sessions WHERE name = ?1 AND device_id = ?2",
                params![address.name, address.device_id],
            )
            .map(drop)
        })
    }

    fn list_sessions(&self) -> Result<Vec<SessionAddress>, CryptoError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name, device_id FROM sessions ORDER BY name, device_id")?;
            let rows = stmt.query_map([], |row| Ok(SessionAddress::new(row.get::<_, String>(0)?, row.get(1)?)))?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use murmur_crypto::signal::{
        BundlePublisher, KeyStore, MemoryIdentityStore, MemoryPreKeyStore, MemorySessionStore, SignalSessionManager,
        TrustOnFirstUse,
    };
    use murmur_crypto::ProtocolConfig;

    use super::*;

    fn store() -> (tempfile::TempDir, SqliteClientStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.db");
        let store = SqliteClientStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn identity_and_registration_are_stored_independently() {
        let (_dir, store) = store();
        assert!(store.load_identity_key_pair().unwrap().is_none());
        assert!(store.get_local_registration_id().unwrap().is_none());

        store.store_local_registration_id(77).unwrap();
        assert!(store.load_identity_key_pair().unwrap().is_none());
        store.store_identity_key_pair(&[5; 32]).unwrap();

        assert_eq!(store.load_identity_key_pair().unwrap(), Some(vec![5; 32]));
        assert_eq!(store.get_local_registration_id().unwrap(), Some(77));
    }

    #[test]
    fn prekey_ids_are_never_reused() {
        let (_dir, store) = store();
        assert_eq!(store.allocate_prekey_ids(10).unwrap(), 1);
        assert_eq!(store.allocate_prekey_ids(5).unwrap(), 11);
        assert_eq!(store.allocate_prekey_ids(1).unwrap(), 16);
    }

    #[test]
    fn issue_then_take() {
        let (_dir, store) = store();
        store.store_prekey(2, b"two").unwrap();
        store.store_prekey(1, b"one").unwrap();
        assert_eq!(store.unissued_prekey_count().unwrap(), 2);

        assert_eq!(store.issue_prekey().unwrap(), Some((1, b"one".to_vec())));
        assert_eq!(store.unissued_prekey_count().unwrap(), 1);
        assert_eq!(store.load_prekey(1).unwrap(), Some(b"one".to_vec()));

        assert_eq!(store.take_prekey(1).unwrap(), Some(b"one".to_vec()));
        assert!(store.take_prekey(1).unwrap().is_none());
        assert_eq!(store.issue_prekey().unwrap(), Some((2, b"two".to_vec())));
        assert!(store.issue_prekey().unwrap().is_none());
    }

    #[test]
    fn concurrent_take_succeeds_once() {
        let (_dir, store) = store();
        store.store_prekey(9, b"nine").unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || store.take_prekey(9).unwrap().is_some())
            })
            .collect();
        let wins = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn signed_prekeys_track_latest() {
        let (_dir, store) = store();
        assert!(store.latest_signed_prekey_id().unwrap().is_none());
        store.store_signed_prekey(1, b"a").unwrap();
        store.store_signed_prekey(2, b"b").unwrap();
        assert_eq!(store.latest_signed_prekey_id().unwrap(), Some(2));
        store.store_signed_prekey(5, b"e").unwrap();
        assert_eq!(store.remove_signed_prekeys_below(5).unwrap(), 2);
        assert!(store.load_signed_prekey(1).unwrap().is_none());
        assert!(store.load_signed_prekey(2).unwrap().is_none());
        assert_eq!(store.latest_signed_prekey_id().unwrap(), Some(5));
    }

    #[test]
    fn sessions_replace_and_list() {
        let (_dir, store) = store();
        let bob = SessionAddress::new("bob", 0);
        let carol = SessionAddress::new("carol", 0);

        store.store_session(&carol, b"c1").unwrap();
        store.store_session(&bob, b"b1").unwrap();
        store.store_session(&bob, b"b2").unwrap();

        assert_eq!(store.load_session(&bob).unwrap(), Some(b"b2".to_vec()));
        assert_eq!(store.list_sessions().unwrap(), vec![bob.clone(), carol]);
        store.delete_session(&bob).unwrap();
        assert!(!store.has_session(&bob).unwrap());
    }

    #[test]
    fn keys_and_sessions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.db");
        let path = path.to_str().unwrap();
        let bob_address = SessionAddress::new("bob", 0);

        let bob = SignalSessionManager::new(
            KeyStore::new(
                Box::new(MemoryIdentityStore::new()),
                Box::new(MemoryPreKeyStore::new()),
            ),
            Box::new(MemorySessionStore::new()),
            Box::new(TrustOnFirstUse::default()),
            &ProtocolConfig::default(),
        );
        let identity = bob.key_store().generate_identity().unwrap();
        bob.key_store().generate_signed_prekey(&identity, 1).unwrap();
        let bundle = BundlePublisher::new(bob.key_store()).publish().unwrap();

        let sent = {
            let store = SqliteClientStore::open(path).unwrap();
            let alice = manager(&store);
            alice.key_store().generate_identity().unwrap();
            alice.establish_session(&bob_address, &bundle).unwrap();
            alice.encrypt(&bob_address, b"first").unwrap()
        };
        bob.decrypt(&SessionAddress::new("alice", 0), &sent).unwrap();

        let store = SqliteClientStore::open(path).unwrap();
        let alice = manager(&store);
        let second = alice.encrypt(&bob_address, b"second").unwrap();
        assert_eq!(bob.decrypt(&SessionAddress::new("alice", 0), &second).unwrap(), b"second");
        assert_eq!(alice.key_store().trusted_identity("bob").unwrap(), Some(bundle.identity_key));
    }

    fn manager(store: &SqliteClientStore) -> SignalSessionManager {
        SignalSessionManager::new(
            KeyStore::new(Box::new(store.clone()), Box::new(store.clone())),
            Box::new(store.clone()),
            Box::new(TrustOnFirstUse::default()),
            &ProtocolConfig::default(),
        )
    }
}
