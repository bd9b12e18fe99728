//! Relay-side storage: the registration directory and the mailbox in one
//! SQLite database.

use murmur_crypto::signal::{
    EncryptedMessage, MessageType, OneTimePreKeyPublic, PreKeyBundle, RegistrationUpload, SignedPreKeyPublic,
};
use murmur_protocol::directory::{log_bundle_fetch, verify_signed_prekey};
use murmur_protocol::{Delivery, Directory, Mailbox, ProtocolError, UserRecord};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::db::{open_relay_db, timestamp_now};
use crate::error::StoreError;

const USER_COLUMNS: &str =
    "id, name, registration_id, identity_key, signed_prekey_id, signed_prekey, signature";

fn sql(e: rusqlite::Error) -> ProtocolError {
    StoreError::from(e).into()
}

struct UserRow {
    id: i64,
    name: String,
    registration_id: u32,
    identity_key: Vec<u8>,
    signed_prekey_id: u32,
    signed_prekey: Vec<u8>,
    signature: Vec<u8>,
}

impl UserRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            registration_id: row.get(2)?,
            identity_key: row.get(3)?,
            signed_prekey_id: row.get(4)?,
            signed_prekey: row.get(5)?,
            signature: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<UserRecord, StoreError> {
        let id = u64::try_from(self.id).map_err(|_| StoreError::Corrupt(format!("negative user id {}", self.id)))?;
        Ok(UserRecord {
            id,
            bundle: PreKeyBundle {
                identity_key: key32(&self.identity_key, "identity key")?,
                registration_id: self.registration_id,
                signed_prekey: SignedPreKeyPublic {
                    key_id: self.signed_prekey_id,
                    public_key: key32(&self.signed_prekey, "signed prekey")?,
                    signature: self.signature,
                },
                one_time_prekey: None,
            },
            name: self.name,
            registration_id: self.registration_id,
        })
    }
}

fn key32(bytes: &[u8], what: &str) -> Result<[u8; 32], StoreError> {
    bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("{what} has {} bytes", bytes.len())))
}

fn message_type_column(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::PreKeyBundle => "prekey",
        MessageType::Regular => "regular",
    }
}

fn parse_message_type(column: &str) -> Result<MessageType, StoreError> {
    match column {
        "prekey" => Ok(MessageType::PreKeyBundle),
        "regular" => Ok(MessageType::Regular),
        other => Err(StoreError::Corrupt(format!("unknown message type {other:?}"))),
    }
}

/// Directory and mailbox backed by SQLite.
pub struct SqliteRelay {
    conn: Mutex<Connection>,
}

impl SqliteRelay {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Ok(Self::from_connection(open_relay_db(path)?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn user(conn: &Connection, name: &str) -> Result<Option<UserRow>, ProtocolError> {
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE name = ?1"),
            params![name],
            UserRow::from_row,
        )
        .optional()
        .map_err(sql)
    }

    fn user_id(conn: &Connection, name: &str) -> Result<i64, ProtocolError> {
        conn.query_row("SELECT id FROM users WHERE name = ?1", params![name], |row| row.get(0))
            .optional()
            .map_err(sql)?
            .ok_or_else(|| ProtocolError::UnknownUser(name.to_string()))
    }
}

impl Directory for SqliteRelay {
    fn register(&self, name: &str, upload: &RegistrationUpload) -> Result<UserRecord, ProtocolError> {
        upload.bundle.verify_signature()?;
        let bundle = &upload.bundle;

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql)?;
        if Self::user(&tx, name)?.is_some() {
            return Err(ProtocolError::UserExists(name.to_string()));
        }
        let id_taken: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE registration_id = ?1)",
                params![bundle.registration_id],
                |row| row.get(0),
            )
            .map_err(sql)?;
        if id_taken {
            return Err(ProtocolError::RegistrationIdTaken(bundle.registration_id));
        }

        tx.execute(
            "INSERT INTO users (name, registration_id, identity_key, signed_prekey_id, signed_prekey, signature, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                name,
                bundle.registration_id,
                &bundle.identity_key[..],
                bundle.signed_prekey.key_id,
                &bundle.signed_prekey.public_key[..],
                bundle.signed_prekey.signature,
                timestamp_now(),
            ],
        )
        .map_err(sql)?;
        let user_id = tx.last_insert_rowid();
        {
            let mut insert = tx
                .prepare("INSERT OR IGNORE INTO prekeys (user_id, key_id, public_key) VALUES (?1, ?2, ?3)")
                .map_err(sql)?;
            for prekey in &upload.one_time_prekeys {
                insert
                    .execute(params![user_id, prekey.key_id, &prekey.public_key[..]])
                    .map_err(sql)?;
            }
        }
        let record = Self::user(&tx, name)?
            .ok_or_else(|| ProtocolError::Storage(format!("user {name} vanished during registration")))?
            .into_record()?;
        tx.commit().map_err(sql)?;

        tracing::info!(user = name, registration_id = record.registration_id, "registered user");
        Ok(record)
    }

    fn lookup(&self, name: &str) -> Result<Option<UserRecord>, ProtocolError> {
        let conn = self.conn.lock();
        Ok(Self::user(&conn, name)?.map(UserRow::into_record).transpose()?)
    }

    fn lookup_by_registration_id(&self, registration_id: u32) -> Result<Option<UserRecord>, ProtocolError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE registration_id = ?1"),
                params![registration_id],
                UserRow::from_row,
            )
            .optional()
            .map_err(sql)?;
        Ok(row.map(UserRow::into_record).transpose()?)
    }

    fn list(&self) -> Result<Vec<UserRecord>, ProtocolError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))
            .map_err(sql)?;
        let rows = stmt
            .query_map([], UserRow::from_row)
            .map_err(sql)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql)?;
        Ok(rows
            .into_iter()
            .map(UserRow::into_record)
            .collect::<Result<Vec<_>, _>>()?)
    }

    fn fetch_bundle(&self, name: &str) -> Result<PreKeyBundle, ProtocolError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql)?;
        let user = Self::user(&tx, name)?.ok_or_else(|| ProtocolError::UnknownUser(name.to_string()))?;
        let taken: Option<(u32, Vec<u8>)> = tx
            .query_row(
                "DELETE FROM prekeys
                 WHERE user_id = ?1
                   AND key_id = (SELECT MIN(key_id) FROM prekeys WHERE user_id = ?1)
                 RETURNING key_id, public_key",
                params![user.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(sql)?;
        tx.commit().map_err(sql)?;
        drop(conn);

        let one_time_prekey = taken
            .map(|(key_id, public_key)| -> Result<_, StoreError> {
                Ok(OneTimePreKeyPublic {
                    key_id,
                    public_key: key32(&public_key, "one-time prekey")?,
                })
            })
            .transpose()?;
        log_bundle_fetch(name, one_time_prekey.as_ref());
        Ok(user.into_record()?.bundle.with_one_time_prekey(one_time_prekey))
    }

    fn replenish(&self, name: &str, prekeys: &[OneTimePreKeyPublic]) -> Result<(), ProtocolError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql)?;
        let user_id = Self::user_id(&tx, name)?;
        {
            let mut insert = tx
                .prepare("INSERT OR IGNORE INTO prekeys (user_id, key_id, public_key) VALUES (?1, ?2, ?3)")
                .map_err(sql)?;
            for prekey in prekeys {
                insert
                    .execute(params![user_id, prekey.key_id, &prekey.public_key[..]])
                    .map_err(sql)?;
            }
        }
        tx.commit().map_err(sql)?;
        tracing::debug!(user = name, added = prekeys.len(), "replenished one-time prekeys");
        Ok(())
    }

    fn update_signed_prekey(&self, name: &str, signed_prekey: &SignedPreKeyPublic) -> Result<(), ProtocolError> {
        let conn = self.conn.lock();
        let user = Self::user(&conn, name)?
            .ok_or_else(|| ProtocolError::UnknownUser(name.to_string()))?
            .into_record()?;
        verify_signed_prekey(&user.bundle.identity_key, signed_prekey)?;
        conn.execute(
            "UPDATE users SET signed_prekey_id = ?1, signed_prekey = ?2, signature = ?3 WHERE id = ?4",
            params![
                signed_prekey.key_id,
                &signed_prekey.public_key[..],
                signed_prekey.signature,
                user.id
            ],
        )
        .map_err(sql)?;
        tracing::info!(user = name, key_id = signed_prekey.key_id, "updated signed prekey");
        Ok(())
    }

    fn one_time_prekey_count(&self, name: &str) -> Result<usize, ProtocolError> {
        let conn = self.conn.lock();
        let user_id = Self::user_id(&conn, name)?;
        conn.query_row("SELECT COUNT(*) FROM prekeys WHERE user_id = ?1", params![user_id], |row| {
            row.get(0)
        })
        .map_err(sql)
    }
}

impl Mailbox for SqliteRelay {
    fn deliver(&self, recipient_registration_id: u32, message: &EncryptedMessage) -> Result<u64, ProtocolError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (recipient_registration_id, message_type, sender_registration_id, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                recipient_registration_id,
                message_type_column(message.message_type),
                message.sender_registration_id,
                message.body,
                timestamp_now(),
            ],
        )
        .map_err(sql)?;
        let id = u64::try_from(conn.last_insert_rowid())
            .map_err(|_| ProtocolError::Storage("negative message id".into()))?;
        tracing::trace!(id, recipient_registration_id, "queued message");
        Ok(id)
    }

    fn fetch_unread(&self, recipient_registration_id: u32) -> Result<Vec<Delivery>, ProtocolError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, message_type, sender_registration_id, body FROM messages
                 WHERE recipient_registration_id = ?1 AND fetched = 0
                 ORDER BY id",
            )
            .map_err(sql)?;
        let rows = stmt
            .query_map(params![recipient_registration_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })
            .map_err(sql)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql)?;

        let mut deliveries = Vec::with_capacity(rows.len());
        for (id, message_type, sender_registration_id, body) in rows {
            deliveries.push(Delivery {
                id: u64::try_from(id).map_err(|_| StoreError::Corrupt(format!("negative message id {id}")))?,
                recipient_registration_id,
                message: EncryptedMessage {
                    message_type: parse_message_type(&message_type)?,
                    sender_registration_id,
                    body,
                },
            });
        }
        Ok(deliveries)
    }

    fn acknowledge(&self, recipient_registration_id: u32, delivery_ids: &[u64]) -> Result<(), ProtocolError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql)?;
        {
            let mut mark = tx
                .prepare("UPDATE messages SET fetched = 1 WHERE id = ?1 AND recipient_registration_id = ?2")
                .map_err(sql)?;
            for id in delivery_ids {
                // Ids beyond i64 cannot exist in the table.
                let Ok(id) = i64::try_from(*id) else { continue };
                mark.execute(params![id, recipient_registration_id]).map_err(sql)?;
            }
        }
        tx.commit().map_err(sql)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use murmur_crypto::signal::{BundlePublisher, KeyStore, MemoryIdentityStore, MemoryPreKeyStore};
    use murmur_crypto::CryptoError;

    use super::*;

    fn relay() -> (tempfile::TempDir, SqliteRelay) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        let relay = SqliteRelay::open(path.to_str().unwrap()).unwrap();
        (dir, relay)
    }

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

    fn message(body: &[u8]) -> EncryptedMessage {
        EncryptedMessage {
            message_type: MessageType::PreKeyBundle,
            sender_registration_id: 42,
            body: body.to_vec(),
        }
    }

    #[test]
    fn register_and_lookup() {
        let (_dir, relay) = relay();
        let (_, alice) = upload(3);
        let record = relay.register("alice", &alice).unwrap();

        assert_eq!(record.bundle, alice.bundle.clone().with_one_time_prekey(None));
        assert_eq!(relay.lookup("alice").unwrap(), Some(record.clone()));
        assert_eq!(
            relay.lookup_by_registration_id(record.registration_id).unwrap(),
            Some(record.clone())
        );
        assert_eq!(relay.list().unwrap(), vec![record]);
        assert_eq!(relay.one_time_prekey_count("alice").unwrap(), 3);
    }

    #[test]
    fn conflicting_registrations_are_rejected() {
        let (_dir, relay) = relay();
        let (_, alice) = upload(0);
        relay.register("alice", &alice).unwrap();

        assert!(matches!(
            relay.register("alice", &upload(0).1),
            Err(ProtocolError::UserExists(_))
        ));
        assert!(matches!(
            relay.register("alice2", &alice),
            Err(ProtocolError::RegistrationIdTaken(id)) if id == alice.bundle.registration_id
        ));

        let (_, mut forged) = upload(0);
        forged.bundle.signed_prekey.signature[0] ^= 1;
        assert!(matches!(
            relay.register("mallory", &forged),
            Err(ProtocolError::Crypto(CryptoError::InvalidSignature))
        ));
        assert_eq!(relay.list().unwrap().len(), 1);
    }

    #[test]
    fn bundle_fetch_hands_out_each_prekey_once() {
        let (_dir, relay) = relay();
        let (_, alice) = upload(2);
        let first_id = alice.one_time_prekeys[0].key_id;
        relay.register("alice", &alice).unwrap();

        let first = relay.fetch_bundle("alice").unwrap();
        let second = relay.fetch_bundle("alice").unwrap();
        let third = relay.fetch_bundle("alice").unwrap();

        assert_eq!(first.one_time_prekey, Some(alice.one_time_prekeys[0].clone()));
        assert_eq!(second.one_time_prekey.map(|k| k.key_id), Some(first_id + 1));
        assert!(third.one_time_prekey.is_none());
        third.verify_signature().unwrap();
        assert!(matches!(relay.fetch_bundle("ghost"), Err(ProtocolError::UnknownUser(_))));
    }

    #[test]
    fn concurrent_fetches_never_share_a_key() {
        let (_dir, relay) = relay();
        relay.register("alice", &upload(20).1).unwrap();
        let relay = Arc::new(relay);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let relay = Arc::clone(&relay);
                thread::spawn(move || {
                    (0..6)
                        .filter_map(|_| relay.fetch_bundle("alice").unwrap().one_time_prekey)
                        .map(|k| k.key_id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids: Vec<u32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 20);
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 20);
    }

    #[test]
    fn replenish_and_rotate() {
        let (_dir, relay) = relay();
        let (store, alice) = upload(1);
        relay.register("alice", &alice).unwrap();

        let more = store.generate_one_time_prekeys(2).unwrap();
        let more: Vec<OneTimePreKeyPublic> = more.iter().map(|k| k.public()).collect();
        relay.replenish("alice", &more).unwrap();
        relay.replenish("alice", &more).unwrap();
        assert_eq!(relay.one_time_prekey_count("alice").unwrap(), 3);

        let rotated = store.rotate_signed_prekey().unwrap().public();
        relay.update_signed_prekey("alice", &rotated).unwrap();
        assert_eq!(relay.fetch_bundle("alice").unwrap().signed_prekey, rotated);

        let (_, other) = upload(0);
        assert!(matches!(
            relay.update_signed_prekey("alice", &other.bundle.signed_prekey),
            Err(ProtocolError::Crypto(CryptoError::InvalidSignature))
        ));
    }

    #[test]
    fn mailbox_keeps_messages_until_acknowledged() {
        let (_dir, relay) = relay();
        let first = relay.deliver(7, &message(b"one")).unwrap();
        let second = relay.deliver(7, &message(b"two")).unwrap();
        relay.deliver(8, &message(b"other")).unwrap();

        let unread = relay.fetch_unread(7).unwrap();
        assert_eq!(unread.iter().map(|d| d.id).collect::<Vec<_>>(), vec![first, second]);
        assert_eq!(unread[0].message, message(b"one"));
        assert_eq!(relay.fetch_unread(7).unwrap().len(), 2);

        relay.acknowledge(8, &[first]).unwrap();
        assert_eq!(relay.fetch_unread(7).unwrap().len(), 2);

        relay.acknowledge(7, &[first, u64::MAX]).unwrap();
        let unread = relay.fetch_unread(7).unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, second);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        let path = path.to_str().unwrap();
        let (_, alice) = upload(2);

        {
            let relay = SqliteRelay::open(path).unwrap();
            relay.register("alice", &alice).unwrap();
            relay.deliver(alice.bundle.registration_id, &message(b"hi")).unwrap();
        }

        let relay = SqliteRelay::open(path).unwrap();
        assert!(relay.lookup("alice").unwrap().is_some());
        assert_eq!(relay.one_time_prekey_count("alice").unwrap(), 2);
        assert_eq!(relay.fetch_unread(alice.bundle.registration_id).unwrap().len(), 1);
    }
}
