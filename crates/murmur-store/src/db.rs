use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;

use crate::error::StoreError;

/// Client-side schema version. Bump when the schema changes.
pub const CLIENT_SCHEMA_VERSION: i64 = 1;

/// Relay-side schema version. Bump when the schema changes.
pub const RELAY_SCHEMA_VERSION: i64 = 1;

/// Open (or create) a client database and apply its schema.
pub fn open_client_db(path: &str) -> Result<Connection, StoreError> {
    open(path, CLIENT_SCHEMA_VERSION, CLIENT_SCHEMA, "client")
}

/// Open (or create) a relay database and apply its schema.
pub fn open_relay_db(path: &str) -> Result<Connection, StoreError> {
    open(path, RELAY_SCHEMA_VERSION, RELAY_SCHEMA, "relay")
}

fn open(path: &str, version: i64, schema: &str, label: &'static str) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    let current: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    match current {
        0 => {
            conn.execute_batch(schema)?;
            conn.pragma_update(None, "user_version", version)?;
            tracing::info!(db = label, path, version, "created database schema");
        }
        // Never recreate: the client database holds private keys.
        found if found != version => {
            return Err(StoreError::SchemaVersion {
                found,
                expected: version,
            });
        }
        _ => {}
    }
    Ok(conn)
}

/// Milliseconds since the Unix epoch.
pub(crate) fn timestamp_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

const CLIENT_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS local_identity (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    private_key BLOB,
    registration_id INTEGER
);

CREATE TABLE IF NOT EXISTS trusted_identities (
    peer TEXT PRIMARY KEY,
    identity_key BLOB NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS prekeys (
    id INTEGER PRIMARY KEY,
    record BLOB NOT NULL,
    issued INTEGER NOT NULL DEFAULT 0
);

-- Next one-time prekey id; ids are never reused.
CREATE TABLE IF NOT EXISTS prekey_sequence (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    next_id INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS signed_prekeys (
    id INTEGER PRIMARY KEY,
    record BLOB NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    name TEXT NOT NULL,
    device_id INTEGER NOT NULL,
    record BLOB NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (name, device_id)
);
";

const RELAY_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    registration_id INTEGER NOT NULL UNIQUE,
    identity_key BLOB NOT NULL,
    signed_prekey_id INTEGER NOT NULL,
    signed_prekey BLOB NOT NULL,
    signature BLOB NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS prekeys (
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    key_id INTEGER NOT NULL,
    public_key BLOB NOT NULL,
    PRIMARY KEY (user_id, key_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recipient_registration_id INTEGER NOT NULL,
    message_type TEXT NOT NULL CHECK(message_type IN ('prekey','regular')),
    sender_registration_id INTEGER NOT NULL,
    body BLOB NOT NULL,
    fetched INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_unread
    ON messages(recipient_registration_id, fetched, id);
";
