//! SQLite persistence for murmur.
//!
//! [`SqliteClientStore`] keeps a client's identity, prekeys, pinned peer
//! identities and sessions. [`SqliteRelay`] is a directory and mailbox for
//! a relay shared by several clients.

pub mod client;
pub mod db;
pub mod error;
pub mod relay;

pub use client::SqliteClientStore;
pub use db::{open_client_db, open_relay_db};
pub use error::StoreError;
pub use relay::SqliteRelay;
