use std::path::Path;
use std::sync::Arc;

use murmur_crypto::signal::{KeyStore, TrustOnFirstUse};
use murmur_crypto::ProtocolConfig;
use murmur_protocol::{Directory, Messenger};
use murmur_store::{SqliteClientStore, SqliteRelay};

fn messenger(dir: &Path, name: &str, relay: &Arc<SqliteRelay>) -> Messenger {
    let path = dir.join(format!("{name}.db"));
    let store = SqliteClientStore::open(path.to_str().unwrap()).unwrap();
    Messenger::new(
        name,
        KeyStore::new(Box::new(store.clone()), Box::new(store.clone())),
        Box::new(store),
        Box::new(TrustOnFirstUse::default()),
        relay.clone(),
        relay.clone(),
        ProtocolConfig {
            one_time_prekey_batch: 5,
            ..ProtocolConfig::default()
        },
    )
}

fn texts(messenger: &Messenger) -> Vec<String> {
    messenger
        .receive_pending()
        .unwrap()
        .into_iter()
        .map(|m| String::from_utf8(m.plaintext).unwrap())
        .collect()
}

#[test]
fn conversation_survives_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let relay_path = dir.path().join("relay.db");
    let relay = Arc::new(SqliteRelay::open(relay_path.to_str().unwrap()).unwrap());

    {
        let alice = messenger(dir.path(), "alice", &relay);
        let bob = messenger(dir.path(), "bob", &relay);
        alice.register().unwrap();
        bob.register().unwrap();
        alice.send_message("bob", b"hello bob").unwrap();
        assert_eq!(texts(&bob), vec!["hello bob"]);
        bob.send_message("alice", b"hi alice").unwrap();
    }
    assert_eq!(relay.one_time_prekey_count("bob").unwrap(), 4);

    // Every process reopens its database from disk.
    drop(relay);
    let relay = Arc::new(SqliteRelay::open(relay_path.to_str().unwrap()).unwrap());
    let alice = messenger(dir.path(), "alice", &relay);
    let bob = messenger(dir.path(), "bob", &relay);

    assert_eq!(texts(&alice), vec!["hi alice"]);
    alice.send_message("bob", b"still here").unwrap();
    assert_eq!(texts(&bob), vec!["still here"]);
    assert_eq!(alice.fingerprint("bob").unwrap(), bob.fingerprint("alice").unwrap());
}

#[test]
fn one_time_prekey_is_removed_from_client_after_use() {
    let dir = tempfile::tempdir().unwrap();
    let relay = Arc::new(SqliteRelay::open(dir.path().join("relay.db").to_str().unwrap()).unwrap());
    let alice = messenger(dir.path(), "alice", &relay);
    let bob = messenger(dir.path(), "bob", &relay);
    alice.register().unwrap();
    bob.register().unwrap();

    let used = relay.fetch_bundle("bob").unwrap().one_time_prekey.unwrap();
    assert!(bob.sessions().key_store().load_one_time_prekey(used.key_id).unwrap().is_some());

    // Alice's first message takes the next key in line.
    alice.send_message("bob", b"ping").unwrap();
    assert_eq!(texts(&bob), vec!["ping"]);
    assert!(bob.sessions().key_store().load_one_time_prekey(used.key_id + 1).unwrap().is_none());
    assert!(bob.sessions().key_store().load_one_time_prekey(used.key_id).unwrap().is_some());
}
