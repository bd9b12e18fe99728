mod cli;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use murmur_crypto::signal::{KeyStore, TrustOnFirstUse};
use murmur_crypto::ProtocolConfig;
use murmur_protocol::{Directory, Messenger};
use murmur_store::{SqliteClientStore, SqliteRelay};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(&cli, &mut std::io::stdout().lock())
}

fn load_config(path: Option<&str>) -> Result<ProtocolConfig> {
    let Some(path) = path else {
        return Ok(ProtocolConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config {path}"))
}

fn open_messenger(cli: &Cli, relay: Arc<SqliteRelay>, config: ProtocolConfig) -> Result<Messenger> {
    let db_path = cli.db_path()?;
    let store =
        SqliteClientStore::open(&db_path).with_context(|| format!("opening client database {db_path}"))?;
    Ok(Messenger::new(
        cli.user()?,
        KeyStore::new(Box::new(store.clone()), Box::new(store.clone())),
        Box::new(store),
        Box::new(TrustOnFirstUse::new(config.trust)),
        relay.clone(),
        relay,
        config,
    ))
}

fn run(cli: &Cli, out: &mut impl Write) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let relay = Arc::new(
        SqliteRelay::open(&cli.relay).with_context(|| format!("opening relay database {}", cli.relay))?,
    );
    if cli.command == Command::Users {
        for user in relay.list()? {
            writeln!(out, "{}", serde_json::to_string(&user)?)?;
        }
        return Ok(());
    }

    let messenger = open_messenger(cli, relay, config)?;
    tracing::debug!(user = messenger.username(), command = ?cli.command, "running command");
    match &cli.command {
        Command::Register => {
            let registration = messenger.register()?;
            writeln!(
                out,
                "registered {} with registration id {}",
                messenger.username(),
                registration.registration_id
            )?;
        }
        Command::Send { peer, text } => {
            let message = messenger.send_message(peer, text.join(" ").as_bytes())?;
            writeln!(out, "sent {:?} message to {peer}", message.message_type)?;
        }
        Command::Fetch => {
            for message in messenger.receive_pending()? {
                writeln!(out, "{}: {}", message.sender, String::from_utf8_lossy(&message.plaintext))?;
            }
        }
        Command::Sessions => {
            for peer in messenger.peers()? {
                writeln!(out, "{peer}")?;
            }
        }
        Command::Fingerprint { peer } => writeln!(out, "{}", messenger.fingerprint(peer)?)?,
        Command::Reset { peer } => {
            messenger.reset_session(peer)?;
            writeln!(out, "session with {peer} reset")?;
        }
        Command::Replenish => {
            let count = messenger.replenish_pre_keys()?;
            writeln!(out, "uploaded {count} one-time prekeys")?;
        }
        Command::Rotate => {
            let key_id = messenger.rotate_signed_pre_key()?;
            writeln!(out, "published signed prekey {key_id}")?;
        }
        Command::Users => {}
    }
    Ok(())
}
