use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

/// Command-line arguments for the client.
#[derive(Parser, Debug)]
#[command(name = "murmur")]
#[command(version, about = "End-to-end encrypted messaging over a shared relay database")]
#[command(after_help = "RUST_LOG controls log output (default: warn).")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Local user name
    #[arg(short, long, global = true, env = "MURMUR_USER")]
    pub user: Option<String>,

    /// Client database [default: <USER>.db]
    #[arg(long, global = true)]
    pub db: Option<String>,

    /// Relay database shared by all users
    #[arg(long, global = true, default_value = "relay.db")]
    pub relay: String,

    /// JSON protocol configuration; missing fields take their defaults
    #[arg(long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create local keys and register with the relay
    Register,
    /// List registered users as JSON lines
    Users,
    /// Encrypt and queue a message for a peer
    Send {
        peer: String,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Decrypt and print waiting messages
    Fetch,
    /// List peers with an established session
    Sessions,
    /// Print the safety number shared with a peer
    Fingerprint { peer: String },
    /// Drop the session with a peer
    Reset { peer: String },
    /// Upload a fresh batch of one-time prekeys
    Replenish,
    /// Rotate and publish the signed prekey
    Rotate,
}

impl Cli {
    pub fn user(&self) -> Result<&str> {
        self.user
            .as_deref()
            .filter(|user| !user.is_empty())
            .context("--user is required for this command")
    }

    pub fn db_path(&self) -> Result<String> {
        match &self.db {
            Some(path) => Ok(path.clone()),
            None => Ok(format!("{}.db", self.user()?)),
        }
    }
}
