pub mod directory;
pub mod envelope;
pub mod error;
pub mod mailbox;
pub mod messenger;

pub use directory::{Directory, MemoryDirectory, UserRecord};
pub use envelope::{decode_message, encode_message, WireMessage};
pub use error::ProtocolError;
pub use mailbox::{Delivery, Mailbox, MemoryMailbox};
pub use messenger::{Messenger, ReceivedMessage, Registration};
