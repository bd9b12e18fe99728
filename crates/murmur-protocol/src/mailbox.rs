//! Store-and-forward delivery of encrypted messages.
//!
//! Delivery is at-least-once: fetching does not remove anything, only an
//! explicit acknowledgement does. Replays that slip through are rejected by
//! the ratchet as duplicates.

use std::collections::BTreeMap;

use murmur_crypto::signal::EncryptedMessage;
use parking_lot::Mutex;

use crate::error::ProtocolError;

/// A message waiting in a recipient's mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: u64,
    pub recipient_registration_id: u32,
    pub message: EncryptedMessage,
}

pub trait Mailbox: Send + Sync {
    /// Queue `message` for the recipient and return its delivery id.
    fn deliver(&self, recipient_registration_id: u32, message: &EncryptedMessage) -> Result<u64, ProtocolError>;

    /// Unacknowledged messages for the recipient, oldest first.
    fn fetch_unread(&self, recipient_registration_id: u32) -> Result<Vec<Delivery>, ProtocolError>;

    /// Mark deliveries as fetched. Unknown or foreign ids are ignored.
    fn acknowledge(&self, recipient_registration_id: u32, delivery_ids: &[u64]) -> Result<(), ProtocolError>;
}

#[derive(Default)]
struct MailboxInner {
    pending: BTreeMap<u64, Delivery>,
    next_id: u64,
}

/// In-memory mailbox, used by tests and embedded relays.
#[derive(Default)]
pub struct MemoryMailbox {
    inner: Mutex<MailboxInner>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Mailbox for MemoryMailbox {
    fn deliver(&self, recipient_registration_id: u32, message: &EncryptedMessage) -> Result<u64, ProtocolError> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.pending.insert(
            id,
            Delivery {
                id,
                recipient_registration_id,
                message: message.clone(),
            },
        );
        tracing::trace!(id, recipient_registration_id, "queued message");
        Ok(id)
    }

    fn fetch_unread(&self, recipient_registration_id: u32) -> Result<Vec<Delivery>, ProtocolError> {
        Ok(self
            .inner
            .lock()
            .pending
            .values()
            .filter(|d| d.recipient_registration_id == recipient_registration_id)
            .cloned()
            .collect())
    }

    fn acknowledge(&self, recipient_registration_id: u32, delivery_ids: &[u64]) -> Result<(), ProtocolError> {
        let mut inner = self.inner.lock();
        for id in delivery_ids {
            if inner
                .pending
                .get(id)
                .is_some_and(|d| d.recipient_registration_id == recipient_registration_id)
            {
                inner.pending.remove(id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use murmur_crypto::signal::MessageType;

    use super::*;

    fn message(body: u8) -> EncryptedMessage {
        EncryptedMessage {
            message_type: MessageType::Regular,
            sender_registration_id: 1,
            body: vec![body],
        }
    }

    #[test]
    fn unread_until_acknowledged() {
        let mailbox = MemoryMailbox::new();
        let first = mailbox.deliver(7, &message(1)).unwrap();
        let second = mailbox.deliver(7, &message(2)).unwrap();
        mailbox.deliver(8, &message(3)).unwrap();

        let unread = mailbox.fetch_unread(7).unwrap();
        assert_eq!(unread.iter().map(|d| d.id).collect::<Vec<_>>(), vec![first, second]);
        assert_eq!(mailbox.fetch_unread(7).unwrap().len(), 2);

        mailbox.acknowledge(7, &[first]).unwrap();
        let unread = mailbox.fetch_unread(7).unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].message, message(2));
    }

    #[test]
    fn cannot_acknowledge_someone_elses_message() {
        let mailbox = MemoryMailbox::new();
        let id = mailbox.deliver(7, &message(1)).unwrap();
        mailbox.acknowledge(8, &[id, 999]).unwrap();
        assert_eq!(mailbox.fetch_unread(7).unwrap().len(), 1);
    }
}
