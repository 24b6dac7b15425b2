//! Common message data types shared by the storage contract, the metadata
//! store, and the sync engine.

use std::hash::{Hash, Hasher};

/// The properties that uniquely identify a message in a remote mailbox.
#[derive(Debug, Clone, Eq)]
pub struct MessageId {
    /// Permanent, unique identifier of the message within its mailbox.
    /// Survives label changes but not true deletion.
    pub perm_id: String,

    /// Identifier of the thread the message belongs to. May be empty for
    /// storage systems without a threading concept.
    pub thread_id: String,
}

// Identity is the perm_id alone; thread_id is informational.
impl PartialEq for MessageId {
    fn eq(&self, other: &Self) -> bool {
        self.perm_id == other.perm_id
    }
}

impl Hash for MessageId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.perm_id.hash(state);
    }
}

impl MessageId {
    pub fn new(perm_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            perm_id: perm_id.into(),
            thread_id: thread_id.into(),
        }
    }
}

/// Metadata snapshot for one message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    pub id: MessageId,

    /// Label identifiers currently attached to the message. These are the
    /// opaque identifiers, not the user-visible label names.
    pub label_ids: Vec<String>,

    /// Server-estimated size of the message in bytes.
    pub size_estimate: i64,

    /// Cursor value naming the point in the mailbox change timeline at
    /// which this snapshot was taken.
    pub history_id: u64,
}

impl MessageHeader {
    /// A header recording that the message is gone from the remote: zero
    /// cursor, no labels. Clears the refresh flag without inventing data.
    pub fn sentinel(id: MessageId) -> Self {
        Self {
            id,
            label_ids: Vec::new(),
            size_estimate: 0,
            history_id: 0,
        }
    }
}

/// A complete message: header metadata plus the raw RFC 5322 text.
#[derive(Debug, Clone)]
pub struct MessageBody {
    pub header: MessageHeader,

    /// The entire message as delivered by the remote, already decoded from
    /// the transfer encoding. Not necessarily valid UTF-8.
    pub raw: Vec<u8>,
}

/// Per-account snapshot returned by the remote mailbox.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub email_address: String,

    /// The mailbox's current history cursor.
    pub history_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_message_id_identity_ignores_thread() {
        let a = MessageId::new("m1", "t1");
        let b = MessageId::new("m1", "t2");
        let c = MessageId::new("m2", "t1");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&c));
    }

    #[test]
    fn test_sentinel_header() {
        let hdr = MessageHeader::sentinel(MessageId::new("m1", "t1"));
        assert_eq!(hdr.history_id, 0);
        assert_eq!(hdr.size_estimate, 0);
        assert!(hdr.label_ids.is_empty());
    }
}
