//! The remote message storage contract consumed by the sync engine.
//!
//! The engine never talks to a mail service directly; it is handed a
//! [`MessageStorage`] capability and drives everything through it. The
//! enumeration operations push ids into a bounded channel so a consumer can
//! run concurrently with the producer.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::message::{MessageBody, MessageHeader, MessageId, Profile};

/// Errors surfaced by a message storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The message no longer exists on the remote, or the remote considers
    /// it invisible to mail clients (for Gmail, chat transcripts).
    #[error("message not found")]
    NotFound,

    /// The remote pushed back on quota. Transient; backends retry this
    /// internally and it should not normally escape to callers.
    #[error("rate limited by the remote service")]
    RateLimited,

    /// The run's cancellation token fired while the call was in flight.
    #[error("cancelled")]
    Cancelled,

    /// The enumeration receiver went away before the listing finished.
    #[error("enumeration receiver closed")]
    Closed,

    /// Transport-level or remote-internal failure.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl StoreError {
    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        Self::Transport(err.into())
    }
}

/// All actions available against a remote message store.
///
/// Implementations own their rate limiting; callers are free to issue calls
/// as fast as the sync pipeline produces them.
#[async_trait]
pub trait MessageStorage: Send + Sync {
    /// Current account info, including the server's history cursor.
    async fn get_profile(&self) -> Result<Profile, StoreError>;

    /// Enumerate every message id in the synchronized mailbox views,
    /// pushing them into `out` in server order. Returns after the full
    /// traversal, or on the first transport or send failure.
    async fn list_all(&self, out: mpsc::Sender<MessageId>) -> Result<(), StoreError>;

    /// Enumerate ids of messages added since `history_id`, pushing them
    /// into `out` in server order.
    async fn list_from(
        &self,
        history_id: u64,
        out: mpsc::Sender<MessageId>,
    ) -> Result<(), StoreError>;

    /// Fetch header-only metadata for one message.
    async fn get_message_header(&self, perm_id: &str) -> Result<MessageHeader, StoreError>;

    /// Fetch the complete message, including the raw RFC 5322 text.
    async fn get_message_full(&self, perm_id: &str) -> Result<MessageBody, StoreError>;
}
