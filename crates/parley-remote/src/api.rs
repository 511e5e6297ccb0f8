//! The [`RemoteStore`] trait and the opaque AI-assist RPC interface.

use async_trait::async_trait;

use parley_shared::protocol::{ReadReceiptBatch, RemoteMessage};
use parley_shared::{ConversationId, UserId};

use crate::error::Result;
use crate::feed::Subscription;

/// Backend operations the sync engine depends on.
///
/// Feed contract: a `watch_*` subscription first delivers the current
/// matching set as `Added` events, then live deltas.  Batches preserve the
/// backend's delivery order; fetches return the raw documents of the
/// complete current set.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Live feed of conversations whose participant set contains `user_id`.
    async fn watch_conversations(&self, user_id: &UserId) -> Result<Subscription>;

    /// One-shot fetch of every conversation containing `user_id`.
    async fn fetch_conversations(&self, user_id: &UserId) -> Result<Vec<serde_json::Value>>;

    /// Live feed of one conversation's messages.
    async fn watch_messages(&self, conversation_id: &ConversationId) -> Result<Subscription>;

    /// One-shot fetch of one conversation's complete message set.
    async fn fetch_messages(&self, conversation_id: &ConversationId)
        -> Result<Vec<serde_json::Value>>;

    /// Create or overwrite a message document.  Used for first-attempt and
    /// retried deliveries alike.
    async fn put_message(&self, message: &RemoteMessage) -> Result<()>;

    /// Apply one batched read acknowledgement: every targeted message gains
    /// the reader in `readBy` with its read timestamp, and the reader's
    /// unread counter for the conversation resets to zero.  One logical
    /// write; partial application is the backend's bug, not the caller's
    /// concern.
    async fn commit_read_receipts(&self, batch: &ReadReceiptBatch) -> Result<()>;

    /// Add or remove `user_id` from a conversation's typing set.
    async fn set_typing(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        typing: bool,
    ) -> Result<()>;

    /// Live feed of one conversation's typing document.
    async fn watch_typing(&self, conversation_id: &ConversationId) -> Result<Subscription>;

    /// Live feed of one user's presence record.
    async fn watch_presence(&self, user_id: &UserId) -> Result<Subscription>;
}

/// Input to the generative-text assist call.
#[derive(Debug, Clone)]
pub struct AssistRequest {
    pub prompt: String,
    /// Optional conversation-history context, oldest first.
    pub history: Vec<String>,
}

/// Opaque request/response text generation.
///
/// The engine treats this as an external collaborator with its own timeout
/// and failure modes; it takes no part in the sync consistency model.
#[async_trait]
pub trait AssistClient: Send + Sync {
    async fn generate(&self, request: AssistRequest) -> Result<String>;
}
