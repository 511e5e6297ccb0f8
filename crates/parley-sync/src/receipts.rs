//! Batched read acknowledgements.
//!
//! Marking a conversation read is one remote write for the whole unread
//! set: every targeted message gains the reader in `readBy` with a
//! per-reader timestamp, and the reader's unread counter resets in the
//! same logical operation.  Local state advances only after the remote
//! accepts the batch; on failure the caller retries with nothing to undo.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use parley_remote::RemoteStore;
use parley_shared::protocol::ReadReceiptBatch;
use parley_shared::{ConversationId, MessageId, UserId};
use parley_store::StoreError;

use crate::error::{Result, SyncError};
use crate::events::{emit, SyncEvent};
use crate::SharedStore;

/// Aggregates read acknowledgements for a conversation into one remote
/// write.
pub struct ReadReceiptBatcher {
    store: SharedStore,
    remote: Arc<dyn RemoteStore>,
    events: broadcast::Sender<SyncEvent>,
    user_id: UserId,
}

impl ReadReceiptBatcher {
    pub fn new(
        store: SharedStore,
        remote: Arc<dyn RemoteStore>,
        events: broadcast::Sender<SyncEvent>,
        user_id: UserId,
    ) -> Self {
        Self {
            store,
            remote,
            events,
            user_id,
        }
    }

    /// Mark every unread message in the conversation as read by the
    /// current user and reset their unread counter.  Returns the number of
    /// messages acknowledged.
    ///
    /// Messages already read by this user (and the user's own messages)
    /// are excluded, so repeating the call is harmless.  If the remote
    /// write fails, local state is untouched and the error is returned for
    /// the caller to retry.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<usize> {
        let (message_ids, unread_count) = {
            let db = self.store.lock().await;
            let conversation = db.get_conversation(conversation_id).map_err(|e| match e {
                StoreError::NotFound => {
                    SyncError::UnknownConversation(conversation_id.clone())
                }
                other => SyncError::Store(other),
            })?;
            let unread = db.unread_messages(conversation_id, &self.user_id)?;
            let ids: Vec<MessageId> = unread.into_iter().map(|m| m.id).collect();
            (ids, conversation.unread_for(&self.user_id))
        };

        if message_ids.is_empty() && unread_count == 0 {
            debug!(conversation = %conversation_id, "nothing unread, skipping receipt write");
            return Ok(0);
        }

        let batch = ReadReceiptBatch {
            conversation_id: conversation_id.clone(),
            reader_id: self.user_id.clone(),
            message_ids,
            read_at: Utc::now(),
        };

        if let Err(e) = self.remote.commit_read_receipts(&batch).await {
            warn!(
                conversation = %conversation_id,
                error = %e,
                "read-receipt commit failed, local state unchanged"
            );
            return Err(e.into());
        }

        // Remote accepted; advance the replica in one apply step.
        {
            let mut db = self.store.lock().await;
            db.mark_messages_read(&batch.message_ids, &self.user_id, batch.read_at)?;
            db.set_unread_count(conversation_id, &self.user_id, 0)?;
        }

        emit(
            &self.events,
            SyncEvent::MessagesChanged {
                conversation_id: conversation_id.clone(),
            },
        );
        emit(&self.events, SyncEvent::ConversationsChanged);

        debug!(
            conversation = %conversation_id,
            count = batch.message_ids.len(),
            "conversation marked read"
        );
        Ok(batch.message_ids.len())
    }
}
