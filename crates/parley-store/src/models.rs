//! Domain model structs persisted in the local replica.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to a consumer layer.  Collection fields are native sets and
//! maps here; the JSON text encoding used by SQLite stays inside the row
//! mappers.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::constants::MAX_PREVIEW_LEN;
use parley_shared::protocol::{RemoteConversation, RemoteMessage};
use parley_shared::{
    ConversationId, ConversationKind, MediaDescriptor, MessageId, MessageStatus, UserId,
};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Summary of the newest message, denormalized onto the conversation for
/// list rendering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastMessage {
    pub id: MessageId,
    pub preview: String,
    pub timestamp: DateTime<Utc>,
}

/// A conversation between two or more participants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    /// Remote document id; stable and globally unique.
    pub id: ConversationId,
    /// Participant set, never empty.
    pub participants: BTreeSet<UserId>,
    /// Optional display title (group conversations).
    pub title: Option<String>,
    /// Denormalized newest-message summary.
    pub last_message: Option<LastMessage>,
    /// Per-participant unread counters.  An entry is reset to zero only by
    /// that participant's own read action.
    pub unread_counts: BTreeMap<UserId, u32>,
    /// Participants who have hidden this conversation.
    pub hidden_for: BTreeSet<UserId>,
}

impl Conversation {
    /// One-to-one or group, derived from the participant count.
    pub fn kind(&self) -> ConversationKind {
        ConversationKind::from_participant_count(self.participants.len())
    }

    /// Unread counter for one participant (zero when absent).
    pub fn unread_for(&self, user_id: &UserId) -> u32 {
        self.unread_counts.get(user_id).copied().unwrap_or(0)
    }

    pub fn is_hidden_for(&self, user_id: &UserId) -> bool {
        self.hidden_for.contains(user_id)
    }
}

impl From<RemoteConversation> for Conversation {
    fn from(remote: RemoteConversation) -> Self {
        let last_message = match (
            remote.last_message_id,
            remote.last_message_preview,
            remote.last_message_timestamp,
        ) {
            (Some(id), Some(preview), Some(timestamp)) => Some(LastMessage {
                id,
                preview,
                timestamp,
            }),
            _ => None,
        };

        Self {
            id: remote.id,
            participants: remote.participants,
            title: remote.title,
            last_message,
            unread_counts: remote.unread_counts,
            hidden_for: remote.hidden_for_user_ids,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message.
///
/// `conversation_id` is a foreign-key value, not an ownership reference:
/// messages are looked up through the store's conversation index and never
/// hold their conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub translated_content: Option<String>,
    pub media: Option<MediaDescriptor>,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    /// Participants who have read this message.
    pub read_by: BTreeSet<UserId>,
    /// Per-reader read timestamps.
    pub read_at: BTreeMap<UserId, DateTime<Utc>>,
    /// Failed delivery attempts so far.
    pub retry_count: u32,
    /// When the next scheduled retry becomes due.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// True while the record has no counterpart in the remote store.
    pub local_only: bool,
}

impl Message {
    /// Build an optimistic local write: id generated by the author, status
    /// `Sending`, no remote counterpart yet.
    pub fn optimistic(
        conversation_id: ConversationId,
        sender_id: UserId,
        content: impl Into<String>,
        media: Option<MediaDescriptor>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            conversation_id,
            sender_id,
            content: content.into(),
            translated_content: None,
            media,
            timestamp: Utc::now(),
            status: MessageStatus::Sending,
            read_by: BTreeSet::new(),
            read_at: BTreeMap::new(),
            retry_count: 0,
            next_retry_at: None,
            local_only: true,
        }
    }

    /// Map a remote document into the local model.  Remote records always
    /// have a remote counterpart, so retry metadata starts cleared.
    pub fn from_remote(remote: RemoteMessage) -> Self {
        Self {
            id: remote.id,
            conversation_id: remote.conversation_id,
            sender_id: remote.sender_id,
            content: remote.content,
            translated_content: remote.translated_content,
            media: remote.media,
            timestamp: remote.timestamp,
            status: remote.status,
            read_by: remote.read_by,
            read_at: remote.read_at,
            retry_count: 0,
            next_retry_at: None,
            local_only: false,
        }
    }

    /// The remote-facing view of this message, used when delivering it.
    pub fn to_remote(&self) -> RemoteMessage {
        RemoteMessage {
            id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            sender_id: self.sender_id.clone(),
            content: self.content.clone(),
            translated_content: self.translated_content.clone(),
            media: self.media.clone(),
            timestamp: self.timestamp,
            status: MessageStatus::Sent,
            read_by: self.read_by.clone(),
            read_at: self.read_at.clone(),
        }
    }

    pub fn is_read_by(&self, user_id: &UserId) -> bool {
        self.read_by.contains(user_id)
    }

    /// Content truncated for a last-message summary.
    pub fn preview(&self) -> String {
        if self.content.chars().count() <= MAX_PREVIEW_LEN {
            self.content.clone()
        } else {
            self.content.chars().take(MAX_PREVIEW_LEN).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimistic_message_shape() {
        let msg = Message::optimistic(
            ConversationId::new("c1"),
            UserId::new("alice"),
            "hello",
            None,
        );
        assert_eq!(msg.status, MessageStatus::Sending);
        assert!(msg.local_only);
        assert_eq!(msg.retry_count, 0);
        assert!(msg.next_retry_at.is_none());
    }

    #[test]
    fn from_remote_clears_retry_metadata() {
        let remote = RemoteMessage {
            id: MessageId::new("m1"),
            conversation_id: ConversationId::new("c1"),
            sender_id: UserId::new("bob"),
            content: "hi".into(),
            translated_content: None,
            media: None,
            timestamp: Utc::now(),
            status: MessageStatus::Sent,
            read_by: BTreeSet::new(),
            read_at: BTreeMap::new(),
        };

        let msg = Message::from_remote(remote);
        assert!(!msg.local_only);
        assert_eq!(msg.retry_count, 0);
    }

    #[test]
    fn preview_truncates_long_content() {
        let long = "x".repeat(500);
        let msg = Message::optimistic(
            ConversationId::new("c1"),
            UserId::new("alice"),
            long,
            None,
        );
        assert_eq!(msg.preview().chars().count(), MAX_PREVIEW_LEN);
    }

    #[test]
    fn conversation_kind_follows_participants() {
        let remote = RemoteConversation {
            id: ConversationId::new("c1"),
            participants: [UserId::new("a"), UserId::new("b"), UserId::new("c")]
                .into_iter()
                .collect(),
            title: Some("trio".into()),
            last_message_id: None,
            last_message_preview: None,
            last_message_timestamp: None,
            unread_counts: BTreeMap::new(),
            hidden_for_user_ids: BTreeSet::new(),
        };

        let conv = Conversation::from(remote);
        assert_eq!(conv.kind(), ConversationKind::Group);
        assert!(conv.last_message.is_none());
    }
}
