//! Wire representation of remote-store records.
//!
//! These mirror the remote document schema field for field
//! (`conversations/{id}`, `conversations/{id}/messages/{id}`, the
//! per-conversation typing doc, and presence records).  Feeds deliver raw
//! JSON values; decoding into these types happens at the reconciliation
//! boundary so a single malformed record can be skipped without aborting
//! its batch.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, MediaDescriptor, MessageId, MessageStatus, UserId};

/// Remote `conversations/{id}` document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConversation {
    pub id: ConversationId,
    pub participants: BTreeSet<UserId>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub last_message_id: Option<MessageId>,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub last_message_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_counts: BTreeMap<UserId, u32>,
    #[serde(default)]
    pub hidden_for_user_ids: BTreeSet<UserId>,
}

/// Remote `conversations/{id}/messages/{id}` document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(default)]
    pub translated_content: Option<String>,
    #[serde(default)]
    pub media: Option<MediaDescriptor>,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    #[serde(default)]
    pub read_by: BTreeSet<UserId>,
    #[serde(default)]
    pub read_at: BTreeMap<UserId, DateTime<Utc>>,
}

/// Remote `conversations/{id}/metadata/typing` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTyping {
    #[serde(default)]
    pub users: BTreeSet<UserId>,
}

/// Remote presence record, keyed by user id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemotePresence {
    pub user_id: UserId,
    pub is_online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// One batched read acknowledgement: every targeted message gains the
/// reader in `readBy` with `read_at` as its per-reader timestamp, and the
/// reader's unread counter for the conversation drops to zero, all in a
/// single logical remote write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptBatch {
    pub conversation_id: ConversationId,
    pub reader_id: UserId,
    pub message_ids: Vec<MessageId>,
    pub read_at: DateTime<Utc>,
}

/// Decode a raw feed document into a typed record.
pub fn decode_document<T: DeserializeOwned>(doc: &serde_json::Value) -> serde_json::Result<T> {
    serde_json::from_value(doc.clone())
}
