//! CRUD operations for [`Conversation`] records.

use chrono::{DateTime, Utc};
use rusqlite::params;

use parley_shared::{ConversationId, UserId};

use crate::codec;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Conversation, LastMessage};

impl Database {
    // ------------------------------------------------------------------
    // Create / update
    // ------------------------------------------------------------------

    /// Insert a conversation, or overwrite every column if the id already
    /// exists.  Reconciliation merge policy lives in the sync layer; the
    /// store writes whatever it is handed.
    pub fn upsert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let (last_id, last_preview, last_at) = match &conversation.last_message {
            Some(last) => (
                Some(last.id.as_str().to_string()),
                Some(last.preview.clone()),
                Some(last.timestamp.to_rfc3339()),
            ),
            None => (None, None, None),
        };

        self.conn().execute(
            "INSERT INTO conversations
                 (id, title, participants, last_message_id, last_message_preview,
                  last_message_at, unread_counts, hidden_for)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 title = excluded.title,
                 participants = excluded.participants,
                 last_message_id = excluded.last_message_id,
                 last_message_preview = excluded.last_message_preview,
                 last_message_at = excluded.last_message_at,
                 unread_counts = excluded.unread_counts,
                 hidden_for = excluded.hidden_for",
            params![
                conversation.id.as_str(),
                conversation.title,
                codec::encode_id_set(&conversation.participants),
                last_id,
                last_preview,
                last_at,
                codec::encode_count_map(&conversation.unread_counts),
                codec::encode_id_set(&conversation.hidden_for),
            ],
        )?;
        Ok(())
    }

    /// Overwrite one participant's unread counter.
    pub fn set_unread_count(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        count: u32,
    ) -> Result<()> {
        let mut conversation = self.get_conversation(conversation_id)?;
        if count == 0 {
            conversation.unread_counts.remove(user_id);
        } else {
            conversation.unread_counts.insert(user_id.clone(), count);
        }
        self.upsert_conversation(&conversation)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single conversation by id.
    pub fn get_conversation(&self, id: &ConversationId) -> Result<Conversation> {
        self.conn()
            .query_row(
                "SELECT id, title, participants, last_message_id, last_message_preview,
                        last_message_at, unread_counts, hidden_for
                 FROM conversations
                 WHERE id = ?1",
                params![id.as_str()],
                row_to_conversation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// List conversations, newest last-message first (conversations without
    /// a last message sort to the end).  When `visible_to` is given,
    /// conversations hidden for that user are skipped.
    pub fn list_conversations(&self, visible_to: Option<&UserId>) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, title, participants, last_message_id, last_message_preview,
                    last_message_at, unread_counts, hidden_for
             FROM conversations
             ORDER BY last_message_at IS NULL, last_message_at DESC",
        )?;

        let rows = stmt.query_map([], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            let conversation = row?;
            if let Some(user_id) = visible_to {
                if conversation.is_hidden_for(user_id) {
                    continue;
                }
            }
            conversations.push(conversation);
        }
        Ok(conversations)
    }

    /// All locally-held conversation ids.  Full-snapshot reconciliation
    /// diffs this set against the remote snapshot.
    pub fn conversation_ids(&self) -> Result<Vec<ConversationId>> {
        let mut stmt = self.conn().prepare("SELECT id FROM conversations")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(ConversationId::new(row?));
        }
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a conversation and its messages.  Returns `true` if a
    /// conversation row was deleted; deleting an absent id is a no-op.
    pub fn delete_conversation(&mut self, id: &ConversationId) -> Result<bool> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![id.as_str()],
        )?;
        let affected = tx.execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![id.as_str()],
        )?;
        tx.commit()?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Conversation`].
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id: String = row.get(0)?;
    let title: Option<String> = row.get(1)?;
    let participants_raw: String = row.get(2)?;
    let last_id: Option<String> = row.get(3)?;
    let last_preview: Option<String> = row.get(4)?;
    let last_at_raw: Option<String> = row.get(5)?;
    let unread_raw: String = row.get(6)?;
    let hidden_raw: String = row.get(7)?;

    let participants = codec::decode_id_set(&participants_raw)
        .map_err(|e| codec::column_decode_error(2, e))?;
    let unread_counts =
        codec::decode_count_map(&unread_raw).map_err(|e| codec::column_decode_error(6, e))?;
    let hidden_for =
        codec::decode_id_set(&hidden_raw).map_err(|e| codec::column_decode_error(7, e))?;

    let last_message = match (last_id, last_preview, last_at_raw) {
        (Some(id), Some(preview), Some(at_raw)) => {
            let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&at_raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        5,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
            Some(LastMessage {
                id: parley_shared::MessageId::new(id),
                preview,
                timestamp,
            })
        }
        _ => None,
    };

    Ok(Conversation {
        id: ConversationId::new(id),
        participants,
        title,
        last_message,
        unread_counts,
        hidden_for,
    })
}
