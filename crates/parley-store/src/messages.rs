//! CRUD and state-machine operations for [`Message`] records.

use chrono::{DateTime, Utc};
use rusqlite::params;

use parley_shared::{
    ConversationId, MediaDescriptor, MediaKind, MessageId, MessageStatus, UserId,
};

use crate::codec;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Message;

impl Database {
    // ------------------------------------------------------------------
    // Create / update
    // ------------------------------------------------------------------

    /// Insert a message, or overwrite every column if the id already
    /// exists.
    pub fn upsert_message(&self, message: &Message) -> Result<()> {
        let (media_kind, media_url, media_duration) = match &message.media {
            Some(media) => (
                Some(media.kind.as_str()),
                Some(media.url.clone()),
                media.duration_secs,
            ),
            None => (None, None, None),
        };

        self.conn().execute(
            "INSERT INTO messages
                 (id, conversation_id, sender_id, content, translated_content,
                  media_kind, media_url, media_duration, timestamp, status,
                  read_by, read_at, retry_count, next_retry_at, local_only)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO UPDATE SET
                 conversation_id = excluded.conversation_id,
                 sender_id = excluded.sender_id,
                 content = excluded.content,
                 translated_content = excluded.translated_content,
                 media_kind = excluded.media_kind,
                 media_url = excluded.media_url,
                 media_duration = excluded.media_duration,
                 timestamp = excluded.timestamp,
                 status = excluded.status,
                 read_by = excluded.read_by,
                 read_at = excluded.read_at,
                 retry_count = excluded.retry_count,
                 next_retry_at = excluded.next_retry_at,
                 local_only = excluded.local_only",
            params![
                message.id.as_str(),
                message.conversation_id.as_str(),
                message.sender_id.as_str(),
                message.content,
                message.translated_content,
                media_kind,
                media_url,
                media_duration,
                message.timestamp.to_rfc3339(),
                message.status.as_str(),
                codec::encode_id_set(&message.read_by),
                codec::encode_time_map(&message.read_at),
                message.retry_count,
                message.next_retry_at.map(|t| t.to_rfc3339()),
                message.local_only as i64,
            ],
        )?;
        Ok(())
    }

    /// Apply a status transition, enforcing the message state machine.
    /// Setting the current status again is a no-op.
    pub fn set_message_status(&self, id: &MessageId, status: MessageStatus) -> Result<()> {
        let message = self.get_message(id)?;
        if message.status == status {
            return Ok(());
        }
        if !message.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: message.status,
                to: status,
            });
        }
        self.conn().execute(
            "UPDATE messages SET status = ?2 WHERE id = ?1",
            params![id.as_str(), status.as_str()],
        )?;
        Ok(())
    }

    /// Record remote confirmation of a message: status `Sent`, retry
    /// metadata cleared, `local_only` dropped.  Confirming a message that
    /// is already past `Sent` is a no-op.
    pub fn mark_message_sent(&self, id: &MessageId) -> Result<()> {
        let message = self.get_message(id)?;
        match message.status {
            MessageStatus::Sending | MessageStatus::Failed => {}
            // Already confirmed (possibly further along); nothing to do.
            MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Read => return Ok(()),
        }
        self.conn().execute(
            "UPDATE messages
             SET status = ?2, retry_count = 0, next_retry_at = NULL, local_only = 0
             WHERE id = ?1",
            params![id.as_str(), MessageStatus::Sent.as_str()],
        )?;
        Ok(())
    }

    /// Record a failed delivery attempt: status `Failed`, retry counter
    /// bumped, next retry scheduled.  A message confirmed in the meantime
    /// is left alone.
    pub fn record_send_failure(
        &self,
        id: &MessageId,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let message = self.get_message(id)?;
        match message.status {
            MessageStatus::Sending | MessageStatus::Failed => {}
            MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Read => return Ok(()),
        }
        self.conn().execute(
            "UPDATE messages
             SET status = ?2, retry_count = retry_count + 1, next_retry_at = ?3
             WHERE id = ?1",
            params![
                id.as_str(),
                MessageStatus::Failed.as_str(),
                next_retry_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Stamp a reader onto a set of messages: `read_by` gains the reader,
    /// `read_at` records the timestamp, and the status advances to `Read`
    /// where the state machine allows it.  One transaction for the batch.
    pub fn mark_messages_read(
        &mut self,
        ids: &[MessageId],
        reader: &UserId,
        read_at: DateTime<Utc>,
    ) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        for id in ids {
            let mut message = tx
                .query_row(
                    "SELECT id, conversation_id, sender_id, content, translated_content,
                            media_kind, media_url, media_duration, timestamp, status,
                            read_by, read_at, retry_count, next_retry_at, local_only
                     FROM messages WHERE id = ?1",
                    params![id.as_str()],
                    row_to_message,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                    other => StoreError::Sqlite(other),
                })?;

            message.read_by.insert(reader.clone());
            message.read_at.entry(reader.clone()).or_insert(read_at);
            if message.status.can_transition_to(MessageStatus::Read) {
                message.status = MessageStatus::Read;
            }

            tx.execute(
                "UPDATE messages SET status = ?2, read_by = ?3, read_at = ?4 WHERE id = ?1",
                params![
                    id.as_str(),
                    message.status.as_str(),
                    codec::encode_id_set(&message.read_by),
                    codec::encode_time_map(&message.read_at),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single message by id.
    pub fn get_message(&self, id: &MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                "SELECT id, conversation_id, sender_id, content, translated_content,
                        media_kind, media_url, media_duration, timestamp, status,
                        read_by, read_at, retry_count, next_retry_at, local_only
                 FROM messages WHERE id = ?1",
                params![id.as_str()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Messages of a conversation in ascending timestamp order.
    pub fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, conversation_id, sender_id, content, translated_content,
                    media_kind, media_url, media_duration, timestamp, status,
                    read_by, read_at, retry_count, next_retry_at, local_only
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY timestamp ASC
             LIMIT ?2 OFFSET ?3",
        )?;

        let rows = stmt.query_map(
            params![conversation_id.as_str(), limit, offset],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// All locally-held message ids for one conversation; used by
    /// full-snapshot reconciliation.
    pub fn message_ids_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id FROM messages WHERE conversation_id = ?1")?;
        let rows = stmt.query_map(params![conversation_id.as_str()], |row| {
            row.get::<_, String>(0)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(MessageId::new(row?));
        }
        Ok(ids)
    }

    /// Messages in a conversation the given user has not read and did not
    /// author.  Input to the read-receipt batcher.
    pub fn unread_messages(
        &self,
        conversation_id: &ConversationId,
        reader: &UserId,
    ) -> Result<Vec<Message>> {
        let messages = self.list_messages(conversation_id, u32::MAX, 0)?;
        Ok(messages
            .into_iter()
            .filter(|m| m.sender_id != *reader && !m.is_read_by(reader))
            .collect())
    }

    /// Messages with no confirmed remote counterpart (`local_only` or
    /// `Failed`), oldest first.  The outgoing queue re-enqueues these on
    /// startup.
    pub fn unconfirmed_messages(&self) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, conversation_id, sender_id, content, translated_content,
                    media_kind, media_url, media_duration, timestamp, status,
                    read_by, read_at, retry_count, next_retry_at, local_only
             FROM messages
             WHERE local_only = 1 OR status = 'failed'
             ORDER BY timestamp ASC",
        )?;

        let rows = stmt.query_map([], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a message by id.  Returns `true` if a row was deleted.
    pub fn delete_message(&self, id: &MessageId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM messages WHERE id = ?1", params![id.as_str()])?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Message`].
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let content: String = row.get(3)?;
    let translated_content: Option<String> = row.get(4)?;
    let media_kind: Option<String> = row.get(5)?;
    let media_url: Option<String> = row.get(6)?;
    let media_duration: Option<f64> = row.get(7)?;
    let ts_raw: String = row.get(8)?;
    let status_raw: String = row.get(9)?;
    let read_by_raw: String = row.get(10)?;
    let read_at_raw: String = row.get(11)?;
    let retry_count: u32 = row.get(12)?;
    let next_retry_raw: Option<String> = row.get(13)?;
    let local_only: bool = row.get::<_, i64>(14)? != 0;

    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?;

    let status: MessageStatus = status_raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })?;

    let read_by =
        codec::decode_id_set(&read_by_raw).map_err(|e| codec::column_decode_error(10, e))?;
    let read_at =
        codec::decode_time_map(&read_at_raw).map_err(|e| codec::column_decode_error(11, e))?;

    let media = match (media_kind, media_url) {
        (Some(kind_raw), Some(url)) => {
            let kind: MediaKind = kind_raw.parse().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    5,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
            Some(MediaDescriptor {
                kind,
                url,
                duration_secs: media_duration,
            })
        }
        _ => None,
    };

    let next_retry_at = match next_retry_raw {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        13,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?,
        ),
        None => None,
    };

    Ok(Message {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(conversation_id),
        sender_id: UserId::new(sender_id),
        content,
        translated_content,
        media,
        timestamp,
        status,
        read_by,
        read_at,
        retry_count,
        next_retry_at,
        local_only,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(conversation: &str, sender: &str, content: &str) -> Message {
        Message::optimistic(
            ConversationId::new(conversation),
            UserId::new(sender),
            content,
            None,
        )
    }

    #[test]
    fn upsert_round_trip_with_media() {
        let db = Database::open_in_memory().unwrap();
        let mut msg = sample("c1", "alice", "look at this");
        msg.media = Some(MediaDescriptor {
            kind: MediaKind::Video,
            url: "https://cdn.example/v.mp4".into(),
            duration_secs: Some(12.5),
        });

        db.upsert_message(&msg).unwrap();
        let loaded = db.get_message(&msg.id).unwrap();
        assert_eq!(loaded, msg);
    }

    #[test]
    fn list_orders_ascending() {
        let db = Database::open_in_memory().unwrap();
        let mut first = sample("c1", "alice", "one");
        first.timestamp = "2024-01-01T00:00:00Z".parse().unwrap();
        let mut second = sample("c1", "bob", "two");
        second.timestamp = "2024-01-02T00:00:00Z".parse().unwrap();
        let other = sample("c2", "alice", "elsewhere");

        db.upsert_message(&second).unwrap();
        db.upsert_message(&first).unwrap();
        db.upsert_message(&other).unwrap();

        let listed = db
            .list_messages(&ConversationId::new("c1"), 100, 0)
            .unwrap();
        let contents: Vec<&str> = listed.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two"]);
    }

    #[test]
    fn sent_confirmation_clears_retry_state() {
        let db = Database::open_in_memory().unwrap();
        let mut msg = sample("c1", "alice", "hello");
        msg.retry_count = 2;
        msg.next_retry_at = Some(Utc::now());
        msg.status = MessageStatus::Failed;
        db.upsert_message(&msg).unwrap();

        db.mark_message_sent(&msg.id).unwrap();

        let loaded = db.get_message(&msg.id).unwrap();
        assert_eq!(loaded.status, MessageStatus::Sent);
        assert_eq!(loaded.retry_count, 0);
        assert!(loaded.next_retry_at.is_none());
        assert!(!loaded.local_only);

        // Idempotent.
        db.mark_message_sent(&msg.id).unwrap();
        assert_eq!(db.get_message(&msg.id).unwrap().status, MessageStatus::Sent);
    }

    #[test]
    fn send_failure_bumps_retry_count() {
        let db = Database::open_in_memory().unwrap();
        let msg = sample("c1", "alice", "hello");
        db.upsert_message(&msg).unwrap();

        let due = Utc::now() + chrono::Duration::seconds(2);
        db.record_send_failure(&msg.id, due).unwrap();
        db.record_send_failure(&msg.id, due).unwrap();

        let loaded = db.get_message(&msg.id).unwrap();
        assert_eq!(loaded.status, MessageStatus::Failed);
        assert_eq!(loaded.retry_count, 2);
        assert!(loaded.next_retry_at.is_some());
    }

    #[test]
    fn failure_after_confirmation_is_ignored() {
        let db = Database::open_in_memory().unwrap();
        let msg = sample("c1", "alice", "hello");
        db.upsert_message(&msg).unwrap();
        db.mark_message_sent(&msg.id).unwrap();

        db.record_send_failure(&msg.id, Utc::now()).unwrap();
        assert_eq!(db.get_message(&msg.id).unwrap().status, MessageStatus::Sent);
    }

    #[test]
    fn status_transition_is_enforced() {
        let db = Database::open_in_memory().unwrap();
        let msg = sample("c1", "alice", "hello");
        db.upsert_message(&msg).unwrap();
        db.mark_message_sent(&msg.id).unwrap();

        assert!(matches!(
            db.set_message_status(&msg.id, MessageStatus::Sending),
            Err(StoreError::InvalidTransition { .. })
        ));
        db.set_message_status(&msg.id, MessageStatus::Delivered)
            .unwrap();
        // Re-setting the current status is a no-op.
        db.set_message_status(&msg.id, MessageStatus::Delivered)
            .unwrap();
    }

    #[test]
    fn mark_read_batch_stamps_all() {
        let mut db = Database::open_in_memory().unwrap();
        let reader = UserId::new("bob");
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut msg = sample("c1", "alice", &format!("msg {i}"));
            msg.status = MessageStatus::Sent;
            msg.local_only = false;
            db.upsert_message(&msg).unwrap();
            ids.push(msg.id);
        }

        let at = Utc::now();
        db.mark_messages_read(&ids, &reader, at).unwrap();

        for id in &ids {
            let loaded = db.get_message(id).unwrap();
            assert_eq!(loaded.status, MessageStatus::Read);
            assert!(loaded.is_read_by(&reader));
            assert!(loaded.read_at.contains_key(&reader));
        }
    }

    #[test]
    fn unread_excludes_own_and_already_read() {
        let mut db = Database::open_in_memory().unwrap();
        let conv = ConversationId::new("c1");
        let bob = UserId::new("bob");

        let mut from_alice = sample("c1", "alice", "unseen");
        from_alice.status = MessageStatus::Sent;
        from_alice.local_only = false;
        let mut own = sample("c1", "bob", "mine");
        own.status = MessageStatus::Sent;
        own.local_only = false;
        let mut seen = sample("c1", "alice", "seen");
        seen.status = MessageStatus::Sent;
        seen.local_only = false;
        db.upsert_message(&from_alice).unwrap();
        db.upsert_message(&own).unwrap();
        db.upsert_message(&seen).unwrap();
        db.mark_messages_read(std::slice::from_ref(&seen.id), &bob, Utc::now())
            .unwrap();

        let unread = db.unread_messages(&conv, &bob).unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, from_alice.id);
    }

    #[test]
    fn unconfirmed_finds_local_only_and_failed() {
        let db = Database::open_in_memory().unwrap();
        let pending = sample("c1", "alice", "pending");
        let mut failed = sample("c1", "alice", "failed");
        failed.status = MessageStatus::Failed;
        failed.local_only = false;
        let mut confirmed = sample("c1", "alice", "confirmed");
        confirmed.status = MessageStatus::Sent;
        confirmed.local_only = false;

        db.upsert_message(&pending).unwrap();
        db.upsert_message(&failed).unwrap();
        db.upsert_message(&confirmed).unwrap();

        let unconfirmed = db.unconfirmed_messages().unwrap();
        let ids: Vec<&MessageId> = unconfirmed.iter().map(|m| &m.id).collect();
        assert_eq!(unconfirmed.len(), 2);
        assert!(ids.contains(&&pending.id));
        assert!(ids.contains(&&failed.id));
    }
}
