//! v001 -- Initial schema creation.
//!
//! Creates the two replica tables: `conversations` and `messages`.
//! Presence and typing state are ephemeral and never persisted.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id                   TEXT PRIMARY KEY NOT NULL,  -- remote document id
    title                TEXT,
    participants         TEXT NOT NULL,              -- JSON array of user ids
    last_message_id      TEXT,
    last_message_preview TEXT,
    last_message_at      TEXT,                       -- ISO-8601 / RFC-3339
    unread_counts        TEXT NOT NULL DEFAULT '{}', -- JSON object user id -> count
    hidden_for           TEXT NOT NULL DEFAULT '[]'  -- JSON array of user ids
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
-- conversation_id is a foreign-key value only: messages are reached
-- through the index below, never through an ownership reference, and a
-- message may arrive before its conversation does.  Conversation deletion
-- removes its messages explicitly in the same transaction.
CREATE TABLE IF NOT EXISTS messages (
    id                 TEXT PRIMARY KEY NOT NULL,  -- author-generated, stable across retries
    conversation_id    TEXT NOT NULL,
    sender_id          TEXT NOT NULL,
    content            TEXT NOT NULL,
    translated_content TEXT,
    media_kind         TEXT,                       -- image / video / audio / file
    media_url          TEXT,
    media_duration     REAL,                       -- seconds
    timestamp          TEXT NOT NULL,              -- ISO-8601
    status             TEXT NOT NULL,              -- sending / sent / delivered / read / failed
    read_by            TEXT NOT NULL DEFAULT '[]', -- JSON array of user ids
    read_at            TEXT NOT NULL DEFAULT '{}', -- JSON object user id -> timestamp
    retry_count        INTEGER NOT NULL DEFAULT 0,
    next_retry_at      TEXT,
    local_only         INTEGER NOT NULL DEFAULT 0  -- boolean 0/1
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, timestamp ASC);

CREATE INDEX IF NOT EXISTS idx_messages_unconfirmed
    ON messages(local_only, status);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
