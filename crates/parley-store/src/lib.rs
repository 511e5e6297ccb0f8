//! # parley-store
//!
//! Local persisted replica of conversational state, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for every domain
//! model.  Collection-valued fields (participants, unread counts, read
//! receipts) are stored as JSON text columns; that encoding never leaks
//! past the row mappers -- the domain model exposes native sets and maps.
//!
//! The connection is a single logical writer: callers that share a
//! `Database` across tasks serialize access behind one mutex, which is
//! exactly the discipline the sync engine's apply path relies on.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;

mod codec;
mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::{Conversation, LastMessage, Message};
