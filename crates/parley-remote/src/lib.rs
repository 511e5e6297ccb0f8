//! # parley-remote
//!
//! The seam between the sync engine and the authoritative remote store.
//!
//! [`RemoteStore`] describes everything the engine needs from a backend:
//! live change feeds, one-shot snapshot fetches, message delivery, the
//! batched read-receipt commit, and the typing/presence endpoints.  Feeds
//! deliver batches of raw JSON documents; decoding happens on the engine
//! side so one malformed record never poisons a batch.
//!
//! [`MemoryRemote`] is a complete in-process implementation used by tests
//! and local development.

pub mod api;
pub mod feed;
pub mod memory;

mod error;

pub use api::{AssistClient, AssistRequest, RemoteStore};
pub use error::{RemoteError, Result};
pub use feed::{ChangeBatch, ChangeEvent, ChangeKind, Subscription};
pub use memory::MemoryRemote;
