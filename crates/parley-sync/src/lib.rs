//! # parley-sync
//!
//! The local-first synchronization engine.
//!
//! [`SyncEngine`] wires five components around one shared [`Database`]
//! handle and one broadcast event channel:
//!
//! - [`SyncCoordinator`] -- subscribes to remote change feeds and
//!   reconciles them into the local replica (incremental deltas plus
//!   full-snapshot refresh with tombstone-by-absence).
//! - [`OutgoingMessageQueue`] -- optimistic sends with exponential-backoff
//!   retries over a single delivery path.
//! - [`PresenceTracker`] -- ref-counted multiplexed presence
//!   subscriptions with synchronous snapshot reads.
//! - [`TypingSignalService`] -- debounced typing publisher and per
//!   conversation typing monitor.
//! - [`ReadReceiptBatcher`] -- one batched remote write per
//!   mark-conversation-read action.
//!
//! Consumers observe the replica through [`SyncEvent`] notifications and
//! pull-based store queries; no UI-binding mechanism is assumed.
//!
//! [`Database`]: parley_store::Database

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod events;
pub mod outgoing;
pub mod presence;
pub mod receipts;
pub mod typing;

mod error;

use std::sync::Arc;

pub use config::SyncConfig;
pub use coordinator::SyncCoordinator;
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use events::SyncEvent;
pub use outgoing::OutgoingMessageQueue;
pub use presence::PresenceTracker;
pub use receipts::ReadReceiptBatcher;
pub use typing::TypingSignalService;

/// Shared handle to the local replica.
///
/// One logical writer per store: every component takes this mutex for the
/// whole of its apply step, so an incremental batch and a concurrent
/// refresh interleave as whole batches, never inside one record's update.
pub type SharedStore = Arc<tokio::sync::Mutex<parley_store::Database>>;
