use parley_remote::RemoteError;
use parley_shared::{ConversationId, MessageStatus};
use parley_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the sync engine.
///
/// None of these are fatal: remote errors are transient and retryable,
/// store errors leave the replica consistent (possibly stale), and
/// precondition violations have no side effects.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local persistence failure; the operation may be retried.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Remote call failure; the relevant component's retry policy applies.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The engine (or component) has not been started.
    #[error("Engine is not running")]
    NotRunning,

    /// `start` was called while a session is already active.
    #[error("Engine is already running")]
    AlreadyRunning,

    /// Operation referenced a conversation the replica does not hold.
    #[error("Unknown conversation: {0}")]
    UnknownConversation(ConversationId),

    /// Rejected message status change.
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: MessageStatus,
        to: MessageStatus,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;
