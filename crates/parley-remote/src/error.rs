use thiserror::Error;

/// Errors produced by remote-store backends.
///
/// Everything here is treated as transient by the engine: the caller's own
/// retry policy (backoff for sends, stale-but-usable cache for feeds)
/// decides what happens next.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The backend could not be reached or refused the connection.
    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within its deadline.
    #[error("Remote call timed out")]
    Timeout,

    /// The backend rejected the request (bad payload, permission, quota).
    #[error("Remote rejected request: {0}")]
    Rejected(String),

    /// The subscription or connection was closed by the backend.
    #[error("Remote subscription closed")]
    Closed,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RemoteError>;
