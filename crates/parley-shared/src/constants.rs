//! Engine-wide defaults.  Runtime overrides go through `SyncConfig` in
//! `parley-sync`.

use std::time::Duration;

/// First retry delay after a failed message delivery.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(2);

/// Multiplicative growth factor between consecutive retry delays.
pub const DEFAULT_RETRY_MULTIPLIER: u32 = 2;

/// Upper cap on the retry delay.
pub const DEFAULT_RETRY_CAP: Duration = Duration::from_secs(300);

/// Window in which rapid `set_typing(true)` calls coalesce into one
/// remote write.
pub const DEFAULT_TYPING_DEBOUNCE: Duration = Duration::from_millis(300);

/// Idle time after the last keystroke before the typing signal is
/// cleared remotely on the caller's behalf.
pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_secs(5);

/// Buffered batches per change-feed subscription.
pub const FEED_BUFFER: usize = 64;

/// Buffered events on the engine's broadcast channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Maximum length of a last-message preview, in characters.
pub const MAX_PREVIEW_LEN: usize = 120;
