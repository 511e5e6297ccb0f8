//! # parley-shared
//!
//! Domain identifiers, status machinery, and the wire representation of
//! remote records shared by every Parley crate.  No I/O lives here.

pub mod constants;
pub mod protocol;
pub mod types;

pub use types::{
    ConversationId, ConversationKind, MediaDescriptor, MediaKind, MessageId, MessageStatus,
    PresenceSnapshot, UserId,
};
