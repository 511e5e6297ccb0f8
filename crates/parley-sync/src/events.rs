//! Change notifications published by the engine.
//!
//! The engine replaces push-based UI bindings with an explicit broadcast
//! channel: components emit a [`SyncEvent`] after every applied change, and
//! consumers either react to events or re-query the store for a snapshot.
//! Slow consumers lag and miss events rather than blocking the engine;
//! after a lag, re-querying the store catches them up.

use std::collections::BTreeSet;

use tokio::sync::broadcast;

use parley_shared::{ConversationId, MessageId, PresenceSnapshot, UserId};

/// One observable change to the replica or to an ephemeral signal.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The conversation set or some conversation's fields changed.
    ConversationsChanged,
    /// A conversation disappeared from the replica.
    ConversationRemoved { conversation_id: ConversationId },
    /// A conversation's message set changed.
    MessagesChanged { conversation_id: ConversationId },
    /// A single message changed state (sent, failed, delivered, read).
    MessageUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    /// An observed peer's presence changed.
    PresenceChanged { snapshot: PresenceSnapshot },
    /// The set of other participants typing in a conversation changed.
    TypingChanged {
        conversation_id: ConversationId,
        users: BTreeSet<UserId>,
    },
}

/// Fire-and-forget emit: an event with no subscribers is simply dropped.
pub(crate) fn emit(tx: &broadcast::Sender<SyncEvent>, event: SyncEvent) {
    let _ = tx.send(event);
}
