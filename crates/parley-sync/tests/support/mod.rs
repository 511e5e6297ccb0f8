//! Shared helpers for the engine integration tests.
//!
//! Each test binary compiles its own copy; not every binary uses every
//! helper.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Duration;

use chrono::Utc;

use parley_shared::protocol::{RemoteConversation, RemoteMessage};
use parley_shared::{ConversationId, MessageId, MessageStatus, UserId};

pub fn user(id: &str) -> UserId {
    UserId::new(id)
}

pub fn conv(id: &str) -> ConversationId {
    ConversationId::new(id)
}

pub fn remote_conversation(id: &str, participants: &[&str]) -> RemoteConversation {
    RemoteConversation {
        id: ConversationId::new(id),
        participants: participants.iter().map(|p| UserId::new(*p)).collect(),
        title: None,
        last_message_id: None,
        last_message_preview: None,
        last_message_timestamp: None,
        unread_counts: BTreeMap::new(),
        hidden_for_user_ids: BTreeSet::new(),
    }
}

pub fn remote_message(conversation: &str, id: &str, sender: &str, content: &str) -> RemoteMessage {
    RemoteMessage {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(conversation),
        sender_id: UserId::new(sender),
        content: content.to_string(),
        translated_content: None,
        media: None,
        timestamp: Utc::now(),
        status: MessageStatus::Sent,
        read_by: BTreeSet::new(),
        read_at: BTreeMap::new(),
    }
}

/// Opt-in log output while debugging a test run:
/// `RUST_LOG=parley_sync=debug cargo test -p parley-sync`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it returns true, yielding to the runtime between
/// polls.  Panics after ~10 simulated seconds of no progress.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Yield to the runtime without advancing the (possibly paused) clock, so
/// spawned tasks progress up to their next timer.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
