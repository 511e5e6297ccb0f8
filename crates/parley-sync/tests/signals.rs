//! Presence, typing and read-receipt behavior.

mod support;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use parley_remote::MemoryRemote;
use parley_remote::RemoteStore;
use parley_shared::protocol::RemotePresence;
use parley_shared::{MessageStatus, UserId};
use parley_store::{Conversation, Database, Message};
use parley_sync::{
    PresenceTracker, ReadReceiptBatcher, SharedStore, SyncConfig, SyncEvent, TypingSignalService,
};

use support::*;

fn events() -> (broadcast::Sender<SyncEvent>, broadcast::Receiver<SyncEvent>) {
    init_logging();
    broadcast::channel(256)
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn presence_subscriptions_are_refcounted() {
    let remote = Arc::new(MemoryRemote::new());
    let (tx, _rx) = events();
    let tracker = PresenceTracker::new(remote.clone(), tx);
    let bob = user("bob");

    // Three call sites observe the same peer: one underlying subscription.
    tracker.observe(std::slice::from_ref(&bob));
    tracker.observe(std::slice::from_ref(&bob));
    tracker.observe(std::slice::from_ref(&bob));
    wait_until("subscription open", || {
        let remote = remote.clone();
        let bob = bob.clone();
        async move { remote.presence_watcher_count(&bob) == 1 }
    })
    .await;
    assert_eq!(tracker.observer_count(&bob), 3);
    assert_eq!(tracker.active_subscriptions(), 1);

    // Releasing all but one observer keeps the subscription alive.
    tracker.remove_observer(&bob);
    tracker.remove_observer(&bob);
    settle().await;
    assert_eq!(remote.presence_watcher_count(&bob), 1);
    assert_eq!(tracker.observer_count(&bob), 1);

    // The last release tears it down.
    tracker.remove_observer(&bob);
    wait_until("subscription torn down", || {
        let remote = remote.clone();
        let bob = bob.clone();
        async move { remote.presence_watcher_count(&bob) == 0 }
    })
    .await;
    assert_eq!(tracker.active_subscriptions(), 0);

    // Releasing an unobserved id is a no-op.
    tracker.remove_observer(&bob);
}

#[tokio::test(start_paused = true)]
async fn presence_snapshot_is_synchronous_and_current() {
    let remote = Arc::new(MemoryRemote::new());
    let (tx, _rx) = events();
    let tracker = PresenceTracker::new(remote.clone(), tx);
    let bob = user("bob");

    // Never observed: absent.
    assert!(tracker.snapshot(&bob).is_none());

    remote.set_presence(&RemotePresence {
        user_id: bob.clone(),
        is_online: true,
        last_seen: None,
    });
    tracker.observe(std::slice::from_ref(&bob));

    wait_until("initial state arrives", || {
        let tracker = &tracker;
        let bob = bob.clone();
        async move { tracker.snapshot(&bob).map(|s| s.is_online).unwrap_or(false) }
    })
    .await;

    let went_offline = chrono::Utc::now();
    remote.set_presence(&RemotePresence {
        user_id: bob.clone(),
        is_online: false,
        last_seen: Some(went_offline),
    });
    wait_until("update arrives", || {
        let tracker = &tracker;
        let bob = bob.clone();
        async move {
            tracker
                .snapshot(&bob)
                .map(|s| !s.is_online && s.last_seen.is_some())
                .unwrap_or(false)
        }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn remove_all_observers_clears_everything() {
    let remote = Arc::new(MemoryRemote::new());
    let (tx, _rx) = events();
    let tracker = PresenceTracker::new(remote.clone(), tx);

    tracker.observe(&[user("bob"), user("carol")]);
    wait_until("both open", || {
        let remote = remote.clone();
        async move {
            remote.presence_watcher_count(&user("bob")) == 1
                && remote.presence_watcher_count(&user("carol")) == 1
        }
    })
    .await;

    tracker.remove_all_observers();
    wait_until("both closed", || {
        let remote = remote.clone();
        async move {
            remote.presence_watcher_count(&user("bob")) == 0
                && remote.presence_watcher_count(&user("carol")) == 0
        }
    })
    .await;
    assert_eq!(tracker.active_subscriptions(), 0);
}

// ---------------------------------------------------------------------------
// Typing
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn typing_keystrokes_coalesce_into_one_write_pair() {
    let remote = Arc::new(MemoryRemote::new());
    let (tx, _rx) = events();
    let service = TypingSignalService::new(
        remote.clone(),
        tx,
        SyncConfig::default(),
        user("alice"),
    );
    let conversation = conv("c1");

    // Five keystrokes inside the debounce window.
    for _ in 0..5 {
        service.set_typing(&conversation, true);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Debounce elapses: exactly one "add" write.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let writes = remote.typing_writes();
    assert_eq!(writes.len(), 1);
    assert!(writes[0].typing);
    assert_eq!(writes[0].user_id, user("alice"));

    // Idle timeout with no further calls: exactly one "remove" write.
    tokio::time::sleep(Duration::from_secs(6)).await;
    let writes = remote.typing_writes();
    assert_eq!(writes.len(), 2);
    assert!(!writes[1].typing);
}

#[tokio::test(start_paused = true)]
async fn typing_false_before_debounce_cancels_the_write() {
    let remote = Arc::new(MemoryRemote::new());
    let (tx, _rx) = events();
    let service = TypingSignalService::new(
        remote.clone(),
        tx,
        SyncConfig::default(),
        user("alice"),
    );
    let conversation = conv("c1");

    service.set_typing(&conversation, true);
    service.set_typing(&conversation, false);

    // Nothing was ever published, so nothing needs clearing.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(remote.typing_writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn typing_false_after_publish_clears_remotely() {
    let remote = Arc::new(MemoryRemote::new());
    let (tx, _rx) = events();
    let service = TypingSignalService::new(
        remote.clone(),
        tx,
        SyncConfig::default(),
        user("alice"),
    );
    let conversation = conv("c1");

    service.set_typing(&conversation, true);
    tokio::time::sleep(Duration::from_millis(500)).await;
    service.set_typing(&conversation, false);

    wait_until("remove write issued", || {
        let remote = remote.clone();
        async move { remote.typing_writes().len() == 2 }
    })
    .await;
    let writes = remote.typing_writes();
    assert!(writes[0].typing);
    assert!(!writes[1].typing);

    // The idle timer was cancelled; no third write ever shows up.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(remote.typing_writes().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn typing_monitor_reports_others_excluding_self() {
    let remote = Arc::new(MemoryRemote::new());
    let (tx, mut rx) = events();
    let service = TypingSignalService::new(
        remote.clone(),
        tx,
        SyncConfig::default(),
        user("alice"),
    );
    let conversation = conv("c1");

    service.start_monitoring(&conversation);
    settle().await;

    // Both bob and alice (from another device) appear in the remote set.
    remote
        .set_typing(&conversation, &user("bob"), true)
        .await
        .unwrap();
    remote
        .set_typing(&conversation, &user("alice"), true)
        .await
        .unwrap();

    // Wait for both remote updates to come through the monitor.
    let mut seen = 0usize;
    let mut last_seen: Option<BTreeSet<UserId>> = None;
    for _ in 0..1000 {
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::TypingChanged { users, .. } = event {
                seen += 1;
                last_seen = Some(users);
            }
        }
        if seen >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let users = last_seen.expect("typing event observed");
    assert!(users.contains(&user("bob")));
    assert!(!users.contains(&user("alice")), "self must be excluded");

    service.stop_monitoring(&conversation);
}

// ---------------------------------------------------------------------------
// Read receipts
// ---------------------------------------------------------------------------

fn seeded_store(unread_for_bob: u32) -> (SharedStore, Vec<Message>) {
    let db = Database::open_in_memory().unwrap();

    let mut conversation = Conversation {
        id: conv("c1"),
        participants: [user("alice"), user("bob")].into_iter().collect(),
        title: None,
        last_message: None,
        unread_counts: Default::default(),
        hidden_for: Default::default(),
    };
    if unread_for_bob > 0 {
        conversation
            .unread_counts
            .insert(user("bob"), unread_for_bob);
    }
    db.upsert_conversation(&conversation).unwrap();

    let mut messages = Vec::new();
    for i in 0..unread_for_bob {
        let mut message = Message::optimistic(conv("c1"), user("alice"), format!("msg {i}"), None);
        message.status = MessageStatus::Sent;
        message.local_only = false;
        db.upsert_message(&message).unwrap();
        messages.push(message);
    }

    (Arc::new(tokio::sync::Mutex::new(db)), messages)
}

#[tokio::test(start_paused = true)]
async fn receipts_batch_is_one_write_and_atomic_locally() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, messages) = seeded_store(3);
    let (tx, _rx) = events();
    let batcher = ReadReceiptBatcher::new(store.clone(), remote.clone(), tx, user("bob"));

    let acked = batcher.mark_conversation_read(&conv("c1")).await.unwrap();
    assert_eq!(acked, 3);

    // Exactly one remote write for the whole batch.
    let commits = remote.receipt_commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].message_ids.len(), 3);
    assert_eq!(commits[0].reader_id, user("bob"));

    let db = store.lock().await;
    for message in &messages {
        let loaded = db.get_message(&message.id).unwrap();
        assert_eq!(loaded.status, MessageStatus::Read);
        assert!(loaded.is_read_by(&user("bob")));
        assert!(loaded.read_at.contains_key(&user("bob")));
    }
    assert_eq!(
        db.get_conversation(&conv("c1")).unwrap().unread_for(&user("bob")),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn receipts_failure_leaves_local_state_untouched() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, messages) = seeded_store(2);
    let (tx, _rx) = events();
    let batcher = ReadReceiptBatcher::new(store.clone(), remote.clone(), tx, user("bob"));

    remote.fail_next_receipt_commits(1);
    assert!(batcher.mark_conversation_read(&conv("c1")).await.is_err());

    {
        let db = store.lock().await;
        for message in &messages {
            let loaded = db.get_message(&message.id).unwrap();
            assert_eq!(loaded.status, MessageStatus::Sent);
            assert!(!loaded.is_read_by(&user("bob")));
        }
        assert_eq!(
            db.get_conversation(&conv("c1")).unwrap().unread_for(&user("bob")),
            2
        );
    }

    // The caller retries; this time it lands.
    let acked = batcher.mark_conversation_read(&conv("c1")).await.unwrap();
    assert_eq!(acked, 2);
    assert_eq!(remote.receipt_commits().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn receipts_are_idempotent_per_reader() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, _messages) = seeded_store(2);
    let (tx, _rx) = events();
    let batcher = ReadReceiptBatcher::new(store.clone(), remote.clone(), tx, user("bob"));

    assert_eq!(batcher.mark_conversation_read(&conv("c1")).await.unwrap(), 2);
    // Everything is read now; a repeat call writes nothing.
    assert_eq!(batcher.mark_conversation_read(&conv("c1")).await.unwrap(), 0);
    assert_eq!(remote.receipt_commits().len(), 1);
}
