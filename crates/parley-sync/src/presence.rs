//! Multiplexed, ref-counted presence subscriptions.
//!
//! The same peer appears in many open conversations at once; the
//! subscription cost is paid once per peer, not once per conversation.
//! Each observed user has one watch task feeding an in-memory snapshot
//! map that [`snapshot`](PresenceTracker::snapshot) reads synchronously.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use parley_remote::{ChangeKind, RemoteStore};
use parley_shared::protocol::{decode_document, RemotePresence};
use parley_shared::{PresenceSnapshot, UserId};

use crate::events::{emit, SyncEvent};

struct Observed {
    ref_count: usize,
    task: JoinHandle<()>,
}

type SnapshotMap = Arc<StdMutex<HashMap<UserId, PresenceSnapshot>>>;

/// Ref-counted subscription to other users' online/last-seen state.
pub struct PresenceTracker {
    remote: Arc<dyn RemoteStore>,
    events: broadcast::Sender<SyncEvent>,
    observed: StdMutex<HashMap<UserId, Observed>>,
    snapshots: SnapshotMap,
}

impl PresenceTracker {
    pub fn new(remote: Arc<dyn RemoteStore>, events: broadcast::Sender<SyncEvent>) -> Self {
        Self {
            remote,
            events,
            observed: StdMutex::new(HashMap::new()),
            snapshots: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Start (or share) the subscription for each given user.
    ///
    /// Exactly one underlying remote subscription exists per user id
    /// regardless of how many call sites observe it.
    pub fn observe(&self, user_ids: &[UserId]) {
        let mut observed = self.observed.lock().expect("observed lock");
        for user_id in user_ids {
            if let Some(entry) = observed.get_mut(user_id) {
                entry.ref_count += 1;
                continue;
            }
            let task = tokio::spawn(run_presence_watch(
                self.remote.clone(),
                self.events.clone(),
                self.snapshots.clone(),
                user_id.clone(),
            ));
            observed.insert(
                user_id.clone(),
                Observed { ref_count: 1, task },
            );
        }
    }

    /// Drop one observer of a user; the subscription is torn down when the
    /// last observer releases it.  Releasing an unobserved id is a no-op.
    pub fn remove_observer(&self, user_id: &UserId) {
        let mut observed = self.observed.lock().expect("observed lock");
        let Some(entry) = observed.get_mut(user_id) else {
            return;
        };
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            let entry = observed.remove(user_id).expect("entry exists");
            entry.task.abort();
            debug!(user = %user_id, "presence subscription torn down");
        }
    }

    /// Tear everything down.
    pub fn remove_all_observers(&self) {
        let mut observed = self.observed.lock().expect("observed lock");
        for (_, entry) in observed.drain() {
            entry.task.abort();
        }
    }

    /// Synchronous, non-blocking read of the last known state.  `None`
    /// when the user was never observed (or no record has arrived yet).
    pub fn snapshot(&self, user_id: &UserId) -> Option<PresenceSnapshot> {
        self.snapshots
            .lock()
            .expect("snapshot lock")
            .get(user_id)
            .cloned()
    }

    /// Current ref count for a user id; zero when unobserved.
    pub fn observer_count(&self, user_id: &UserId) -> usize {
        self.observed
            .lock()
            .expect("observed lock")
            .get(user_id)
            .map(|entry| entry.ref_count)
            .unwrap_or(0)
    }

    /// Number of live underlying subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.observed.lock().expect("observed lock").len()
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.remove_all_observers();
    }
}

async fn run_presence_watch(
    remote: Arc<dyn RemoteStore>,
    events: broadcast::Sender<SyncEvent>,
    snapshots: SnapshotMap,
    user_id: UserId,
) {
    let mut subscription = match remote.watch_presence(&user_id).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(user = %user_id, error = %e, "presence subscription failed");
            return;
        }
    };

    while let Some(batch) = subscription.next_batch().await {
        for event in batch.events {
            if event.kind == ChangeKind::Removed {
                continue;
            }
            let Some(doc) = event.doc else { continue };
            let remote_presence: RemotePresence = match decode_document(&doc) {
                Ok(presence) => presence,
                Err(e) => {
                    warn!(user = %user_id, error = %e, "skipping undecodable presence record");
                    continue;
                }
            };
            let snapshot = PresenceSnapshot {
                user_id: remote_presence.user_id,
                is_online: remote_presence.is_online,
                last_seen: remote_presence.last_seen,
            };
            snapshots
                .lock()
                .expect("snapshot lock")
                .insert(user_id.clone(), snapshot.clone());
            emit(&events, SyncEvent::PresenceChanged { snapshot });
        }
    }
    debug!(user = %user_id, "presence feed closed");
}
