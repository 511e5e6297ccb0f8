//! Optimistic message delivery with retry/backoff.
//!
//! Every pending message is driven by one delivery task that loops
//! attempt / record-failure / sleep until the message is confirmed (by its
//! own `put` succeeding or by the coordinator applying the remote echo).
//! First attempts and retries go through the same path, so success and
//! failure handling are identical everywhere.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_remote::RemoteStore;
use parley_shared::{MessageId, MessageStatus};
use parley_store::{Message, StoreError};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::events::{emit, SyncEvent};
use crate::SharedStore;

type PendingMap = Arc<StdMutex<HashMap<MessageId, JoinHandle<()>>>>;

/// Tracks locally-authored messages not yet confirmed by the remote store.
pub struct OutgoingMessageQueue {
    store: SharedStore,
    remote: Arc<dyn RemoteStore>,
    events: broadcast::Sender<SyncEvent>,
    config: SyncConfig,
    pending: PendingMap,
}

impl OutgoingMessageQueue {
    pub fn new(
        store: SharedStore,
        remote: Arc<dyn RemoteStore>,
        events: broadcast::Sender<SyncEvent>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            events,
            config,
            pending: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Persist an optimistic write and attempt delivery immediately.
    ///
    /// The message stays visible locally whatever the remote does; on
    /// failure it enters the backoff schedule.
    pub async fn send(&self, message: Message) -> Result<()> {
        {
            let db = self.store.lock().await;
            db.upsert_message(&message)?;
        }
        emit(
            &self.events,
            SyncEvent::MessagesChanged {
                conversation_id: message.conversation_id.clone(),
            },
        );
        self.spawn_delivery(message.id, true);
        Ok(())
    }

    /// Put an unconfirmed message (back) on the retry schedule.
    /// Idempotent: enqueuing an id already pending is a no-op.
    pub async fn enqueue_retry(&self, message_id: &MessageId) -> Result<()> {
        if self.is_pending(message_id) {
            return Ok(());
        }
        // Verify the message exists and still needs delivery.
        let message = {
            let db = self.store.lock().await;
            db.get_message(message_id)?
        };
        if !needs_delivery(&message) {
            debug!(id = %message_id, "message already confirmed, nothing to enqueue");
            return Ok(());
        }
        self.spawn_delivery(message_id.clone(), false);
        Ok(())
    }

    /// Manual retry: bypass the scheduled backoff and attempt now.
    ///
    /// Permitted whenever the message is `Failed` or still local-only;
    /// anything already confirmed is a no-op (returns `false`).
    pub async fn retry_now(&self, message_id: &MessageId) -> Result<bool> {
        let message = {
            let db = self.store.lock().await;
            db.get_message(message_id)?
        };
        if !(message.status == MessageStatus::Failed || message.local_only) {
            return Ok(false);
        }
        // Drop any scheduled attempt; the immediate one replaces it.
        if let Some(task) = self
            .pending
            .lock()
            .expect("pending lock")
            .remove(message_id)
        {
            task.abort();
        }
        self.spawn_delivery(message_id.clone(), true);
        Ok(true)
    }

    /// Re-enqueue every unconfirmed message from the store.  Called on
    /// startup so messages composed before a crash or shutdown re-enter
    /// the schedule.
    pub async fn rehydrate(&self) -> Result<usize> {
        let unconfirmed = {
            let db = self.store.lock().await;
            db.unconfirmed_messages()?
        };
        let count = unconfirmed.len();
        for message in unconfirmed {
            if !self.is_pending(&message.id) {
                self.spawn_delivery(message.id, false);
            }
        }
        if count > 0 {
            info!(count, "re-enqueued unconfirmed messages");
        }
        Ok(count)
    }

    /// Ids currently on the schedule.
    pub fn pending_ids(&self) -> Vec<MessageId> {
        let mut pending = self.pending.lock().expect("pending lock");
        pending.retain(|_, task| !task.is_finished());
        pending.keys().cloned().collect()
    }

    /// Abort every scheduled delivery.  In-flight remote calls are not
    /// interrupted but their results are ignored.
    pub fn stop(&self) {
        let mut pending = self.pending.lock().expect("pending lock");
        for (_, task) in pending.drain() {
            task.abort();
        }
    }

    fn is_pending(&self, message_id: &MessageId) -> bool {
        let mut pending = self.pending.lock().expect("pending lock");
        pending.retain(|_, task| !task.is_finished());
        pending.contains_key(message_id)
    }

    fn spawn_delivery(&self, message_id: MessageId, immediate: bool) {
        let mut pending = self.pending.lock().expect("pending lock");
        pending.retain(|_, task| !task.is_finished());
        if pending.contains_key(&message_id) {
            return;
        }
        let task = tokio::spawn(run_delivery(
            self.store.clone(),
            self.remote.clone(),
            self.events.clone(),
            self.config.clone(),
            self.pending.clone(),
            message_id.clone(),
            immediate,
        ));
        pending.insert(message_id, task);
    }
}

impl Drop for OutgoingMessageQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn needs_delivery(message: &Message) -> bool {
    message.local_only
        || matches!(
            message.status,
            MessageStatus::Sending | MessageStatus::Failed
        )
}

/// The shared delivery loop: wait out the schedule, attempt, record the
/// outcome, repeat until confirmed.
async fn run_delivery(
    store: SharedStore,
    remote: Arc<dyn RemoteStore>,
    events: broadcast::Sender<SyncEvent>,
    config: SyncConfig,
    pending: PendingMap,
    message_id: MessageId,
    mut immediate: bool,
) {
    loop {
        // Honor a previously persisted schedule unless this attempt was
        // requested immediately (first send or manual retry).
        if !immediate {
            let due = {
                let db = store.lock().await;
                match db.get_message(&message_id) {
                    Ok(message) if needs_delivery(&message) => message.next_retry_at,
                    Ok(_) | Err(StoreError::NotFound) => break,
                    Err(e) => {
                        warn!(id = %message_id, error = %e, "delivery task store read failed");
                        break;
                    }
                }
            };
            if let Some(due) = due {
                let wait = (due - Utc::now()).to_std().unwrap_or_default();
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
        }
        immediate = false;

        match attempt_delivery(&store, &remote, &events, &config, &message_id).await {
            Ok(done) => {
                if done {
                    break;
                }
                // Failure recorded; loop around and sleep until the next
                // scheduled attempt.
            }
            Err(e) => {
                warn!(id = %message_id, error = %e, "delivery task aborted");
                break;
            }
        }
    }

    pending
        .lock()
        .expect("pending lock")
        .remove(&message_id);
}

/// One delivery attempt.  Returns `Ok(true)` when the message no longer
/// needs delivery (confirmed, or gone), `Ok(false)` when a failure was
/// recorded and another attempt is due.
async fn attempt_delivery(
    store: &SharedStore,
    remote: &Arc<dyn RemoteStore>,
    events: &broadcast::Sender<SyncEvent>,
    config: &SyncConfig,
    message_id: &MessageId,
) -> Result<bool> {
    // Snapshot the message and move it (back) into `Sending`.
    let message = {
        let db = store.lock().await;
        let message = match db.get_message(message_id) {
            Ok(message) => message,
            Err(StoreError::NotFound) => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        if !needs_delivery(&message) {
            // Confirmed in the meantime (remote echo applied by the
            // coordinator, or a competing attempt won).
            return Ok(true);
        }
        if message.status == MessageStatus::Failed {
            db.set_message_status(message_id, MessageStatus::Sending)?;
        }
        message
    };
    emit(
        events,
        SyncEvent::MessageUpdated {
            conversation_id: message.conversation_id.clone(),
            message_id: message_id.clone(),
        },
    );

    match remote.put_message(&message.to_remote()).await {
        Ok(()) => {
            {
                let db = store.lock().await;
                db.mark_message_sent(message_id)?;
            }
            debug!(id = %message_id, "message delivered");
            emit(
                events,
                SyncEvent::MessageUpdated {
                    conversation_id: message.conversation_id,
                    message_id: message_id.clone(),
                },
            );
            Ok(true)
        }
        Err(e) => {
            let failures = message.retry_count + 1;
            let delay = config.backoff_delay(failures);
            let next_retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            {
                let db = store.lock().await;
                db.record_send_failure(message_id, next_retry_at)?;
            }
            warn!(
                id = %message_id,
                error = %e,
                failures,
                retry_in = ?delay,
                "message delivery failed"
            );
            emit(
                events,
                SyncEvent::MessageUpdated {
                    conversation_id: message.conversation_id,
                    message_id: message_id.clone(),
                },
            );
            Ok(false)
        }
    }
}
