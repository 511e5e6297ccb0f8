//! Debounced typing publisher and per-conversation typing monitor.
//!
//! Publishing: rapid keystroke-driven `set_typing(true)` calls coalesce
//! into a single remote "add" write after the debounce window, and an idle
//! timer (reset on every call) clears the signal remotely if the caller
//! never sends `false`.  Monitoring: one watch task per conversation
//! reports the set of *other* participants currently typing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use parley_remote::{ChangeKind, RemoteStore};
use parley_shared::protocol::{decode_document, RemoteTyping};
use parley_shared::{ConversationId, UserId};

use crate::config::SyncConfig;
use crate::events::{emit, SyncEvent};

#[derive(Default)]
struct PublishState {
    /// The remote typing set currently contains us.
    published: bool,
    /// Pending debounced "add" write.
    publish_task: Option<JoinHandle<()>>,
    /// Pending idle-timeout clear.
    idle_task: Option<JoinHandle<()>>,
}

type PublishMap = Arc<StdMutex<HashMap<ConversationId, PublishState>>>;

/// Debounced local "is typing" publisher and remote "who is typing"
/// subscriber.
pub struct TypingSignalService {
    remote: Arc<dyn RemoteStore>,
    events: broadcast::Sender<SyncEvent>,
    config: SyncConfig,
    user_id: UserId,
    publish: PublishMap,
    monitors: StdMutex<HashMap<ConversationId, JoinHandle<()>>>,
}

impl TypingSignalService {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        events: broadcast::Sender<SyncEvent>,
        config: SyncConfig,
        user_id: UserId,
    ) -> Self {
        Self {
            remote,
            events,
            config,
            user_id,
            publish: Arc::new(StdMutex::new(HashMap::new())),
            monitors: StdMutex::new(HashMap::new()),
        }
    }

    /// Signal that the current user is (or stopped) typing.
    ///
    /// `true` schedules one debounced remote "add" write and resets the
    /// idle timer; `false` cancels pending timers and clears the signal
    /// remotely (skipped when no "add" was ever published).
    pub fn set_typing(&self, conversation_id: &ConversationId, typing: bool) {
        if typing {
            self.keystroke(conversation_id);
        } else {
            self.clear(conversation_id);
        }
    }

    fn keystroke(&self, conversation_id: &ConversationId) {
        let mut publish = self.publish.lock().expect("publish lock");
        let entry = publish.entry(conversation_id.clone()).or_default();

        // Every call pushes the idle deadline out.
        if let Some(task) = entry.idle_task.take() {
            task.abort();
        }
        entry.idle_task = Some(tokio::spawn(run_idle_clear(
            self.remote.clone(),
            self.publish.clone(),
            self.user_id.clone(),
            conversation_id.clone(),
            self.config.typing_idle,
        )));

        // One pending "add" write at a time; further keystrokes coalesce
        // into it.
        let pending = entry
            .publish_task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false);
        if entry.published || pending {
            return;
        }
        entry.publish_task = Some(tokio::spawn(run_debounced_publish(
            self.remote.clone(),
            self.publish.clone(),
            self.user_id.clone(),
            conversation_id.clone(),
            self.config.typing_debounce,
        )));
    }

    fn clear(&self, conversation_id: &ConversationId) {
        let was_published = {
            let mut publish = self.publish.lock().expect("publish lock");
            let Some(entry) = publish.get_mut(conversation_id) else {
                return;
            };
            if let Some(task) = entry.publish_task.take() {
                task.abort();
            }
            if let Some(task) = entry.idle_task.take() {
                task.abort();
            }
            std::mem::take(&mut entry.published)
        };
        if was_published {
            let remote = self.remote.clone();
            let user_id = self.user_id.clone();
            let conversation_id = conversation_id.clone();
            tokio::spawn(async move {
                if let Err(e) = remote.set_typing(&conversation_id, &user_id, false).await {
                    warn!(conversation = %conversation_id, error = %e, "typing clear failed");
                }
            });
        }
    }

    /// Subscribe to a conversation's remote typing set and report every
    /// change, self excluded, via [`SyncEvent::TypingChanged`].
    pub fn start_monitoring(&self, conversation_id: &ConversationId) {
        let mut monitors = self.monitors.lock().expect("monitor lock");
        if let Some(task) = monitors.get(conversation_id) {
            if !task.is_finished() {
                return;
            }
        }
        let task = tokio::spawn(run_typing_monitor(
            self.remote.clone(),
            self.events.clone(),
            self.user_id.clone(),
            conversation_id.clone(),
        ));
        monitors.insert(conversation_id.clone(), task);
    }

    pub fn stop_monitoring(&self, conversation_id: &ConversationId) {
        if let Some(task) = self
            .monitors
            .lock()
            .expect("monitor lock")
            .remove(conversation_id)
        {
            task.abort();
        }
    }

    /// Cancel every pending timer and monitor immediately.  In-flight
    /// remote writes are not interrupted; their results are ignored.
    pub fn stop(&self) {
        let mut monitors = self.monitors.lock().expect("monitor lock");
        for (_, task) in monitors.drain() {
            task.abort();
        }
        let mut publish = self.publish.lock().expect("publish lock");
        for (_, entry) in publish.drain() {
            if let Some(task) = entry.publish_task {
                task.abort();
            }
            if let Some(task) = entry.idle_task {
                task.abort();
            }
        }
    }
}

impl Drop for TypingSignalService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Debounce window elapsed with no `set_typing(false)`: publish the "add"
/// write.  The published flag is set before the write so a concurrent
/// clear always issues the matching "remove".
async fn run_debounced_publish(
    remote: Arc<dyn RemoteStore>,
    publish: PublishMap,
    user_id: UserId,
    conversation_id: ConversationId,
    debounce: std::time::Duration,
) {
    tokio::time::sleep(debounce).await;
    {
        let mut publish = publish.lock().expect("publish lock");
        let Some(entry) = publish.get_mut(&conversation_id) else {
            return;
        };
        entry.published = true;
        entry.publish_task = None;
    }
    if let Err(e) = remote.set_typing(&conversation_id, &user_id, true).await {
        warn!(conversation = %conversation_id, error = %e, "typing publish failed");
    }
}

/// Idle deadline reached: behave as an implicit `set_typing(false)`.
async fn run_idle_clear(
    remote: Arc<dyn RemoteStore>,
    publish: PublishMap,
    user_id: UserId,
    conversation_id: ConversationId,
    idle: std::time::Duration,
) {
    tokio::time::sleep(idle).await;
    let was_published = {
        let mut publish = publish.lock().expect("publish lock");
        let Some(entry) = publish.get_mut(&conversation_id) else {
            return;
        };
        if let Some(task) = entry.publish_task.take() {
            task.abort();
        }
        entry.idle_task = None;
        std::mem::take(&mut entry.published)
    };
    if was_published {
        debug!(conversation = %conversation_id, "typing signal idle-expired");
        if let Err(e) = remote.set_typing(&conversation_id, &user_id, false).await {
            warn!(conversation = %conversation_id, error = %e, "typing clear failed");
        }
    }
}

async fn run_typing_monitor(
    remote: Arc<dyn RemoteStore>,
    events: broadcast::Sender<SyncEvent>,
    user_id: UserId,
    conversation_id: ConversationId,
) {
    let mut subscription = match remote.watch_typing(&conversation_id).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(conversation = %conversation_id, error = %e, "typing subscription failed");
            return;
        }
    };

    while let Some(batch) = subscription.next_batch().await {
        for event in batch.events {
            if event.kind == ChangeKind::Removed {
                continue;
            }
            let Some(doc) = event.doc else { continue };
            let typing: RemoteTyping = match decode_document(&doc) {
                Ok(typing) => typing,
                Err(e) => {
                    warn!(conversation = %conversation_id, error = %e, "skipping undecodable typing record");
                    continue;
                }
            };
            let mut users = typing.users;
            users.remove(&user_id); // self is never reported
            emit(
                &events,
                SyncEvent::TypingChanged {
                    conversation_id: conversation_id.clone(),
                    users,
                },
            );
        }
    }
    debug!(conversation = %conversation_id, "typing feed closed");
}
