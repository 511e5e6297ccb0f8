//! Engine facade: one shared store, one event channel, five components.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::broadcast;
use tracing::info;

use parley_remote::RemoteStore;
use parley_shared::{ConversationId, MediaDescriptor, MessageId, MessageStatus, UserId};
use parley_store::{Database, Message, StoreError};

use crate::config::SyncConfig;
use crate::coordinator::SyncCoordinator;
use crate::error::{Result, SyncError};
use crate::events::{emit, SyncEvent};
use crate::outgoing::OutgoingMessageQueue;
use crate::presence::PresenceTracker;
use crate::receipts::ReadReceiptBatcher;
use crate::typing::TypingSignalService;
use crate::SharedStore;

struct EngineSession {
    user_id: UserId,
    queue: Arc<OutgoingMessageQueue>,
    presence: Arc<PresenceTracker>,
    typing: Arc<TypingSignalService>,
    receipts: Arc<ReadReceiptBatcher>,
}

/// Owns the replica, the remote handle and the component set.
///
/// Consumers subscribe to [`SyncEvent`] notifications for change
/// propagation and query the store directly for snapshots; the engine
/// assumes no UI-binding mechanism.
pub struct SyncEngine {
    store: SharedStore,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    events: broadcast::Sender<SyncEvent>,
    coordinator: Arc<SyncCoordinator>,
    session: StdMutex<Option<Arc<EngineSession>>>,
}

impl SyncEngine {
    pub fn new(database: Database, remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        let store: SharedStore = Arc::new(tokio::sync::Mutex::new(database));
        let (events, _) = broadcast::channel(config.event_buffer);
        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            remote.clone(),
            events.clone(),
        ));
        Self {
            store,
            remote,
            config,
            events,
            coordinator,
            session: StdMutex::new(None),
        }
    }

    /// Shared handle to the replica, for pull-based snapshot queries.
    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    /// Receive engine change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Start a sync session for `user_id`: open the live subscriptions
    /// and put unconfirmed local messages back on the retry schedule.
    pub async fn start(&self, user_id: UserId) -> Result<()> {
        if self.session.lock().expect("session lock").is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        self.coordinator.start(user_id.clone()).await?;

        let queue = Arc::new(OutgoingMessageQueue::new(
            self.store.clone(),
            self.remote.clone(),
            self.events.clone(),
            self.config.clone(),
        ));
        let presence = Arc::new(PresenceTracker::new(
            self.remote.clone(),
            self.events.clone(),
        ));
        let typing = Arc::new(TypingSignalService::new(
            self.remote.clone(),
            self.events.clone(),
            self.config.clone(),
            user_id.clone(),
        ));
        let receipts = Arc::new(ReadReceiptBatcher::new(
            self.store.clone(),
            self.remote.clone(),
            self.events.clone(),
            user_id.clone(),
        ));

        if let Err(e) = queue.rehydrate().await {
            self.coordinator.stop();
            return Err(e);
        }

        let session = Arc::new(EngineSession {
            user_id: user_id.clone(),
            queue,
            presence,
            typing,
            receipts,
        });
        let mut guard = self.session.lock().expect("session lock");
        if guard.is_some() {
            self.coordinator.stop();
            return Err(SyncError::AlreadyRunning);
        }
        *guard = Some(session);
        info!(user = %user_id, "engine started");
        Ok(())
    }

    /// One-shot full fetch and snapshot reconciliation.
    pub async fn refresh(&self) -> Result<()> {
        self.coordinator.refresh().await
    }

    /// Stop every component, cancel subscriptions and scheduled work, and
    /// clear session state.  Idempotent.
    pub fn stop(&self) {
        self.coordinator.stop();
        let session = self.session.lock().expect("session lock").take();
        if let Some(session) = session {
            session.queue.stop();
            session.presence.remove_all_observers();
            session.typing.stop();
            info!(user = %session.user_id, "engine stopped");
        }
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.session
            .lock()
            .expect("session lock")
            .as_ref()
            .map(|s| s.user_id.clone())
    }

    // ------------------------------------------------------------------
    // Component access
    // ------------------------------------------------------------------

    pub fn queue(&self) -> Result<Arc<OutgoingMessageQueue>> {
        self.with_session(|s| s.queue.clone())
    }

    pub fn presence(&self) -> Result<Arc<PresenceTracker>> {
        self.with_session(|s| s.presence.clone())
    }

    pub fn typing(&self) -> Result<Arc<TypingSignalService>> {
        self.with_session(|s| s.typing.clone())
    }

    pub fn receipts(&self) -> Result<Arc<ReadReceiptBatcher>> {
        self.with_session(|s| s.receipts.clone())
    }

    fn with_session<T>(&self, f: impl FnOnce(&EngineSession) -> T) -> Result<T> {
        self.session
            .lock()
            .expect("session lock")
            .as_ref()
            .map(|s| f(s))
            .ok_or(SyncError::NotRunning)
    }

    // ------------------------------------------------------------------
    // Conveniences
    // ------------------------------------------------------------------

    /// Compose and send a message in the current session.  The optimistic
    /// record is visible locally at once; delivery and retries run in the
    /// background.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: impl Into<String>,
        media: Option<MediaDescriptor>,
    ) -> Result<MessageId> {
        let (user_id, queue) = self.with_session(|s| (s.user_id.clone(), s.queue.clone()))?;
        {
            let db = self.store.lock().await;
            match db.get_conversation(conversation_id) {
                Ok(_) => {}
                Err(StoreError::NotFound) => {
                    return Err(SyncError::UnknownConversation(conversation_id.clone()))
                }
                Err(e) => return Err(e.into()),
            }
        }
        let message = Message::optimistic(conversation_id.clone(), user_id, content, media);
        let message_id = message.id.clone();
        queue.send(message).await?;
        Ok(message_id)
    }

    /// Manual retry of a failed or still-unconfirmed message.
    pub async fn retry_message(&self, message_id: &MessageId) -> Result<bool> {
        let queue = self.queue()?;
        queue.retry_now(message_id).await
    }

    /// Mark every unread message in a conversation read, one remote write.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<usize> {
        let receipts = self.receipts()?;
        receipts.mark_conversation_read(conversation_id).await
    }

    /// Apply an external delivery confirmation (`Sent -> Delivered`).
    ///
    /// The engine never produces this transition itself; it is driven by a
    /// server-side fan-out acknowledgement.  Confirming a message already
    /// delivered or read returns `Ok(false)`.
    pub async fn confirm_delivered(&self, message_id: &MessageId) -> Result<bool> {
        let message = {
            let db = self.store.lock().await;
            db.get_message(message_id)?
        };
        match message.status {
            MessageStatus::Sent => {
                {
                    let db = self.store.lock().await;
                    db.set_message_status(message_id, MessageStatus::Delivered)?;
                }
                emit(
                    &self.events,
                    SyncEvent::MessageUpdated {
                        conversation_id: message.conversation_id,
                        message_id: message_id.clone(),
                    },
                );
                Ok(true)
            }
            MessageStatus::Delivered | MessageStatus::Read => Ok(false),
            status => Err(SyncError::InvalidTransition {
                from: status,
                to: MessageStatus::Delivered,
            }),
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
