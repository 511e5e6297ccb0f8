//! Remote-to-local reconciliation.
//!
//! The coordinator owns the conversation change feed for the current user
//! plus one message feed per replicated conversation, and merges whatever
//! they deliver into the local store.  Two modes:
//!
//! - **Incremental**: live batches of add/modify/remove events, applied in
//!   delivery order, upserting by id.  Remote is authoritative for its
//!   fields; there is no merge logic beyond last-write-wins.
//! - **Full snapshot** (`refresh`): fetch the complete remote set, upsert
//!   everything in it, and delete local entities absent from it
//!   (tombstone-by-absence).  This is how removals missed while offline
//!   are discovered.
//!
//! The store mutex is held for the whole apply step of a batch or
//! snapshot, so a live batch and a concurrent refresh never interleave
//! partial writes to one record.  A record that fails to decode is
//! skipped and logged; the rest of its batch still applies.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_remote::{ChangeBatch, ChangeKind, RemoteStore, Subscription};
use parley_shared::protocol::{decode_document, RemoteConversation, RemoteMessage};
use parley_shared::{ConversationId, MessageId, MessageStatus, UserId};
use parley_store::{Conversation, Database, LastMessage, Message, StoreError};

use crate::error::{Result, SyncError};
use crate::events::{emit, SyncEvent};
use crate::SharedStore;

/// Subscribes to remote change feeds and reconciles them into the store.
pub struct SyncCoordinator {
    store: SharedStore,
    remote: Arc<dyn RemoteStore>,
    events: broadcast::Sender<SyncEvent>,
    session: StdMutex<Option<Session>>,
}

struct Session {
    ctx: ListenerCtx,
    conversation_task: JoinHandle<()>,
}

/// Everything a feed task needs, cheap to clone.
#[derive(Clone)]
struct ListenerCtx {
    store: SharedStore,
    remote: Arc<dyn RemoteStore>,
    events: broadcast::Sender<SyncEvent>,
    user_id: UserId,
    message_tasks: Arc<StdMutex<HashMap<ConversationId, JoinHandle<()>>>>,
}

impl SyncCoordinator {
    pub fn new(
        store: SharedStore,
        remote: Arc<dyn RemoteStore>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            store,
            remote,
            events,
            session: StdMutex::new(None),
        }
    }

    /// Open the live subscription for `user_id` and start replicating.
    ///
    /// Message feeds for conversations already held locally (from a
    /// previous session) are reopened immediately; feeds for conversations
    /// the remote introduces later open as their records arrive.
    pub async fn start(&self, user_id: UserId) -> Result<()> {
        if self.session.lock().expect("session lock").is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        let subscription = self.remote.watch_conversations(&user_id).await?;
        let cached = { self.store.lock().await.conversation_ids()? };

        let ctx = ListenerCtx {
            store: self.store.clone(),
            remote: self.remote.clone(),
            events: self.events.clone(),
            user_id: user_id.clone(),
            message_tasks: Arc::new(StdMutex::new(HashMap::new())),
        };

        for conversation_id in cached {
            ctx.ensure_message_feed(&conversation_id);
        }

        let conversation_task = tokio::spawn(run_conversation_feed(subscription, ctx.clone()));

        let mut guard = self.session.lock().expect("session lock");
        if guard.is_some() {
            // Lost a start/start race; tear down what we just spawned.
            conversation_task.abort();
            ctx.abort_message_feeds();
            return Err(SyncError::AlreadyRunning);
        }
        info!(user = %user_id, "sync session started");
        *guard = Some(Session {
            ctx,
            conversation_task,
        });
        Ok(())
    }

    /// One-shot full fetch and snapshot reconciliation.
    ///
    /// On remote failure the store is left untouched and keeps serving
    /// the last known state.
    pub async fn refresh(&self) -> Result<()> {
        let ctx = {
            let guard = self.session.lock().expect("session lock");
            guard
                .as_ref()
                .map(|s| s.ctx.clone())
                .ok_or(SyncError::NotRunning)?
        };

        let docs = self.remote.fetch_conversations(&ctx.user_id).await?;

        let outcome = {
            let mut db = self.store.lock().await;
            apply_conversation_snapshot(&mut db, &ctx.user_id, &docs)?
        };
        for conversation_id in &outcome.removed {
            ctx.stop_message_feed(conversation_id);
            emit(
                &self.events,
                SyncEvent::ConversationRemoved {
                    conversation_id: conversation_id.clone(),
                },
            );
        }
        if outcome.changed {
            emit(&self.events, SyncEvent::ConversationsChanged);
        }

        // Snapshot every replicated conversation's message set.  A failed
        // per-conversation fetch degrades to the cached state rather than
        // aborting the refresh.
        let ids = { self.store.lock().await.conversation_ids()? };
        for conversation_id in ids {
            match self.remote.fetch_messages(&conversation_id).await {
                Ok(docs) => {
                    let changed = {
                        let mut db = self.store.lock().await;
                        apply_message_snapshot(&mut db, &conversation_id, &docs)?
                    };
                    if changed {
                        emit(
                            &self.events,
                            SyncEvent::MessagesChanged {
                                conversation_id: conversation_id.clone(),
                            },
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        conversation = %conversation_id,
                        error = %e,
                        "message snapshot fetch failed, serving cached state"
                    );
                }
            }
            ctx.ensure_message_feed(&conversation_id);
        }

        Ok(())
    }

    /// Cancel all subscriptions and clear session state.  Idempotent.
    pub fn stop(&self) {
        let session = self.session.lock().expect("session lock").take();
        if let Some(session) = session {
            session.conversation_task.abort();
            session.ctx.abort_message_feeds();
            info!(user = %session.ctx.user_id, "sync session stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.session.lock().expect("session lock").is_some()
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ListenerCtx {
    /// Spawn the message feed for a conversation unless one is already
    /// live.  A finished task (closed feed) is replaced.
    fn ensure_message_feed(&self, conversation_id: &ConversationId) {
        let mut tasks = self.message_tasks.lock().expect("message task lock");
        if let Some(handle) = tasks.get(conversation_id) {
            if !handle.is_finished() {
                return;
            }
        }
        let task = tokio::spawn(run_message_feed(self.clone(), conversation_id.clone()));
        tasks.insert(conversation_id.clone(), task);
    }

    fn stop_message_feed(&self, conversation_id: &ConversationId) {
        let task = self
            .message_tasks
            .lock()
            .expect("message task lock")
            .remove(conversation_id);
        if let Some(task) = task {
            task.abort();
        }
    }

    fn abort_message_feeds(&self) {
        let mut tasks = self.message_tasks.lock().expect("message task lock");
        for (_, task) in tasks.drain() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Feed tasks
// ---------------------------------------------------------------------------

async fn run_conversation_feed(mut subscription: Subscription, ctx: ListenerCtx) {
    while let Some(batch) = subscription.next_batch().await {
        apply_conversation_batch(&ctx, batch).await;
    }
    info!(user = %ctx.user_id, "conversation feed closed");
}

async fn run_message_feed(ctx: ListenerCtx, conversation_id: ConversationId) {
    let mut subscription = match ctx.remote.watch_messages(&conversation_id).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(
                conversation = %conversation_id,
                error = %e,
                "message feed unavailable, serving cached state"
            );
            return;
        }
    };
    while let Some(batch) = subscription.next_batch().await {
        apply_message_batch(&ctx, &conversation_id, batch).await;
    }
    debug!(conversation = %conversation_id, "message feed closed");
}

// ---------------------------------------------------------------------------
// Incremental application
// ---------------------------------------------------------------------------

async fn apply_conversation_batch(ctx: &ListenerCtx, batch: ChangeBatch) {
    let mut upserted: Vec<ConversationId> = Vec::new();
    let mut removed: Vec<ConversationId> = Vec::new();

    {
        let mut db = ctx.store.lock().await;
        for event in batch.events {
            match event.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    let Some(doc) = event.doc else {
                        warn!(id = %event.id, "change event without document, skipping");
                        continue;
                    };
                    let remote: RemoteConversation = match decode_document(&doc) {
                        Ok(remote) => remote,
                        Err(e) => {
                            warn!(id = %event.id, error = %e, "skipping undecodable conversation record");
                            continue;
                        }
                    };
                    let id = remote.id.clone();
                    match merge_remote_conversation(&db, &ctx.user_id, remote) {
                        Ok(_) => upserted.push(id),
                        Err(e) => warn!(id = %id, error = %e, "conversation upsert failed"),
                    }
                }
                ChangeKind::Removed => {
                    let id = ConversationId::new(event.id);
                    match db.delete_conversation(&id) {
                        Ok(true) => removed.push(id),
                        Ok(false) => {} // already absent; removals are idempotent
                        Err(e) => warn!(id = %id, error = %e, "conversation delete failed"),
                    }
                }
            }
        }
    }

    for conversation_id in &upserted {
        ctx.ensure_message_feed(conversation_id);
    }
    for conversation_id in removed {
        ctx.stop_message_feed(&conversation_id);
        emit(&ctx.events, SyncEvent::ConversationRemoved { conversation_id });
    }
    if !upserted.is_empty() {
        emit(&ctx.events, SyncEvent::ConversationsChanged);
    }
}

async fn apply_message_batch(ctx: &ListenerCtx, conversation_id: &ConversationId, batch: ChangeBatch) {
    let mut changed = false;

    {
        let db = ctx.store.lock().await;
        for event in batch.events {
            match event.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    let Some(doc) = event.doc else {
                        warn!(id = %event.id, "change event without document, skipping");
                        continue;
                    };
                    let remote: RemoteMessage = match decode_document(&doc) {
                        Ok(remote) => remote,
                        Err(e) => {
                            warn!(id = %event.id, error = %e, "skipping undecodable message record");
                            continue;
                        }
                    };
                    let id = remote.id.clone();
                    match merge_remote_message(&db, remote) {
                        Ok(()) => changed = true,
                        Err(e) => warn!(id = %id, error = %e, "message upsert failed"),
                    }
                }
                ChangeKind::Removed => {
                    let id = MessageId::new(event.id);
                    match db.delete_message(&id) {
                        Ok(true) => changed = true,
                        Ok(false) => {}
                        Err(e) => warn!(id = %id, error = %e, "message delete failed"),
                    }
                }
            }
        }
    }

    if changed {
        emit(
            &ctx.events,
            SyncEvent::MessagesChanged {
                conversation_id: conversation_id.clone(),
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Merge rules
// ---------------------------------------------------------------------------

fn remote_summary(remote: &RemoteConversation) -> Option<LastMessage> {
    match (
        remote.last_message_id.clone(),
        remote.last_message_preview.clone(),
        remote.last_message_timestamp,
    ) {
        (Some(id), Some(preview), Some(timestamp)) => Some(LastMessage {
            id,
            preview,
            timestamp,
        }),
        _ => None,
    }
}

/// Upsert one remote conversation record.
///
/// When the record already exists locally, only remote-owned fields are
/// overwritten: title, participants, last-message summary, the current
/// user's unread entry, and the current user's hidden membership.  The
/// coordinator never interprets other participants' unread entries.
fn merge_remote_conversation(
    db: &Database,
    me: &UserId,
    remote: RemoteConversation,
) -> std::result::Result<bool, StoreError> {
    match db.get_conversation(&remote.id) {
        Ok(mut local) => {
            local.title = remote.title.clone();
            local.participants = remote.participants.clone();
            local.last_message = remote_summary(&remote);
            match remote.unread_counts.get(me).copied() {
                Some(count) if count > 0 => {
                    local.unread_counts.insert(me.clone(), count);
                }
                _ => {
                    local.unread_counts.remove(me);
                }
            }
            if remote.hidden_for_user_ids.contains(me) {
                local.hidden_for.insert(me.clone());
            } else {
                local.hidden_for.remove(me);
            }
            db.upsert_conversation(&local)?;
            Ok(false)
        }
        Err(StoreError::NotFound) => {
            db.upsert_conversation(&Conversation::from(remote))?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

/// Message statuses ordered by delivery progress; the retry loop's
/// `Sending`/`Failed` pair sits below everything confirmed.
fn status_rank(status: MessageStatus) -> u8 {
    match status {
        MessageStatus::Sending | MessageStatus::Failed => 0,
        MessageStatus::Sent => 1,
        MessageStatus::Delivered => 2,
        MessageStatus::Read => 3,
    }
}

/// Upsert one remote message record.
///
/// A record arriving for a pending optimistic write (same id, still
/// `local_only`) is its confirmation: retry metadata clears and the
/// message stops being local-only.  Status never regresses below what the
/// local replica already reached.
fn merge_remote_message(db: &Database, remote: RemoteMessage) -> std::result::Result<(), StoreError> {
    match db.get_message(&remote.id) {
        Ok(local) => {
            let mut merged = Message::from_remote(remote);
            if local.local_only {
                debug!(id = %merged.id, "optimistic write confirmed by remote");
            }
            if status_rank(merged.status) < status_rank(local.status) {
                merged.status = local.status;
            }
            db.upsert_message(&merged)
        }
        Err(StoreError::NotFound) => db.upsert_message(&Message::from_remote(remote)),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Full-snapshot application
// ---------------------------------------------------------------------------

struct SnapshotOutcome {
    changed: bool,
    removed: Vec<ConversationId>,
}

/// Reconcile the complete remote conversation set: upsert every record in
/// the snapshot, then delete local conversations absent from it.
///
/// A record that fails to decode is skipped but still counts as present
/// remotely (when its id is readable), so a malformed record never
/// tombstones its local copy.
fn apply_conversation_snapshot(
    db: &mut Database,
    me: &UserId,
    docs: &[serde_json::Value],
) -> std::result::Result<SnapshotOutcome, StoreError> {
    let mut retained: HashSet<String> = HashSet::new();
    let mut changed = false;

    for doc in docs {
        if let Some(id) = doc.get("id").and_then(serde_json::Value::as_str) {
            retained.insert(id.to_string());
        }
        let remote: RemoteConversation = match decode_document(doc) {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "skipping undecodable conversation record in snapshot");
                continue;
            }
        };
        merge_remote_conversation(db, me, remote)?;
        changed = true;
    }

    let mut removed = Vec::new();
    for local_id in db.conversation_ids()? {
        if !retained.contains(local_id.as_str()) {
            if db.delete_conversation(&local_id)? {
                removed.push(local_id);
            }
        }
    }
    changed |= !removed.is_empty();

    Ok(SnapshotOutcome { changed, removed })
}

/// Reconcile one conversation's complete remote message set.
fn apply_message_snapshot(
    db: &mut Database,
    conversation_id: &ConversationId,
    docs: &[serde_json::Value],
) -> std::result::Result<bool, StoreError> {
    let mut retained: HashSet<String> = HashSet::new();
    let mut changed = false;

    for doc in docs {
        if let Some(id) = doc.get("id").and_then(serde_json::Value::as_str) {
            retained.insert(id.to_string());
        }
        let remote: RemoteMessage = match decode_document(doc) {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "skipping undecodable message record in snapshot");
                continue;
            }
        };
        merge_remote_message(db, remote)?;
        changed = true;
    }

    // Pending optimistic writes have no remote counterpart yet; absence
    // from the snapshot must not delete them.
    for local_id in db.message_ids_for_conversation(conversation_id)? {
        if retained.contains(local_id.as_str()) {
            continue;
        }
        let message = db.get_message(&local_id)?;
        if message.local_only {
            continue;
        }
        if db.delete_message(&local_id)? {
            changed = true;
        }
    }

    Ok(changed)
}
