//! In-process [`RemoteStore`] backed by plain maps.
//!
//! Serves two purposes: the standing fake for the engine's test suites,
//! and a zero-infrastructure backend for local development.  Change feeds
//! are fanned out over bounded mpsc channels; a subscription first
//! receives the current matching set as `Added` events, then live deltas.
//!
//! Test hooks (`push_*`, `remove_*`, fail injection, write counters) live
//! directly on the type; they simulate what a real backend would do on
//! behalf of other devices.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use parley_shared::constants::FEED_BUFFER;
use parley_shared::protocol::{ReadReceiptBatch, RemoteConversation, RemoteMessage, RemotePresence, RemoteTyping};
use parley_shared::{ConversationId, UserId};

use crate::api::RemoteStore;
use crate::error::{RemoteError, Result};
use crate::feed::{ChangeBatch, ChangeEvent, Subscription};

/// One recorded `set_typing` call, for assertions on write chatter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingWrite {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub typing: bool,
}

#[derive(Default)]
struct State {
    conversations: HashMap<String, Value>,
    /// conversation id -> message id -> document
    messages: HashMap<String, HashMap<String, Value>>,
    presence: HashMap<String, Value>,
    typing: HashMap<String, BTreeSet<UserId>>,

    conversation_watchers: Vec<(UserId, mpsc::Sender<ChangeBatch>)>,
    message_watchers: HashMap<String, Vec<mpsc::Sender<ChangeBatch>>>,
    typing_watchers: HashMap<String, Vec<mpsc::Sender<ChangeBatch>>>,
    presence_watchers: HashMap<String, Vec<mpsc::Sender<ChangeBatch>>>,

    fail_puts: u32,
    fail_receipt_commits: u32,
    put_attempts: u32,
    typing_writes: Vec<TypingWrite>,
    receipt_commits: Vec<ReadReceiptBatch>,
}

/// In-memory remote store.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Test hooks: remote-side mutations
    // ------------------------------------------------------------------

    /// Insert or overwrite a conversation document and fan it out.
    pub fn push_conversation(&self, conversation: &RemoteConversation) {
        let doc = serde_json::to_value(conversation).expect("conversation serializes");
        self.push_conversation_doc(conversation.id.as_str(), doc);
    }

    /// Raw-document variant, for injecting malformed records.
    pub fn push_conversation_doc(&self, id: &str, doc: Value) {
        let mut state = self.state.lock().expect("remote state lock");
        let existed = state.conversations.insert(id.to_string(), doc.clone()).is_some();
        let event = if existed {
            ChangeEvent::modified(id, doc.clone())
        } else {
            ChangeEvent::added(id, doc.clone())
        };
        fanout_conversations(&mut state.conversation_watchers, &doc, event);
    }

    /// Delete a conversation document and fan out the removal.
    pub fn remove_conversation(&self, id: &ConversationId) {
        let mut state = self.state.lock().expect("remote state lock");
        if let Some(doc) = state.conversations.remove(id.as_str()) {
            fanout_conversations(
                &mut state.conversation_watchers,
                &doc,
                ChangeEvent::removed(id.as_str()),
            );
        }
    }

    /// Insert or overwrite a message document and fan it out.
    pub fn push_message(&self, message: &RemoteMessage) {
        let doc = serde_json::to_value(message).expect("message serializes");
        self.push_message_doc(message.conversation_id.as_str(), message.id.as_str(), doc);
    }

    /// Raw-document variant, for injecting malformed records.
    pub fn push_message_doc(&self, conversation_id: &str, id: &str, doc: Value) {
        let mut state = self.state.lock().expect("remote state lock");
        let existed = state
            .messages
            .entry(conversation_id.to_string())
            .or_default()
            .insert(id.to_string(), doc.clone())
            .is_some();
        let event = if existed {
            ChangeEvent::modified(id, doc)
        } else {
            ChangeEvent::added(id, doc)
        };
        if let Some(watchers) = state.message_watchers.get_mut(conversation_id) {
            fanout(watchers, ChangeBatch::single(event));
        }
    }

    /// Delete a message document and fan out the removal.
    pub fn remove_message(&self, conversation_id: &ConversationId, id: &parley_shared::MessageId) {
        let mut state = self.state.lock().expect("remote state lock");
        let removed = state
            .messages
            .get_mut(conversation_id.as_str())
            .map(|msgs| msgs.remove(id.as_str()).is_some())
            .unwrap_or(false);
        if removed {
            if let Some(watchers) = state.message_watchers.get_mut(conversation_id.as_str()) {
                fanout(watchers, ChangeBatch::single(ChangeEvent::removed(id.as_str())));
            }
        }
    }

    /// Delete a conversation document without fanning out a `Removed`
    /// event, simulating a removal the live listener missed (e.g. while
    /// the device was offline).  Only a full-snapshot refresh will notice.
    pub fn silently_remove_conversation(&self, id: &ConversationId) {
        let mut state = self.state.lock().expect("remote state lock");
        state.conversations.remove(id.as_str());
        state.messages.remove(id.as_str());
    }

    /// Message-level variant of [`silently_remove_conversation`].
    ///
    /// [`silently_remove_conversation`]: MemoryRemote::silently_remove_conversation
    pub fn silently_remove_message(
        &self,
        conversation_id: &ConversationId,
        id: &parley_shared::MessageId,
    ) {
        let mut state = self.state.lock().expect("remote state lock");
        if let Some(messages) = state.messages.get_mut(conversation_id.as_str()) {
            messages.remove(id.as_str());
        }
    }

    /// Overwrite a presence record and fan it out.
    pub fn set_presence(&self, presence: &RemotePresence) {
        let doc = serde_json::to_value(presence).expect("presence serializes");
        let mut state = self.state.lock().expect("remote state lock");
        state
            .presence
            .insert(presence.user_id.as_str().to_string(), doc.clone());
        if let Some(watchers) = state.presence_watchers.get_mut(presence.user_id.as_str()) {
            fanout(
                watchers,
                ChangeBatch::single(ChangeEvent::modified(presence.user_id.as_str(), doc)),
            );
        }
    }

    // ------------------------------------------------------------------
    // Test hooks: fault injection and counters
    // ------------------------------------------------------------------

    /// Make the next `n` `put_message` calls fail with `Unavailable`.
    pub fn fail_next_puts(&self, n: u32) {
        self.state.lock().expect("remote state lock").fail_puts = n;
    }

    /// Make the next `n` `commit_read_receipts` calls fail.
    pub fn fail_next_receipt_commits(&self, n: u32) {
        self.state
            .lock()
            .expect("remote state lock")
            .fail_receipt_commits = n;
    }

    /// Total `put_message` attempts, including failed ones.
    pub fn put_attempts(&self) -> u32 {
        self.state.lock().expect("remote state lock").put_attempts
    }

    /// Every `set_typing` call seen so far, in order.
    pub fn typing_writes(&self) -> Vec<TypingWrite> {
        self.state
            .lock()
            .expect("remote state lock")
            .typing_writes
            .clone()
    }

    /// Every committed read-receipt batch, in order.
    pub fn receipt_commits(&self) -> Vec<ReadReceiptBatch> {
        self.state
            .lock()
            .expect("remote state lock")
            .receipt_commits
            .clone()
    }

    /// Live (non-closed) presence subscriptions for one user.
    pub fn presence_watcher_count(&self, user_id: &UserId) -> usize {
        let mut state = self.state.lock().expect("remote state lock");
        state
            .presence_watchers
            .get_mut(user_id.as_str())
            .map(|watchers| {
                watchers.retain(|tx| !tx.is_closed());
                watchers.len()
            })
            .unwrap_or(0)
    }

    /// The stored message document, if any.
    pub fn message_doc(&self, conversation_id: &ConversationId, id: &parley_shared::MessageId) -> Option<Value> {
        self.state
            .lock()
            .expect("remote state lock")
            .messages
            .get(conversation_id.as_str())
            .and_then(|msgs| msgs.get(id.as_str()))
            .cloned()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn watch_conversations(&self, user_id: &UserId) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let mut state = self.state.lock().expect("remote state lock");

        let initial: Vec<ChangeEvent> = state
            .conversations
            .iter()
            .filter(|(_, doc)| matches_participant(doc, user_id))
            .map(|(id, doc)| ChangeEvent::added(id.clone(), doc.clone()))
            .collect();
        if !initial.is_empty() {
            let _ = tx.try_send(ChangeBatch { events: initial });
        }

        state.conversation_watchers.push((user_id.clone(), tx));
        Ok(Subscription::new(rx))
    }

    async fn fetch_conversations(&self, user_id: &UserId) -> Result<Vec<Value>> {
        let state = self.state.lock().expect("remote state lock");
        Ok(state
            .conversations
            .values()
            .filter(|doc| matches_participant(doc, user_id))
            .cloned()
            .collect())
    }

    async fn watch_messages(&self, conversation_id: &ConversationId) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let mut state = self.state.lock().expect("remote state lock");

        if let Some(messages) = state.messages.get(conversation_id.as_str()) {
            let initial: Vec<ChangeEvent> = messages
                .iter()
                .map(|(id, doc)| ChangeEvent::added(id.clone(), doc.clone()))
                .collect();
            if !initial.is_empty() {
                let _ = tx.try_send(ChangeBatch { events: initial });
            }
        }

        state
            .message_watchers
            .entry(conversation_id.as_str().to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }

    async fn fetch_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Value>> {
        let state = self.state.lock().expect("remote state lock");
        Ok(state
            .messages
            .get(conversation_id.as_str())
            .map(|msgs| msgs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put_message(&self, message: &RemoteMessage) -> Result<()> {
        {
            let mut state = self.state.lock().expect("remote state lock");
            state.put_attempts += 1;
            if state.fail_puts > 0 {
                state.fail_puts -= 1;
                return Err(RemoteError::Unavailable("injected put failure".into()));
            }
        }
        self.push_message(message);
        Ok(())
    }

    async fn commit_read_receipts(&self, batch: &ReadReceiptBatch) -> Result<()> {
        let mut state = self.state.lock().expect("remote state lock");
        if state.fail_receipt_commits > 0 {
            state.fail_receipt_commits -= 1;
            return Err(RemoteError::Unavailable("injected receipt failure".into()));
        }

        let conversation_key = batch.conversation_id.as_str().to_string();
        let read_at = serde_json::to_value(batch.read_at).expect("timestamp serializes");

        // Stamp every targeted message.
        let mut message_events = Vec::new();
        if let Some(messages) = state.messages.get_mut(&conversation_key) {
            for id in &batch.message_ids {
                if let Some(doc) = messages.get_mut(id.as_str()) {
                    stamp_reader(doc, &batch.reader_id, &read_at);
                    message_events.push(ChangeEvent::modified(id.as_str(), doc.clone()));
                }
            }
        }

        // Zero the reader's unread counter on the conversation, same
        // logical write.
        let mut conversation_update = None;
        if let Some(doc) = state.conversations.get_mut(&conversation_key) {
            if let Some(counts) = doc
                .get_mut("unreadCounts")
                .and_then(Value::as_object_mut)
            {
                counts.insert(batch.reader_id.as_str().to_string(), Value::from(0u32));
            }
            conversation_update = Some(doc.clone());
        }

        state.receipt_commits.push(batch.clone());

        if !message_events.is_empty() {
            if let Some(watchers) = state.message_watchers.get_mut(&conversation_key) {
                fanout(watchers, ChangeBatch { events: message_events });
            }
        }
        if let Some(doc) = conversation_update {
            let event = ChangeEvent::modified(conversation_key, doc.clone());
            fanout_conversations(&mut state.conversation_watchers, &doc, event);
        }
        Ok(())
    }

    async fn set_typing(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        typing: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("remote state lock");
        state.typing_writes.push(TypingWrite {
            conversation_id: conversation_id.clone(),
            user_id: user_id.clone(),
            typing,
        });

        let users = state
            .typing
            .entry(conversation_id.as_str().to_string())
            .or_default();
        if typing {
            users.insert(user_id.clone());
        } else {
            users.remove(user_id);
        }

        let doc = serde_json::to_value(RemoteTyping {
            users: users.clone(),
        })
        .expect("typing doc serializes");
        if let Some(watchers) = state.typing_watchers.get_mut(conversation_id.as_str()) {
            fanout(
                watchers,
                ChangeBatch::single(ChangeEvent::modified(conversation_id.as_str(), doc)),
            );
        }
        Ok(())
    }

    async fn watch_typing(&self, conversation_id: &ConversationId) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let mut state = self.state.lock().expect("remote state lock");

        if let Some(users) = state.typing.get(conversation_id.as_str()) {
            let doc = serde_json::to_value(RemoteTyping {
                users: users.clone(),
            })
            .expect("typing doc serializes");
            let _ = tx.try_send(ChangeBatch::single(ChangeEvent::added(
                conversation_id.as_str(),
                doc,
            )));
        }

        state
            .typing_watchers
            .entry(conversation_id.as_str().to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }

    async fn watch_presence(&self, user_id: &UserId) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let mut state = self.state.lock().expect("remote state lock");

        if let Some(doc) = state.presence.get(user_id.as_str()) {
            let _ = tx.try_send(ChangeBatch::single(ChangeEvent::added(
                user_id.as_str(),
                doc.clone(),
            )));
        }

        state
            .presence_watchers
            .entry(user_id.as_str().to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Whether a conversation document's participant list contains the user.
/// Documents without a readable participant list are delivered to every
/// watcher; the engine is the one that skips malformed records.
fn matches_participant(doc: &Value, user_id: &UserId) -> bool {
    match doc.get("participants").and_then(Value::as_array) {
        Some(participants) => participants
            .iter()
            .any(|p| p.as_str() == Some(user_id.as_str())),
        None => true,
    }
}

fn stamp_reader(doc: &mut Value, reader: &UserId, read_at: &Value) {
    if let Some(read_by) = doc.get_mut("readBy").and_then(Value::as_array_mut) {
        if !read_by.iter().any(|r| r.as_str() == Some(reader.as_str())) {
            read_by.push(Value::from(reader.as_str()));
        }
    } else if let Some(obj) = doc.as_object_mut() {
        obj.insert(
            "readBy".to_string(),
            Value::Array(vec![Value::from(reader.as_str())]),
        );
    }

    if let Some(obj) = doc.as_object_mut() {
        let read_map = obj
            .entry("readAt")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(map) = read_map.as_object_mut() {
            map.insert(reader.as_str().to_string(), read_at.clone());
        }
        obj.insert("status".to_string(), Value::from("read"));
    }
}

/// Deliver a batch to every live watcher, pruning closed ones.
fn fanout(watchers: &mut Vec<mpsc::Sender<ChangeBatch>>, batch: ChangeBatch) {
    watchers.retain(|tx| !tx.is_closed());
    for tx in watchers.iter() {
        if tx.try_send(batch.clone()).is_err() {
            tracing::warn!("change-feed watcher buffer full, dropping batch");
        }
    }
}

fn fanout_conversations(
    watchers: &mut Vec<(UserId, mpsc::Sender<ChangeBatch>)>,
    doc: &Value,
    event: ChangeEvent,
) {
    watchers.retain(|(_, tx)| !tx.is_closed());
    for (user_id, tx) in watchers.iter() {
        if !matches_participant(doc, user_id) {
            continue;
        }
        if tx.try_send(ChangeBatch::single(event.clone())).is_err() {
            tracing::warn!(user = %user_id, "conversation feed buffer full, dropping batch");
        }
    }
}
