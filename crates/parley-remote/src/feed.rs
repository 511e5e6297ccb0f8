//! Change-feed plumbing shared by every [`RemoteStore`] implementation.
//!
//! [`RemoteStore`]: crate::RemoteStore

use tokio::sync::mpsc;

/// How a document changed within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One document change.  `doc` carries the raw JSON document for
/// `Added`/`Modified` and is `None` for `Removed`.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Remote document id.
    pub id: String,
    pub doc: Option<serde_json::Value>,
}

impl ChangeEvent {
    pub fn added(id: impl Into<String>, doc: serde_json::Value) -> Self {
        Self {
            kind: ChangeKind::Added,
            id: id.into(),
            doc: Some(doc),
        }
    }

    pub fn modified(id: impl Into<String>, doc: serde_json::Value) -> Self {
        Self {
            kind: ChangeKind::Modified,
            id: id.into(),
            doc: Some(doc),
        }
    }

    pub fn removed(id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Removed,
            id: id.into(),
            doc: None,
        }
    }
}

/// A group of changes delivered together.  Events within one batch are in
/// delivery order; order across batches is the feed's order.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub events: Vec<ChangeEvent>,
}

impl ChangeBatch {
    pub fn single(event: ChangeEvent) -> Self {
        Self {
            events: vec![event],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// A live change feed.  Dropping the subscription tears the feed down on
/// the backend side.
pub struct Subscription {
    rx: mpsc::Receiver<ChangeBatch>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<ChangeBatch>) -> Self {
        Self { rx }
    }

    /// Receive the next batch, or `None` once the feed has closed.
    pub async fn next_batch(&mut self) -> Option<ChangeBatch> {
        self.rx.recv().await
    }
}
