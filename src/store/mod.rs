// ABOUTME: Store abstraction shared by the document, relational and in-memory backends
// ABOUTME: Upsert by unique key, delete, keyset paging and live change feeds

pub mod document;
pub mod memory;
pub mod relational;

use async_trait::async_trait;
use serde_json::Value;
use sync_queue::StoreSide;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::SyncResult;
use crate::provenance::Envelope;

pub use document::DocumentStore;
pub use memory::{Fault, MemoryStore};
pub use relational::RelationalStore;

/// Buffered change events per feed before the producer waits on the consumer.
pub(crate) const FEED_BUFFER: usize = 256;

/// Where an entity type lives inside one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreTarget<'a> {
    /// Collection (store A) or table (store B).
    pub name: &'a str,
    pub key_field: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// A raw change read from a store's feed.
///
/// `envelope` is the post-image for inserts and updates. Deletes carry none.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub kind: ChangeKind,
    pub id: String,
    pub envelope: Option<Envelope>,
}

/// A change as delivered to application callbacks, with provenance stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChangeEvent {
    pub source: StoreSide,
    pub kind: ChangeKind,
    pub entity_type: String,
    pub id: String,
    pub payload: Option<Value>,
}

/// Live change stream of one collection or table.
///
/// Dropping the feed stops the task that produces it.
pub struct ChangeFeed {
    events: mpsc::Receiver<StoreChange>,
    producer: Option<JoinHandle<()>>,
}

impl ChangeFeed {
    pub fn new(events: mpsc::Receiver<StoreChange>, producer: JoinHandle<()>) -> Self {
        Self {
            events,
            producer: Some(producer),
        }
    }

    /// Next change, or `None` once the underlying stream has ended.
    pub async fn next(&mut self) -> Option<StoreChange> {
        self.events.recv().await
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

/// Aborts the wrapped task when dropped.
pub(crate) struct AbortOnDrop(pub JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One of the two replicated stores.
///
/// Every operation is addressed by the unique key value of the entity, never by
/// a store-internal identifier. Upserts must be idempotent: writing the same
/// envelope twice leaves one row or document.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn side(&self) -> StoreSide;

    /// Cheap reachability check.
    async fn ping(&self) -> SyncResult<()>;

    async fn get(&self, target: StoreTarget<'_>, id: &str) -> SyncResult<Option<Envelope>>;

    async fn upsert(&self, target: StoreTarget<'_>, id: &str, envelope: &Envelope)
        -> SyncResult<()>;

    /// Returns whether a row or document was removed.
    async fn delete(&self, target: StoreTarget<'_>, id: &str) -> SyncResult<bool>;

    /// Up to `limit` entries ordered by key, starting strictly after `after`.
    async fn fetch_page(
        &self,
        target: StoreTarget<'_>,
        after: Option<&str>,
        limit: usize,
    ) -> SyncResult<Vec<(String, Envelope)>>;

    /// Open a live feed. Changes made after this returns are delivered.
    async fn subscribe(&self, target: StoreTarget<'_>) -> SyncResult<ChangeFeed>;
}
