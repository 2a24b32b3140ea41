//! Backing-store seam.
//!
//! [`DocumentStore`] captures what the engine requires from a document
//! database: single-document reads, predicate queries, atomic conditional
//! updates with set-on-insert upserts, deletes, and a change feed. The
//! engine is generic over implementations; [`MemoryStore`] ships in-repo
//! for tests and store-less embedders.

mod memory;

pub use self::memory::MemoryStore;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vellum_core::document::Document;
use vellum_core::event::{ChangeEvent, OperationType};
use vellum_core::update::UpdateDocument;

/// Result counts of a conditional [`DocumentStore::update_one`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateCounts {
    /// Documents matched by the filter.
    pub matched: u64,
    /// Documents actually modified.
    pub modified: u64,
}

/// Result of a [`DocumentStore::find_one_and_upsert`].
#[derive(Debug, Clone)]
pub struct Upserted<D> {
    /// The stored document: the existing one unchanged, or the inserted
    /// one with its initial version.
    pub document: D,
    /// Whether an insert happened.
    pub created: bool,
}

/// A read query.
#[derive(Clone)]
pub enum Query<D: Document> {
    /// Every document.
    All,
    /// Documents with any of the given ids.
    Ids(Vec<D::Id>),
    /// Documents satisfying an arbitrary predicate.
    Predicate(Arc<dyn Fn(&D) -> bool + Send + Sync>),
}

impl<D: Document> Query<D> {
    /// Evaluates the query against one document.
    #[must_use]
    pub fn matches(&self, document: &D) -> bool {
        match self {
            Self::All => true,
            Self::Ids(ids) => ids.contains(&document.id()),
            Self::Predicate(predicate) => predicate(document),
        }
    }
}

impl<D: Document> fmt::Debug for Query<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("Query::All"),
            Self::Ids(ids) => write!(f, "Query::Ids(len={})", ids.len()),
            Self::Predicate(_) => f.write_str("Query::Predicate"),
        }
    }
}

/// Server-side change-feed filter.
///
/// `id_batches` carries the filtered document keys: a single batch is the
/// document-specific form, several batches express the same set as a
/// disjunction (sidestepping the server's filter-document size cap), and
/// `None` filters by operation type only (collection-level).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeFilter {
    /// Operation-type whitelist. Empty = every operation.
    pub operations: Vec<OperationType>,
    /// Optional id filter, expressed in batches.
    pub id_batches: Option<Vec<Vec<Value>>>,
}

impl ChangeFilter {
    /// A filter passing every event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// A filter for the given operations on every document.
    #[must_use]
    pub fn operations(operations: Vec<OperationType>) -> Self {
        Self {
            operations,
            id_batches: None,
        }
    }

    /// Evaluates the filter against one raw event.
    #[must_use]
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if !self.operations.is_empty() && !self.operations.contains(&event.operation) {
            return false;
        }
        match &self.id_batches {
            None => true,
            Some(batches) => batches.iter().any(|batch| batch.contains(&event.id)),
        }
    }
}

/// Options for opening a change feed.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Whether events carry the post-image of the document.
    pub full_document_lookup: bool,
    /// Maximum time the feed may hold a poll open, in milliseconds.
    pub max_await_time_ms: u64,
    /// Feed batch size; also sizes the handle's delivery buffer.
    pub batch_size: u32,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            full_document_lookup: true,
            max_await_time_ms: 1_000,
            batch_size: 100,
        }
    }
}

/// A live change stream.
///
/// Yields raw [`ChangeEvent`]s until closed; a stream-level error is
/// surfaced in-band so consumers can reopen. Dropping the handle closes
/// the stream.
pub struct ChangeStreamHandle {
    receiver: mpsc::Receiver<anyhow::Result<ChangeEvent>>,
    token: CancellationToken,
}

impl ChangeStreamHandle {
    /// Wraps a delivery channel and the token cancelling its pump.
    #[must_use]
    pub fn new(
        receiver: mpsc::Receiver<anyhow::Result<ChangeEvent>>,
        token: CancellationToken,
    ) -> Self {
        Self { receiver, token }
    }

    /// Next event, stream error, or `None` once the stream has closed.
    pub async fn next(&mut self) -> Option<anyhow::Result<ChangeEvent>> {
        tokio::select! {
            () = self.token.cancelled() => None,
            item = self.receiver.recv() => item,
        }
    }

    /// Closes the stream. Idempotent.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Token observing (and controlling) this stream's lifetime.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for ChangeStreamHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// What the engine requires from a backing document database.
///
/// Implementations must provide per-document atomicity for the conditional
/// operations: the version predicate check and the update must be one
/// indivisible step. Backend failures are reported as opaque
/// `anyhow::Error`s; the engine maps them into its own taxonomy.
///
/// Used as `Arc<dyn DocumentStore<D>>`.
#[async_trait]
pub trait DocumentStore<D: Document>: Send + Sync {
    /// Reads one document by id.
    async fn find_one(&self, id: &D::Id) -> anyhow::Result<Option<D>>;

    /// Reads every document matching the query.
    async fn find_many(&self, query: Query<D>) -> anyhow::Result<Vec<D>>;

    /// Atomic find-or-insert with set-on-insert semantics: an existing
    /// document is returned unchanged; a new one is inserted with the
    /// initial version.
    async fn find_one_and_upsert(&self, document: &D) -> anyhow::Result<Upserted<D>>;

    /// Applies `update` to the document iff its stored version equals
    /// `expected_version`; returns the post-image, or `None` when nothing
    /// matched.
    async fn find_one_and_update(
        &self,
        id: &D::Id,
        expected_version: i64,
        update: &UpdateDocument,
    ) -> anyhow::Result<Option<D>>;

    /// Conditional update returning match/modify counts instead of the
    /// post-image.
    async fn update_one(
        &self,
        id: &D::Id,
        expected_version: i64,
        update: &UpdateDocument,
    ) -> anyhow::Result<UpdateCounts>;

    /// Deletes one document; returns whether it existed.
    async fn delete_one(&self, id: &D::Id) -> anyhow::Result<bool>;

    /// Opens a change feed filtered server-side by `filter`.
    async fn watch(
        &self,
        filter: &ChangeFilter,
        options: &WatchOptions,
    ) -> anyhow::Result<ChangeStreamHandle>;
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        id: String,
        version: i64,
    }

    impl Document for Doc {
        type Id = String;
        fn id(&self) -> String {
            self.id.clone()
        }
        fn version(&self) -> i64 {
            self.version
        }
        fn set_version(&mut self, version: i64) {
            self.version = version;
        }
    }

    fn event(operation: OperationType, id: &str) -> ChangeEvent {
        ChangeEvent {
            operation,
            id: json!(id),
            full_document: None,
        }
    }

    #[test]
    fn query_all_ids_and_predicate() {
        let doc = Doc {
            id: "a".to_string(),
            version: 1,
        };
        assert!(Query::All.matches(&doc));
        assert!(Query::Ids(vec!["a".to_string()]).matches(&doc));
        assert!(!Query::Ids(vec!["b".to_string()]).matches(&doc));
        assert!(Query::<Doc>::Predicate(Arc::new(|d: &Doc| d.version > 0)).matches(&doc));
    }

    #[test]
    fn empty_filter_passes_everything() {
        let filter = ChangeFilter::all();
        assert!(filter.matches(&event(OperationType::Create, "a")));
        assert!(filter.matches(&event(OperationType::Delete, "b")));
    }

    #[test]
    fn operation_whitelist_filters() {
        let filter = ChangeFilter::operations(vec![OperationType::Update]);
        assert!(filter.matches(&event(OperationType::Update, "a")));
        assert!(!filter.matches(&event(OperationType::Delete, "a")));
    }

    #[test]
    fn id_batches_filter_as_a_disjunction() {
        let filter = ChangeFilter {
            operations: Vec::new(),
            id_batches: Some(vec![vec![json!("a")], vec![json!("b"), json!("c")]]),
        };
        assert!(filter.matches(&event(OperationType::Update, "a")));
        assert!(filter.matches(&event(OperationType::Update, "c")));
        assert!(!filter.matches(&event(OperationType::Update, "d")));
    }

    #[tokio::test]
    async fn change_stream_handle_closes_on_token() {
        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let mut handle = ChangeStreamHandle::new(rx, token.clone());

        tx.send(Ok(event(OperationType::Create, "a"))).await.unwrap();
        let first = handle.next().await.unwrap().unwrap();
        assert_eq!(first.id, json!("a"));

        handle.close();
        assert!(handle.next().await.is_none());
        assert!(token.is_cancelled());
    }

    /// Verifies `Arc<dyn DocumentStore<D>>` compiles (object safety).
    #[test]
    fn document_store_is_object_safe() {
        fn _assert_object_safe(_: &Arc<dyn DocumentStore<Doc>>) {}
    }
}
