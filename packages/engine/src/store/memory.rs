//! In-memory [`DocumentStore`] for tests and store-less embedders.
//!
//! Documents live in a [`DashMap`]; conditional updates run under the entry
//! guard, so the version predicate check and the descriptor application are
//! one indivisible step per document. Every mutation is published to a
//! broadcast feed from which watch handles filter server-side.

use anyhow::anyhow;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use vellum_core::apply::apply_update;
use vellum_core::document::{Document, VERSION_INITIAL};
use vellum_core::event::{ChangeEvent, OperationType};
use vellum_core::update::UpdateDocument;

use async_trait::async_trait;

use super::{
    ChangeFilter, ChangeStreamHandle, DocumentStore, Query, UpdateCounts, Upserted, WatchOptions,
};

/// Broadcast buffer between mutations and watch pumps. A slow pump sees a
/// lag error rather than blocking writers.
const FEED_CAPACITY: usize = 1_024;

/// In-memory document store with a broadcast-backed change feed.
pub struct MemoryStore<D: Document> {
    documents: DashMap<D::Id, D>,
    feed: broadcast::Sender<ChangeEvent>,
}

impl<D: Document> MemoryStore<D> {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            documents: DashMap::new(),
            feed,
        }
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// True when no documents are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Writes a document directly, bypassing version checks and the
    /// conditional-update path. Models an out-of-band writer (another
    /// process mutating the shared database) in tests.
    pub fn write_out_of_band(&self, document: D) -> anyhow::Result<()> {
        let event = ChangeEvent {
            operation: if self.documents.contains_key(&document.id()) {
                OperationType::Update
            } else {
                OperationType::Create
            },
            id: serde_json::to_value(document.id())?,
            full_document: Some(serde_json::to_value(&document)?),
        };
        self.documents.insert(document.id(), document);
        self.publish(event);
        Ok(())
    }

    fn publish(&self, event: ChangeEvent) {
        // No receivers is fine; the feed is best-effort by contract.
        let _ = self.feed.send(event);
    }

    fn event_for(
        operation: OperationType,
        id: &D::Id,
        document: Option<&D>,
    ) -> anyhow::Result<ChangeEvent> {
        Ok(ChangeEvent {
            operation,
            id: serde_json::to_value(id)?,
            full_document: document.map(serde_json::to_value).transpose()?,
        })
    }
}

impl<D: Document> Default for MemoryStore<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<D: Document> DocumentStore<D> for MemoryStore<D> {
    async fn find_one(&self, id: &D::Id) -> anyhow::Result<Option<D>> {
        Ok(self.documents.get(id).map(|entry| entry.value().clone()))
    }

    async fn find_many(&self, query: Query<D>) -> anyhow::Result<Vec<D>> {
        let mut results: Vec<D> = self
            .documents
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        results.sort_by(|a, b| a.id().cmp(&b.id()));
        Ok(results)
    }

    async fn find_one_and_upsert(&self, document: &D) -> anyhow::Result<Upserted<D>> {
        let (upserted, event) = match self.documents.entry(document.id()) {
            Entry::Occupied(occupied) => (
                Upserted {
                    document: occupied.get().clone(),
                    created: false,
                },
                None,
            ),
            Entry::Vacant(vacant) => {
                let mut fresh = document.clone();
                fresh.set_version(VERSION_INITIAL);
                vacant.insert(fresh.clone());
                let event =
                    Self::event_for(OperationType::Create, &fresh.id(), Some(&fresh))?;
                (
                    Upserted {
                        document: fresh,
                        created: true,
                    },
                    Some(event),
                )
            }
        };
        if let Some(event) = event {
            self.publish(event);
        }
        Ok(upserted)
    }

    async fn find_one_and_update(
        &self,
        id: &D::Id,
        expected_version: i64,
        update: &UpdateDocument,
    ) -> anyhow::Result<Option<D>> {
        let updated = match self.documents.entry(id.clone()) {
            Entry::Vacant(_) => return Ok(None),
            Entry::Occupied(mut occupied) => {
                if occupied.get().version() != expected_version {
                    return Ok(None);
                }
                let mut value = serde_json::to_value(occupied.get())?;
                apply_update(&mut value, update)
                    .map_err(|err| anyhow!("update application failed: {err}"))?;
                let replaced: D = serde_json::from_value(value)?;
                occupied.insert(replaced.clone());
                replaced
            }
        };

        let event = Self::event_for(OperationType::Update, id, Some(&updated))?;
        self.publish(event);
        Ok(Some(updated))
    }

    async fn update_one(
        &self,
        id: &D::Id,
        expected_version: i64,
        update: &UpdateDocument,
    ) -> anyhow::Result<UpdateCounts> {
        // A matched conditional update always rewrites the entry here, so
        // matched and modified coincide.
        match self.find_one_and_update(id, expected_version, update).await? {
            Some(_) => Ok(UpdateCounts {
                matched: 1,
                modified: 1,
            }),
            None => Ok(UpdateCounts {
                matched: 0,
                modified: 0,
            }),
        }
    }

    async fn delete_one(&self, id: &D::Id) -> anyhow::Result<bool> {
        let existed = self.documents.remove(id).is_some();
        if existed {
            let event = Self::event_for(OperationType::Delete, id, None)?;
            self.publish(event);
        }
        Ok(existed)
    }

    /// Opens a feed subscription. `max_await_time_ms` has no effect on the
    /// in-memory feed; `batch_size` sizes the delivery buffer.
    async fn watch(
        &self,
        filter: &ChangeFilter,
        options: &WatchOptions,
    ) -> anyhow::Result<ChangeStreamHandle> {
        let capacity = usize::try_from(options.batch_size.max(1)).unwrap_or(1);
        let (tx, rx) = mpsc::channel(capacity);
        let mut feed = self.feed.subscribe();
        let token = CancellationToken::new();
        let pump_token = token.clone();
        let filter = filter.clone();
        let lookup = options.full_document_lookup;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = pump_token.cancelled() => break,
                    received = feed.recv() => match received {
                        Ok(mut event) => {
                            if !filter.matches(&event) {
                                continue;
                            }
                            if !lookup {
                                event.full_document = None;
                            }
                            if tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            let report =
                                tx.send(Err(anyhow!("change feed lagged by {skipped} events")));
                            if report.await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(ChangeStreamHandle::new(rx, token))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        id: String,
        value: i64,
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

    fn doc(id: &str, value: i64, version: i64) -> Doc {
        Doc {
            id: id.to_string(),
            value,
            version,
        }
    }

    fn bump(update: &mut UpdateDocument, value: i64, new_version: i64) {
        update.set("value", json!(value));
        update.set("version", json!(new_version));
    }

    #[tokio::test]
    async fn upsert_inserts_with_initial_version_then_passes_through() {
        let store: MemoryStore<Doc> = MemoryStore::new();

        let first = store.find_one_and_upsert(&doc("a", 42, 0)).await.unwrap();
        assert!(first.created);
        assert_eq!(first.document.version, 1);

        // Second upsert returns the existing document unchanged; the
        // caller's version field is ignored.
        let second = store.find_one_and_upsert(&doc("a", 99, 7)).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.document, first.document);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn find_one_returns_clone_or_none() {
        let store: MemoryStore<Doc> = MemoryStore::new();
        store.find_one_and_upsert(&doc("a", 1, 0)).await.unwrap();

        assert_eq!(
            store.find_one(&"a".to_string()).await.unwrap().unwrap().value,
            1
        );
        assert!(store.find_one(&"ghost".to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_many_filters_and_sorts_by_id() {
        let store: MemoryStore<Doc> = MemoryStore::new();
        for (id, value) in [("c", 3), ("a", 1), ("b", 2)] {
            store.find_one_and_upsert(&doc(id, value, 0)).await.unwrap();
        }

        let all = store.find_many(Query::All).await.unwrap();
        assert_eq!(
            all.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );

        let some = store
            .find_many(Query::Predicate(std::sync::Arc::new(|d: &Doc| d.value >= 2)))
            .await
            .unwrap();
        assert_eq!(some.len(), 2);

        let by_id = store
            .find_many(Query::Ids(vec!["b".to_string()]))
            .await
            .unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].id, "b");
    }

    #[tokio::test]
    async fn conditional_update_applies_only_on_version_match() {
        let store: MemoryStore<Doc> = MemoryStore::new();
        store.find_one_and_upsert(&doc("a", 1, 0)).await.unwrap();

        let mut update = UpdateDocument::new();
        bump(&mut update, 2, 2);
        let updated = store
            .find_one_and_update(&"a".to_string(), 1, &update)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.value, 2);
        assert_eq!(updated.version, 2);

        // Stale expected version matches nothing.
        let stale = store
            .find_one_and_update(&"a".to_string(), 1, &update)
            .await
            .unwrap();
        assert!(stale.is_none());

        // Missing document matches nothing.
        let missing = store
            .find_one_and_update(&"ghost".to_string(), 1, &update)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn update_one_reports_counts() {
        let store: MemoryStore<Doc> = MemoryStore::new();
        store.find_one_and_upsert(&doc("a", 1, 0)).await.unwrap();

        let mut update = UpdateDocument::new();
        bump(&mut update, 5, 2);

        let hit = store.update_one(&"a".to_string(), 1, &update).await.unwrap();
        assert_eq!(hit, UpdateCounts { matched: 1, modified: 1 });

        let miss = store.update_one(&"a".to_string(), 1, &update).await.unwrap();
        assert_eq!(miss, UpdateCounts { matched: 0, modified: 0 });
    }

    #[tokio::test]
    async fn concurrent_conditional_updates_admit_exactly_one_winner() {
        let store = std::sync::Arc::new(MemoryStore::<Doc>::new());
        store.find_one_and_upsert(&doc("a", 0, 0)).await.unwrap();

        let mut update = UpdateDocument::new();
        bump(&mut update, 1, 2);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = std::sync::Arc::clone(&store);
            let update = update.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .find_one_and_update(&"a".to_string(), 1, &update)
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "the conditional update is linearizable");
        assert_eq!(
            store.find_one(&"a".to_string()).await.unwrap().unwrap().version,
            2
        );
    }

    #[tokio::test]
    async fn delete_one_reports_existence_and_tolerates_absence() {
        let store: MemoryStore<Doc> = MemoryStore::new();
        store.find_one_and_upsert(&doc("a", 1, 0)).await.unwrap();

        assert!(store.delete_one(&"a".to_string()).await.unwrap());
        assert!(!store.delete_one(&"a".to_string()).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn watch_delivers_matching_events_in_order() {
        let store: MemoryStore<Doc> = MemoryStore::new();
        let mut stream = store
            .watch(&ChangeFilter::all(), &WatchOptions::default())
            .await
            .unwrap();

        store.find_one_and_upsert(&doc("a", 1, 0)).await.unwrap();
        let mut update = UpdateDocument::new();
        bump(&mut update, 2, 2);
        store
            .find_one_and_update(&"a".to_string(), 1, &update)
            .await
            .unwrap();
        store.delete_one(&"a".to_string()).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.operation, OperationType::Create);
        assert!(first.full_document.is_some());

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.operation, OperationType::Update);
        assert_eq!(
            second.full_document.as_ref().unwrap().get("value"),
            Some(&json!(2))
        );

        let third = stream.next().await.unwrap().unwrap();
        assert_eq!(third.operation, OperationType::Delete);
        assert!(third.full_document.is_none());
    }

    #[tokio::test]
    async fn watch_filters_by_id_batches_and_operations() {
        let store: MemoryStore<Doc> = MemoryStore::new();
        let filter = ChangeFilter {
            operations: vec![OperationType::Create],
            id_batches: Some(vec![vec![json!("a")]]),
        };
        let mut stream = store.watch(&filter, &WatchOptions::default()).await.unwrap();

        store.find_one_and_upsert(&doc("b", 1, 0)).await.unwrap();
        store.find_one_and_upsert(&doc("a", 1, 0)).await.unwrap();
        store.delete_one(&"a".to_string()).await.unwrap();

        let only = stream.next().await.unwrap().unwrap();
        assert_eq!(only.operation, OperationType::Create);
        assert_eq!(only.id, json!("a"));
    }

    #[tokio::test]
    async fn watch_without_lookup_strips_full_documents() {
        let store: MemoryStore<Doc> = MemoryStore::new();
        let options = WatchOptions {
            full_document_lookup: false,
            ..WatchOptions::default()
        };
        let mut stream = store.watch(&ChangeFilter::all(), &options).await.unwrap();

        store.find_one_and_upsert(&doc("a", 1, 0)).await.unwrap();
        let event = stream.next().await.unwrap().unwrap();
        assert!(event.full_document.is_none());
    }

    #[tokio::test]
    async fn closed_stream_yields_none() {
        let store: MemoryStore<Doc> = MemoryStore::new();
        let mut stream = store
            .watch(&ChangeFilter::all(), &WatchOptions::default())
            .await
            .unwrap();

        stream.close();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn out_of_band_write_bumps_version_and_publishes() {
        let store: MemoryStore<Doc> = MemoryStore::new();
        store.find_one_and_upsert(&doc("a", 1, 0)).await.unwrap();

        let mut stream = store
            .watch(&ChangeFilter::all(), &WatchOptions::default())
            .await
            .unwrap();
        store.write_out_of_band(doc("a", 50, 9)).unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.operation, OperationType::Update);
        assert_eq!(
            store.find_one(&"a".to_string()).await.unwrap().unwrap().version,
            9
        );
    }
}
