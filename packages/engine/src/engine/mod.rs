//! Engine core: single-document CRUD with optimistic concurrency.
//!
//! [`Engine`] composes a [`DocumentStore`], a [`DocumentCache`], and an
//! [`AccessTracker`]. Reads consult the cache first and populate it from
//! the store on miss. Mutations go through a version-conditioned update:
//! the engine diffs the caller's transformation, stamps the successor
//! version, and retries with exponential backoff and jitter until the
//! conditional update lands, the retry budget runs out, or the operation
//! timeout fires. Every local mutation refreshes the cache and broadcasts
//! a typed event carrying the diff to watch subscribers.

mod broadcast;

pub use broadcast::{EventFilter, WatchSubscription};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vellum_core::document::Document;
use vellum_core::diff::build_diff;
use vellum_core::event::{OperationType, WatchEvent};
use vellum_core::update::UpdateDocument;

use crate::cache::{CacheError, DocumentCache};
use crate::error::EngineError;
use crate::options::{CallOptions, Options, RetryParams};
use crate::store::{ChangeFilter, DocumentStore, Query, Upserted, WatchOptions};
use crate::tracker::AccessTracker;

use broadcast::{run_feed_consumer, RecentLocal, Subscribers, DELETE_ECHO_VERSION};

/// How long close waits for the feed consumer to observe the shutdown.
const CLOSE_DRAIN_MS: u64 = 1_000;

/// Result of a successful update.
///
/// A mutation that persisted but then failed the follow-up cache write is
/// still a success; the cache failure is reported in `cache_degraded` so
/// the caller may treat the operation as partial.
#[derive(Debug)]
pub struct Updated<D> {
    /// The stored post-image.
    pub document: D,
    /// The update that produced it: the computed diff for transform
    /// updates, the caller's descriptor for raw updates.
    pub diff: UpdateDocument,
    /// A cache write failure that followed the persisted mutation.
    pub cache_degraded: Option<CacheError>,
}

/// Result of a delete.
#[derive(Debug)]
pub struct Deleted {
    /// Whether a document existed under the id.
    pub existed: bool,
    /// A cache invalidation failure that followed the persisted delete.
    pub cache_degraded: Option<CacheError>,
}

struct EngineInner<D: Document> {
    store: Arc<dyn DocumentStore<D>>,
    cache: Arc<dyn DocumentCache<D>>,
    tracker: Arc<AccessTracker<D::Id>>,
    options: Options,
    subscribers: Arc<Subscribers<D>>,
    recent_local: Arc<Mutex<RecentLocal>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

/// Generic document storage engine.
///
/// Cheap to clone; clones share one engine instance.
#[derive(Clone)]
pub struct Engine<D: Document> {
    inner: Arc<EngineInner<D>>,
}

impl<D: Document> Engine<D> {
    /// Builds an engine over the given store and cache.
    ///
    /// Spawns the change-feed consumer when `options.watch_enabled`; must
    /// be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`EngineError::MissingVersionField`] on invalid options.
    pub fn new(
        store: Arc<dyn DocumentStore<D>>,
        cache: Arc<dyn DocumentCache<D>>,
        options: Options,
    ) -> Result<Self, EngineError> {
        options.validate()?;

        let tracker = Arc::new(AccessTracker::new(
            options.hot.max_hot_items,
            options.hot.decay_factor,
        ));
        let subscribers = Arc::new(Subscribers::new());
        let recent_local = Arc::new(Mutex::new(RecentLocal::new()));
        let shutdown = CancellationToken::new();

        let consumer = if options.watch_enabled {
            let filter = options.watch_filter.clone().unwrap_or_else(ChangeFilter::all);
            let watch_options = WatchOptions {
                full_document_lookup: options.watch_full_document_lookup,
                max_await_time_ms: options.watch_max_await_time_ms,
                batch_size: options.watch_batch_size,
            };
            Some(tokio::spawn(run_feed_consumer(
                Arc::clone(&store),
                Arc::clone(&subscribers),
                Arc::clone(&recent_local),
                filter,
                watch_options,
                shutdown.clone(),
            )))
        } else {
            None
        };

        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                cache,
                tracker,
                options,
                subscribers,
                recent_local,
                closed: AtomicBool::new(false),
                shutdown,
                consumer: Mutex::new(consumer),
            }),
        })
    }

    /// The engine's access tracker (shared with the hot-data watcher).
    #[must_use]
    pub fn tracker(&self) -> Arc<AccessTracker<D::Id>> {
        Arc::clone(&self.inner.tracker)
    }

    /// The backing store handle.
    #[must_use]
    pub fn store(&self) -> Arc<dyn DocumentStore<D>> {
        Arc::clone(&self.inner.store)
    }

    /// The cache handle. The engine never closes it.
    #[must_use]
    pub fn cache(&self) -> Arc<dyn DocumentCache<D>> {
        Arc::clone(&self.inner.cache)
    }

    /// The engine options.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    /// Reads one document, cache first. The returned value is an
    /// independent copy.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`], [`EngineError::Closed`], store errors.
    pub async fn find_one(&self, id: &D::Id) -> Result<D, EngineError> {
        self.ensure_open()?;
        self.inner.tracker.record_access(id);
        self.load_cached(id).await
    }

    /// Reads every document matching `query`, populating the cache per
    /// result when configured to.
    ///
    /// # Errors
    ///
    /// [`EngineError::Closed`], store errors.
    pub async fn find_many(&self, query: Query<D>) -> Result<Vec<D>, EngineError> {
        self.ensure_open()?;
        let results = self.inner.store.find_many(query).await?;
        if self.inner.options.cache_query_results {
            for document in &results {
                self.cache_set_best_effort(document).await;
            }
        }
        Ok(results)
    }

    /// Atomic find-or-create. An existing document passes through
    /// unchanged (the caller's version field is ignored); a new one is
    /// inserted with version 1.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidDocument`] for a negative version,
    /// [`EngineError::Closed`], store errors.
    pub async fn find_one_and_upsert(&self, document: D) -> Result<Upserted<D>, EngineError> {
        self.ensure_open()?;
        if document.version() < 0 {
            return Err(EngineError::InvalidDocument {
                reason: format!("negative version {}", document.version()),
            });
        }
        let id = document.id();
        self.inner.tracker.record_access(&id);

        // Mark the echo before the store publishes the feed event.
        self.mark_echo(&id, 1);
        let upserted = match self.inner.store.find_one_and_upsert(&document).await {
            Ok(upserted) => upserted,
            Err(err) => {
                self.consume_echo(&id, 1);
                return Err(EngineError::Store(err));
            }
        };
        if upserted.created {
            self.cache_set_best_effort(&upserted.document).await;
            self.inner.subscribers.fan_out(&WatchEvent {
                id,
                operation: OperationType::Create,
                document: Some(upserted.document.clone()),
                diff: None,
            });
        } else {
            self.consume_echo(&id, 1);
            self.cache_set_best_effort(&upserted.document).await;
        }
        Ok(upserted)
    }

    /// Loads, transforms, and conditionally stores one document, retrying
    /// version conflicts per the retry policy.
    ///
    /// The transform receives an independent copy and returns the desired
    /// state; the engine computes the diff, stamps the successor version,
    /// and races the whole call against the operation timeout.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`], [`EngineError::TransformFailed`],
    /// [`EngineError::MaxRetriesExceeded`] wrapping the final
    /// [`EngineError::VersionMismatch`], [`EngineError::Timeout`],
    /// [`EngineError::Closed`], store errors.
    pub async fn find_one_and_update<F>(
        &self,
        id: &D::Id,
        transform: F,
        call: Option<CallOptions>,
    ) -> Result<Updated<D>, EngineError>
    where
        F: Fn(D) -> anyhow::Result<D> + Send + Sync,
    {
        self.ensure_open()?;
        self.inner.tracker.record_access(id);
        let params = self.inner.options.retry_params(call.as_ref());

        let attempt_update = |current: &D| -> Result<UpdateDocument, EngineError> {
            let mut transformed = transform(current.clone())
                .map_err(|source| EngineError::TransformFailed { source })?;
            // The version is the engine's token, not the transform's:
            // normalize before diffing so it never appears in the diff.
            transformed.set_version(current.version());
            Ok(build_diff(current, &transformed)?)
        };

        self.with_timeout(params, self.optimistic_loop(id, attempt_update, params))
            .await
    }

    /// Conditionally applies a caller-supplied raw update descriptor,
    /// retrying version conflicts per the retry policy.
    ///
    /// The descriptor must not address the version field; the engine
    /// stamps the successor version itself.
    ///
    /// # Errors
    ///
    /// Same contract as [`Engine::find_one_and_update`], without
    /// `TransformFailed`.
    pub async fn update_one(
        &self,
        id: &D::Id,
        update: UpdateDocument,
        call: Option<CallOptions>,
    ) -> Result<Updated<D>, EngineError> {
        self.ensure_open()?;
        self.inner.tracker.record_access(id);
        let params = self.inner.options.retry_params(call.as_ref());

        let attempt_update = |_current: &D| Ok(update.clone());
        self.with_timeout(params, self.optimistic_loop(id, attempt_update, params))
            .await
    }

    /// Deletes one document. Deleting a missing id succeeds.
    ///
    /// # Errors
    ///
    /// [`EngineError::Closed`], store errors.
    pub async fn delete_one(&self, id: &D::Id) -> Result<Deleted, EngineError> {
        self.ensure_open()?;

        self.mark_echo(id, DELETE_ECHO_VERSION);
        let existed = match self.inner.store.delete_one(id).await {
            Ok(existed) => existed,
            Err(err) => {
                self.consume_echo(id, DELETE_ECHO_VERSION);
                return Err(EngineError::Store(err));
            }
        };
        if !existed {
            self.consume_echo(id, DELETE_ECHO_VERSION);
        }

        let cache_degraded = match self.inner.cache.delete(id).await {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!(%id, error = %err, "cache invalidation failed after delete");
                Some(err)
            }
        };

        if existed {
            self.inner.subscribers.fan_out(&WatchEvent {
                id: id.clone(),
                operation: OperationType::Delete,
                document: None,
                diff: None,
            });
        }
        Ok(Deleted {
            existed,
            cache_degraded,
        })
    }

    /// Registers a watch subscriber delivering every broadcast event.
    ///
    /// The subscriber lives until `token` is cancelled or the engine
    /// closes; its channel holds 100 events and drops on overflow.
    ///
    /// # Errors
    ///
    /// [`EngineError::Closed`], [`EngineError::WatchDisabled`].
    pub fn watch(&self, token: CancellationToken) -> Result<WatchSubscription<D>, EngineError> {
        self.watch_filtered(token, None)
    }

    /// Registers a watch subscriber with a per-subscriber event filter.
    ///
    /// # Errors
    ///
    /// Same contract as [`Engine::watch`].
    pub fn watch_filtered(
        &self,
        token: CancellationToken,
        filter: Option<EventFilter<D>>,
    ) -> Result<WatchSubscription<D>, EngineError> {
        self.ensure_open()?;
        if !self.inner.options.watch_enabled {
            return Err(EngineError::WatchDisabled);
        }

        let (id, subscription) = self.inner.subscribers.register(token.clone(), filter);

        // Tracker task: the subscriber leaves when its context completes
        // or the engine shuts down.
        let subscribers = Arc::clone(&self.inner.subscribers);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = shutdown.cancelled() => {}
            }
            subscribers.remove(id);
        });

        Ok(subscription)
    }

    /// Shuts the engine down. Idempotent.
    ///
    /// Sets the closed flag first (so in-flight calls fail with `Closed`
    /// rather than logging stream errors), cancels background tasks, then
    /// waits briefly for the feed consumer to observe the cancellation.
    /// Caches are owned by the embedder and stay open.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();

        let consumer = self.inner.consumer.lock().take();
        if let Some(handle) = consumer {
            let drain = tokio::time::timeout(Duration::from_millis(CLOSE_DRAIN_MS), handle);
            if drain.await.is_err() {
                tracing::warn!("change feed consumer did not stop within the drain window");
            }
        }

        self.inner.subscribers.close_all();
        self.inner.tracker.close();
    }

    /// True once [`Engine::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // --- internals ---

    async fn with_timeout<T>(
        &self,
        params: RetryParams,
        fut: impl std::future::Future<Output = Result<T, EngineError>> + Send,
    ) -> Result<T, EngineError> {
        if params.timeout_ms == 0 {
            return fut.await;
        }
        match tokio::time::timeout(Duration::from_millis(params.timeout_ms), fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                timeout_ms: params.timeout_ms,
            }),
        }
    }

    /// Cache-first load; populates the cache from the store on miss.
    async fn load_cached(&self, id: &D::Id) -> Result<D, EngineError> {
        match self.inner.cache.get(id).await {
            Ok(document) => return Ok(document),
            Err(CacheError::Miss) => {}
            Err(err) => {
                tracing::warn!(%id, error = %err, "cache read failed; falling through to store");
            }
        }

        let document = self
            .inner
            .store
            .find_one(id)
            .await?
            .ok_or_else(|| EngineError::NotFound { id: id.to_string() })?;
        self.cache_set_best_effort(&document).await;
        Ok(document)
    }

    async fn cache_set_best_effort(&self, document: &D) {
        let ttl = self.inner.options.cache_ttl_ms;
        if let Err(err) = self.inner.cache.set(document, ttl).await {
            tracing::warn!(id = %document.id(), error = %err, "cache population failed");
        }
    }

    fn mark_echo(&self, id: &D::Id, version: i64) {
        self.inner.recent_local.lock().mark(id.to_string(), version);
    }

    fn consume_echo(&self, id: &D::Id, version: i64) {
        let _ = self.inner.recent_local.lock().consume(&id.to_string(), version);
    }

    /// The optimistic update protocol. `make_update` builds the
    /// user-visible diff against the current document state; the engine
    /// appends the version bump, issues the conditional update, and
    /// retries conflicts with exponential backoff and jitter.
    async fn optimistic_loop<F>(
        &self,
        id: &D::Id,
        make_update: F,
        params: RetryParams,
    ) -> Result<Updated<D>, EngineError>
    where
        F: Fn(&D) -> Result<UpdateDocument, EngineError> + Send + Sync,
    {
        let mut attempt: u32 = 0;
        loop {
            self.ensure_open()?;

            let current = self.load_cached(id).await?;
            let current_version = current.version();
            let diff = make_update(&current)?;

            let mut store_update = diff.clone();
            store_update.set(
                self.inner.options.version_field.clone(),
                json!(current_version + 1),
            );

            // Mark the echo before the store publishes the feed event; a
            // failed attempt takes the mark back.
            self.mark_echo(id, current_version + 1);
            let outcome = self
                .inner
                .store
                .find_one_and_update(id, current_version, &store_update)
                .await;

            match outcome {
                Err(err) => {
                    self.consume_echo(id, current_version + 1);
                    return Err(EngineError::Store(err));
                }
                Ok(Some(stored)) => {
                    if attempt > 0 {
                        counter!("vellum_update_retries_total").increment(u64::from(attempt));
                    }
                    let cache_degraded = match self
                        .inner
                        .cache
                        .set(&stored, self.inner.options.cache_ttl_ms)
                        .await
                    {
                        Ok(()) => None,
                        Err(err) => {
                            tracing::warn!(%id, error = %err, "cache update failed after commit");
                            Some(err)
                        }
                    };
                    self.inner.subscribers.fan_out(&WatchEvent {
                        id: id.clone(),
                        operation: OperationType::Update,
                        document: Some(stored.clone()),
                        diff: Some(diff.clone()),
                    });
                    return Ok(Updated {
                        document: stored,
                        diff,
                        cache_degraded,
                    });
                }
                Ok(None) => {
                    // Version conflict: someone else won. Invalidate the
                    // stale cache entry and retry against fresh state.
                    self.consume_echo(id, current_version + 1);
                    counter!("vellum_update_conflicts_total").increment(1);
                    if let Err(err) = self.inner.cache.delete(id).await {
                        tracing::warn!(%id, error = %err, "cache invalidation failed after conflict");
                    }

                    attempt += 1;
                    if params.max_retries != 0 && attempt > params.max_retries {
                        let observed = match self.inner.store.find_one(id).await {
                            Ok(Some(document)) => document.version(),
                            _ => 0,
                        };
                        return Err(EngineError::MaxRetriesExceeded {
                            retries: params.max_retries,
                            source: Box::new(EngineError::VersionMismatch {
                                id: id.to_string(),
                                expected: current_version,
                                observed,
                                section: None,
                            }),
                        });
                    }

                    let delay = backoff_delay(attempt, params);
                    tokio::select! {
                        () = self.inner.shutdown.cancelled() => return Err(EngineError::Closed),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Exponential backoff with jitter: `retry_delay · 2^(attempt-1)` clamped
/// to the ceiling, scaled by a uniform factor in `1 ± jitter`.
fn backoff_delay(attempt: u32, params: RetryParams) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let base = params
        .retry_delay_ms
        .saturating_mul(1_u64 << exponent)
        .min(params.max_retry_delay_ms.max(params.retry_delay_ms));

    let jitter = params.retry_jitter;
    let factor = if jitter > 0.0 {
        1.0 + rand::rng().random_range(-jitter..=jitter)
    } else {
        1.0
    };
    // Delays are far below the precision-loss range.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let millis = ((base as f64) * factor).round().max(0.0) as u64;
    Duration::from_millis(millis)
}
