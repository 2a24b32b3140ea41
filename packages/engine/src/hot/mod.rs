//! Hot-data watcher: proactive cache refresh for frequently used documents.
//!
//! The watcher drives a change-feed filter from the access tracker's hot
//! set, so a remote writer's mutations never leave stale cache entries for
//! hot keys. Four loops cooperate under one shutdown token:
//!
//! - the watch-list loop snapshots the hot set every interval and restarts
//!   the stream when it changed;
//! - the decay loop ages the tracker;
//! - the stream loop pumps feed events, double-checks hot membership
//!   client-side, and upserts/deletes the cache accordingly;
//! - the optional performance monitor watches per-event latency and the
//!   server-filter pass ratio, moving the document threshold (and with it
//!   the strategy) when the stream misbehaves.
//!
//! Lock discipline: the stream slot mutex is acquired before the
//! watch-list lock, never the reverse.

mod strategy;

pub use strategy::FilterStrategy;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::counter;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vellum_core::clock::{ClockSource, SystemClock};
use vellum_core::document::Document;
use vellum_core::event::{ChangeEvent, OperationType};

use crate::cache::DocumentCache;
use crate::options::{HotOptions, Options};
use crate::store::{DocumentStore, WatchOptions};
use crate::tracker::AccessTracker;

use strategy::{
    adjusted_threshold, build_filter, select_strategy, StrategyState, STRATEGY_HYSTERESIS_MS,
};

/// Backoff before reopening a failed hot stream.
const REOPEN_DELAY_MS: u64 = 1_000;

/// How long close waits for each loop to observe the shutdown.
const CLOSE_DRAIN_MS: u64 = 1_000;

#[derive(Default)]
struct PerfStats {
    processed: AtomicU64,
    matched: AtomicU64,
    total_nanos: AtomicU64,
}

struct StreamSlot {
    /// Token of the currently open stream, if any. Cancelling it ends the
    /// stream loop's pump, which then reopens with the current filter.
    active: Option<CancellationToken>,
}

struct HotInner<D: Document> {
    store: Arc<dyn DocumentStore<D>>,
    cache: Arc<dyn DocumentCache<D>>,
    tracker: Arc<AccessTracker<D::Id>>,
    options: HotOptions,
    cache_ttl_ms: u64,
    clock: Arc<dyn ClockSource>,
    /// Stream slot. Acquired before `watch_list`, never after.
    stream: tokio::sync::Mutex<StreamSlot>,
    watch_list: RwLock<HashSet<D::Id>>,
    strategy: ArcSwap<StrategyState>,
    restart: Notify,
    shutdown: CancellationToken,
    closed: AtomicBool,
    stats: PerfStats,
}

/// Watches hot documents on the change feed and keeps the cache fresh.
pub struct HotWatcher<D: Document> {
    inner: Arc<HotInner<D>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<D: Document> HotWatcher<D> {
    /// Builds a watcher over the engine's store, cache, and tracker.
    ///
    /// Takes the engine [`Options`] to share the hot knobs and cache TTL.
    /// Call [`HotWatcher::start`] to spawn the loops.
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore<D>>,
        cache: Arc<dyn DocumentCache<D>>,
        tracker: Arc<AccessTracker<D::Id>>,
        options: &Options,
    ) -> Self {
        Self::with_clock(store, cache, tracker, options, Arc::new(SystemClock))
    }

    /// Builds a watcher with an injected clock (deterministic tests).
    #[must_use]
    pub fn with_clock(
        store: Arc<dyn DocumentStore<D>>,
        cache: Arc<dyn DocumentCache<D>>,
        tracker: Arc<AccessTracker<D::Id>>,
        options: &Options,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let hot = options.hot.clone();
        let initial = StrategyState {
            strategy: FilterStrategy::DocumentSpecific,
            document_threshold: hot.document_threshold,
            changed_at_ms: 0,
        };
        Self {
            inner: Arc::new(HotInner {
                store,
                cache,
                tracker,
                options: hot,
                cache_ttl_ms: options.cache_ttl_ms,
                clock,
                stream: tokio::sync::Mutex::new(StreamSlot { active: None }),
                watch_list: RwLock::new(HashSet::new()),
                strategy: ArcSwap::from_pointee(initial),
                restart: Notify::new(),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                stats: PerfStats::default(),
            }),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Spawns the watch-list, decay, and stream loops, plus the monitor
    /// when enabled. Must be called within a tokio runtime.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        tasks.push(tokio::spawn(watch_list_loop(Arc::clone(&self.inner))));
        tasks.push(tokio::spawn(decay_loop(Arc::clone(&self.inner))));
        tasks.push(tokio::spawn(stream_loop(Arc::clone(&self.inner))));
        if self.inner.options.monitor_enabled {
            tasks.push(tokio::spawn(monitor_loop(Arc::clone(&self.inner))));
        }
    }

    /// The strategy currently driving the stream filter.
    #[must_use]
    pub fn strategy(&self) -> FilterStrategy {
        self.inner.strategy.load().strategy
    }

    /// Number of ids currently watched.
    #[must_use]
    pub fn watch_list_len(&self) -> usize {
        self.inner.watch_list.read().len()
    }

    /// Recomputes the watch list from the tracker immediately, restarting
    /// the stream when it changed. The loops do this on their own cadence;
    /// this forces one round.
    pub async fn refresh(&self) {
        self.inner.refresh().await;
    }

    /// Stops every loop and closes the stream. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        {
            let mut slot = self.inner.stream.lock().await;
            if let Some(token) = slot.active.take() {
                token.cancel();
            }
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let drained =
                tokio::time::timeout(Duration::from_millis(CLOSE_DRAIN_MS), task).await;
            if drained.is_err() {
                tracing::warn!("hot watcher loop did not stop within the drain window");
            }
        }
    }
}

impl<D: Document> HotInner<D> {
    /// Snapshots the hot set; on change, updates the watch list and cycles
    /// the stream. Stream lock before watch-list lock.
    async fn refresh(&self) {
        let hot = self.tracker.hot_items();
        let hot_set: HashSet<D::Id> = hot.iter().cloned().collect();

        let mut slot = self.stream.lock().await;
        let changed = {
            let mut watch_list = self.watch_list.write();
            if *watch_list == hot_set {
                false
            } else {
                *watch_list = hot_set;
                true
            }
        };
        if !changed {
            return;
        }

        self.reselect_strategy(hot.len());
        if let Some(token) = slot.active.take() {
            token.cancel();
        }
        self.restart.notify_one();
    }

    /// Applies the size-based strategy rule, honoring hysteresis.
    fn reselect_strategy(&self, hot_len: usize) {
        let current = self.strategy.load_full();
        let desired =
            select_strategy(hot_len, current.document_threshold, self.options.max_batch_size);
        if desired == current.strategy {
            return;
        }
        let now_ms = self.clock.now();
        if now_ms.saturating_sub(current.changed_at_ms) < STRATEGY_HYSTERESIS_MS {
            return;
        }
        tracing::info!(?desired, hot_len, "hot watcher switching filter strategy");
        self.strategy.store(Arc::new(StrategyState {
            strategy: desired,
            document_threshold: current.document_threshold,
            changed_at_ms: now_ms,
        }));
    }

    /// Serialized, deterministic snapshot of the watch list.
    fn id_snapshot(&self) -> Vec<Value> {
        let mut ids: Vec<D::Id> = self.watch_list.read().iter().cloned().collect();
        ids.sort();
        ids.iter()
            .filter_map(|id| serde_json::to_value(id).ok())
            .collect()
    }

    /// Applies one feed event to the cache when it concerns a hot id.
    async fn process_event(&self, event: ChangeEvent) {
        let started = std::time::Instant::now();
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        counter!("vellum_hot_events_total").increment(1);

        let decoded: Result<D::Id, _> = serde_json::from_value(event.id.clone());
        if let Ok(id) = decoded {
            if self.watch_list.read().contains(&id) {
                self.stats.matched.fetch_add(1, Ordering::Relaxed);
                match event.operation {
                    OperationType::Delete => {
                        if let Err(err) = self.cache.delete(&id).await {
                            tracing::warn!(%id, error = %err, "hot cache delete failed");
                        }
                    }
                    _ => {
                        if let Some(raw) = event.full_document {
                            match serde_json::from_value::<D>(raw) {
                                Ok(document) => {
                                    if let Err(err) =
                                        self.cache.set(&document, self.cache_ttl_ms).await
                                    {
                                        tracing::warn!(%id, error = %err, "hot cache refresh failed");
                                    }
                                }
                                Err(err) => {
                                    tracing::warn!(%id, error = %err, "hot event carries an undecodable document");
                                }
                            }
                        }
                    }
                }
            }
        } else {
            tracing::debug!("hot event carries an undecodable id; skipping");
        }

        let elapsed = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.stats.total_nanos.fetch_add(elapsed, Ordering::Relaxed);
    }
}

async fn watch_list_loop<D: Document>(inner: Arc<HotInner<D>>) {
    let mut ticker =
        tokio::time::interval(Duration::from_millis(inner.options.watch_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so the loop observes real
    // intervals.
    ticker.tick().await;
    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => return,
            _ = ticker.tick() => inner.refresh().await,
        }
    }
}

async fn decay_loop<D: Document>(inner: Arc<HotInner<D>>) {
    let mut ticker =
        tokio::time::interval(Duration::from_millis(inner.options.decay_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => return,
            _ = ticker.tick() => inner.tracker.decay(),
        }
    }
}

async fn stream_loop<D: Document>(inner: Arc<HotInner<D>>) {
    loop {
        if inner.shutdown.is_cancelled() {
            return;
        }

        let ids = inner.id_snapshot();
        if ids.is_empty() {
            // Nothing to watch; sleep until the watch list changes.
            tokio::select! {
                () = inner.shutdown.cancelled() => return,
                () = inner.restart.notified() => continue,
            }
        }

        let state = inner.strategy.load_full();
        let filter = build_filter(state.strategy, &ids, inner.options.max_batch_size);
        let watch_options = WatchOptions::default();

        let mut stream = match inner.store.watch(&filter, &watch_options).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(error = %err, "hot stream failed to open; retrying");
                tokio::select! {
                    () = inner.shutdown.cancelled() => return,
                    () = tokio::time::sleep(Duration::from_millis(REOPEN_DELAY_MS)) => continue,
                }
            }
        };
        {
            let mut slot = inner.stream.lock().await;
            slot.active = Some(stream.cancellation_token().clone());
        }
        tracing::debug!(watched = ids.len(), strategy = ?state.strategy, "hot stream opened");

        loop {
            tokio::select! {
                () = inner.shutdown.cancelled() => {
                    stream.close();
                    return;
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => inner.process_event(event).await,
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "hot stream error; reopening");
                        break;
                    }
                    // Closed by a watch-list restart or by the feed;
                    // reopen with the current filter.
                    None => break,
                },
            }
        }
    }
}

async fn monitor_loop<D: Document>(inner: Arc<HotInner<D>>) {
    let mut ticker =
        tokio::time::interval(Duration::from_millis(inner.options.perf_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => return,
            _ = ticker.tick() => evaluate_window(&inner).await,
        }
    }
}

/// One monitor window: read and reset the counters, adjust the document
/// threshold when the stream is pathological, and restart the stream under
/// the adjusted strategy.
async fn evaluate_window<D: Document>(inner: &Arc<HotInner<D>>) {
    let processed = inner.stats.processed.swap(0, Ordering::Relaxed);
    let matched = inner.stats.matched.swap(0, Ordering::Relaxed);
    let nanos = inner.stats.total_nanos.swap(0, Ordering::Relaxed);
    if processed == 0 {
        return;
    }

    // Window totals stay far below the f64 mantissa.
    #[allow(clippy::cast_precision_loss)]
    let avg_processing_ms = (nanos as f64 / processed as f64) / 1_000_000.0;
    #[allow(clippy::cast_precision_loss)]
    let filter_ratio = matched as f64 / processed as f64;

    let current = inner.strategy.load_full();
    let Some(new_threshold) = adjusted_threshold(
        avg_processing_ms,
        filter_ratio,
        current.strategy,
        current.document_threshold,
        inner.options.max_event_processing_ms,
    ) else {
        return;
    };

    let now_ms = inner.clock.now();
    if now_ms.saturating_sub(current.changed_at_ms) < STRATEGY_HYSTERESIS_MS {
        return;
    }

    let hot_len = inner.watch_list.read().len();
    let desired = select_strategy(hot_len, new_threshold, inner.options.max_batch_size);
    tracing::info!(
        avg_processing_ms,
        filter_ratio,
        new_threshold,
        ?desired,
        "hot watcher monitor adjusting strategy"
    );
    inner.strategy.store(Arc::new(StrategyState {
        strategy: desired,
        document_threshold: new_threshold,
        changed_at_ms: now_ms,
    }));

    let mut slot = inner.stream.lock().await;
    if let Some(token) = slot.active.take() {
        token.cancel();
    }
    inner.restart.notify_one();
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::cache::{CacheError, MemoryCache, MemoryCacheConfig};
    use crate::store::MemoryStore;

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

    struct Fixture {
        store: Arc<MemoryStore<Doc>>,
        cache: Arc<MemoryCache<Doc>>,
        tracker: Arc<AccessTracker<String>>,
        watcher: HotWatcher<Doc>,
    }

    fn fixture(max_hot: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new(MemoryCacheConfig {
            cleanup_interval_ms: 0,
            ..MemoryCacheConfig::default()
        }));
        let tracker = Arc::new(AccessTracker::new(max_hot, 0.95));
        let options = Options {
            hot: HotOptions {
                max_hot_items: max_hot,
                watch_interval_ms: 60_000,
                monitor_enabled: false,
                ..HotOptions::default()
            },
            ..Options::default()
        };
        let watcher = HotWatcher::new(
            store.clone() as Arc<dyn DocumentStore<Doc>>,
            cache.clone() as Arc<dyn DocumentCache<Doc>>,
            tracker.clone(),
            &options,
        );
        Fixture {
            store,
            cache,
            tracker,
            watcher,
        }
    }

    async fn settle() {
        // Let spawned pumps and loops run.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn hot_document_changes_refresh_the_cache() {
        let f = fixture(2);
        f.store.find_one_and_upsert(&doc("a", 1, 0)).await.unwrap();
        f.cache.set(&doc("a", 1, 1), 0).await.unwrap();
        f.tracker.record_access(&"a".to_string());

        f.watcher.start();
        f.watcher.refresh().await;
        settle().await;

        // A remote writer bumps the document; the watcher must replace the
        // cached copy without any store read by the reader.
        f.store.write_out_of_band(doc("a", 99, 5)).unwrap();
        settle().await;

        let cached = f.cache.get(&"a".to_string()).await.unwrap();
        assert_eq!(cached.value, 99);
        assert_eq!(cached.version, 5);

        f.watcher.close().await;
    }

    #[tokio::test]
    async fn cold_document_changes_are_ignored() {
        let f = fixture(1);
        f.tracker.record_access(&"hot".to_string());
        f.cache.set(&doc("cold", 1, 1), 0).await.unwrap();

        f.watcher.start();
        f.watcher.refresh().await;
        settle().await;

        f.store.write_out_of_band(doc("cold", 42, 3)).unwrap();
        settle().await;

        // The cold entry was left alone.
        let cached = f.cache.get(&"cold".to_string()).await.unwrap();
        assert_eq!(cached.value, 1);

        f.watcher.close().await;
    }

    #[tokio::test]
    async fn hot_delete_events_drop_the_cache_entry() {
        let f = fixture(2);
        f.store.find_one_and_upsert(&doc("a", 1, 0)).await.unwrap();
        f.cache.set(&doc("a", 1, 1), 0).await.unwrap();
        f.tracker.record_access(&"a".to_string());

        f.watcher.start();
        f.watcher.refresh().await;
        settle().await;

        f.store.delete_one(&"a".to_string()).await.unwrap();
        settle().await;

        assert!(matches!(
            f.cache.get(&"a".to_string()).await,
            Err(CacheError::Miss)
        ));

        f.watcher.close().await;
    }

    #[tokio::test]
    async fn refresh_tracks_hot_set_changes() {
        let f = fixture(2);
        f.tracker.record_access(&"a".to_string());
        f.watcher.refresh().await;
        assert_eq!(f.watcher.watch_list_len(), 1);

        f.tracker.record_access(&"b".to_string());
        f.watcher.refresh().await;
        assert_eq!(f.watcher.watch_list_len(), 2);

        // No change: refresh is a no-op.
        f.watcher.refresh().await;
        assert_eq!(f.watcher.watch_list_len(), 2);
    }

    #[tokio::test]
    async fn strategy_escalates_past_the_document_threshold() {
        let store: Arc<MemoryStore<Doc>> = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new(MemoryCacheConfig {
            cleanup_interval_ms: 0,
            ..MemoryCacheConfig::default()
        }));
        let tracker = Arc::new(AccessTracker::new(10, 0.95));
        let options = Options {
            hot: HotOptions {
                max_hot_items: 10,
                document_threshold: 3,
                max_batch_size: 2,
                monitor_enabled: false,
                ..HotOptions::default()
            },
            ..Options::default()
        };
        let watcher = HotWatcher::with_clock(
            store as Arc<dyn DocumentStore<Doc>>,
            cache as Arc<dyn DocumentCache<Doc>>,
            tracker.clone(),
            &options,
            Arc::new(vellum_core::clock::ManualClock::new(10_000_000)),
        );

        // Two hot ids fit a single batch.
        tracker.record_access(&"a".to_string());
        tracker.record_access(&"b".to_string());
        watcher.refresh().await;
        assert_eq!(watcher.strategy(), FilterStrategy::DocumentSpecific);

        // Three exceed the batch cap but not the threshold.
        tracker.record_access(&"c".to_string());
        watcher.refresh().await;
        assert_eq!(watcher.strategy(), FilterStrategy::BatchedDocument);
    }

    #[tokio::test]
    async fn strategy_changes_respect_hysteresis() {
        let store: Arc<MemoryStore<Doc>> = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new(MemoryCacheConfig {
            cleanup_interval_ms: 0,
            ..MemoryCacheConfig::default()
        }));
        let tracker = Arc::new(AccessTracker::new(10, 0.95));
        let clock = Arc::new(vellum_core::clock::ManualClock::new(10_000_000));
        let options = Options {
            hot: HotOptions {
                max_hot_items: 10,
                document_threshold: 3,
                max_batch_size: 2,
                monitor_enabled: false,
                ..HotOptions::default()
            },
            ..Options::default()
        };
        let watcher = HotWatcher::with_clock(
            store as Arc<dyn DocumentStore<Doc>>,
            cache as Arc<dyn DocumentCache<Doc>>,
            tracker.clone(),
            &options,
            clock.clone(),
        );

        tracker.record_access(&"a".to_string());
        tracker.record_access(&"b".to_string());
        tracker.record_access(&"c".to_string());
        watcher.refresh().await;
        assert_eq!(watcher.strategy(), FilterStrategy::BatchedDocument);

        // A shrink right away is throttled by hysteresis.
        watcher.inner.reselect_strategy(1);
        assert_eq!(watcher.strategy(), FilterStrategy::BatchedDocument);

        // After the hysteresis window the change is allowed.
        clock.advance(STRATEGY_HYSTERESIS_MS + 1);
        watcher.inner.reselect_strategy(1);
        assert_eq!(watcher.strategy(), FilterStrategy::DocumentSpecific);
    }

    #[tokio::test]
    async fn monitor_window_lowers_the_threshold_under_latency() {
        let f = fixture(4);
        // Synthesize a pathological window: 10 events, 1 second total.
        f.watcher.inner.stats.processed.store(10, Ordering::Relaxed);
        f.watcher.inner.stats.matched.store(10, Ordering::Relaxed);
        f.watcher
            .inner
            .stats
            .total_nanos
            .store(10_000_000_000, Ordering::Relaxed);

        evaluate_window(&f.watcher.inner).await;
        assert_eq!(f.watcher.inner.strategy.load().document_threshold, 50);

        // Counters were consumed.
        assert_eq!(f.watcher.inner.stats.processed.load(Ordering::Relaxed), 0);

        f.watcher.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_the_loops() {
        let f = fixture(2);
        f.watcher.start();
        f.watcher.close().await;
        f.watcher.close().await;
        assert!(f.watcher.inner.shutdown.is_cancelled());
    }
}
