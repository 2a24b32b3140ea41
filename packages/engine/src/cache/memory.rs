//! In-memory [`DocumentCache`] backed by a readers-writer-locked map.
//!
//! Reads take the shared lock and refresh the entry's access time through
//! an atomic, so concurrent readers never serialize. Writes at capacity
//! evict the entry with the oldest access time (LRU by last touch). A
//! background sweeper removes expired entries at a configurable cadence;
//! expiry is also enforced on read, so a missing sweep only costs memory,
//! never staleness.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vellum_core::clock::{ClockSource, SystemClock};
use vellum_core::document::Document;

use super::{CacheError, DocumentCache};

/// Configuration for [`MemoryCache`].
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Capacity bound. 0 = unbounded.
    pub max_items: usize,
    /// Default entry TTL in milliseconds. 0 = no expiration.
    pub default_ttl_ms: u64,
    /// Sweeper cadence in milliseconds. 0 disables the sweeper.
    pub cleanup_interval_ms: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_items: 10_000,
            default_ttl_ms: 0,
            cleanup_interval_ms: 60_000,
        }
    }
}

struct Entry<D> {
    value: D,
    /// Absolute expiry in epoch milliseconds. 0 = never.
    expires_at_ms: u64,
    /// Epoch milliseconds of the last get or set.
    last_access_ms: AtomicU64,
}

impl<D> Entry<D> {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms != 0 && now_ms >= self.expires_at_ms
    }
}

struct Shared<D: Document> {
    entries: RwLock<HashMap<D::Id, Entry<D>>>,
    clock: Arc<dyn ClockSource>,
    closed: AtomicBool,
}

/// In-memory cache with LRU eviction and TTL expiry.
pub struct MemoryCache<D: Document> {
    shared: Arc<Shared<D>>,
    config: MemoryCacheConfig,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Document> MemoryCache<D> {
    /// Creates a cache with the real system clock.
    ///
    /// Must be called within a tokio runtime when the sweeper is enabled.
    #[must_use]
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a cache with an injected clock (deterministic tests).
    #[must_use]
    pub fn with_clock(config: MemoryCacheConfig, clock: Arc<dyn ClockSource>) -> Self {
        let shared = Arc::new(Shared {
            entries: RwLock::new(HashMap::new()),
            clock,
            closed: AtomicBool::new(false),
        });
        let shutdown = CancellationToken::new();

        let sweeper = if config.cleanup_interval_ms > 0 {
            Some(Self::spawn_sweeper(
                Arc::clone(&shared),
                config.cleanup_interval_ms,
                shutdown.clone(),
            ))
        } else {
            None
        };

        Self {
            shared,
            config,
            shutdown,
            sweeper: Mutex::new(sweeper),
        }
    }

    fn spawn_sweeper(
        shared: Arc<Shared<D>>,
        interval_ms: u64,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let now_ms = shared.clock.now();
                        let mut entries = shared.entries.write();
                        let before = entries.len();
                        entries.retain(|_, entry| !entry.is_expired(now_ms));
                        let swept = before - entries.len();
                        if swept > 0 {
                            tracing::debug!(swept, "memory cache sweep removed expired entries");
                        }
                    }
                }
            }
        })
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    /// Number of resident entries, expired ones included until swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.entries.read().len()
    }

    /// True when no entries are resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts the entry with the oldest access time. Caller holds the
    /// write lock.
    fn evict_lru(entries: &mut HashMap<D::Id, Entry<D>>) {
        let oldest = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access_ms.load(Ordering::Relaxed))
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            tracing::debug!(%id, "memory cache evicting least recently used entry");
            entries.remove(&id);
        }
    }
}

#[async_trait]
impl<D: Document> DocumentCache<D> for MemoryCache<D> {
    async fn get(&self, id: &D::Id) -> Result<D, CacheError> {
        self.ensure_open()?;
        let now_ms = self.shared.clock.now();
        let entries = self.shared.entries.read();
        let entry = entries.get(id).ok_or(CacheError::Miss)?;
        if entry.is_expired(now_ms) {
            return Err(CacheError::Miss);
        }
        entry.last_access_ms.store(now_ms, Ordering::Relaxed);
        Ok(entry.value.clone())
    }

    async fn set(&self, document: &D, ttl_ms: u64) -> Result<(), CacheError> {
        self.ensure_open()?;
        let now_ms = self.shared.clock.now();
        let effective_ttl = if ttl_ms == 0 {
            self.config.default_ttl_ms
        } else {
            ttl_ms
        };
        let expires_at_ms = if effective_ttl == 0 {
            0
        } else {
            now_ms + effective_ttl
        };

        let id = document.id();
        let mut entries = self.shared.entries.write();
        if self.config.max_items > 0
            && !entries.contains_key(&id)
            && entries.len() >= self.config.max_items
        {
            Self::evict_lru(&mut entries);
        }
        entries.insert(
            id,
            Entry {
                value: document.clone(),
                expires_at_ms,
                last_access_ms: AtomicU64::new(now_ms),
            },
        );
        Ok(())
    }

    async fn delete(&self, id: &D::Id) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.shared.entries.write().remove(id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.shared.entries.write().clear();
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.entries.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use vellum_core::clock::ManualClock;

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

    fn doc(id: &str, value: i64) -> Doc {
        Doc {
            id: id.to_string(),
            value,
            version: 1,
        }
    }

    fn no_sweeper(max_items: usize, default_ttl_ms: u64) -> MemoryCacheConfig {
        MemoryCacheConfig {
            max_items,
            default_ttl_ms,
            cleanup_interval_ms: 0,
        }
    }

    #[tokio::test]
    async fn get_after_set_returns_the_value() {
        let cache = MemoryCache::new(no_sweeper(10, 0));
        cache.set(&doc("a", 1), 0).await.unwrap();

        let fetched = cache.get(&"a".to_string()).await.unwrap();
        assert_eq!(fetched, doc("a", 1));

        assert!(matches!(
            cache.get(&"missing".to_string()).await,
            Err(CacheError::Miss)
        ));
    }

    #[tokio::test]
    async fn entries_expire_after_default_ttl() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache: MemoryCache<Doc> = MemoryCache::with_clock(no_sweeper(10, 500), clock.clone());
        cache.set(&doc("a", 1), 0).await.unwrap();

        clock.advance(499);
        assert!(cache.get(&"a".to_string()).await.is_ok());

        clock.advance(1);
        assert!(matches!(
            cache.get(&"a".to_string()).await,
            Err(CacheError::Miss)
        ));
    }

    #[tokio::test]
    async fn explicit_ttl_overrides_default() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache: MemoryCache<Doc> =
            MemoryCache::with_clock(no_sweeper(10, 10_000), clock.clone());
        cache.set(&doc("a", 1), 100).await.unwrap();

        clock.advance(101);
        assert!(matches!(
            cache.get(&"a".to_string()).await,
            Err(CacheError::Miss)
        ));
    }

    #[tokio::test]
    async fn capacity_eviction_removes_least_recently_touched() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache: MemoryCache<Doc> = MemoryCache::with_clock(no_sweeper(2, 0), clock.clone());

        cache.set(&doc("a", 1), 0).await.unwrap();
        clock.advance(10);
        cache.set(&doc("b", 2), 0).await.unwrap();
        clock.advance(10);

        // Touch "a" so "b" becomes the LRU entry.
        cache.get(&"a".to_string()).await.unwrap();
        clock.advance(10);

        cache.set(&doc("c", 3), 0).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&"a".to_string()).await.is_ok());
        assert!(matches!(
            cache.get(&"b".to_string()).await,
            Err(CacheError::Miss)
        ));
        assert!(cache.get(&"c".to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn overwriting_an_existing_key_does_not_evict() {
        let cache = MemoryCache::new(no_sweeper(2, 0));
        cache.set(&doc("a", 1), 0).await.unwrap();
        cache.set(&doc("b", 2), 0).await.unwrap();
        cache.set(&doc("a", 9), 0).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a".to_string()).await.unwrap().value, 9);
        assert!(cache.get(&"b".to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn delete_and_clear_remove_entries() {
        let cache = MemoryCache::new(no_sweeper(10, 0));
        cache.set(&doc("a", 1), 0).await.unwrap();
        cache.set(&doc("b", 2), 0).await.unwrap();

        cache.delete(&"a".to_string()).await.unwrap();
        assert!(matches!(
            cache.get(&"a".to_string()).await,
            Err(CacheError::Miss)
        ));

        // Deleting a missing entry succeeds.
        cache.delete(&"ghost".to_string()).await.unwrap();

        cache.clear().await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn operations_after_close_return_closed() {
        let cache = MemoryCache::new(no_sweeper(10, 0));
        cache.set(&doc("a", 1), 0).await.unwrap();

        cache.close().await.unwrap();
        assert!(matches!(
            cache.get(&"a".to_string()).await,
            Err(CacheError::Closed)
        ));
        assert!(matches!(
            cache.set(&doc("b", 2), 0).await,
            Err(CacheError::Closed)
        ));
        assert!(matches!(
            cache.delete(&"a".to_string()).await,
            Err(CacheError::Closed)
        ));
        assert!(matches!(cache.clear().await, Err(CacheError::Closed)));

        // Close is idempotent.
        cache.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_removes_expired_entries() {
        let clock = Arc::new(ManualClock::new(1_000));
        let config = MemoryCacheConfig {
            max_items: 10,
            default_ttl_ms: 50,
            cleanup_interval_ms: 10,
        };
        let cache: MemoryCache<Doc> = MemoryCache::with_clock(config, clock.clone());
        cache.set(&doc("a", 1), 0).await.unwrap();
        assert_eq!(cache.len(), 1);

        clock.advance(60);
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        assert_eq!(cache.len(), 0, "sweeper should have removed the entry");

        cache.close().await.unwrap();
    }
}
