//! Embedded persistent [`DocumentCache`] backed by redb.
//!
//! Values are MsgPack-encoded `(expiry, document)` records in a single
//! table. Per-entry TTL is stored as an absolute expiry and enforced on
//! read; a background reclaimer removes expired rows and then compacts the
//! database until the compactor reports no remaining work. Close performs a
//! final durable commit so eventually-durable writes reach disk.
//!
//! The configuration accepts the full knob set of log-structured stores
//! (value-log sizing, memtable counts); redb honors the cache-sizing and
//! durability knobs and accepts the rest for configuration compatibility.

use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use redb::{Database, Durability, ReadableTable, TableDefinition, TableError};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vellum_core::clock::{ClockSource, SystemClock};
use vellum_core::document::Document;

use super::{CacheError, DocumentCache};

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// Configuration for [`PersistentCache`].
#[derive(Debug, Clone)]
pub struct PersistentCacheConfig {
    /// Directory holding the database file.
    pub path: PathBuf,
    /// Value-log segment size hint. Accepted for compatibility; inert.
    pub value_log_file_size: u64,
    /// Write-buffer size hint; multiplied by `num_memtables` to size the
    /// database page cache.
    pub mem_table_size: u64,
    /// Write-buffer count hint; see `mem_table_size`.
    pub num_memtables: usize,
    /// Level-zero table count hint. Accepted for compatibility; inert.
    pub num_level_zero_tables: usize,
    /// Level-zero stall bound hint. Accepted for compatibility; inert.
    pub num_level_zero_tables_stall: usize,
    /// Inline-value threshold hint. Accepted for compatibility; inert.
    pub value_threshold: u64,
    /// Whether commits are synchronously durable.
    pub sync_writes: bool,
    /// Compactor parallelism hint. Accepted for compatibility; inert.
    pub num_compactors: usize,
    /// Default entry TTL in milliseconds. 0 = no expiration.
    pub default_ttl_ms: u64,
    /// Reclaimer cadence in milliseconds. 0 disables the reclaimer.
    pub gc_interval_ms: u64,
}

impl Default for PersistentCacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./vellum-cache"),
            value_log_file_size: 1 << 30,
            mem_table_size: 64 << 20,
            num_memtables: 5,
            num_level_zero_tables: 5,
            num_level_zero_tables_stall: 15,
            value_threshold: 1 << 10,
            sync_writes: false,
            num_compactors: 4,
            default_ttl_ms: 0,
            gc_interval_ms: 600_000,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredEntry<D> {
    /// Absolute expiry in epoch milliseconds. 0 = never.
    expires_at_ms: u64,
    document: D,
}

fn backend<E>(err: E) -> CacheError
where
    E: std::error::Error + Send + Sync + 'static,
{
    CacheError::Backend(anyhow::Error::new(err))
}

/// Embedded persistent cache.
pub struct PersistentCache<D: Document> {
    db: Arc<RwLock<Database>>,
    config: PersistentCacheConfig,
    clock: Arc<dyn ClockSource>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    reclaimer: Mutex<Option<JoinHandle<()>>>,
    _document: PhantomData<fn() -> D>,
}

impl<D: Document> PersistentCache<D> {
    /// Opens (creating if necessary) the database under `config.path`.
    ///
    /// Must be called within a tokio runtime when the reclaimer is enabled.
    ///
    /// # Errors
    ///
    /// [`CacheError::Backend`] when the directory or database cannot be
    /// created.
    pub fn open(config: PersistentCacheConfig) -> Result<Self, CacheError> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Opens the database with an injected clock (deterministic tests).
    ///
    /// # Errors
    ///
    /// Same contract as [`PersistentCache::open`].
    pub fn open_with_clock(
        config: PersistentCacheConfig,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&config.path).map_err(backend)?;

        let cache_bytes = usize::try_from(config.mem_table_size)
            .unwrap_or(usize::MAX)
            .saturating_mul(config.num_memtables.max(1));
        let db = Database::builder()
            .set_cache_size(cache_bytes)
            .create(config.path.join("cache.redb"))
            .map_err(backend)?;
        let db = Arc::new(RwLock::new(db));
        let shutdown = CancellationToken::new();

        let reclaimer = if config.gc_interval_ms > 0 {
            Some(Self::spawn_reclaimer(
                Arc::clone(&db),
                Arc::clone(&clock),
                config.gc_interval_ms,
                shutdown.clone(),
            ))
        } else {
            None
        };

        Ok(Self {
            db,
            config,
            clock,
            closed: AtomicBool::new(false),
            shutdown,
            reclaimer: Mutex::new(reclaimer),
            _document: PhantomData,
        })
    }

    fn spawn_reclaimer(
        db: Arc<RwLock<Database>>,
        clock: Arc<dyn ClockSource>,
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
                        let db = Arc::clone(&db);
                        let now_ms = clock.now();
                        let outcome = tokio::task::spawn_blocking(move || {
                            Self::reclaim(&db, now_ms)
                        })
                        .await;
                        match outcome {
                            Ok(Ok(removed)) if removed > 0 => {
                                tracing::debug!(removed, "persistent cache reclaimed expired entries");
                            }
                            Ok(Ok(_)) => {}
                            Ok(Err(err)) => {
                                tracing::warn!(error = %err, "persistent cache reclaim failed");
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "persistent cache reclaim task panicked");
                            }
                        }
                    }
                }
            }
        })
    }

    /// Removes expired rows, then compacts until the compactor reports
    /// no remaining work. Returns the number of removed rows.
    fn reclaim(db: &RwLock<Database>, now_ms: u64) -> Result<usize, CacheError> {
        let expired: Vec<String> = {
            let db = db.read();
            let txn = db.begin_read().map_err(backend)?;
            match txn.open_table(TABLE) {
                Ok(table) => {
                    let mut keys = Vec::new();
                    for row in table.iter().map_err(backend)? {
                        let (key, value) = row.map_err(backend)?;
                        if let Ok(entry) =
                            rmp_serde::from_slice::<StoredEntry<serde_json::Value>>(value.value())
                        {
                            if entry.expires_at_ms != 0 && now_ms >= entry.expires_at_ms {
                                keys.push(key.value().to_string());
                            }
                        }
                    }
                    keys
                }
                Err(TableError::TableDoesNotExist(_)) => Vec::new(),
                Err(err) => return Err(backend(err)),
            }
        };

        if !expired.is_empty() {
            let db_read = db.read();
            let mut txn = db_read.begin_write().map_err(backend)?;
            txn.set_durability(Durability::Eventual);
            {
                let mut table = txn.open_table(TABLE).map_err(backend)?;
                for key in &expired {
                    table.remove(key.as_str()).map_err(backend)?;
                }
            }
            txn.commit().map_err(backend)?;
        }

        // Compaction needs exclusive access; loop until it reports no work.
        let mut db = db.write();
        loop {
            match db.compact() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "persistent cache compaction failed");
                    break;
                }
            }
        }

        Ok(expired.len())
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    fn render_key(id: &D::Id) -> Result<String, CacheError> {
        let key = id.to_string();
        if key.is_empty() {
            return Err(CacheError::InvalidKey {
                reason: "key renders to an empty string".to_string(),
            });
        }
        Ok(key)
    }

    fn durability(&self) -> Durability {
        if self.config.sync_writes {
            Durability::Immediate
        } else {
            Durability::Eventual
        }
    }
}

#[async_trait]
impl<D: Document> DocumentCache<D> for PersistentCache<D> {
    async fn get(&self, id: &D::Id) -> Result<D, CacheError> {
        self.ensure_open()?;
        let key = Self::render_key(id)?;
        let db = Arc::clone(&self.db);

        let bytes: Option<Vec<u8>> = tokio::task::spawn_blocking(move || {
            let db = db.read();
            let txn = db.begin_read().map_err(backend)?;
            match txn.open_table(TABLE) {
                Ok(table) => Ok(table
                    .get(key.as_str())
                    .map_err(backend)?
                    .map(|guard| guard.value().to_vec())),
                Err(TableError::TableDoesNotExist(_)) => Ok(None),
                Err(err) => Err(backend(err)),
            }
        })
        .await
        .map_err(backend)??;

        let bytes = bytes.ok_or(CacheError::Miss)?;
        let entry: StoredEntry<D> = rmp_serde::from_slice(&bytes)
            .map_err(|err| CacheError::Deserialization(err.to_string()))?;
        if entry.expires_at_ms != 0 && self.clock.now() >= entry.expires_at_ms {
            // Leave the row for the reclaimer; the read contract is Miss.
            return Err(CacheError::Miss);
        }
        Ok(entry.document)
    }

    async fn set(&self, document: &D, ttl_ms: u64) -> Result<(), CacheError> {
        self.ensure_open()?;
        let key = Self::render_key(&document.id())?;
        let effective_ttl = if ttl_ms == 0 {
            self.config.default_ttl_ms
        } else {
            ttl_ms
        };
        let expires_at_ms = if effective_ttl == 0 {
            0
        } else {
            self.clock.now() + effective_ttl
        };
        let bytes = rmp_serde::to_vec(&StoredEntry {
            expires_at_ms,
            document: document.clone(),
        })
        .map_err(|err| CacheError::Serialization(err.to_string()))?;

        let db = Arc::clone(&self.db);
        let durability = self.durability();
        tokio::task::spawn_blocking(move || {
            let db = db.read();
            let mut txn = db.begin_write().map_err(backend)?;
            txn.set_durability(durability);
            {
                let mut table = txn.open_table(TABLE).map_err(backend)?;
                table.insert(key.as_str(), bytes.as_slice()).map_err(backend)?;
            }
            txn.commit().map_err(backend)
        })
        .await
        .map_err(backend)?
    }

    async fn delete(&self, id: &D::Id) -> Result<(), CacheError> {
        self.ensure_open()?;
        let key = Self::render_key(id)?;
        let db = Arc::clone(&self.db);
        let durability = self.durability();
        tokio::task::spawn_blocking(move || {
            let db = db.read();
            let mut txn = db.begin_write().map_err(backend)?;
            txn.set_durability(durability);
            {
                let mut table = txn.open_table(TABLE).map_err(backend)?;
                table.remove(key.as_str()).map_err(backend)?;
            }
            txn.commit().map_err(backend)
        })
        .await
        .map_err(backend)?
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.ensure_open()?;
        let db = Arc::clone(&self.db);
        let durability = self.durability();
        tokio::task::spawn_blocking(move || {
            let db = db.read();
            let mut txn = db.begin_write().map_err(backend)?;
            txn.set_durability(durability);
            txn.delete_table(TABLE).map_err(backend)?;
            txn.commit().map_err(backend)
        })
        .await
        .map_err(backend)?
    }

    async fn close(&self) -> Result<(), CacheError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        let handle = self.reclaimer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        // Flush: a durable empty commit forces eventually-durable commits
        // onto disk.
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let db = db.read();
            let mut txn = db.begin_write().map_err(backend)?;
            txn.set_durability(Durability::Immediate);
            txn.commit().map_err(backend)
        })
        .await
        .map_err(backend)?
    }
}
