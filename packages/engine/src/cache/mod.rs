//! Cache abstraction over pluggable backends.
//!
//! [`DocumentCache`] is the uniform key-to-document contract the engine
//! consults before touching the backing store. Three backends implement it:
//!
//! - [`MemoryCache`]: an in-process map with LRU eviction and a background
//!   expiry sweeper.
//! - [`PersistentCache`]: an embedded on-disk KV store surviving restarts.
//! - [`RedisCache`]: a remote shared KV for multi-process deployments.
//!
//! The engine is indifferent to the backend choice. Cache instances are
//! supplied by the embedder; the engine never closes them.

mod memory;
mod persistent;
mod redis;

pub use self::memory::{MemoryCache, MemoryCacheConfig};
pub use self::persistent::{PersistentCache, PersistentCacheConfig};
pub use self::redis::{RedisCache, RedisCacheConfig};

use async_trait::async_trait;
use vellum_core::document::Document;

/// TTL argument meaning "use the backend's configured default".
pub const TTL_DEFAULT: u64 = 0;

/// Errors returned by cache backends.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The key is not present (or its entry expired).
    #[error("cache miss")]
    Miss,
    /// The backend is at capacity and cannot admit the entry.
    #[error("cache full")]
    Full,
    /// The cache has been closed.
    #[error("cache is closed")]
    Closed,
    /// The rendered key is not usable by this backend.
    #[error("invalid cache key: {reason}")]
    InvalidKey {
        /// Why the key was rejected.
        reason: String,
    },
    /// The value is not storable by this backend.
    #[error("invalid cache value: {reason}")]
    InvalidValue {
        /// Why the value was rejected.
        reason: String,
    },
    /// Encoding the value for storage failed.
    #[error("cache serialization failed: {0}")]
    Serialization(String),
    /// Decoding a stored value failed.
    #[error("cache deserialization failed: {0}")]
    Deserialization(String),
    /// The backend itself failed.
    #[error("cache backend error")]
    Backend(#[from] anyhow::Error),
}

/// Uniform key-to-document cache contract.
///
/// All operations are safe for concurrent use and cancellable by dropping
/// their futures. A `ttl_ms` of [`TTL_DEFAULT`] (0) means "use the backend
/// default"; a backend default of 0 means "no expiration". Every operation
/// on a closed cache returns [`CacheError::Closed`]; [`DocumentCache::close`]
/// itself is idempotent.
///
/// Used as `Arc<dyn DocumentCache<D>>`.
#[async_trait]
pub trait DocumentCache<D: Document>: Send + Sync {
    /// Retrieves the cached document, refreshing its access time.
    ///
    /// # Errors
    ///
    /// [`CacheError::Miss`] when absent or expired.
    async fn get(&self, id: &D::Id) -> Result<D, CacheError>;

    /// Stores a document under its own id.
    ///
    /// # Errors
    ///
    /// Backend-specific; see [`CacheError`].
    async fn set(&self, document: &D, ttl_ms: u64) -> Result<(), CacheError>;

    /// Removes the entry for `id`. Removing a missing entry succeeds.
    ///
    /// # Errors
    ///
    /// [`CacheError::Closed`] after close; backend errors otherwise.
    async fn delete(&self, id: &D::Id) -> Result<(), CacheError>;

    /// Removes every entry.
    ///
    /// # Errors
    ///
    /// [`CacheError::Closed`] after close; backend errors otherwise.
    async fn clear(&self) -> Result<(), CacheError>;

    /// Shuts the cache down, releasing background tasks and flushing
    /// buffered state. Idempotent.
    ///
    /// # Errors
    ///
    /// Backend flush failures.
    async fn close(&self) -> Result<(), CacheError>;
}
