//! Vellum engine — generic document storage with optimistic concurrency,
//! pluggable caching, change-stream broadcasting, and hot-data tracking.
//!
//! The engine sits above a document database (the [`DocumentStore`] seam)
//! and below application services. It guarantees that concurrent mutations
//! of a document either compose safely or are retried until they do, that
//! cached copies never lag the database after a local mutation, and that
//! watch subscribers receive ordered change notifications.
//!
//! Components:
//!
//! - [`cache`]: the [`DocumentCache`] contract and its in-memory, embedded
//!   persistent, and remote shared backends.
//! - [`tracker`]: recency+frequency access scoring with a bounded hot set.
//! - [`store`]: the backing-store seam and the in-memory reference store.
//! - [`engine`]: CRUD with version-based optimistic concurrency, retry
//!   policy, and subscriber fan-out.
//! - [`hot`]: the hot-data watcher keeping cache entries fresh for the
//!   most-accessed documents.
//! - [`options`] / [`error`]: configuration and the error taxonomy.
//!
//! The wrapping application owns process lifecycle and dependency
//! injection: it constructs the store and cache, hands them to
//! [`Engine::new`], and closes the caches itself after [`Engine::close`].

pub mod cache;
pub mod engine;
pub mod error;
pub mod hot;
pub mod options;
pub mod store;
pub mod tracker;

pub use cache::{
    CacheError, DocumentCache, MemoryCache, MemoryCacheConfig, PersistentCache,
    PersistentCacheConfig, RedisCache, RedisCacheConfig,
};
pub use engine::{Deleted, Engine, EventFilter, Updated, WatchSubscription};
pub use error::EngineError;
pub use hot::{FilterStrategy, HotWatcher};
pub use options::{CallOptions, HotOptions, Options, RetryParams};
pub use store::{
    ChangeFilter, ChangeStreamHandle, DocumentStore, MemoryStore, Query, UpdateCounts, Upserted,
    WatchOptions,
};
pub use tracker::AccessTracker;
