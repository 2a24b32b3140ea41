//! Engine configuration and per-call overrides.
//!
//! [`Options`] parameterizes every engine component: the version-field name
//! the optimistic protocol conditions on, retry/backoff/timeout bounds,
//! cache TTLs, change-feed settings, and the hot-data knobs. Durations are
//! expressed as `*_ms` millisecond fields where 0 means "disabled" or
//! "unbounded", matching the sentinel convention of the rest of the
//! configuration surface.

use crate::error::EngineError;
use crate::store::ChangeFilter;

/// Engine-level configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Serialized name of the document's version attribute. The conditional
    /// update predicate and the version bump both address this field.
    /// Must be non-empty.
    pub version_field: String,

    /// Maximum number of retries for a conflicting update. 0 = unbounded
    /// (bounded only by `operation_timeout_ms`).
    pub max_retries: u32,
    /// Initial retry backoff in milliseconds. Doubles per attempt.
    pub retry_delay_ms: u64,
    /// Upper bound for the retry backoff in milliseconds.
    pub max_retry_delay_ms: u64,
    /// Jitter fraction (0.0–1.0) applied to each backoff delay.
    pub retry_jitter: f64,
    /// Total time budget for one operation, retries included.
    /// 0 = no timeout.
    pub operation_timeout_ms: u64,

    /// TTL for cache entries written by the engine. 0 = backend default.
    pub cache_ttl_ms: u64,
    /// Whether `find_many` results populate the cache.
    pub cache_query_results: bool,

    /// Whether the change broadcaster runs and `watch` is available.
    pub watch_enabled: bool,
    /// Optional server-side filter for the broadcaster's change feed.
    pub watch_filter: Option<ChangeFilter>,
    /// Whether the feed is opened with full-document lookup.
    pub watch_full_document_lookup: bool,
    /// Maximum time the feed may hold a poll open, in milliseconds.
    pub watch_max_await_time_ms: u64,
    /// Feed batch size.
    pub watch_batch_size: u32,

    /// Hot-data tracking and watching knobs.
    pub hot: HotOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            version_field: "version".to_string(),
            max_retries: 0,
            retry_delay_ms: 100,
            max_retry_delay_ms: 2_000,
            retry_jitter: 0.1,
            operation_timeout_ms: 30_000,
            cache_ttl_ms: 86_400_000,
            cache_query_results: false,
            watch_enabled: true,
            watch_filter: None,
            watch_full_document_lookup: true,
            watch_max_await_time_ms: 1_000,
            watch_batch_size: 100,
            hot: HotOptions::default(),
        }
    }
}

impl Options {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// [`EngineError::MissingVersionField`] when `version_field` is empty.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.version_field.is_empty() {
            return Err(EngineError::MissingVersionField);
        }
        Ok(())
    }

    /// Resolves the retry/timeout parameters for one call, applying the
    /// per-call overrides where present.
    #[must_use]
    pub fn retry_params(&self, call: Option<&CallOptions>) -> RetryParams {
        let pick_u64 = |field: Option<u64>, default: u64| field.unwrap_or(default);
        let call = call.cloned().unwrap_or_default();
        RetryParams {
            max_retries: call.max_retries.unwrap_or(self.max_retries),
            retry_delay_ms: pick_u64(call.retry_delay_ms, self.retry_delay_ms),
            max_retry_delay_ms: pick_u64(call.max_retry_delay_ms, self.max_retry_delay_ms),
            retry_jitter: call.retry_jitter.unwrap_or(self.retry_jitter).clamp(0.0, 1.0),
            timeout_ms: pick_u64(call.timeout_ms, self.operation_timeout_ms),
        }
    }
}

/// Per-call overrides for the retry/timeout parameters.
///
/// Every field defaults to "inherit from [`Options`]".
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Override for [`Options::max_retries`].
    pub max_retries: Option<u32>,
    /// Override for [`Options::retry_delay_ms`].
    pub retry_delay_ms: Option<u64>,
    /// Override for [`Options::max_retry_delay_ms`].
    pub max_retry_delay_ms: Option<u64>,
    /// Override for [`Options::retry_jitter`].
    pub retry_jitter: Option<f64>,
    /// Override for [`Options::operation_timeout_ms`].
    pub timeout_ms: Option<u64>,
}

/// Effective retry/timeout parameters for one call.
#[derive(Debug, Clone, Copy)]
pub struct RetryParams {
    /// Retry budget. 0 = unbounded.
    pub max_retries: u32,
    /// Initial backoff in milliseconds.
    pub retry_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_retry_delay_ms: u64,
    /// Jitter fraction, clamped to 0.0–1.0.
    pub retry_jitter: f64,
    /// Operation time budget in milliseconds. 0 = no timeout.
    pub timeout_ms: u64,
}

/// Hot-data tracker and watcher configuration.
#[derive(Debug, Clone)]
pub struct HotOptions {
    /// Bound on the hot set.
    pub max_hot_items: usize,
    /// Multiplier applied to every score on decay (0 < f < 1).
    pub decay_factor: f64,
    /// Interval between hot-set snapshots driving the stream filter.
    pub watch_interval_ms: u64,
    /// Interval between tracker decays.
    pub decay_interval_ms: u64,
    /// Hot-set size above which the watcher filters at collection level.
    pub document_threshold: usize,
    /// Largest id batch expressible in a single server-side filter document.
    pub max_batch_size: usize,
    /// Average per-event processing time above which the monitor reacts,
    /// in milliseconds.
    pub max_event_processing_ms: u64,
    /// Interval between performance-monitor evaluations.
    pub perf_interval_ms: u64,
    /// Whether the performance monitor runs.
    pub monitor_enabled: bool,
}

impl Default for HotOptions {
    fn default() -> Self {
        Self {
            max_hot_items: 100,
            decay_factor: 0.95,
            watch_interval_ms: 300_000,
            decay_interval_ms: 3_600_000,
            document_threshold: 100,
            max_batch_size: 1_000,
            max_event_processing_ms: 100,
            perf_interval_ms: 60_000,
            monitor_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_contract() {
        let options = Options::default();
        assert_eq!(options.version_field, "version");
        assert_eq!(options.max_retries, 0);
        assert_eq!(options.retry_delay_ms, 100);
        assert_eq!(options.max_retry_delay_ms, 2_000);
        assert!((options.retry_jitter - 0.1).abs() < f64::EPSILON);
        assert_eq!(options.operation_timeout_ms, 30_000);
        assert_eq!(options.cache_ttl_ms, 86_400_000);
        assert!(options.watch_enabled);
        assert_eq!(options.watch_max_await_time_ms, 1_000);
        assert_eq!(options.watch_batch_size, 100);

        let hot = options.hot;
        assert_eq!(hot.max_hot_items, 100);
        assert!((hot.decay_factor - 0.95).abs() < f64::EPSILON);
        assert_eq!(hot.watch_interval_ms, 300_000);
        assert_eq!(hot.decay_interval_ms, 3_600_000);
        assert_eq!(hot.document_threshold, 100);
        assert_eq!(hot.max_batch_size, 1_000);
        assert_eq!(hot.max_event_processing_ms, 100);
    }

    #[test]
    fn empty_version_field_fails_validation() {
        let options = Options {
            version_field: String::new(),
            ..Options::default()
        };
        assert!(matches!(
            options.validate(),
            Err(EngineError::MissingVersionField)
        ));
        assert!(Options::default().validate().is_ok());
    }

    #[test]
    fn call_options_override_engine_defaults() {
        let options = Options::default();
        let call = CallOptions {
            max_retries: Some(3),
            timeout_ms: Some(50),
            ..CallOptions::default()
        };

        let params = options.retry_params(Some(&call));
        assert_eq!(params.max_retries, 3);
        assert_eq!(params.timeout_ms, 50);
        // Unspecified fields inherit.
        assert_eq!(params.retry_delay_ms, 100);
        assert_eq!(params.max_retry_delay_ms, 2_000);
    }

    #[test]
    fn absent_call_options_inherit_everything() {
        let params = Options::default().retry_params(None);
        assert_eq!(params.max_retries, 0);
        assert_eq!(params.timeout_ms, 30_000);
    }

    #[test]
    fn jitter_is_clamped_to_unit_interval() {
        let call = CallOptions {
            retry_jitter: Some(7.5),
            ..CallOptions::default()
        };
        let params = Options::default().retry_params(Some(&call));
        assert!((params.retry_jitter - 1.0).abs() < f64::EPSILON);
    }
}
