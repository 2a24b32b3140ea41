//! Change-feed filter strategies for the hot-data watcher.
//!
//! The watcher filters the feed as close to the server as the hot-set size
//! allows: a single id list while it fits one filter document, a batched
//! disjunction while it fits several, and operation-type-only filtering
//! (with client-side id checks) beyond that. The performance monitor moves
//! the document threshold when a strategy misbehaves.

use serde_json::Value;
use vellum_core::event::OperationType;

use crate::store::ChangeFilter;

/// Minimum time between strategy changes.
pub(crate) const STRATEGY_HYSTERESIS_MS: u64 = 300_000;

/// Server-filter pass ratio below which collection-level filtering is
/// considered wasteful.
pub(crate) const LOW_FILTER_RATIO: f64 = 0.1;

/// Ceiling for monitor-driven threshold growth.
pub(crate) const MAX_DOCUMENT_THRESHOLD: usize = 100_000;

/// How the hot set is expressed to the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStrategy {
    /// One server-side id list.
    DocumentSpecific,
    /// The id list split into batches, expressed as a disjunction to
    /// sidestep the server's filter-document size cap.
    BatchedDocument,
    /// Operation-type filter only; ids are checked client-side.
    CollectionLevel,
}

/// Active strategy plus the knobs it was derived from.
#[derive(Debug, Clone)]
pub(crate) struct StrategyState {
    pub strategy: FilterStrategy,
    pub document_threshold: usize,
    pub changed_at_ms: u64,
}

/// Picks the strategy for a hot set of `hot_len` ids.
pub(crate) fn select_strategy(
    hot_len: usize,
    document_threshold: usize,
    max_batch_size: usize,
) -> FilterStrategy {
    if hot_len > document_threshold {
        FilterStrategy::CollectionLevel
    } else if hot_len <= max_batch_size {
        FilterStrategy::DocumentSpecific
    } else {
        FilterStrategy::BatchedDocument
    }
}

/// Builds the server-side filter for the given strategy and id snapshot.
pub(crate) fn build_filter(
    strategy: FilterStrategy,
    ids: &[Value],
    max_batch_size: usize,
) -> ChangeFilter {
    let operations = OperationType::ALL.to_vec();
    let id_batches = match strategy {
        FilterStrategy::DocumentSpecific => Some(vec![ids.to_vec()]),
        FilterStrategy::BatchedDocument => Some(
            ids.chunks(max_batch_size.max(1))
                .map(<[Value]>::to_vec)
                .collect(),
        ),
        FilterStrategy::CollectionLevel => None,
    };
    ChangeFilter {
        operations,
        id_batches,
    }
}

/// Monitor decision: the new document threshold, if the observed window
/// calls for one.
///
/// High per-event latency halves the threshold (pushing the watcher toward
/// collection-level filtering sooner); a collection-level stream where
/// almost every event fails the client-side check doubles it (pulling
/// id-filtering back to the server).
pub(crate) fn adjusted_threshold(
    avg_processing_ms: f64,
    filter_ratio: f64,
    strategy: FilterStrategy,
    document_threshold: usize,
    max_event_processing_ms: u64,
) -> Option<usize> {
    // Threshold bounds keep the comparison in f64 exact.
    #[allow(clippy::cast_precision_loss)]
    let latency_bound = max_event_processing_ms as f64;
    if avg_processing_ms > latency_bound {
        let lowered = (document_threshold / 2).max(1);
        return (lowered != document_threshold).then_some(lowered);
    }
    if strategy == FilterStrategy::CollectionLevel && filter_ratio < LOW_FILTER_RATIO {
        let raised = document_threshold
            .saturating_mul(2)
            .min(MAX_DOCUMENT_THRESHOLD);
        return (raised != document_threshold).then_some(raised);
    }
    None
}
