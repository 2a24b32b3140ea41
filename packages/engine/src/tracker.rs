//! Access tracker: recency+frequency scoring with a bounded hot set.
//!
//! Every document access is scored as
//! `count / secs_since_first_seen × exp(-secs_idle / τ)`: frequent recent
//! access scores high, a burst long ago decays away. The hot set is an
//! indexed binary min-heap bounded to `max_hot_items`: the root is the
//! coldest hot record, and a record outside the heap displaces the root
//! once its score exceeds it. Ties compare `first_seen`; the older record
//! loses.
//!
//! All writes are serialized by a single mutex. Periodic [`AccessTracker::
//! decay`] multiplies every score by the decay factor, purges records below
//! the floor, and rebuilds the heap from the survivors.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use vellum_core::clock::{ClockSource, SystemClock};

/// Records with a score below this are purged on decay.
const SCORE_FLOOR: f64 = 0.01;

/// Recency time constant in seconds: an hour of silence costs ~63% of a
/// record's score at its next access.
const RECENCY_TAU_SECS: f64 = 3600.0;

/// One tracked record.
#[derive(Debug, Clone)]
struct AccessRecord {
    count: u64,
    first_seen_ms: u64,
    last_seen_ms: u64,
    score: f64,
}

impl AccessRecord {
    fn compute_score(count: u64, first_seen_ms: u64, idle_ms: u64, now_ms: u64) -> f64 {
        // Precision loss is irrelevant at score magnitudes.
        #[allow(clippy::cast_precision_loss)]
        let age_secs = ((now_ms.saturating_sub(first_seen_ms)) / 1_000).max(1) as f64;
        #[allow(clippy::cast_precision_loss)]
        let idle_secs = (idle_ms / 1_000) as f64;
        #[allow(clippy::cast_precision_loss)]
        let frequency = count as f64 / age_secs;
        frequency * (-idle_secs / RECENCY_TAU_SECS).exp()
    }
}

struct Inner<K> {
    records: HashMap<K, AccessRecord>,
    /// Min-heap of hot ids ordered by (score, first_seen).
    heap: Vec<K>,
    /// Id -> heap slot, for O(log n) repositioning.
    positions: HashMap<K, usize>,
}

/// Scores document accesses and exposes a bounded hot set.
pub struct AccessTracker<K> {
    inner: Mutex<Inner<K>>,
    clock: Arc<dyn ClockSource>,
    closed: AtomicBool,
    max_hot_items: usize,
    decay_factor: f64,
}

impl<K> AccessTracker<K>
where
    K: Clone + Eq + Hash + Send,
{
    /// Creates a tracker with the real system clock.
    #[must_use]
    pub fn new(max_hot_items: usize, decay_factor: f64) -> Self {
        Self::with_clock(max_hot_items, decay_factor, Arc::new(SystemClock))
    }

    /// Creates a tracker with an injected clock (deterministic tests).
    #[must_use]
    pub fn with_clock(
        max_hot_items: usize,
        decay_factor: f64,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                heap: Vec::new(),
                positions: HashMap::new(),
            }),
            clock,
            closed: AtomicBool::new(false),
            max_hot_items,
            decay_factor: decay_factor.clamp(f64::MIN_POSITIVE, 1.0),
        }
    }

    /// Records one access to `id`, rescoring and repositioning it.
    pub fn record_access(&self, id: &K) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let now_ms = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let record = inner.records.entry(id.clone()).or_insert(AccessRecord {
            count: 0,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            score: 0.0,
        });
        record.count += 1;
        // The recency term uses the idle gap before this access; the access
        // itself then refreshes last_seen.
        let idle_ms = now_ms.saturating_sub(record.last_seen_ms);
        record.score =
            AccessRecord::compute_score(record.count, record.first_seen_ms, idle_ms, now_ms);
        record.last_seen_ms = now_ms;

        if let Some(&slot) = inner.positions.get(id) {
            let slot = sift_up(&inner.records, &mut inner.heap, &mut inner.positions, slot);
            sift_down(&inner.records, &mut inner.heap, &mut inner.positions, slot);
        } else if inner.heap.len() < self.max_hot_items {
            heap_push(&inner.records, &mut inner.heap, &mut inner.positions, id.clone());
        } else if !inner.heap.is_empty() {
            let root = inner.heap[0].clone();
            if record_less(&inner.records, &root, id) {
                heap_pop_root(&inner.records, &mut inner.heap, &mut inner.positions);
                heap_push(&inner.records, &mut inner.heap, &mut inner.positions, id.clone());
            }
        }
    }

    /// The current hot set, highest score first.
    #[must_use]
    pub fn hot_items(&self) -> Vec<K> {
        let inner = self.inner.lock();
        let mut ids: Vec<K> = inner.heap.clone();
        ids.sort_by(|a, b| {
            // Descending score, newest first on ties.
            if record_less(&inner.records, a, b) {
                std::cmp::Ordering::Greater
            } else if record_less(&inner.records, b, a) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        });
        ids
    }

    /// True when `id` is currently in the hot set.
    #[must_use]
    pub fn is_hot(&self, id: &K) -> bool {
        self.inner.lock().positions.contains_key(id)
    }

    /// Number of records currently tracked (hot or not).
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Multiplies every score by the decay factor, purges records below the
    /// floor, and rebuilds the heap from the survivors.
    pub fn decay(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        for record in inner.records.values_mut() {
            record.score *= self.decay_factor;
        }
        let before = inner.records.len();
        inner.records.retain(|_, record| record.score >= SCORE_FLOOR);
        let purged = before - inner.records.len();
        if purged > 0 {
            tracing::debug!(purged, "access tracker purged cold records");
        }

        // Rebuild: the top max_hot_items survivors re-form the heap.
        let mut survivors: Vec<K> = inner.records.keys().cloned().collect();
        survivors.sort_by(|a, b| {
            if record_less(&inner.records, a, b) {
                std::cmp::Ordering::Greater
            } else if record_less(&inner.records, b, a) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        });
        survivors.truncate(self.max_hot_items);

        inner.heap.clear();
        inner.positions.clear();
        for id in survivors {
            heap_push(&inner.records, &mut inner.heap, &mut inner.positions, id);
        }
    }

    /// Stops the tracker: subsequent operations are no-ops and the hot set
    /// reads empty.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut inner = self.inner.lock();
        inner.records.clear();
        inner.heap.clear();
        inner.positions.clear();
    }
}

/// Min-heap order: lower score first; on equal scores the older record
/// (smaller `first_seen`) orders first, so it is the one displaced.
fn record_less<K: Eq + Hash>(records: &HashMap<K, AccessRecord>, a: &K, b: &K) -> bool {
    let ra = &records[a];
    let rb = &records[b];
    match ra.score.partial_cmp(&rb.score) {
        Some(std::cmp::Ordering::Less) => true,
        Some(std::cmp::Ordering::Greater) => false,
        _ => ra.first_seen_ms < rb.first_seen_ms,
    }
}

fn heap_push<K: Clone + Eq + Hash>(
    records: &HashMap<K, AccessRecord>,
    heap: &mut Vec<K>,
    positions: &mut HashMap<K, usize>,
    id: K,
) {
    heap.push(id.clone());
    let slot = heap.len() - 1;
    positions.insert(id, slot);
    sift_up(records, heap, positions, slot);
}

fn heap_pop_root<K: Clone + Eq + Hash>(
    records: &HashMap<K, AccessRecord>,
    heap: &mut Vec<K>,
    positions: &mut HashMap<K, usize>,
) {
    if heap.is_empty() {
        return;
    }
    let last = heap.len() - 1;
    heap.swap(0, last);
    let removed = heap.pop().expect("heap is non-empty");
    positions.remove(&removed);
    if !heap.is_empty() {
        positions.insert(heap[0].clone(), 0);
        sift_down(records, heap, positions, 0);
    }
}

fn sift_up<K: Clone + Eq + Hash>(
    records: &HashMap<K, AccessRecord>,
    heap: &mut [K],
    positions: &mut HashMap<K, usize>,
    mut slot: usize,
) -> usize {
    while slot > 0 {
        let parent = (slot - 1) / 2;
        if record_less(records, &heap[slot], &heap[parent]) {
            heap.swap(slot, parent);
            positions.insert(heap[slot].clone(), slot);
            positions.insert(heap[parent].clone(), parent);
            slot = parent;
        } else {
            break;
        }
    }
    slot
}

fn sift_down<K: Clone + Eq + Hash>(
    records: &HashMap<K, AccessRecord>,
    heap: &mut [K],
    positions: &mut HashMap<K, usize>,
    mut slot: usize,
) {
    loop {
        let left = 2 * slot + 1;
        let right = 2 * slot + 2;
        let mut smallest = slot;
        if left < heap.len() && record_less(records, &heap[left], &heap[smallest]) {
            smallest = left;
        }
        if right < heap.len() && record_less(records, &heap[right], &heap[smallest]) {
            smallest = right;
        }
        if smallest == slot {
            break;
        }
        heap.swap(slot, smallest);
        positions.insert(heap[slot].clone(), slot);
        positions.insert(heap[smallest].clone(), smallest);
        slot = smallest;
    }
}
