//! Subscriber registry and change-feed consumer.
//!
//! Subscribers live under monotonically increasing ids with bounded
//! delivery channels. Fan-out never blocks: a full subscriber loses the
//! event (logged and counted), a cancelled one is removed by its tracker
//! task. The feed consumer decodes raw store events, suppresses echoes of
//! mutations this engine already broadcast itself (those carried the diff),
//! and reopens the stream on error until the engine closes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vellum_core::document::Document;
use vellum_core::event::{OperationType, WatchEvent};

use crate::store::{ChangeFilter, DocumentStore, WatchOptions};

/// Per-subscriber delivery-channel capacity.
pub(crate) const SUBSCRIBER_CHANNEL_CAPACITY: usize = 100;

/// Bound on the echo-suppression set.
const RECENT_LOCAL_CAPACITY: usize = 1_024;

/// Version marker for delete echoes (delete feed events carry no
/// post-image to read a version from).
pub(crate) const DELETE_ECHO_VERSION: i64 = -1;

/// Backoff before reopening a failed change stream.
const REOPEN_DELAY_MS: u64 = 500;

/// Per-subscriber event filter.
#[derive(Clone)]
pub struct EventFilter<D: Document> {
    /// Operation whitelist. `None` = every operation.
    pub operations: Option<Vec<OperationType>>,
    /// Id whitelist. `None` = every document.
    pub ids: Option<HashSet<D::Id>>,
}

impl<D: Document> EventFilter<D> {
    /// Evaluates the filter against one decoded event.
    #[must_use]
    pub fn matches(&self, event: &WatchEvent<D>) -> bool {
        if let Some(operations) = &self.operations {
            if !operations.contains(&event.operation) {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        true
    }
}

impl<D: Document> fmt::Debug for EventFilter<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFilter")
            .field("operations", &self.operations)
            .field("ids", &self.ids.as_ref().map(HashSet::len))
            .finish()
    }
}

struct Subscriber<D: Document> {
    sender: mpsc::Sender<WatchEvent<D>>,
    token: CancellationToken,
    filter: Option<EventFilter<D>>,
}

/// A registered watch: the receiving half of a subscriber's channel.
pub struct WatchSubscription<D: Document> {
    id: u64,
    receiver: mpsc::Receiver<WatchEvent<D>>,
}

impl<D: Document> fmt::Debug for WatchSubscription<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchSubscription")
            .field("id", &self.id)
            .finish()
    }
}

impl<D: Document> WatchSubscription<D> {
    /// This subscriber's registry id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the subscriber was removed (its context
    /// completed or the engine closed).
    pub async fn next(&mut self) -> Option<WatchEvent<D>> {
        self.receiver.recv().await
    }
}

/// The engine's subscriber registry.
pub(crate) struct Subscribers<D: Document> {
    map: RwLock<HashMap<u64, Subscriber<D>>>,
    next_id: AtomicU64,
}

impl<D: Document> Subscribers<D> {
    pub(crate) fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a subscriber and returns its id and receiving half.
    pub(crate) fn register(
        &self,
        token: CancellationToken,
        filter: Option<EventFilter<D>>,
    ) -> (u64, WatchSubscription<D>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.map.write().insert(
            id,
            Subscriber {
                sender,
                token,
                filter,
            },
        );
        (id, WatchSubscription { id, receiver })
    }

    /// Removes one subscriber, cancelling its token and dropping its
    /// sender (which closes the channel).
    pub(crate) fn remove(&self, id: u64) {
        if let Some(subscriber) = self.map.write().remove(&id) {
            subscriber.token.cancel();
        }
    }

    /// Removes every subscriber (engine close).
    pub(crate) fn close_all(&self) {
        let mut map = self.map.write();
        for (_, subscriber) in map.drain() {
            subscriber.token.cancel();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Delivers one event to every matching subscriber without blocking.
    /// A full channel drops the event for that subscriber only.
    pub(crate) fn fan_out(&self, event: &WatchEvent<D>) {
        let map = self.map.read();
        for (id, subscriber) in map.iter() {
            if let Some(filter) = &subscriber.filter {
                if !filter.matches(event) {
                    continue;
                }
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    counter!("vellum_watch_events_dropped_total").increment(1);
                    tracing::error!(
                        subscriber = id,
                        "subscriber channel full; dropping change event"
                    );
                }
                // The receiver is gone; the tracker task will remove it.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

/// Bounded memory of recently self-broadcast `(id, version)` pairs, used
/// to suppress the change-feed echo of local mutations.
pub(crate) struct RecentLocal {
    order: VecDeque<(String, i64)>,
    set: HashSet<(String, i64)>,
}

impl RecentLocal {
    pub(crate) fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(RECENT_LOCAL_CAPACITY),
            set: HashSet::with_capacity(RECENT_LOCAL_CAPACITY),
        }
    }

    /// Remembers a locally broadcast mutation.
    pub(crate) fn mark(&mut self, id: String, version: i64) {
        let key = (id, version);
        if !self.set.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > RECENT_LOCAL_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }

    /// True (and forgets the entry) when the event is an echo of a local
    /// mutation.
    pub(crate) fn consume(&mut self, id: &str, version: i64) -> bool {
        let key = (id.to_string(), version);
        if self.set.remove(&key) {
            self.order.retain(|entry| *entry != key);
            return true;
        }
        false
    }
}

/// Runs the change-feed consumer until the engine shuts down.
///
/// Stream errors are internal: logged, followed by a reopen. Decode
/// failures skip the event.
pub(crate) async fn run_feed_consumer<D: Document>(
    store: Arc<dyn DocumentStore<D>>,
    subscribers: Arc<Subscribers<D>>,
    recent_local: Arc<Mutex<RecentLocal>>,
    filter: ChangeFilter,
    options: WatchOptions,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let mut stream = match store.watch(&filter, &options).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(error = %err, "failed to open change feed; retrying");
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(std::time::Duration::from_millis(REOPEN_DELAY_MS)) => continue,
                }
            }
        };
        tracing::debug!("change feed consumer started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    stream.close();
                    return;
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        process_feed_event(&subscribers, &recent_local, event);
                    }
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "change feed error; reopening");
                        break;
                    }
                    None => {
                        if shutdown.is_cancelled() {
                            return;
                        }
                        tracing::warn!("change feed ended; reopening");
                        break;
                    }
                },
            }
        }
    }
}

fn process_feed_event<D: Document>(
    subscribers: &Subscribers<D>,
    recent_local: &Mutex<RecentLocal>,
    event: vellum_core::event::ChangeEvent,
) {
    let id: D::Id = match serde_json::from_value(event.id.clone()) {
        Ok(id) => id,
        Err(err) => {
            tracing::warn!(error = %err, "change event carries an undecodable id; skipping");
            return;
        }
    };

    let document: Option<D> = match event.full_document {
        Some(raw) => match serde_json::from_value(raw) {
            Ok(document) => Some(document),
            Err(err) => {
                tracing::warn!(error = %err, "change event carries an undecodable document; skipping");
                return;
            }
        },
        None => None,
    };

    let echo_version = match event.operation {
        OperationType::Delete => DELETE_ECHO_VERSION,
        _ => document.as_ref().map_or(DELETE_ECHO_VERSION, Document::version),
    };
    if recent_local.lock().consume(&id.to_string(), echo_version) {
        return;
    }

    subscribers.fan_out(&WatchEvent {
        id,
        operation: event.operation,
        document,
        diff: None,
    });
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        id: String,
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

    fn update_event(id: &str) -> WatchEvent<Doc> {
        WatchEvent {
            id: id.to_string(),
            operation: OperationType::Update,
            document: Some(Doc {
                id: id.to_string(),
                version: 2,
            }),
            diff: None,
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_every_matching_subscriber() {
        let subscribers: Subscribers<Doc> = Subscribers::new();
        let (first_id, mut first) = subscribers.register(CancellationToken::new(), None);
        let (_, mut second) = subscribers.register(
            CancellationToken::new(),
            Some(EventFilter {
                operations: Some(vec![OperationType::Delete]),
                ids: None,
            }),
        );
        assert_eq!(first_id, 1);
        assert_eq!(subscribers.len(), 2);

        subscribers.fan_out(&update_event("a"));

        let received = first.next().await.unwrap();
        assert_eq!(received.id, "a");

        // The delete-only subscriber saw nothing.
        assert!(second.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_subscriber_drops_events_without_blocking() {
        let subscribers: Subscribers<Doc> = Subscribers::new();
        let (_, mut subscription) = subscribers.register(CancellationToken::new(), None);

        for _ in 0..(SUBSCRIBER_CHANNEL_CAPACITY + 10) {
            subscribers.fan_out(&update_event("a"));
        }

        let mut delivered = 0;
        while subscription.receiver.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, SUBSCRIBER_CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn remove_cancels_and_closes_the_channel() {
        let subscribers: Subscribers<Doc> = Subscribers::new();
        let token = CancellationToken::new();
        let (id, mut subscription) = subscribers.register(token.clone(), None);

        subscribers.remove(id);
        assert!(token.is_cancelled());
        assert!(subscription.next().await.is_none());
        assert_eq!(subscribers.len(), 0);
    }

    #[test]
    fn recent_local_marks_and_consumes_once() {
        let mut recent = RecentLocal::new();
        recent.mark("a".to_string(), 2);

        assert!(recent.consume("a", 2));
        assert!(!recent.consume("a", 2), "echo entries are one-shot");
        assert!(!recent.consume("a", 3));
        assert!(!recent.consume("b", 2));
    }

    #[test]
    fn recent_local_is_bounded() {
        let mut recent = RecentLocal::new();
        for i in 0..(RECENT_LOCAL_CAPACITY + 100) {
            recent.mark(format!("doc-{i}"), 1);
        }
        assert!(recent.set.len() <= RECENT_LOCAL_CAPACITY);
        // The oldest entries were evicted.
        assert!(!recent.consume("doc-0", 1));
        assert!(recent.consume(&format!("doc-{}", RECENT_LOCAL_CAPACITY + 99), 1));
    }

    #[test]
    fn event_filter_by_ids() {
        let filter: EventFilter<Doc> = EventFilter {
            operations: None,
            ids: Some(["a".to_string()].into_iter().collect()),
        };
        assert!(filter.matches(&update_event("a")));
        assert!(!filter.matches(&update_event("b")));
    }
}
