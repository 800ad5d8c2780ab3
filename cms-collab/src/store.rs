//! Queue map and sync orchestrator.
//!
//! ```text
//!  TimelineHandle ─┐                        ┌──► Transport::mutate(doc A)
//!  TimelineHandle ─┼─► CollabStore ── sync ─┼──► Transport::mutate(doc B)
//!  TimelineHandle ─┘    │                   └──► ...
//!                       ├── timelines: id ─► (Timeline, refcount)
//!                       └── queue map: (id, key) ─► Queue with pending
//! ```
//!
//! A queue joins the map the first time it accumulates pending edits and
//! leaves it once a sync drains it. `sync` collects the unsent pending of
//! every mapped queue, sends one request per document (documents in
//! parallel), and applies the verdicts. A single outbound lock keeps at most
//! one sync in flight, so edits of one document reach the server in push
//! order.

use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::listeners::{lock, Subscription};
use crate::protocol::{EntityId, MutationOutcome, MutationRequest, ProtocolError};
use crate::queue::{Batch, Queue};
use crate::timeline::{StaleEvent, Timeline};
use crate::transport::{Transport, TransportError};

/// Outcome of one [`CollabStore::sync`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Skipped: a non-forced call inside the throttle window.
    pub throttled: bool,
    /// Documents a request was sent for.
    pub documents: usize,
    /// Items confirmed by the server.
    pub accepted: usize,
    /// Items rejected as stale.
    pub stale: usize,
    /// Verdicts dropped because their queue was purged or reset meanwhile.
    pub discarded: usize,
}

impl SyncReport {
    fn throttled() -> Self {
        Self {
            throttled: true,
            ..Self::default()
        }
    }

    /// Nothing was pending.
    pub fn is_idle(&self) -> bool {
        !self.throttled && self.documents == 0
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// At least one document request failed. Its pending edits are intact
    /// and go out again with the next sync.
    #[error("sync failed for {failed} document(s), first {document}: {source}")]
    Transport {
        document: EntityId,
        source: TransportError,
        failed: usize,
        /// What the requests that did succeed achieved.
        partial: SyncReport,
    },
    #[error("sync driver stopped unexpectedly")]
    DriverStopped,
}

/// Host lifecycle signals that force a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    BeforeUnload,
    VisibilityHidden,
    Publish,
}

struct TimelineSlot {
    timeline: Timeline,
    refs: usize,
    _mutations: Subscription,
}

struct StoreInner {
    user: Uuid,
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    timelines: Mutex<HashMap<EntityId, TimelineSlot>>,
    queues: Mutex<BTreeMap<(EntityId, String), Queue>>,
    last_sync: Mutex<Option<Instant>>,
    outbound: tokio::sync::Mutex<()>,
}

/// Result of one document request, before it is folded into the report.
struct DocumentResult {
    document: EntityId,
    report: SyncReport,
    error: Option<TransportError>,
}

impl StoreInner {
    fn register_queue(&self, queue: &Queue) {
        if queue.is_detached() {
            return;
        }
        let mut queues = lock(&self.queues);
        let slot = queues
            .entry((queue.document().clone(), queue.key().to_string()))
            .or_insert_with(|| queue.clone());
        if !slot.same_queue(queue) {
            *slot = queue.clone();
        }
    }

    fn live_timeline(&self, document: &EntityId) -> Option<Timeline> {
        lock(&self.timelines).get(document).map(|slot| slot.timeline.clone())
    }

    fn acquire(self: &Arc<Self>, id: EntityId) -> Timeline {
        let mut timelines = lock(&self.timelines);
        if let Some(slot) = timelines.get_mut(&id) {
            slot.refs += 1;
            return slot.timeline.clone();
        }

        let timeline = Timeline::new(id.clone(), self.config.clone());
        let weak: Weak<StoreInner> = Arc::downgrade(self);
        let mutations = timeline.register_mutation_listener(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.register_queue(&event.queue);
            }
        });
        timelines.insert(
            id.clone(),
            TimelineSlot {
                timeline: timeline.clone(),
                refs: 1,
                _mutations: mutations,
            },
        );
        log::debug!("Opened timeline {id}");
        timeline
    }

    fn release(&self, timeline: &Timeline) {
        let removed = {
            let mut timelines = lock(&self.timelines);
            let last = match timelines.get_mut(timeline.id()) {
                Some(slot) if slot.timeline.same_timeline(timeline) => {
                    slot.refs -= 1;
                    slot.refs == 0
                }
                _ => false,
            };
            if last {
                timelines.remove(timeline.id())
            } else {
                None
            }
        };

        if let Some(slot) = removed {
            slot.timeline.purge();
            lock(&self.queues).retain(|_, queue| !queue.is_detached());
            log::debug!("Closed timeline {}", slot.timeline.id());
        }
    }

    /// Start a sync unless throttled. Returns `false` when throttled.
    fn begin(&self, force: bool) -> bool {
        let mut last = lock(&self.last_sync);
        let now = Instant::now();
        if !force {
            if let Some(at) = *last {
                if now.duration_since(at) < self.config.throttle() {
                    return false;
                }
            }
        }
        *last = Some(now);
        true
    }

    /// Take a batch from every mapped queue whose timeline can sync.
    fn collect(&self) -> BTreeMap<EntityId, Vec<(Queue, Batch)>> {
        let queues: Vec<Queue> = {
            let mut queues = lock(&self.queues);
            queues.retain(|_, queue| !queue.is_detached());
            queues.values().cloned().collect()
        };

        let mut batches: BTreeMap<EntityId, Vec<(Queue, Batch)>> = BTreeMap::new();
        for queue in queues {
            match self.live_timeline(queue.document()) {
                Some(timeline) if timeline.is_stale() => {
                    log::trace!("Skipping {}/{}: timeline is stale", queue.document(), queue.key());
                    continue;
                }
                Some(_) => {}
                None => continue,
            }
            if let Some(batch) = queue.take_batch() {
                batches.entry(queue.document().clone()).or_default().push((queue, batch));
            }
        }
        batches
    }

    async fn send(&self, document: EntityId, batches: Vec<(Queue, Batch)>) -> DocumentResult {
        let request = MutationRequest {
            document: document.clone(),
            user: self.user,
            items: batches.iter().map(|(_, batch)| batch.item.clone()).collect(),
        };
        log::debug!(
            "Sending {} transactions in {} items for {document}",
            request.transaction_count(),
            request.items.len()
        );

        let mut report = SyncReport {
            documents: 1,
            ..SyncReport::default()
        };

        let response = match self.transport.mutate(request).await {
            Ok(response) if response.results.len() == batches.len() => response,
            Ok(response) => {
                let error = TransportError::Protocol(ProtocolError::MismatchedResults {
                    expected: batches.len(),
                    got: response.results.len(),
                });
                return self.fail(document, batches, report, error);
            }
            Err(error) => return self.fail(document, batches, report, error),
        };

        // Accepted items are confirmed before any stale listener runs.
        let mut rejected = None;
        for ((queue, batch), outcome) in batches.into_iter().zip(response.results) {
            if queue.is_detached() {
                report.discarded += 1;
                continue;
            }
            match outcome {
                MutationOutcome::Accepted { version, missed } => {
                    if queue.confirm(&batch, version, missed, self.user) {
                        report.accepted += 1;
                    } else {
                        report.discarded += 1;
                    }
                }
                MutationOutcome::Stale { current } => {
                    queue.release(batch.epoch);
                    report.stale += 1;
                    rejected.get_or_insert(StaleEvent {
                        document: document.clone(),
                        key: queue.key().to_string(),
                        current,
                    });
                }
            }
        }

        if let Some(event) = rejected {
            if let Some(timeline) = self.live_timeline(&document) {
                timeline.mark_stale(event);
            }
        }

        DocumentResult {
            document,
            report,
            error: None,
        }
    }

    fn fail(
        &self,
        document: EntityId,
        batches: Vec<(Queue, Batch)>,
        report: SyncReport,
        error: TransportError,
    ) -> DocumentResult {
        log::warn!("Sync of {document} failed, keeping {} items pending: {error}", batches.len());
        for (queue, batch) in &batches {
            queue.release(batch.epoch);
        }
        DocumentResult {
            document,
            report,
            error: Some(error),
        }
    }
}

/// Explicitly constructed owner of every open timeline and of the sync
/// channel to the server. Cheap to clone.
#[derive(Clone)]
pub struct CollabStore {
    inner: Arc<StoreInner>,
}

impl CollabStore {
    pub fn new(user: Uuid, transport: impl Transport + 'static, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                user,
                config,
                transport: Arc::new(transport),
                timelines: Mutex::new(HashMap::new()),
                queues: Mutex::new(BTreeMap::new()),
                last_sync: Mutex::new(None),
                outbound: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn user(&self) -> Uuid {
        self.inner.user
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Open (or share) the timeline for `id`.
    ///
    /// The timeline lives as long as any handle to it. Dropping the last
    /// handle purges it: its queues leave the queue map and responses still
    /// in flight for them are discarded.
    pub fn timeline(&self, id: impl Into<EntityId>) -> TimelineHandle {
        let timeline = self.inner.acquire(id.into());
        TimelineHandle {
            store: self.inner.clone(),
            timeline,
        }
    }

    pub fn is_open(&self, id: &EntityId) -> bool {
        lock(&self.inner.timelines).contains_key(id)
    }

    pub fn open_timelines(&self) -> usize {
        lock(&self.inner.timelines).len()
    }

    /// Queues currently waiting to sync.
    pub fn registered_queues(&self) -> Vec<Queue> {
        lock(&self.inner.queues).values().cloned().collect()
    }

    pub fn registered_queue_count(&self) -> usize {
        lock(&self.inner.queues).len()
    }

    /// Send every pending edit.
    ///
    /// A non-forced call within the throttle window of the previous sync
    /// does nothing. Requests for different documents run concurrently.
    /// On failure the affected pending edits stay queued.
    pub async fn sync(&self, force: bool) -> Result<SyncReport, SyncError> {
        let _outbound = self.inner.outbound.lock().await;
        if !self.inner.begin(force) {
            log::trace!("Sync throttled");
            return Ok(SyncReport::throttled());
        }

        let batches = self.inner.collect();
        if batches.is_empty() {
            return Ok(SyncReport::default());
        }

        let results = join_all(
            batches
                .into_iter()
                .map(|(document, batches)| self.inner.send(document, batches)),
        )
        .await;

        lock(&self.inner.queues).retain(|_, queue| queue.has_pending() && !queue.is_detached());

        let mut report = SyncReport::default();
        let mut failures = Vec::new();
        for result in results {
            report.documents += result.report.documents;
            report.accepted += result.report.accepted;
            report.stale += result.report.stale;
            report.discarded += result.report.discarded;
            if let Some(error) = result.error {
                failures.push((result.document, error));
            }
        }

        let failed = failures.len();
        match failures.into_iter().next() {
            Some((document, source)) => Err(SyncError::Transport {
                document,
                source,
                failed,
                partial: report,
            }),
            None => {
                log::debug!(
                    "Synced {} documents: {} accepted, {} stale",
                    report.documents,
                    report.accepted,
                    report.stale
                );
                Ok(report)
            }
        }
    }

    /// Run syncs in the background until the returned driver is shut down.
    ///
    /// The driver syncs every `sync_interval` (throttled), retries every
    /// `retry_interval` after a failure until a sync succeeds, and forces a
    /// sync on every [`LifecycleEvent`]. Must be called inside a tokio
    /// runtime.
    pub fn sync_on_interval(&self) -> SyncDriver {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(drive(self.clone(), lifecycle_rx, shutdown_rx));
        SyncDriver {
            lifecycle: lifecycle_tx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

async fn drive(
    store: CollabStore,
    mut lifecycle: mpsc::UnboundedReceiver<LifecycleEvent>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<SyncReport, SyncError> {
    let config = store.config().clone();
    let period = config.sync_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut retry_at: Option<Instant> = None;

    loop {
        let retry = async move {
            match retry_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        let result = tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => store.sync(false).await,
            _ = retry => {
                log::debug!("Retrying failed sync");
                store.sync(true).await
            }
            event = lifecycle.recv() => match event {
                Some(event) => {
                    log::debug!("Forced sync on {event:?}");
                    store.sync(true).await
                }
                None => break,
            },
        };

        match result {
            Ok(report) if report.throttled => {}
            Ok(_) => {
                if retry_at.take().is_some() {
                    log::info!("Sync recovered");
                }
            }
            Err(e) => {
                log::warn!("{e}; retrying in {:?}", config.retry_interval());
                retry_at = Some(Instant::now() + config.retry_interval());
            }
        }
    }

    log::debug!("Sync driver stopping, flushing pending edits");
    store.sync(true).await
}

/// Handle to the background sync task.
///
/// Dropping it aborts the task without a final sync; call
/// [`SyncDriver::shutdown`] to flush first.
pub struct SyncDriver {
    lifecycle: mpsc::UnboundedSender<LifecycleEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<SyncReport, SyncError>>>,
}

impl SyncDriver {
    /// Force a sync for a host lifecycle event.
    pub fn notify(&self, event: LifecycleEvent) {
        if self.lifecycle.send(event).is_err() {
            log::debug!("Sync driver already stopped, dropping {event:?}");
        }
    }

    /// Sender for wiring host lifecycle hooks.
    pub fn lifecycle(&self) -> mpsc::UnboundedSender<LifecycleEvent> {
        self.lifecycle.clone()
    }

    /// Stop the task after one last forced sync, returning its result.
    pub async fn shutdown(mut self) -> Result<SyncReport, SyncError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match self.task.take() {
            Some(task) => task.await.map_err(|e| {
                log::error!("Sync driver task failed: {e}");
                SyncError::DriverStopped
            })?,
            None => Err(SyncError::DriverStopped),
        }
    }
}

impl Drop for SyncDriver {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Counted reference to an open timeline. Clone to share, drop to release.
pub struct TimelineHandle {
    store: Arc<StoreInner>,
    timeline: Timeline,
}

impl TimelineHandle {
    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }
}

impl Deref for TimelineHandle {
    type Target = Timeline;

    fn deref(&self) -> &Timeline {
        &self.timeline
    }
}

impl Clone for TimelineHandle {
    fn clone(&self) -> Self {
        let timeline = self.store.acquire(self.timeline.id().clone());
        Self {
            store: self.store.clone(),
            timeline,
        }
    }
}

impl Drop for TimelineHandle {
    fn drop(&mut self) {
        self.store.release(&self.timeline);
    }
}

impl std::fmt::Debug for TimelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TimelineHandle").field(&self.timeline).finish()
    }
}

impl std::fmt::Debug for CollabStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabStore")
            .field("user", &self.inner.user)
            .field("timelines", &self.open_timelines())
            .field("queues", &self.registered_queue_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{Operation, Transaction};
    use crate::protocol::TimelineSnapshot;
    use crate::transport::MemoryServer;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn store(server: &MemoryServer) -> CollabStore {
        CollabStore::new(Uuid::new_v4(), server.clone(), SyncConfig::for_testing())
    }

    fn insert(ch: &str) -> Transaction {
        Transaction::single("", Operation::insert(0, vec![json!(ch)]))
    }

    #[tokio::test]
    async fn test_queue_registers_on_push_and_leaves_after_sync() {
        let server = MemoryServer::new();
        let store = store(&server);
        let doc = store.timeline("doc");
        let queue = doc.get_queue("config");
        assert_eq!(store.registered_queue_count(), 0);

        queue.push(insert("a"));
        assert_eq!(store.registered_queue_count(), 1);

        let report = store.sync(true).await.unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(store.registered_queue_count(), 0);
        assert!(!queue.has_pending());
        assert_eq!(queue.version().count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unforced_sync_is_throttled() {
        let server = MemoryServer::new();
        let store = store(&server);
        let doc = store.timeline("doc");

        doc.get_queue("config").push(insert("a"));
        assert_eq!(store.sync(false).await.unwrap().accepted, 1);

        doc.get_queue("config").push(insert("b"));
        assert!(store.sync(false).await.unwrap().throttled);
        assert!(!store.sync(true).await.unwrap().throttled);

        doc.get_queue("config").push(insert("c"));
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(store.sync(false).await.unwrap().accepted, 1);
        assert_eq!(server.request_count(), 3);
    }

    #[tokio::test]
    async fn test_idle_sync_sends_nothing() {
        let server = MemoryServer::new();
        let store = store(&server);
        let _doc = store.timeline("doc");
        assert!(store.sync(true).await.unwrap().is_idle());
        assert_eq!(server.request_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_sync_keeps_pending() {
        let server = MemoryServer::new();
        let store = store(&server);
        let doc = store.timeline("doc");
        let queue = doc.get_queue("config");
        queue.push(insert("a"));

        server.set_offline(true);
        let err = store.sync(true).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport { failed: 1, .. }));
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(store.registered_queue_count(), 1);

        server.set_offline(false);
        assert_eq!(store.sync(true).await.unwrap().accepted, 1);
        assert!(!queue.has_pending());
    }

    #[tokio::test]
    async fn test_one_request_per_document() {
        let server = MemoryServer::new();
        let store = store(&server);
        let a = store.timeline("a");
        let b = store.timeline("b");
        a.get_queue("config").push(insert("x"));
        a.get_queue("labels").push(Transaction::single("", Operation::toggle("draft", true)));
        b.get_queue("config").push(insert("y"));

        let report = store.sync(true).await.unwrap();
        assert_eq!(report.documents, 2);
        assert_eq!(report.accepted, 3);
        assert_eq!(server.request_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_response_marks_timeline_and_pauses_it() {
        let server = MemoryServer::new();
        let store = store(&server);
        let doc = store.timeline("doc");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let _sub = doc.register_stale_listener(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        server.append(&EntityId::from("doc"), "config", Uuid::new_v4(), vec![insert("remote")]);
        let queue = doc.get_queue("config");
        queue.push(insert("local"));

        let report = store.sync(true).await.unwrap();
        assert_eq!(report.stale, 1);
        assert!(doc.is_stale());
        assert_eq!(queue.pending_len(), 1);

        // Stale timelines are left alone until re-initialized.
        let report = store.sync(true).await.unwrap();
        assert!(report.is_idle());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        doc.initialize(server.fetch(&EntityId::from("doc")));
        assert!(!doc.is_stale());
        assert_eq!(store.sync(true).await.unwrap().accepted, 1);
        assert_eq!(queue.version().count, 2);
    }

    #[tokio::test]
    async fn test_accepted_key_confirms_before_stale_refetch() {
        let server = MemoryServer::new();
        let store = store(&server);
        let doc = store.timeline("doc");
        let id = EntityId::from("doc");
        let _sub = {
            let server = server.clone();
            let timeline = doc.timeline().clone();
            doc.register_stale_listener(move |event| {
                timeline.initialize(server.fetch(&event.document));
            })
        };

        server.append(&id, "config", Uuid::new_v4(), vec![insert("remote")]);
        doc.get_queue("config").push(insert("local"));
        let labels = doc.get_queue("labels");
        labels.push(Transaction::single("", Operation::toggle("draft", true)));

        // One request: "config" is rejected, "labels" is accepted.
        let report = store.sync(true).await.unwrap();
        assert_eq!((report.accepted, report.stale, report.discarded), (1, 1, 0));
        assert!(!labels.has_pending());
        assert!(!doc.is_stale());

        let report = store.sync(true).await.unwrap();
        assert_eq!(report.accepted, 1);
        assert!(store.sync(true).await.unwrap().is_idle());

        let snapshot = server.fetch(&id);
        assert_eq!(snapshot.keys["labels"].history.len(), 1);
        assert_eq!(snapshot.keys["config"].history.len(), 2);
    }

    #[tokio::test]
    async fn test_last_handle_purges_timeline() {
        let server = MemoryServer::new();
        let store = store(&server);
        let first = store.timeline("doc");
        let second = first.clone();
        let queue = first.get_queue("config");
        queue.push(insert("a"));

        drop(first);
        assert!(store.is_open(&EntityId::from("doc")));
        assert!(!queue.is_detached());

        drop(second);
        assert!(!store.is_open(&EntityId::from("doc")));
        assert!(queue.is_detached());
        assert_eq!(store.registered_queue_count(), 0);
        assert!(store.sync(true).await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_reopened_timeline_is_fresh() {
        let server = MemoryServer::new();
        let store = store(&server);
        let old = store.timeline("doc").get_queue("config");
        let reopened = store.timeline("doc");
        let fresh = reopened.get_queue("config");
        assert!(old.is_detached());
        assert!(!old.same_queue(&fresh));
        fresh.push(insert("a"));
        reopened.initialize(TimelineSnapshot::empty("doc"));
        assert_eq!(store.registered_queue_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_syncs_on_interval() {
        let server = MemoryServer::new();
        let store = store(&server);
        let doc = store.timeline("doc");
        let driver = store.sync_on_interval();

        doc.get_queue("config").push(insert("a"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!doc.get_status().is_mutated);

        driver.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_retries_after_failure() {
        let server = MemoryServer::new();
        let store = store(&server);
        let doc = store.timeline("doc");
        let driver = store.sync_on_interval();
        server.set_offline(true);

        doc.get_queue("config").push(insert("a"));
        driver.notify(LifecycleEvent::Publish);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(doc.get_status().is_mutated);
        let attempts = server.request_count();
        assert!(attempts >= 1);

        server.set_offline(false);
        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(!doc.get_status().is_mutated);
        drop(driver);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes() {
        let server = MemoryServer::new();
        let store = store(&server);
        let doc = store.timeline("doc");
        let driver = store.sync_on_interval();

        doc.get_queue("config").push(insert("a"));
        let report = driver.shutdown().await.unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(server.version(&EntityId::from("doc"), "config").count, 1);
    }
}
