//! All queues of one logical entity, with version and staleness tracking.
//!
//! ```text
//! Timeline "doc-42"
//!   ├── Queue "config"   ──┐
//!   ├── Queue "fields"   ──┼── QueueEvent ──► mutation listeners ("unsaved changes")
//!   └── Queue "labels"   ──┘             └──► change listeners (projections)
//!
//!   stale flag ── set by a rejected sync or outdated data, fires the stale
//!                 listeners once, cleared by the next successful initialize
//! ```
//!
//! The timeline never fetches on its own. Stale listeners are expected to
//! refetch through the data layer and call [`Timeline::initialize`].

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;

use crate::config::SyncConfig;
use crate::listeners::{lock, Listeners, Subscription};
use crate::operator::{LogItem, LogSource};
use crate::protocol::{EntityId, TimelineSnapshot, Version};
use crate::queue::{InitOutcome, Queue, QueueEvent};
use crate::tracker::BoundMutator;

/// Key used when callers do not name one.
pub const DEFAULT_KEY: &str = "default";

/// Why a timeline became stale.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleEvent {
    pub document: EntityId,
    pub key: String,
    /// Latest version known for the key: the server's on a rejected sync,
    /// the one this client already confirmed on an outdated initialize.
    pub current: Version,
}

/// A queue under this timeline accumulated local edits.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    pub document: EntityId,
    pub key: String,
    pub queue: Queue,
}

/// Summary reported by [`Timeline::get_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineStatus {
    pub is_mutated: bool,
    pub is_stale: bool,
    pub version: u64,
}

/// Result of [`Timeline::initialize`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    pub reset: Vec<String>,
    pub unchanged: Vec<String>,
    pub stale: Vec<String>,
    /// Pending transactions re-pushed on top of the fresh history.
    pub rebased: usize,
}

struct QueueSlot {
    queue: Queue,
    _events: Subscription,
}

struct TimelineInner {
    id: EntityId,
    config: SyncConfig,
    queues: Mutex<BTreeMap<String, QueueSlot>>,
    stale: AtomicBool,
    purged: AtomicBool,
    initialized: watch::Sender<bool>,
    stale_listeners: Listeners<StaleEvent>,
    mutation_listeners: Listeners<MutationEvent>,
    change_listeners: Listeners<()>,
}

impl TimelineInner {
    fn on_queue_event(&self, queue: &Queue, event: QueueEvent) {
        if event == QueueEvent::Pushed {
            self.mutation_listeners.notify(&MutationEvent {
                document: self.id.clone(),
                key: queue.key().to_string(),
                queue: queue.clone(),
            });
        }
        self.change_listeners.notify(&());
    }
}

/// Cheaply cloneable handle to one entity's timeline.
#[derive(Clone)]
pub struct Timeline {
    inner: Arc<TimelineInner>,
}

impl Timeline {
    pub fn new(id: impl Into<EntityId>, config: SyncConfig) -> Self {
        let (initialized, _) = watch::channel(false);
        Self {
            inner: Arc::new(TimelineInner {
                id: id.into(),
                config,
                queues: Mutex::new(BTreeMap::new()),
                stale: AtomicBool::new(false),
                purged: AtomicBool::new(false),
                initialized,
                stale_listeners: Listeners::new(),
                mutation_listeners: Listeners::new(),
                change_listeners: Listeners::new(),
            }),
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.inner.id
    }

    pub fn same_timeline(&self, other: &Timeline) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ─── Queues ──────────────────────────────────────────────────────────

    /// Queue for `key`, created on first use.
    pub fn get_queue(&self, key: &str) -> Queue {
        let mut queues = lock(&self.inner.queues);
        if let Some(slot) = queues.get(key) {
            return slot.queue.clone();
        }

        let queue = Queue::new(self.inner.id.clone(), key, self.inner.config.merge_window());
        let weak: Weak<TimelineInner> = Arc::downgrade(&self.inner);
        let observed = queue.clone();
        let events = queue.register(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_queue_event(&observed, *event);
            }
        });
        if self.inner.purged.load(Ordering::SeqCst) {
            queue.detach();
        }
        queues.insert(
            key.to_string(),
            QueueSlot {
                queue: queue.clone(),
                _events: events,
            },
        );
        log::trace!("Created queue {}/{key}", self.inner.id);
        queue
    }

    /// Queue for [`DEFAULT_KEY`].
    pub fn default_queue(&self) -> Queue {
        self.get_queue(DEFAULT_KEY)
    }

    /// Existing queue for `key`, without creating one.
    pub fn queue(&self, key: &str) -> Option<Queue> {
        lock(&self.inner.queues).get(key).map(|slot| slot.queue.clone())
    }

    pub fn queues(&self) -> Vec<Queue> {
        lock(&self.inner.queues).values().map(|slot| slot.queue.clone()).collect()
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.inner.queues).keys().cloned().collect()
    }

    /// Tracked mutator over the queue for `key`.
    pub fn bound_mutate(&self, key: &str, base: Value) -> BoundMutator {
        self.get_queue(key).bound_mutate(base)
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn get_status(&self) -> TimelineStatus {
        TimelineStatus {
            is_mutated: self.queues().iter().any(Queue::has_pending),
            is_stale: self.is_stale(),
            version: self.total_version(),
        }
    }

    /// Per-key confirmed versions.
    pub fn version(&self) -> BTreeMap<String, Version> {
        lock(&self.inner.queues)
            .iter()
            .map(|(key, slot)| (key.clone(), slot.queue.version()))
            .collect()
    }

    /// Sum of every key's confirmed count.
    pub fn total_version(&self) -> u64 {
        self.queues().iter().map(|q| q.version().count).sum()
    }

    pub fn is_stale(&self) -> bool {
        self.inner.stale.load(Ordering::SeqCst)
    }

    pub fn is_purged(&self) -> bool {
        self.inner.purged.load(Ordering::SeqCst)
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Seed every key of `snapshot`.
    ///
    /// Keys whose supplied data is behind what was already confirmed are
    /// reported stale and keep the timeline stale. Otherwise the stale flag is
    /// cleared, and with `rebase_on_reload` the pending edits dropped by a
    /// reset are pushed again on top of the new history.
    pub fn initialize(&self, snapshot: TimelineSnapshot) -> InitReport {
        if snapshot.document != self.inner.id {
            log::warn!(
                "Ignoring snapshot for {} handed to timeline {}",
                snapshot.document,
                self.inner.id
            );
            return InitReport::default();
        }

        let mut report = InitReport::default();
        let mut rebase = Vec::new();
        let mut stale_event = None;

        for (key, data) in snapshot.keys {
            let queue = self.get_queue(&key);
            match queue.initialize(data.version, data.history) {
                InitOutcome::Unchanged => report.unchanged.push(key),
                InitOutcome::Reset { discarded } => {
                    if !discarded.is_empty() {
                        rebase.push((queue, discarded));
                    }
                    report.reset.push(key);
                }
                InitOutcome::Stale { confirmed, supplied } => {
                    log::warn!(
                        "Snapshot for {}/{key} is at {supplied}, behind confirmed {confirmed}",
                        self.inner.id
                    );
                    stale_event.get_or_insert(StaleEvent {
                        document: self.inner.id.clone(),
                        key: key.clone(),
                        current: confirmed,
                    });
                    report.stale.push(key);
                }
            }
        }

        if self.inner.config.rebase_on_reload {
            for (queue, discarded) in rebase {
                for txn in discarded {
                    if queue.push(txn) {
                        report.rebased += 1;
                    }
                }
            }
        } else {
            let dropped: usize = rebase.iter().map(|(_, d)| d.len()).sum();
            if dropped > 0 {
                log::info!("Dropped {dropped} pending transactions of {} on reload", self.inner.id);
            }
        }

        match stale_event {
            Some(event) => {
                self.mark_stale(event);
            }
            None => {
                if self.inner.stale.swap(false, Ordering::SeqCst) {
                    log::info!("Timeline {} recovered from staleness", self.inner.id);
                }
                self.inner.initialized.send_replace(true);
            }
        }
        report
    }

    pub fn is_initialized(&self) -> bool {
        *self.inner.initialized.borrow()
    }

    /// Resolve once the timeline has been initialized.
    pub async fn initialized(&self) {
        let mut rx = self.inner.initialized.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Flag the timeline as behind the server.
    ///
    /// Fires the stale listeners only on the transition, so repeated reports
    /// during one episode trigger a single refetch. Returns whether this call
    /// started a new episode.
    pub fn mark_stale(&self, event: StaleEvent) -> bool {
        if self.inner.stale.swap(true, Ordering::SeqCst) {
            log::debug!("Timeline {} already stale, ignoring {}", self.inner.id, event.key);
            return false;
        }
        log::warn!(
            "Timeline {} is stale on {} (current {})",
            self.inner.id,
            event.key,
            event.current
        );
        self.inner.stale_listeners.notify(&event);
        true
    }

    /// Detach every queue and drop them. In-flight responses for these queues
    /// are discarded when they arrive.
    pub(crate) fn purge(&self) {
        self.inner.purged.store(true, Ordering::SeqCst);
        let slots: Vec<QueueSlot> = {
            let mut queues = lock(&self.inner.queues);
            std::mem::take(&mut *queues).into_values().collect()
        };
        for slot in &slots {
            slot.queue.detach();
        }
        log::debug!("Purged timeline {} ({} queues)", self.inner.id, slots.len());
    }

    // ─── Subscriptions ───────────────────────────────────────────────────

    pub fn register_stale_listener(
        &self,
        listener: impl Fn(&StaleEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.stale_listeners.register(listener)
    }

    pub fn register_mutation_listener(
        &self,
        listener: impl Fn(&MutationEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.mutation_listeners.register(listener)
    }

    /// Any change in any queue: pushes, resets, confirmations.
    pub fn register(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.change_listeners.register(move |_| listener())
    }
}

impl LogSource for Timeline {
    fn for_each(&self, f: &mut dyn FnMut(LogItem<'_>)) {
        for queue in self.queues() {
            let key = queue.key().to_string();
            queue.for_each(|transaction, confirmed| {
                f(LogItem {
                    key: &key,
                    transaction,
                    confirmed,
                })
            });
        }
    }

    fn register(&self, listener: Box<dyn Fn() + Send + Sync>) -> Subscription {
        Timeline::register(self, listener)
    }
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline")
            .field("id", &self.inner.id)
            .field("keys", &self.keys())
            .field("stale", &self.is_stale())
            .finish()
    }
}
