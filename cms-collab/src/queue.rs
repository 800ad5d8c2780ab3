//! Per-(document, key) buffer of local edits over a confirmed history.
//!
//! ```text
//!   history (server-confirmed, append-only)      pending (local only)
//! ┌─────────┬─────────┬─────────┐   ┌──────────────┬──────────────────┐
//! │ entry 0 │ entry 1 │ entry 2 │ + │ in flight    │ unsent           │
//! └─────────┴─────────┴─────────┘   └──────────────┴──────────────────┘
//!                         version ──┘               └── merge window
//! ```
//!
//! While a sync request is outstanding the first `in_flight` pending
//! transactions belong to it; further pushes land after them and never merge
//! into them. A reload keeps that prefix in flight: its verdict is applied
//! on top of the fresh history, skipping entries the reload already brought
//! in. Each batch carries a sequence number, and verdicts for any batch other
//! than the outstanding one are ignored.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::listeners::{lock, Listeners, Subscription};
use crate::operator::{LogItem, LogSource};
use crate::ops::{Target, Transaction};
use crate::protocol::{EntityId, MutationItem, TimelineEntry, Version};
use crate::tracker::{BoundMutator, Tracker};

/// Change notifications emitted by a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// Pending grew or changed through a local push.
    Pushed,
    /// History was reseeded by `initialize`.
    Reset,
    /// A sync confirmed the in-flight transactions.
    Confirmed,
}

/// Result of [`Queue::initialize`].
#[derive(Debug, Clone, PartialEq)]
pub enum InitOutcome {
    /// Same version as already confirmed; nothing changed.
    Unchanged,
    /// The supplied data is behind what this queue already confirmed.
    Stale { confirmed: Version, supplied: Version },
    /// History replaced. `discarded` holds the unsent transactions dropped
    /// by the reset, oldest first. In-flight transactions stay pending.
    Reset { discarded: Vec<Transaction> },
}

/// Transactions handed to a sync request.
#[derive(Debug, Clone)]
pub(crate) struct Batch {
    pub epoch: u64,
    pub item: MutationItem,
}

#[derive(Debug, Clone)]
struct MergeWindow {
    target: Target,
    opened_at: Instant,
}

#[derive(Default)]
struct QueueState {
    initialized: bool,
    version: Version,
    history: Vec<Arc<TimelineEntry>>,
    pending: Vec<Transaction>,
    in_flight: usize,
    /// Sequence number of the most recent batch.
    epoch: u64,
    merge: Option<MergeWindow>,
}

impl QueueState {
    fn unsent(&self) -> &[Transaction] {
        &self.pending[self.in_flight..]
    }
}

struct QueueInner {
    document: EntityId,
    key: String,
    merge_window: Duration,
    detached: AtomicBool,
    state: Mutex<QueueState>,
    listeners: Listeners<QueueEvent>,
}

/// Cheaply cloneable handle to one queue.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Queue {
    pub fn new(
        document: impl Into<EntityId>,
        key: impl Into<String>,
        merge_window: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                document: document.into(),
                key: key.into(),
                merge_window,
                detached: AtomicBool::new(false),
                state: Mutex::new(QueueState::default()),
                listeners: Listeners::new(),
            }),
        }
    }

    pub fn document(&self) -> &EntityId {
        &self.inner.document
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Whether both handles point at the same queue.
    pub fn same_queue(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ─── Local edits ─────────────────────────────────────────────────────

    /// Append `txn` as a new pending transaction.
    ///
    /// Returns whether state changed; transactions made only of no-ops are
    /// dropped and nobody is notified.
    pub fn push(&self, txn: Transaction) -> bool {
        let txn = txn.normalized();
        if txn.entries.is_empty() {
            return false;
        }
        {
            let mut state = lock(&self.inner.state);
            state.merge = None;
            state.pending.push(txn);
        }
        self.inner.listeners.notify(&QueueEvent::Pushed);
        true
    }

    /// Push, collapsing into the last unsent transaction when it was opened
    /// for the same single target less than the merge window ago.
    pub fn push_mergeable(&self, txn: Transaction) -> bool {
        let txn = txn.normalized();
        if txn.entries.is_empty() {
            return false;
        }
        let now = Instant::now();
        {
            let mut state = lock(&self.inner.state);
            let target = txn.single_target().cloned();
            let window_open = match (&state.merge, &target) {
                (Some(window), Some(target)) => {
                    &window.target == target
                        && now.duration_since(window.opened_at) < self.inner.merge_window
                        && state.pending.len() > state.in_flight
                }
                _ => false,
            };

            if window_open {
                if let Some(last) = state.pending.last_mut() {
                    last.merge(txn);
                }
            } else {
                state.pending.push(txn);
                state.merge = target.map(|target| MergeWindow {
                    target,
                    opened_at: now,
                });
            }
        }
        self.inner.listeners.notify(&QueueEvent::Pushed);
        true
    }

    /// Replace the unsent pending tail with whatever `factory` returns.
    ///
    /// The factory sees the unsent transactions (oldest first) and can extend,
    /// rewrite or keep them. In-flight transactions are never exposed.
    pub fn push_with<F>(&self, factory: F) -> bool
    where
        F: FnOnce(&[Transaction]) -> Vec<Transaction>,
    {
        let changed = {
            let mut state = lock(&self.inner.state);
            let replacement: Vec<Transaction> = factory(state.unsent())
                .into_iter()
                .map(Transaction::normalized)
                .filter(|t| !t.entries.is_empty())
                .collect();
            if replacement.as_slice() == state.unsent() {
                false
            } else {
                let in_flight = state.in_flight;
                state.pending.truncate(in_flight);
                state.pending.extend(replacement);
                state.merge = None;
                true
            }
        };
        if changed {
            self.inner.listeners.notify(&QueueEvent::Pushed);
        }
        changed
    }

    // ─── Reading ─────────────────────────────────────────────────────────

    /// Visit confirmed transactions, then pending ones, in log order.
    ///
    /// The second argument is the index of the confirmed history entry, or
    /// `None` for local-only transactions. Runs over a snapshot, so the
    /// callback may push.
    pub fn for_each(&self, mut f: impl FnMut(&Transaction, Option<u64>)) {
        let (history, pending) = {
            let state = lock(&self.inner.state);
            (state.history.clone(), state.pending.clone())
        };
        for (index, entry) in history.iter().enumerate() {
            for txn in &entry.transactions {
                f(txn, Some(index as u64));
            }
        }
        for txn in &pending {
            f(txn, None);
        }
    }

    /// Server-confirmed version this queue is based on.
    pub fn version(&self) -> Version {
        lock(&self.inner.state).version.clone()
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.inner.state).initialized
    }

    pub fn history_len(&self) -> usize {
        lock(&self.inner.state).history.len()
    }

    pub fn pending(&self) -> Vec<Transaction> {
        lock(&self.inner.state).pending.clone()
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_len() > 0
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.inner.state).in_flight
    }

    // ─── Confirmed history ───────────────────────────────────────────────

    /// (Re)seed confirmed history.
    ///
    /// Idempotent for the version already confirmed. Data older than what
    /// this queue has confirmed is reported as stale and left unapplied.
    pub fn initialize(&self, version: Version, history: Vec<TimelineEntry>) -> InitOutcome {
        let outcome = {
            let mut state = lock(&self.inner.state);
            if state.initialized && state.version.same_as(&version) {
                return InitOutcome::Unchanged;
            }
            if state.initialized && version.count < state.version.count {
                return InitOutcome::Stale {
                    confirmed: state.version.clone(),
                    supplied: version,
                };
            }

            let in_flight = state.in_flight;
            let discarded: Vec<Transaction> = state.pending.drain(in_flight..).collect();
            state.merge = None;
            state.history = history.into_iter().map(Arc::new).collect();
            state.version = version;
            state.initialized = true;
            InitOutcome::Reset { discarded }
        };
        log::debug!(
            "Queue {}/{} initialized at {}",
            self.inner.document,
            self.inner.key,
            self.version()
        );
        self.inner.listeners.notify(&QueueEvent::Reset);
        outcome
    }

    /// Hand the unsent pending to a sync request.
    ///
    /// Returns `None` when nothing is pending or a request is already out.
    pub(crate) fn take_batch(&self) -> Option<Batch> {
        let mut state = lock(&self.inner.state);
        if state.in_flight > 0 || state.pending.is_empty() {
            return None;
        }
        state.in_flight = state.pending.len();
        state.epoch += 1;
        state.merge = None;
        Some(Batch {
            epoch: state.epoch,
            item: MutationItem {
                key: self.inner.key.clone(),
                base: state.version.clone(),
                transactions: state.pending.clone(),
            },
        })
    }

    /// Move the in-flight transactions into confirmed history.
    ///
    /// `missed` are the entries between the batch's base and `version`. When
    /// a reload happened meanwhile, the entries it already brought in are
    /// skipped, and nothing is appended if it already covers `version`.
    ///
    /// Returns `false` when the response is discarded because the queue was
    /// detached or `batch` is no longer the outstanding one.
    pub(crate) fn confirm(
        &self,
        batch: &Batch,
        version: Version,
        missed: Vec<TimelineEntry>,
        user: Uuid,
    ) -> bool {
        if self.is_detached() {
            log::debug!(
                "Discarding sync response for detached queue {}/{}",
                self.inner.document,
                self.inner.key
            );
            return false;
        }
        {
            let mut state = lock(&self.inner.state);
            if state.epoch != batch.epoch || state.in_flight == 0 {
                return false;
            }
            let in_flight = state.in_flight;
            let sent: Vec<Transaction> = state.pending.drain(..in_flight).collect();
            state.in_flight = 0;
            if version.count <= state.version.count {
                log::debug!(
                    "Queue {}/{} already holds {version} from a reload",
                    self.inner.document,
                    self.inner.key
                );
            } else {
                let held = state.version.count.saturating_sub(batch.item.base.count);
                let held = usize::try_from(held).unwrap_or(usize::MAX);
                state.history.extend(missed.into_iter().skip(held).map(Arc::new));
                state.history.push(Arc::new(TimelineEntry {
                    transactions: sent,
                    user,
                    prev_version: version.count.saturating_sub(1),
                    metadata: Value::Null,
                }));
                state.version = version;
            }
        }
        self.inner.listeners.notify(&QueueEvent::Confirmed);
        true
    }

    /// Return the in-flight transactions to the unsent pool after a failed
    /// or rejected request.
    pub(crate) fn release(&self, epoch: u64) {
        let mut state = lock(&self.inner.state);
        if state.epoch == epoch {
            state.in_flight = 0;
        }
    }

    /// Mark the queue as no longer owned by a timeline.
    pub(crate) fn detach(&self) {
        self.inner.detached.store(true, Ordering::SeqCst);
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::SeqCst)
    }

    // ─── Subscriptions & undo ────────────────────────────────────────────

    /// Subscribe to change notifications. Fires synchronously inside `push`.
    pub fn register(&self, listener: impl Fn(&QueueEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.register(listener)
    }

    /// Push the inverse of the tracker's most recent step.
    pub fn undo(&self, tracker: &mut Tracker) -> bool {
        match tracker.pop_undo() {
            Some(step) => {
                let pushed = self.push(step.inverse.clone());
                if pushed {
                    tracker.push_redo(step);
                }
                pushed
            }
            None => false,
        }
    }

    /// Push again the most recently undone step.
    pub fn redo(&self, tracker: &mut Tracker) -> bool {
        match tracker.pop_redo() {
            Some(step) => {
                let pushed = self.push(step.forward.clone());
                if pushed {
                    tracker.push_undo(step);
                }
                pushed
            }
            None => false,
        }
    }

    /// Tracked mutator for one user gesture. `base` is the value the
    /// projection of this queue starts from.
    pub fn bound_mutate(&self, base: Value) -> BoundMutator {
        BoundMutator::new(self.clone(), base)
    }
}

impl LogSource for Queue {
    fn for_each(&self, f: &mut dyn FnMut(LogItem<'_>)) {
        let key = self.inner.key.clone();
        Queue::for_each(self, |transaction, confirmed| {
            f(LogItem {
                key: &key,
                transaction,
                confirmed,
            })
        });
    }

    fn register(&self, listener: Box<dyn Fn() + Send + Sync>) -> Subscription {
        Queue::register(self, move |_| listener())
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Queue")
            .field("document", &self.inner.document)
            .field("key", &self.inner.key)
            .field("version", &state.version)
            .field("history", &state.history.len())
            .field("pending", &state.pending.len())
            .field("in_flight", &state.in_flight)
            .finish()
    }
}
