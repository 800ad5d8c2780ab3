//! Undo/redo bookkeeping for user gestures.
//!
//! Undo never rewrites history: reverting a step pushes its inverse as a new
//! transaction, so the reverted edit and its reversal both travel to the
//! server like any other edit.

use serde_json::Value;

use crate::operator::{fold, LogSource};
use crate::ops::Transaction;
use crate::queue::Queue;

/// A recorded `(forward, inverse)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub forward: Transaction,
    pub inverse: Transaction,
}

/// Undo and redo stacks for one gesture or editing session.
#[derive(Debug, Clone, Default)]
pub struct Tracker {
    undo: Vec<Step>,
    redo: Vec<Step>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly pushed step. Clears the redo stack.
    pub fn record(&mut self, forward: Transaction, inverse: Transaction) {
        self.undo.push(Step { forward, inverse });
        self.redo.clear();
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }

    pub(crate) fn pop_undo(&mut self) -> Option<Step> {
        self.undo.pop()
    }

    pub(crate) fn pop_redo(&mut self) -> Option<Step> {
        self.redo.pop()
    }

    pub(crate) fn push_undo(&mut self, step: Step) {
        self.undo.push(step);
    }

    pub(crate) fn push_redo(&mut self, step: Step) {
        self.redo.push(step);
    }
}

/// A queue bound to a tracker: every push records its inverse.
pub struct BoundMutator {
    queue: Queue,
    base: Value,
    tracker: Tracker,
}

impl BoundMutator {
    pub fn new(queue: Queue, base: Value) -> Self {
        Self {
            queue,
            base,
            tracker: Tracker::new(),
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Current materialized value of the bound queue.
    pub fn current(&self) -> Value {
        fold(&self.base, &self.queue as &dyn LogSource)
    }

    /// Tracked [`Queue::push`].
    pub fn push(&mut self, txn: Transaction) -> bool {
        self.tracked(txn, false)
    }

    /// Tracked [`Queue::push_mergeable`].
    pub fn push_mergeable(&mut self, txn: Transaction) -> bool {
        self.tracked(txn, true)
    }

    pub fn undo(&mut self) -> bool {
        self.queue.undo(&mut self.tracker)
    }

    pub fn redo(&mut self) -> bool {
        self.queue.redo(&mut self.tracker)
    }

    fn tracked(&mut self, txn: Transaction, mergeable: bool) -> bool {
        let txn = txn.normalized();
        let mut scratch = self.current();
        let inverse = txn.apply(&mut scratch).normalized();

        let pushed = if mergeable {
            self.queue.push_mergeable(txn.clone())
        } else {
            self.queue.push(txn.clone())
        };
        // Nothing to revert when the edit left the value as it was.
        if pushed && !inverse.entries.is_empty() {
            self.tracker.record(txn, inverse);
        }
        pushed
    }
}
