//! Projection of a log into materialized state.
//!
//! An [`Operator`] is a pure fold over a [`LogSource`] (a queue or a whole
//! timeline). A [`Projection`] keeps the last folded state and re-runs the
//! operator whenever its source reports a change:
//!
//! ```text
//! push ──► Queue ──notify──► Projection::refresh ──► Operator::project
//!                                   │                       │
//!                              Singular guard          new state ──► subscribers
//! ```
//!
//! Triggers arriving while a projection is already running (for instance a
//! subscriber pushing from inside its callback) coalesce into one more run.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::listeners::{lock, Listeners, Subscription};
use crate::ops::Transaction;

/// Why a projection runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Initial,
    Update,
}

/// One transaction of a log, as seen by a fold.
#[derive(Debug, Clone, Copy)]
pub struct LogItem<'a> {
    pub key: &'a str,
    pub transaction: &'a Transaction,
    /// Index of the confirmed history entry, `None` when local-only.
    pub confirmed: Option<u64>,
}

impl LogItem<'_> {
    pub fn is_confirmed(&self) -> bool {
        self.confirmed.is_some()
    }
}

/// Anything whose entries can be folded and watched.
pub trait LogSource: Send + Sync {
    /// Visit every transaction in log order: confirmed first, then pending.
    fn for_each(&self, f: &mut dyn FnMut(LogItem<'_>));

    /// Be told when the log changes.
    fn register(&self, listener: Box<dyn Fn() + Send + Sync>) -> Subscription;
}

/// Apply every transaction of `source` to a copy of `base`.
pub fn fold(base: &Value, source: &dyn LogSource) -> Value {
    let mut state = base.clone();
    source.for_each(&mut |item| {
        item.transaction.apply(&mut state);
    });
    state
}

/// Pure mapping from a log to materialized state.
pub trait Operator: Send + Sync + 'static {
    type State: Send + Sync + 'static;

    fn project(&self, source: &dyn LogSource, origin: Origin) -> Self::State;
}

/// Folds splice/toggle operations over a base value.
#[derive(Debug, Clone)]
pub struct SpliceToggleOperator {
    base: Value,
}

impl SpliceToggleOperator {
    pub fn new(base: Value) -> Self {
        Self { base }
    }
}

impl Operator for SpliceToggleOperator {
    type State = Value;

    fn project(&self, source: &dyn LogSource, _origin: Origin) -> Value {
        fold(&self.base, source)
    }
}

/// Folds a multi-key source into one value per key.
///
/// Keys without a configured base start from `null`.
#[derive(Debug, Clone, Default)]
pub struct KeyedOperator {
    bases: BTreeMap<String, Value>,
}

impl KeyedOperator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base(mut self, key: impl Into<String>, base: Value) -> Self {
        self.bases.insert(key.into(), base);
        self
    }
}

impl Operator for KeyedOperator {
    type State = BTreeMap<String, Value>;

    fn project(&self, source: &dyn LogSource, _origin: Origin) -> Self::State {
        let mut states = self.bases.clone();
        source.for_each(&mut |item| {
            let state = states.entry(item.key.to_string()).or_insert(Value::Null);
            item.transaction.apply(state);
        });
        states
    }
}

/// Adapter turning a closure into an [`Operator`].
pub struct FnOperator<F>(pub F);

impl<F, S> Operator for FnOperator<F>
where
    F: Fn(&dyn LogSource, Origin) -> S + Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    type State = S;

    fn project(&self, source: &dyn LogSource, origin: Origin) -> S {
        (self.0)(source, origin)
    }
}

/// Re-entrancy guard: at most one run at a time, later triggers coalesce.
#[derive(Debug, Default)]
pub(crate) struct Singular {
    running: AtomicBool,
    requested: AtomicBool,
}

impl Singular {
    pub(crate) fn run(&self, mut f: impl FnMut()) {
        self.requested.store(true, Ordering::SeqCst);
        loop {
            if self
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            while self.requested.swap(false, Ordering::SeqCst) {
                f();
            }
            self.running.store(false, Ordering::SeqCst);
            if !self.requested.load(Ordering::SeqCst) {
                return;
            }
        }
    }
}

struct ProjectionInner<O: Operator> {
    source: Arc<dyn LogSource>,
    operator: O,
    state: Mutex<Arc<O::State>>,
    runs: Mutex<u64>,
    guard: Singular,
    listeners: Listeners<Arc<O::State>>,
}

impl<O: Operator> ProjectionInner<O> {
    fn refresh(&self) {
        self.guard.run(|| {
            let next = Arc::new(self.operator.project(self.source.as_ref(), Origin::Update));
            *lock(&self.state) = next.clone();
            *lock(&self.runs) += 1;
            self.listeners.notify(&next);
        });
    }
}

/// Live materialized view of a log source.
pub struct Projection<O: Operator> {
    inner: Arc<ProjectionInner<O>>,
    _source: Subscription,
}

impl<O: Operator> Projection<O> {
    /// Project once with [`Origin::Initial`] and follow the source from then on.
    pub fn new(source: impl LogSource + 'static, operator: O) -> Self {
        let source: Arc<dyn LogSource> = Arc::new(source);
        let initial = Arc::new(operator.project(source.as_ref(), Origin::Initial));
        let inner = Arc::new(ProjectionInner {
            source: source.clone(),
            operator,
            state: Mutex::new(initial),
            runs: Mutex::new(1),
            guard: Singular::default(),
            listeners: Listeners::new(),
        });

        let weak: Weak<ProjectionInner<O>> = Arc::downgrade(&inner);
        let subscription = source.register(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.refresh();
            }
        }));

        Self {
            inner,
            _source: subscription,
        }
    }

    /// Latest materialized state.
    pub fn state(&self) -> Arc<O::State> {
        lock(&self.inner.state).clone()
    }

    /// Number of operator runs so far, including the initial one.
    pub fn runs(&self) -> u64 {
        *lock(&self.inner.runs)
    }

    /// Re-run the operator now.
    pub fn refresh(&self) {
        self.inner.refresh();
    }

    /// Be told about every new state.
    pub fn subscribe(
        &self,
        listener: impl Fn(&Arc<O::State>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.listeners.register(listener)
    }
}
