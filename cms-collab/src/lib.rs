//! # cms-collab: Collaborative transaction queue and sync engine
//!
//! Buffers structured edits locally, reconciles them with an authoritative
//! server on an interval, detects when a local copy fell behind, and
//! recovers without losing the user's pending edits.
//!
//! ## Architecture
//!
//! ```text
//!   UI gesture
//!       │ push / push_mergeable / BoundMutator
//!       ▼
//! ┌─────────────┐  notify   ┌─────────────┐
//! │ Queue       │ ────────► │ Projection  │ ──► materialized state
//! │ (doc, key)  │           │ (operator)  │
//! └──────┬──────┘           └─────────────┘
//!        │ owned by
//!        ▼
//! ┌─────────────┐  stale    ┌─────────────┐
//! │ Timeline    │ ────────► │ data fetch  │ ──► Timeline::initialize
//! │ (entity)    │           │ (external)  │
//! └──────┬──────┘           └─────────────┘
//!        │ opened through
//!        ▼
//! ┌─────────────┐   sync    ┌─────────────┐
//! │ CollabStore │ ────────► │ Transport   │ ──► mutation endpoint
//! │ (queue map) │ ◄──────── │             │
//! └─────────────┘  verdicts └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ops`]: Splice/Toggle/Replace operations and transactions
//! - [`queue`]: Per-(document, key) pending buffer over confirmed history
//! - [`timeline`]: Queues of one entity, version and staleness
//! - [`store`]: Queue map, throttled sync, background driver
//! - [`tracker`]: Undo/redo through inverse transactions
//! - [`operator`]: Folds and live projections
//! - [`protocol`]: Wire types and JSON codec
//! - [`transport`]: Endpoint seam and in-memory reference server

pub mod config;
pub mod listeners;
pub mod operator;
pub mod ops;
pub mod protocol;
pub mod queue;
pub mod store;
pub mod timeline;
pub mod tracker;
pub mod transport;

// Re-exports for convenience
pub use config::SyncConfig;
pub use listeners::{Listeners, Subscription};
pub use operator::{
    fold, FnOperator, KeyedOperator, LogItem, LogSource, Operator, Origin, Projection,
    SpliceToggleOperator,
};
pub use ops::{Operation, Replace, Splice, Target, Toggle, Transaction, TransactionEntry};
pub use protocol::{
    EntityId, KeySnapshot, MutationItem, MutationOutcome, MutationRequest, MutationResponse,
    ProtocolError, TimelineEntry, TimelineSnapshot, Version,
};
pub use queue::{InitOutcome, Queue, QueueEvent};
pub use store::{CollabStore, LifecycleEvent, SyncDriver, SyncError, SyncReport, TimelineHandle};
pub use timeline::{
    InitReport, MutationEvent, StaleEvent, Timeline, TimelineStatus, DEFAULT_KEY,
};
pub use tracker::{BoundMutator, Step, Tracker};
pub use transport::{MemoryServer, ServerPolicy, Transport, TransportError};
