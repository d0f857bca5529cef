//! # Lattice
//!
//! Composable software transactional memory for fiber runtimes: versioned
//! cells, a journaled optimistic executor, blocking retry with precise
//! wakeups, and transactional collections built on nothing but cells.
//!
//! Transactions are inert descriptions: build one from combinators, then
//! submit it with [`atomically`]. Conflicting transactions re-run
//! transparently; blocked ones park until a cell they observed changes.
//!
//! # Quick Start
//!
//! ```
//! use lattice::{atomically, TQueue, THub};
//!
//! // A bounded queue: a full offer blocks, an empty take blocks.
//! let queue = TQueue::bounded(16);
//! atomically(&queue.offer("job"))?;
//! assert_eq!(atomically(&queue.take())?, "job");
//!
//! // A hub broadcasts to every subscriber alive at publish time.
//! let hub = THub::unbounded();
//! let sub = atomically(&hub.subscribe())?;
//! atomically(&hub.publish(42))?;
//! assert_eq!(atomically(&sub.take())?, 42);
//! # Ok::<(), lattice::ShutdownError>(())
//! ```
//!
//! # Building blocks
//!
//! | Piece | Purpose | Key operations |
//! |-------|---------|----------------|
//! | **TRef** | Versioned cell, the only mutable primitive | `get`, `set`, `update`, `modify` |
//! | **Stm** | Transaction description | `flat_map`, `fold`, `or_try`, `retry` |
//! | **TQueue** | FIFO with admission strategies | `offer`, `take`, `shutdown` |
//! | **THub** | Broadcast with per-subscriber cursors | `publish`, `subscribe`, `take` |
//! | **TPriorityQueue** | Min-key-first delivery | `offer`, `take` |
//! | **TSemaphore** | Counting permits | `acquire_n`, `release_n` |
//!
//! # Architecture
//!
//! The engine lives in `lattice-stm` (cells, journals, executor, commit
//! coordinator), the collections in `lattice-primitives`, and the shared
//! collaborator seams (scheduler, scope, wakeup handles) in
//! `lattice-core`. Only the surface re-exported here is stable.

// Re-export the public API from the member crates
pub use lattice_core::{
    Defect, FiberId, Scheduler, Scope, ShutdownError, ThreadScheduler, TxnOutcome, Wakeup,
    WakeupHandle,
};
pub use lattice_primitives::{
    AdmissionStrategy, THub, TPriorityQueue, TQueue, TSemaphore, TSubscription,
};
pub use lattice_stm::{atomically, atomically_outcome, Stm, TRef, TxValue};
