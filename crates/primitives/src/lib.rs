//! Transactional data structures for the Lattice runtime
//!
//! Every structure in this crate is a pure composition of transactional
//! cells: admission, ordering, and blocking live entirely in transaction
//! code, so any operation can be combined with any other into one atomic
//! step.
//!
//! - [`TQueue`]: multi-producer multi-consumer FIFO with bounded,
//!   dropping, sliding, and unbounded admission
//! - [`THub`]: multi-producer multi-subscriber broadcast with the same
//!   four admission strategies and scoped subscriptions
//! - [`TPriorityQueue`]: min-key-first queue, FIFO within a key
//! - [`TSemaphore`]: counting semaphore with all-or-nothing bulk acquire

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod hub;
pub mod pqueue;
pub mod queue;
pub mod semaphore;
pub mod strategy;

// Re-export the public surface
pub use hub::{THub, TSubscription};
pub use pqueue::TPriorityQueue;
pub use queue::TQueue;
pub use semaphore::TSemaphore;
pub use strategy::AdmissionStrategy;
