//! Core types and traits for the Lattice transactional runtime
//!
//! This crate defines the foundational pieces shared by the engine and the
//! transactional data structures:
//! - Identifier newtypes: `CellId`, `FiberId`, `WakeupId`
//! - Error and outcome types: `ShutdownError`, `Defect`, `TxnOutcome`
//! - One-shot wakeup handles used by the retry/park protocol
//! - The `Scheduler` collaborator trait and the default thread-backed
//!   implementation
//! - Structured `Scope` with LIFO finalizers for scoped resources

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod sched;
pub mod scope;
pub mod traits;
pub mod types;
pub mod wakeup;

// Re-export commonly used types and traits
pub use error::{Defect, ShutdownError, TxnOutcome};
pub use sched::ThreadScheduler;
pub use scope::Scope;
pub use traits::Scheduler;
pub use types::{CellId, FiberId, WakeupId};
pub use wakeup::{Wakeup, WakeupHandle};
