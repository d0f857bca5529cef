//! The Lattice transaction engine
//!
//! This crate implements the core of the runtime:
//! - `TRef<T>`: atomically versioned single-value storage, the only
//!   mutable primitive
//! - `Stm<A, E>`: immutable transaction descriptions built from a small
//!   set of primitives plus derived combinators
//! - An iterative executor interpreting terms against per-attempt journals
//! - The commit coordinator: global commit lock, optimistic validation,
//!   publication, and the retry/park/wakeup protocol
//!
//! Transactions compose: any two `Stm` values can be sequenced or raced
//! without exposing intermediate states, and the runtime re-executes them
//! transparently on conflicts and wakeups.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod executor;
mod journal;

pub mod cell;
pub mod commit;
pub mod term;

// Re-export the public surface
pub use cell::TRef;
pub use commit::{atomically, atomically_outcome};
pub use term::{Stm, TxValue};
