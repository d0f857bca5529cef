//! Collaborator traits consumed by the transaction engine
//!
//! The engine does not own fibers. It asks the enclosing runtime for the
//! identity of the fiber driving the current thread, parks that fiber when
//! a transaction blocks on `retry`, and polls for cancellation between
//! primitives. Anything implementing [`Scheduler`] can host the engine;
//! [`crate::sched::ThreadScheduler`] is the default thread-backed
//! implementation used by tests and standalone callers.

use crate::types::FiberId;
use crate::wakeup::WakeupHandle;

/// Fiber scheduling operations consumed by the commit coordinator
///
/// Implementations must uphold two contracts:
///
/// - `park` returns once the handle has fired, even when the fire happened
///   before `park` was entered (the coordinator fires handles after
///   releasing its lock, so both orders occur).
/// - `resume` is safe to call for handles belonging to fibers of other
///   threads, and firing an already-fired handle is a no-op.
pub trait Scheduler: Send + Sync {
    /// Identity of the fiber driving the current thread
    fn current_fiber(&self) -> FiberId;

    /// Suspend the current fiber until `wakeup` fires
    fn park(&self, wakeup: &WakeupHandle);

    /// Resume the fiber parked on `wakeup`
    fn resume(&self, wakeup: &WakeupHandle);

    /// True when the current fiber has been asked to stop
    ///
    /// The executor polls this between primitives; a cancelled attempt is
    /// abandoned without publishing.
    fn is_cancelled(&self) -> bool;
}
