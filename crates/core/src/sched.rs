//! Thread-backed fiber scheduler
//!
//! The default [`Scheduler`] implementation drives each fiber as an OS
//! thread. Fiber state (cancellation flag, currently parked handle) lives
//! in a concurrent table so any thread can cancel any fiber: cancellation
//! sets the flag and fires the parked handle, and the woken transaction
//! observes the flag at its next checkpoint.

use crate::traits::Scheduler;
use crate::types::FiberId;
use crate::wakeup::WakeupHandle;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::trace;

thread_local! {
    static CURRENT_FIBER: FiberId = FiberId::fresh();
}

#[derive(Default)]
struct FiberState {
    cancelled: bool,
    parked: Option<WakeupHandle>,
}

/// Scheduler that maps fibers onto OS threads
///
/// Each thread is lazily assigned a fiber identity the first time it
/// touches the scheduler. Parking blocks the thread on the wakeup gate;
/// resuming fires the gate from whichever thread committed the write.
pub struct ThreadScheduler {
    fibers: DashMap<FiberId, FiberState>,
}

static GLOBAL: Lazy<ThreadScheduler> = Lazy::new(ThreadScheduler::new);

impl ThreadScheduler {
    /// Create a scheduler with an empty fiber table
    pub fn new() -> Self {
        ThreadScheduler {
            fibers: DashMap::new(),
        }
    }

    /// The process-wide scheduler used by `atomically`
    pub fn global() -> &'static ThreadScheduler {
        &GLOBAL
    }

    /// Ask `fiber` to stop
    ///
    /// Sets the cancellation flag and fires the fiber's parked handle, if
    /// any, so a blocked transaction re-checks the flag instead of waiting
    /// for a cell write that may never come.
    pub fn cancel(&self, fiber: FiberId) {
        let parked = {
            let mut state = self.fibers.entry(fiber).or_default();
            state.cancelled = true;
            state.parked.take()
        };
        trace!(fiber = fiber.as_u64(), "fiber cancelled");
        if let Some(handle) = parked {
            handle.fire();
        }
    }

    /// True when `fiber` has been cancelled
    pub fn is_fiber_cancelled(&self, fiber: FiberId) -> bool {
        self.fibers.get(&fiber).map(|s| s.cancelled).unwrap_or(false)
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        ThreadScheduler::new()
    }
}

impl Scheduler for ThreadScheduler {
    fn current_fiber(&self) -> FiberId {
        CURRENT_FIBER.with(|id| *id)
    }

    fn park(&self, wakeup: &WakeupHandle) {
        let fiber = self.current_fiber();
        {
            let mut state = self.fibers.entry(fiber).or_default();
            state.parked = Some(wakeup.clone());
        }
        // The table guard is released before blocking; a concurrent
        // `cancel` either saw the handle (and fires it) or runs after the
        // wait returns.
        wakeup.wait();
        if let Some(mut state) = self.fibers.get_mut(&fiber) {
            state.parked = None;
        }
    }

    fn resume(&self, wakeup: &WakeupHandle) {
        wakeup.fire();
    }

    fn is_cancelled(&self) -> bool {
        self.is_fiber_cancelled(self.current_fiber())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wakeup::Wakeup;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_each_thread_gets_a_stable_fiber_id() {
        let sched = ThreadScheduler::new();
        let here = sched.current_fiber();
        assert_eq!(here, sched.current_fiber());

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let sched = ThreadScheduler::new();
            tx.send(sched.current_fiber()).unwrap();
        })
        .join()
        .unwrap();
        let there = rx.recv().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_park_blocks_until_resume() {
        let sched = ThreadScheduler::global();
        let handle = Wakeup::handle();
        let parked = {
            let handle = handle.clone();
            thread::spawn(move || {
                ThreadScheduler::global().park(&handle);
            })
        };
        thread::sleep(Duration::from_millis(20));
        sched.resume(&handle);
        parked.join().unwrap();
    }

    #[test]
    fn test_cancel_fires_parked_handle_and_sets_flag() {
        let (tx, rx) = mpsc::channel();
        let parked = thread::spawn(move || {
            let sched = ThreadScheduler::global();
            let handle = Wakeup::handle();
            tx.send((sched.current_fiber(), handle.clone())).unwrap();
            sched.park(&handle);
            sched.is_cancelled()
        });
        let (fiber, _handle) = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        ThreadScheduler::global().cancel(fiber);
        assert!(parked.join().unwrap());
    }

    #[test]
    fn test_cancel_before_park_is_observed() {
        let sched = ThreadScheduler::new();
        let fiber = FiberId::fresh();
        sched.cancel(fiber);
        assert!(sched.is_fiber_cancelled(fiber));
    }
}
