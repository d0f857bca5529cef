//! One-shot wakeup handles
//!
//! A parked fiber leaves a [`WakeupHandle`] in the registry of every cell
//! its transaction observed. The first committed write to any of those
//! cells fires the handle; firing is idempotent, so a handle registered in
//! many cells resumes its fiber at most once per park.
//!
//! The handle doubles as the park gate for the default thread scheduler:
//! `wait` blocks the calling thread until `fire`, and returns immediately
//! when the handle fired before the waiter arrived. That ordering freedom
//! is what lets the commit coordinator release its lock before firing.

use crate::types::WakeupId;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Shared handle to a one-shot wakeup gate
pub type WakeupHandle = Arc<Wakeup>;

/// A one-shot fire/wait gate identified by a [`WakeupId`]
pub struct Wakeup {
    id: WakeupId,
    fired: Mutex<bool>,
    signal: Condvar,
}

impl Wakeup {
    /// Create a fresh, unfired handle
    pub fn handle() -> WakeupHandle {
        Arc::new(Wakeup {
            id: WakeupId::fresh(),
            fired: Mutex::new(false),
            signal: Condvar::new(),
        })
    }

    /// Identity of this handle
    pub fn id(&self) -> WakeupId {
        self.id
    }

    /// Fire the gate
    ///
    /// Returns `true` only for the call that transitioned the gate;
    /// every later call is a no-op returning `false`.
    pub fn fire(&self) -> bool {
        let mut fired = self.fired.lock();
        if *fired {
            return false;
        }
        *fired = true;
        self.signal.notify_all();
        true
    }

    /// True once `fire` has been called
    pub fn has_fired(&self) -> bool {
        *self.fired.lock()
    }

    /// Block the calling thread until the gate fires
    ///
    /// Returns immediately if the gate already fired.
    pub fn wait(&self) {
        let mut fired = self.fired.lock();
        while !*fired {
            self.signal.wait(&mut fired);
        }
    }
}

impl std::fmt::Debug for Wakeup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wakeup")
            .field("id", &self.id)
            .field("fired", &self.has_fired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fire_is_one_shot() {
        let w = Wakeup::handle();
        assert!(!w.has_fired());
        assert!(w.fire());
        assert!(!w.fire());
        assert!(w.has_fired());
    }

    #[test]
    fn test_wait_returns_immediately_after_fire() {
        let w = Wakeup::handle();
        w.fire();
        // Must not block.
        w.wait();
    }

    #[test]
    fn test_fire_unblocks_waiter() {
        let w = Wakeup::handle();
        let waiter = {
            let w = Arc::clone(&w);
            thread::spawn(move || w.wait())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(w.fire());
        waiter.join().unwrap();
    }

    #[test]
    fn test_handles_have_distinct_ids() {
        let a = Wakeup::handle();
        let b = Wakeup::handle();
        assert_ne!(a.id(), b.id());
    }
}
