//! Transactional counting semaphores
//!
//! A [`TSemaphore`] is a single cell holding the available permit count.
//! Acquisition blocks through `retry` until enough permits are available,
//! so waiting composes with any other transactional condition.

use lattice_stm::{Stm, TRef, TxValue};

/// A counting semaphore backed by one transactional cell
pub struct TSemaphore {
    permits: TRef<u64>,
}

impl Clone for TSemaphore {
    fn clone(&self) -> Self {
        TSemaphore {
            permits: self.permits.clone(),
        }
    }
}

impl TSemaphore {
    /// Create a semaphore holding `permits` permits
    pub fn new(permits: u64) -> Self {
        TSemaphore {
            permits: TRef::new(permits),
        }
    }

    /// Currently available permits
    pub fn available<E: TxValue>(&self) -> Stm<u64, E> {
        self.permits.get()
    }

    /// Acquire one permit, blocking while none is available
    pub fn acquire<E: TxValue>(&self) -> Stm<(), E> {
        self.acquire_n(1)
    }

    /// Acquire `n` permits atomically, blocking while fewer are available
    pub fn acquire_n<E: TxValue>(&self, n: u64) -> Stm<(), E> {
        let permits = self.permits.clone();
        self.permits.get().flat_map(move |available: u64| {
            if available < n {
                Stm::retry()
            } else {
                permits.set(available - n)
            }
        })
    }

    /// Release one permit
    pub fn release<E: TxValue>(&self) -> Stm<(), E> {
        self.release_n(1)
    }

    /// Release `n` permits
    ///
    /// Dies with a defect when the count would overflow; releasing more
    /// than was ever acquired is a caller bug, not an error state.
    pub fn release_n<E: TxValue>(&self, n: u64) -> Stm<(), E> {
        let permits = self.permits.clone();
        self.permits
            .get()
            .flat_map(move |available: u64| match available.checked_add(n) {
                Some(total) => permits.set(total),
                None => Stm::die("semaphore permit count overflow"),
            })
    }
}
