//! Transactional FIFO queues
//!
//! A [`TQueue`] is a pure composition of cells: head and tail pointers
//! over a singly linked list of value nodes, where every node slot is
//! itself a cell holding `Option<Node<T>>` and the tail slot is always
//! empty. Admission and ordering live entirely in transaction code, so a
//! queue operation composes with any other transaction.
//!
//! Blocking is expressed with `retry`: `take` on an empty queue and
//! `offer` on a full backpressure queue park the caller until another
//! transaction writes one of the observed cells.

use crate::strategy::AdmissionStrategy;
use lattice_core::error::ShutdownError;
use lattice_stm::{Stm, TRef, TxValue};
use std::sync::Arc;
use tracing::debug;

type Slot<T> = TRef<Option<Node<T>>>;

#[derive(Clone)]
struct Node<T> {
    value: T,
    next: Slot<T>,
}

struct QueueCore<T> {
    head: TRef<Slot<T>>,
    tail: TRef<Slot<T>>,
    size: TRef<usize>,
    capacity: Option<usize>,
    strategy: AdmissionStrategy,
    down: TRef<bool>,
}

/// A multi-producer multi-consumer transactional queue
///
/// Handles are cheap to clone; all clones view the same queue. Every
/// operation is a single transaction and may be composed into larger ones
/// before being submitted with `atomically`.
pub struct TQueue<T> {
    core: Arc<QueueCore<T>>,
}

impl<T> Clone for TQueue<T> {
    fn clone(&self) -> Self {
        TQueue {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: TxValue> TQueue<T> {
    fn with_strategy(capacity: Option<usize>, strategy: AdmissionStrategy) -> Self {
        let empty: Slot<T> = TRef::new(None);
        debug!(?capacity, ?strategy, "queue created");
        TQueue {
            core: Arc::new(QueueCore {
                head: TRef::new(empty.clone()),
                tail: TRef::new(empty),
                size: TRef::new(0),
                capacity,
                strategy,
                down: TRef::new(false),
            }),
        }
    }

    /// Bounded queue: a full `offer` blocks until space frees up
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero.
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        TQueue::with_strategy(Some(capacity), AdmissionStrategy::Backpressure)
    }

    /// Bounded queue: a full `offer` rejects the value with `false`
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero.
    pub fn dropping(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        TQueue::with_strategy(Some(capacity), AdmissionStrategy::Dropping)
    }

    /// Bounded queue: a full `offer` evicts the oldest value
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero.
    pub fn sliding(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        TQueue::with_strategy(Some(capacity), AdmissionStrategy::Sliding)
    }

    /// Queue with no capacity bound
    pub fn unbounded() -> Self {
        TQueue::with_strategy(None, AdmissionStrategy::Unbounded)
    }

    /// The configured capacity, `None` for unbounded
    pub fn capacity(&self) -> Option<usize> {
        self.core.capacity
    }

    /// The configured admission strategy
    pub fn strategy(&self) -> AdmissionStrategy {
        self.core.strategy
    }

    fn require_open(&self) -> Stm<(), ShutdownError> {
        self.core.down.get().flat_map(|down| {
            if down {
                Stm::fail(ShutdownError)
            } else {
                Stm::succeed(())
            }
        })
    }

    /// Append one value; admission has already been decided.
    fn enqueue(&self, value: T) -> Stm<(), ShutdownError> {
        let tail = self.core.tail.clone();
        let size = self.core.size.clone();
        Stm::suspend(move || {
            // Fresh tail slot per attempt: terms re-run after conflicts.
            let fresh: Slot<T> = TRef::new(None);
            let tail = tail.clone();
            let size = size.clone();
            let value = value.clone();
            tail.get().flat_map(move |last: Slot<T>| {
                let tail = tail.clone();
                let size = size.clone();
                let fresh = fresh.clone();
                let node = Node {
                    value: value.clone(),
                    next: fresh.clone(),
                };
                last.set(Some(node))
                    .flat_map(move |_| tail.set(fresh.clone()))
                    .flat_map(move |_| size.update(|n| n + 1))
            })
        })
    }

    /// Detach the head node, if any.
    fn pop(&self) -> Stm<Option<T>, ShutdownError> {
        let head = self.core.head.clone();
        let size = self.core.size.clone();
        head.get().flat_map(move |first: Slot<T>| {
            let head = head.clone();
            let size = size.clone();
            first.get().flat_map(move |node: Option<Node<T>>| match node {
                None => Stm::succeed(None),
                Some(node) => {
                    let size = size.clone();
                    let value = node.value.clone();
                    head.set(node.next.clone())
                        .flat_map(move |_| size.update(|n| n.saturating_sub(1)))
                        .map(move |_| Some(value.clone()))
                }
            })
        })
    }

    /// Offer one value, applying the admission strategy when full
    ///
    /// Returns whether the value was admitted. Backpressure queues block
    /// instead of refusing, so they always return `true`.
    pub fn offer(&self, value: T) -> Stm<bool, ShutdownError> {
        let this = self.clone();
        self.require_open()
            .flat_map(move |_| this.admit(value.clone()))
    }

    fn admit(&self, value: T) -> Stm<bool, ShutdownError> {
        let this = self.clone();
        self.core.size.get().flat_map(move |size: usize| {
            let full = this.core.capacity.map_or(false, |c| size >= c);
            if !full {
                return this.enqueue(value.clone()).map(|_| true);
            }
            match this.core.strategy {
                AdmissionStrategy::Backpressure => Stm::retry(),
                AdmissionStrategy::Dropping => Stm::succeed(false),
                AdmissionStrategy::Sliding => {
                    let enqueue = this.enqueue(value.clone());
                    this.pop()
                        .flat_map(move |_| enqueue.clone())
                        .map(|_| true)
                }
                AdmissionStrategy::Unbounded => this.enqueue(value.clone()).map(|_| true),
            }
        })
    }

    /// Offer every value in order
    ///
    /// Returns `true` when all values were admitted. A backpressure queue
    /// blocks until the whole batch fits the successive states it flows
    /// through; lossy queues may report `false` after dropping.
    pub fn offer_all(&self, values: Vec<T>) -> Stm<bool, ShutdownError> {
        let mut chain: Stm<bool, ShutdownError> = Stm::succeed(true);
        for value in values {
            let step = self.offer(value);
            chain = chain.flat_map(move |admitted| {
                step.clone().map(move |ok| admitted && ok)
            });
        }
        chain
    }

    /// Take the oldest value, blocking while the queue is empty
    pub fn take(&self) -> Stm<T, ShutdownError> {
        let pop = self.pop();
        self.require_open().flat_map(move |_| {
            pop.clone().flat_map(|taken| match taken {
                Some(value) => Stm::succeed(value),
                None => Stm::retry(),
            })
        })
    }

    /// Take the oldest value if one is present
    pub fn poll(&self) -> Stm<Option<T>, ShutdownError> {
        let pop = self.pop();
        self.require_open().flat_map(move |_| pop.clone())
    }

    /// Read the oldest value without removing it, blocking while empty
    pub fn peek(&self) -> Stm<T, ShutdownError> {
        let head = self.core.head.clone();
        self.require_open().flat_map(move |_| {
            head.get().flat_map(|first: Slot<T>| {
                first.get().flat_map(|node: Option<Node<T>>| match node {
                    None => Stm::retry(),
                    Some(node) => Stm::succeed(node.value),
                })
            })
        })
    }

    /// Drain the queue completely
    pub fn take_all(&self) -> Stm<Vec<T>, ShutdownError> {
        let this = self.clone();
        self.require_open()
            .flat_map(move |_| drain(this.clone(), Vec::new(), None))
    }

    /// Drain at most `max` values
    pub fn take_upto(&self, max: usize) -> Stm<Vec<T>, ShutdownError> {
        let this = self.clone();
        self.require_open()
            .flat_map(move |_| drain(this.clone(), Vec::new(), Some(max)))
    }

    /// Number of queued values
    pub fn size(&self) -> Stm<usize, ShutdownError> {
        let size = self.core.size.clone();
        self.require_open().flat_map(move |_| size.get())
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> Stm<bool, ShutdownError> {
        self.size().map(|n| n == 0)
    }

    /// True when the queue is at capacity
    pub fn is_full(&self) -> Stm<bool, ShutdownError> {
        let capacity = self.core.capacity;
        self.size()
            .map(move |n| capacity.map_or(false, |c| n >= c))
    }

    /// Shut the queue down
    ///
    /// Every later operation fails with [`ShutdownError`]; fibers blocked
    /// on the queue wake and observe the shutdown. Idempotent.
    pub fn shutdown(&self) -> Stm<(), ShutdownError> {
        self.core.down.set(true)
    }

    /// True once the queue has been shut down
    pub fn is_shutdown(&self) -> Stm<bool, ShutdownError> {
        self.core.down.get()
    }

    /// Block until the queue has been shut down
    pub fn await_shutdown(&self) -> Stm<(), ShutdownError> {
        self.core.down.get().flat_map(Stm::check)
    }
}

/// Repeatedly pop until empty or `limit` values were taken.
fn drain<T: TxValue>(
    queue: TQueue<T>,
    acc: Vec<T>,
    limit: Option<usize>,
) -> Stm<Vec<T>, ShutdownError> {
    Stm::suspend(move || {
        let queue = queue.clone();
        let acc = acc.clone();
        if limit.map_or(false, |max| acc.len() >= max) {
            return Stm::succeed(acc);
        }
        queue.clone().pop().flat_map(move |taken| match taken {
            None => Stm::succeed(acc.clone()),
            Some(value) => {
                let mut next = acc.clone();
                next.push(value);
                drain(queue.clone(), next, limit)
            }
        })
    })
}
