//! Transactional broadcast hubs
//!
//! A [`THub`] fans every published value out to all current subscribers.
//! Internally it is a singly linked list of publisher nodes, each carrying
//! the value, a countdown of subscribers still due to read it, and the
//! next slot. `publisher_head` points at the oldest retained node,
//! `publisher_tail` at the always-empty slot values are appended into.
//! Each subscription owns a cursor cell pointing at the next slot it will
//! read.
//!
//! A node is reclaimed from the head only once every subscriber has moved
//! past it, so the hub never retains a value some live subscriber still
//! needs, and never retains one nobody needs. All of it is plain cell
//! composition: every mutation flows through the journal and commit path.

use crate::strategy::AdmissionStrategy;
use lattice_core::error::ShutdownError;
use lattice_core::scope::Scope;
use lattice_stm::{atomically, Stm, TRef, TxValue};
use std::sync::Arc;
use tracing::{debug, trace};

type Slot<T> = TRef<Option<HubNode<T>>>;

#[derive(Clone)]
struct HubNode<T> {
    value: T,
    /// Subscribers that have not read this node yet; its own cell so the
    /// node body stays shared-immutable.
    remaining: TRef<usize>,
    next: Slot<T>,
}

struct SubscriberEntry<T> {
    /// Next slot this subscriber will read. Doubles as the subscriber's
    /// identity: cursors are never shared.
    cursor: TRef<Slot<T>>,
    live: TRef<bool>,
}

impl<T> Clone for SubscriberEntry<T> {
    fn clone(&self) -> Self {
        SubscriberEntry {
            cursor: self.cursor.clone(),
            live: self.live.clone(),
        }
    }
}

struct HubCore<T> {
    publisher_head: TRef<Slot<T>>,
    publisher_tail: TRef<Slot<T>>,
    hub_size: TRef<usize>,
    capacity: Option<usize>,
    strategy: AdmissionStrategy,
    subscriber_count: TRef<usize>,
    subscribers: TRef<Vec<SubscriberEntry<T>>>,
    down: TRef<bool>,
}

/// A multi-producer multi-subscriber transactional hub
///
/// Values published while a subscription is live are delivered to that
/// subscription exactly once, in publish order, subject to the admission
/// strategy. Subscribers only see values published after they subscribed.
pub struct THub<T> {
    core: Arc<HubCore<T>>,
}

impl<T> Clone for THub<T> {
    fn clone(&self) -> Self {
        THub {
            core: Arc::clone(&self.core),
        }
    }
}

/// A live view into a hub, created by [`THub::subscribe`]
///
/// Dropping the handle does not unsubscribe; call
/// [`TSubscription::unsubscribe`] or use [`THub::subscribe_scoped`].
pub struct TSubscription<T> {
    hub: Arc<HubCore<T>>,
    entry: SubscriberEntry<T>,
}

impl<T> Clone for TSubscription<T> {
    fn clone(&self) -> Self {
        TSubscription {
            hub: Arc::clone(&self.hub),
            entry: self.entry.clone(),
        }
    }
}

impl<T: TxValue> THub<T> {
    fn with_strategy(capacity: Option<usize>, strategy: AdmissionStrategy) -> Self {
        let empty: Slot<T> = TRef::new(None);
        debug!(?capacity, ?strategy, "hub created");
        THub {
            core: Arc::new(HubCore {
                publisher_head: TRef::new(empty.clone()),
                publisher_tail: TRef::new(empty),
                hub_size: TRef::new(0),
                capacity,
                strategy,
                subscriber_count: TRef::new(0),
                subscribers: TRef::new(Vec::new()),
                down: TRef::new(false),
            }),
        }
    }

    /// Bounded hub: a full `publish` blocks until subscribers catch up
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero.
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "hub capacity must be positive");
        THub::with_strategy(Some(capacity), AdmissionStrategy::Backpressure)
    }

    /// Bounded hub: a full `publish` rejects the value with `false`
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero.
    pub fn dropping(capacity: usize) -> Self {
        assert!(capacity > 0, "hub capacity must be positive");
        THub::with_strategy(Some(capacity), AdmissionStrategy::Dropping)
    }

    /// Bounded hub: a full `publish` evicts the oldest retained value
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero.
    pub fn sliding(capacity: usize) -> Self {
        assert!(capacity > 0, "hub capacity must be positive");
        THub::with_strategy(Some(capacity), AdmissionStrategy::Sliding)
    }

    /// Hub with no capacity bound
    pub fn unbounded() -> Self {
        THub::with_strategy(None, AdmissionStrategy::Unbounded)
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

    /// Publish one value to every current subscriber
    ///
    /// With no subscribers the value has nowhere to go and the publish
    /// succeeds with `true` without retaining anything. When the hub is
    /// full the admission strategy decides: backpressure blocks, dropping
    /// returns `false`, sliding evicts the oldest retained value.
    pub fn publish(&self, value: T) -> Stm<bool, ShutdownError> {
        let this = self.clone();
        self.require_open().flat_map(move |_| {
            let this = this.clone();
            let value = value.clone();
            this.core
                .subscriber_count
                .get()
                .flat_map(move |subscribers: usize| {
                    if subscribers == 0 {
                        return Stm::succeed(true);
                    }
                    let this = this.clone();
                    let value = value.clone();
                    this.core.hub_size.get().flat_map(move |size: usize| {
                        let full = this.core.capacity.map_or(false, |c| size >= c);
                        if !full {
                            return this.append(value.clone(), subscribers).map(|_| true);
                        }
                        match this.core.strategy {
                            AdmissionStrategy::Backpressure => Stm::retry(),
                            AdmissionStrategy::Dropping => Stm::succeed(false),
                            AdmissionStrategy::Sliding => {
                                let append = this.append(value.clone(), subscribers);
                                this.slide()
                                    .flat_map(move |_| append.clone())
                                    .map(|_| true)
                            }
                            AdmissionStrategy::Unbounded => {
                                this.append(value.clone(), subscribers).map(|_| true)
                            }
                        }
                    })
                })
        })
    }

    /// Publish every value in order
    pub fn publish_all(&self, values: Vec<T>) -> Stm<bool, ShutdownError> {
        let mut chain: Stm<bool, ShutdownError> = Stm::succeed(true);
        for value in values {
            let step = self.publish(value);
            chain = chain.flat_map(move |admitted| {
                step.clone().map(move |ok| admitted && ok)
            });
        }
        chain
    }

    /// Append a node due to be read by `subscribers` readers.
    fn append(&self, value: T, subscribers: usize) -> Stm<(), ShutdownError> {
        let tail = self.core.publisher_tail.clone();
        let size = self.core.hub_size.clone();
        Stm::suspend(move || {
            // Fresh cells per attempt: terms re-run after conflicts.
            let fresh: Slot<T> = TRef::new(None);
            let remaining = TRef::new(subscribers);
            let tail = tail.clone();
            let size = size.clone();
            let value = value.clone();
            tail.get().flat_map(move |last: Slot<T>| {
                let tail = tail.clone();
                let size = size.clone();
                let node = HubNode {
                    value: value.clone(),
                    remaining: remaining.clone(),
                    next: fresh.clone(),
                };
                let fresh = fresh.clone();
                last.set(Some(node))
                    .flat_map(move |_| tail.set(fresh.clone()))
                    .flat_map(move |_| size.update(|n| n + 1))
            })
        })
    }

    /// Evict the oldest retained node, advancing any cursor parked on it.
    fn slide(&self) -> Stm<(), ShutdownError> {
        let head = self.core.publisher_head.clone();
        let size = self.core.hub_size.clone();
        let subscribers = self.core.subscribers.clone();
        head.get().flat_map(move |first: Slot<T>| {
            let head = head.clone();
            let size = size.clone();
            let subscribers = subscribers.clone();
            first.get().flat_map(move |node: Option<HubNode<T>>| {
                let node = match node {
                    // A full hub retains at least one node.
                    None => return Stm::die("sliding eviction found no retained node"),
                    Some(node) => node,
                };
                let head = head.clone();
                let size = size.clone();
                let next = node.next.clone();
                let advance = {
                    let first = first.clone();
                    let next = next.clone();
                    subscribers
                        .get()
                        .flat_map(move |entries: Vec<SubscriberEntry<T>>| {
                            let first = first.clone();
                            let next = next.clone();
                            Stm::for_each(entries, move |entry: SubscriberEntry<T>| {
                                let first = first.clone();
                                let next = next.clone();
                                entry.cursor.get().flat_map(move |at: Slot<T>| {
                                    if at == first {
                                        entry.cursor.set(next.clone())
                                    } else {
                                        Stm::succeed(())
                                    }
                                })
                            })
                        })
                };
                advance
                    .flat_map(move |_| head.set(next.clone()))
                    .flat_map(move |_| size.update(|n| n.saturating_sub(1)))
            })
        })
    }

    /// Drop fully-read nodes from the head.
    fn reclaim(&self) -> Stm<(), ShutdownError> {
        let head = self.core.publisher_head.clone();
        let size = self.core.hub_size.clone();
        let this = self.clone();
        head.get().flat_map(move |first: Slot<T>| {
            let size = size.clone();
            let this = this.clone();
            first.get().flat_map(move |node: Option<HubNode<T>>| {
                let node = match node {
                    None => return Stm::succeed(()),
                    Some(node) => node,
                };
                let size = size.clone();
                let this = this.clone();
                let next = node.next.clone();
                node.remaining.get().flat_map(move |remaining: usize| {
                    if remaining > 0 {
                        return Stm::succeed(());
                    }
                    let this = this.clone();
                    this.core
                        .publisher_head
                        .set(next.clone())
                        .flat_map({
                            let size = size.clone();
                            move |_| size.update(|n| n.saturating_sub(1))
                        })
                        .flat_map(move |_| this.reclaim())
                })
            })
        })
    }

    /// Subscribe to values published from now on
    ///
    /// The new subscription's cursor starts at the publisher tail, so it
    /// observes nothing published before this transaction commits.
    pub fn subscribe(&self) -> Stm<TSubscription<T>, ShutdownError> {
        let this = self.clone();
        self.require_open().flat_map(move |_| {
            let this = this.clone();
            this.core
                .publisher_tail
                .get()
                .flat_map(move |tail_slot: Slot<T>| {
                    let hub = Arc::clone(&this.core);
                    let count = this.core.subscriber_count.clone();
                    let subscribers = this.core.subscribers.clone();
                    Stm::sync(move || SubscriberEntry {
                        cursor: TRef::new(tail_slot.clone()),
                        live: TRef::new(true),
                    })
                    .flat_map(move |entry: SubscriberEntry<T>| {
                        let hub = Arc::clone(&hub);
                        let subscribers = subscribers.clone();
                        let registered = entry.clone();
                        count
                            .update(|n| n + 1)
                            .flat_map(move |_| {
                                let registered = registered.clone();
                                subscribers.update(move |entries| {
                                    let mut entries = entries.clone();
                                    entries.push(registered.clone());
                                    entries
                                })
                            })
                            .map(move |_| TSubscription {
                                hub: Arc::clone(&hub),
                                entry: entry.clone(),
                            })
                    })
                })
        })
    }

    /// Subscribe and bind the release to `scope`
    ///
    /// The subscription is acquired now; when the scope closes, the
    /// unsubscribe runs under a fresh transaction. Release is idempotent,
    /// so racing it with an explicit unsubscribe is harmless.
    pub fn subscribe_scoped(&self, scope: &Scope) -> Result<TSubscription<T>, ShutdownError> {
        let subscription = atomically(&self.subscribe())?;
        let release = subscription.clone();
        scope.add_finalizer(move || {
            let _ = atomically(&release.unsubscribe());
        });
        trace!("scoped hub subscription acquired");
        Ok(subscription)
    }

    /// Number of currently retained values
    ///
    /// Equals the lag of the slowest subscriber.
    pub fn size(&self) -> Stm<usize, ShutdownError> {
        let size = self.core.hub_size.clone();
        self.require_open().flat_map(move |_| size.get())
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> Stm<usize, ShutdownError> {
        let count = self.core.subscriber_count.clone();
        self.require_open().flat_map(move |_| count.get())
    }

    /// Shut the hub down
    ///
    /// Every later operation, including takes on existing subscriptions,
    /// fails with [`ShutdownError`]. Idempotent.
    pub fn shutdown(&self) -> Stm<(), ShutdownError> {
        self.core.down.set(true)
    }

    /// True once the hub has been shut down
    pub fn is_shutdown(&self) -> Stm<bool, ShutdownError> {
        self.core.down.get()
    }

    /// Block until the hub has been shut down
    pub fn await_shutdown(&self) -> Stm<(), ShutdownError> {
        self.core.down.get().flat_map(Stm::check)
    }
}

impl<T: TxValue> TSubscription<T> {
    fn hub_handle(&self) -> THub<T> {
        THub {
            core: Arc::clone(&self.hub),
        }
    }

    fn require_live(&self) -> Stm<(), ShutdownError> {
        let down = self.hub.down.clone();
        let live = self.entry.live.clone();
        down.get().flat_map(move |down| {
            if down {
                return Stm::fail(ShutdownError);
            }
            let live = live.clone();
            live.get().flat_map(|alive| {
                if alive {
                    Stm::succeed(())
                } else {
                    Stm::fail(ShutdownError)
                }
            })
        })
    }

    /// True while the subscription has not been unsubscribed
    pub fn is_live(&self) -> Stm<bool, ShutdownError> {
        self.entry.live.get()
    }

    /// Take the next value, blocking while none is pending
    pub fn take(&self) -> Stm<T, ShutdownError> {
        let cursor = self.entry.cursor.clone();
        let hub = self.hub_handle();
        self.require_live().flat_map(move |_| {
            let cursor = cursor.clone();
            let hub = hub.clone();
            cursor.get().flat_map(move |slot: Slot<T>| {
                let cursor = cursor.clone();
                let hub = hub.clone();
                slot.get().flat_map(move |node: Option<HubNode<T>>| {
                    let node = match node {
                        // At the tail: nothing published since our cursor.
                        None => return Stm::retry(),
                        Some(node) => node,
                    };
                    let cursor = cursor.clone();
                    let hub = hub.clone();
                    let value = node.value.clone();
                    let next = node.next.clone();
                    node.remaining
                        .update(|n| n.saturating_sub(1))
                        .flat_map(move |_| cursor.set(next.clone()))
                        .flat_map(move |_| hub.reclaim())
                        .map(move |_| value.clone())
                })
            })
        })
    }

    /// Read the next value without consuming it, blocking while none is
    /// pending
    pub fn peek(&self) -> Stm<T, ShutdownError> {
        let cursor = self.entry.cursor.clone();
        self.require_live().flat_map(move |_| {
            cursor.get().flat_map(|slot: Slot<T>| {
                slot.get().flat_map(|node: Option<HubNode<T>>| match node {
                    None => Stm::retry(),
                    Some(node) => Stm::succeed(node.value),
                })
            })
        })
    }

    /// Terminate the subscription
    ///
    /// Unread nodes stop waiting for this subscriber, and any node nobody
    /// else needs is reclaimed. Idempotent: a second unsubscribe, or one
    /// racing a scope release, is a no-op.
    pub fn unsubscribe(&self) -> Stm<(), ShutdownError> {
        let live = self.entry.live.clone();
        let cursor = self.entry.cursor.clone();
        let count = self.hub.subscriber_count.clone();
        let subscribers = self.hub.subscribers.clone();
        let hub = self.hub_handle();
        live.get().flat_map(move |alive| {
            if !alive {
                return Stm::succeed(());
            }
            let live = live.clone();
            let cursor = cursor.clone();
            let count = count.clone();
            let subscribers = subscribers.clone();
            let hub = hub.clone();
            let identity = cursor.clone();
            live.set(false)
                .flat_map(move |_| count.update(|n| n.saturating_sub(1)))
                .flat_map(move |_| {
                    let identity = identity.clone();
                    subscribers.update(move |entries| {
                        entries
                            .iter()
                            .filter(|e| e.cursor != identity)
                            .cloned()
                            .collect()
                    })
                })
                .flat_map(move |_| {
                    let cursor = cursor.clone();
                    cursor.get().flat_map(release_pending)
                })
                .flat_map(move |_| hub.reclaim())
        })
    }
}

/// Walk from `slot` to the tail, releasing this subscriber's claim on
/// every node it never read.
fn release_pending<T: TxValue>(slot: Slot<T>) -> Stm<(), ShutdownError> {
    Stm::suspend(move || {
        let slot = slot.clone();
        slot.get().flat_map(|node: Option<HubNode<T>>| match node {
            None => Stm::succeed(()),
            Some(node) => {
                let next = node.next.clone();
                node.remaining
                    .update(|n| n.saturating_sub(1))
                    .flat_map(move |_| release_pending(next.clone()))
            }
        })
    })
}
