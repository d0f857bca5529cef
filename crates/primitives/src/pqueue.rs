//! Transactional priority queues
//!
//! A [`TPriorityQueue`] delivers values in ascending key order, FIFO
//! within a key. It is a single cell holding an ordered map from key to
//! bucket, so every operation is one read-modify-write and composes with
//! any other transaction. Unbounded; there is no admission strategy and no
//! shutdown protocol.

use lattice_stm::{Stm, TRef, TxValue};
use std::collections::BTreeMap;

/// A min-first transactional priority queue
pub struct TPriorityQueue<K, V> {
    entries: TRef<BTreeMap<K, Vec<V>>>,
}

impl<K, V> Clone for TPriorityQueue<K, V> {
    fn clone(&self) -> Self {
        TPriorityQueue {
            entries: self.entries.clone(),
        }
    }
}

impl<K, V> TPriorityQueue<K, V>
where
    K: Ord + TxValue,
    V: TxValue,
{
    /// Create an empty priority queue
    pub fn new() -> Self {
        TPriorityQueue {
            entries: TRef::new(BTreeMap::new()),
        }
    }

    /// Queue `value` under `key`
    pub fn offer<E: TxValue>(&self, key: K, value: V) -> Stm<(), E> {
        self.entries.update(move |entries| {
            let mut entries = entries.clone();
            entries.entry(key.clone()).or_default().push(value.clone());
            entries
        })
    }

    /// Take the value with the smallest key, blocking while empty
    pub fn take<E: TxValue>(&self) -> Stm<V, E> {
        let cell = self.entries.clone();
        self.entries
            .get()
            .flat_map(move |entries: BTreeMap<K, Vec<V>>| {
                let (key, bucket) = match entries.iter().next() {
                    None => return Stm::retry(),
                    Some(found) => found,
                };
                let value = match bucket.first() {
                    // Empty buckets are removed on take; reaching one
                    // means the map lost that invariant.
                    None => return Stm::die("priority queue held an empty bucket"),
                    Some(value) => value.clone(),
                };
                let key = key.clone();
                let cell = cell.clone();
                cell.update(move |entries| {
                    let mut entries = entries.clone();
                    if let Some(bucket) = entries.get_mut(&key) {
                        if !bucket.is_empty() {
                            bucket.remove(0);
                        }
                        if bucket.is_empty() {
                            entries.remove(&key);
                        }
                    }
                    entries
                })
                .map(move |_| value.clone())
            })
    }

    /// Take the value with the smallest key if one is present
    pub fn poll<E: TxValue>(&self) -> Stm<Option<V>, E> {
        self.take().map(Some).or_try(Stm::succeed(None))
    }

    /// Read the value with the smallest key without consuming it,
    /// blocking while empty
    pub fn peek<E: TxValue>(&self) -> Stm<V, E> {
        self.entries
            .get()
            .flat_map(|entries: BTreeMap<K, Vec<V>>| {
                match entries.iter().next().and_then(|(_, b)| b.first()) {
                    None => Stm::retry(),
                    Some(value) => Stm::succeed(value.clone()),
                }
            })
    }

    /// Drain everything in priority order
    pub fn take_all<E: TxValue>(&self) -> Stm<Vec<V>, E> {
        let cell = self.entries.clone();
        self.entries
            .get()
            .flat_map(move |entries: BTreeMap<K, Vec<V>>| {
                let drained: Vec<V> = entries.values().flatten().cloned().collect();
                cell.set(BTreeMap::new()).map(move |_| drained.clone())
            })
    }

    /// Number of queued values across all keys
    pub fn size<E: TxValue>(&self) -> Stm<usize, E> {
        self.entries
            .get()
            .map(|entries: BTreeMap<K, Vec<V>>| entries.values().map(Vec::len).sum())
    }

    /// True when nothing is queued
    pub fn is_empty<E: TxValue>(&self) -> Stm<bool, E> {
        self.entries
            .get()
            .map(|entries: BTreeMap<K, Vec<V>>| entries.is_empty())
    }
}

impl<K, V> Default for TPriorityQueue<K, V>
where
    K: Ord + TxValue,
    V: TxValue,
{
    fn default() -> Self {
        TPriorityQueue::new()
    }
}
