//! Per-attempt transaction journals
//!
//! A journal is the tentative view of one transaction attempt: for every
//! cell the attempt touched, the version it observed, the value it saw on
//! first touch, and the value it intends to publish. Journals are owned by
//! exactly one attempt and discarded on commit or abort.
//!
//! `is_invalid` is the sole validation predicate: an attempt whose journal
//! holds a stale observation must restart, never commit.

use crate::cell::CellCore;
use crate::term::Dyn;
use lattice_core::types::{CellId, WakeupId};
use lattice_core::wakeup::WakeupHandle;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// One cell's footprint in a journal
///
/// At most one entry exists per cell. `original` keeps the first-touch
/// value so an aborted `or_try` branch can be downgraded back to a pure
/// observation.
pub(crate) struct JournalEntry {
    pub(crate) cell: Arc<CellCore>,
    pub(crate) observed_version: u64,
    pub(crate) original: Dyn,
    pub(crate) tentative: Dyn,
    pub(crate) written: bool,
}

/// The tentative read/write log of a single transaction attempt
#[derive(Default)]
pub(crate) struct Journal {
    entries: FxHashMap<CellId, JournalEntry>,
    wrote: bool,
}

impl Journal {
    pub(crate) fn new() -> Self {
        Journal::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True while no write has been journaled
    pub(crate) fn is_read_only(&self) -> bool {
        !self.wrote
    }

    pub(crate) fn lookup(&self, id: CellId) -> Option<&JournalEntry> {
        self.entries.get(&id)
    }

    /// Read `cell` through the journal, installing a first-touch entry
    /// from the live slot when absent.
    pub(crate) fn read(&mut self, cell: &Arc<CellCore>) -> Dyn {
        if let Some(entry) = self.entries.get(&cell.id()) {
            return entry.tentative.clone();
        }
        let (version, value) = cell.snapshot();
        self.entries.insert(
            cell.id(),
            JournalEntry {
                cell: Arc::clone(cell),
                observed_version: version,
                original: value.clone(),
                tentative: value.clone(),
                written: false,
            },
        );
        value
    }

    /// Write `value` to `cell` through the journal.
    pub(crate) fn write(&mut self, cell: &Arc<CellCore>, value: Dyn) {
        self.wrote = true;
        match self.entries.get_mut(&cell.id()) {
            Some(entry) => {
                entry.tentative = value;
                entry.written = true;
            }
            None => {
                let (version, original) = cell.snapshot();
                self.entries.insert(
                    cell.id(),
                    JournalEntry {
                        cell: Arc::clone(cell),
                        observed_version: version,
                        original,
                        tentative: value,
                        written: true,
                    },
                );
            }
        }
    }

    /// True iff any observation is stale against the live cells
    pub(crate) fn is_invalid(&self) -> bool {
        self.entries
            .values()
            .any(|entry| entry.cell.current_version() != entry.observed_version)
    }

    /// Fold a retried branch's journal into this one as pure observations
    ///
    /// The branch's writes are discarded; its reads are kept (downgraded
    /// to unwritten entries) so the surrounding transaction still parks on
    /// those cells. Entries already present here win.
    pub(crate) fn merge_observations(&mut self, child: Journal) {
        for (id, entry) in child.entries {
            self.entries.entry(id).or_insert(JournalEntry {
                cell: entry.cell,
                observed_version: entry.observed_version,
                tentative: entry.original.clone(),
                original: entry.original,
                written: false,
            });
        }
    }

    /// Adopt a completed branch's journal wholesale
    ///
    /// Branch entries overwrite any entry this journal already held for
    /// the same cell.
    pub(crate) fn adopt(&mut self, child: Journal) {
        self.wrote |= child.wrote;
        for (id, entry) in child.entries {
            self.entries.insert(id, entry);
        }
    }

    /// Register a parked fiber's handle in every observed cell
    ///
    /// Caller holds the commit lock.
    pub(crate) fn register_todos(&self, handle: &WakeupHandle) {
        for entry in self.entries.values() {
            entry.cell.register_todo(handle);
        }
    }

    /// Remove a handle from every observed cell's registry
    ///
    /// Caller holds the commit lock. Used after a park returns (fired
    /// handles may still be registered in unwritten cells) and on
    /// cancellation.
    pub(crate) fn deregister_todos(&self, id: WakeupId) {
        for entry in self.entries.values() {
            entry.cell.remove_todo(id);
        }
    }

    /// Publish every written entry and drain the written cells' wakeups
    ///
    /// Caller holds the commit lock and has validated the journal. The
    /// returned map is the union of the drained registries, keyed by
    /// handle id so each handle fires at most once.
    pub(crate) fn publish(&self) -> FxHashMap<WakeupId, WakeupHandle> {
        let mut woken = FxHashMap::default();
        for entry in self.entries.values() {
            if entry.written {
                entry.cell.publish(entry.tentative.clone());
                woken.extend(entry.cell.take_todos());
            }
        }
        woken
    }
}
