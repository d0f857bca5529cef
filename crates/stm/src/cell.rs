//! Versioned transactional cells
//!
//! A [`TRef<T>`] is the only mutable primitive in the runtime: a single
//! slot holding an immutable value (mutation happens by replacement) plus
//! a version number bumped on every committed write and a registry of
//! wakeup handles parked on the cell.
//!
//! The typed surface builds transaction terms; nothing here touches the
//! live slot directly except the journal (first-touch snapshots) and the
//! commit coordinator (publication). Slot access is guarded by a short
//! per-cell mutex so first-touch snapshots are internally consistent even
//! though transaction bodies run outside the commit lock; the commit lock
//! remains the sole ordering boundary.

use crate::journal::Journal;
use crate::term::{Dyn, Stm, Term, TxValue};
use lattice_core::types::{CellId, WakeupId};
use lattice_core::wakeup::WakeupHandle;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::marker::PhantomData;
use std::sync::Arc;

pub(crate) struct CellSlot {
    pub(crate) version: u64,
    pub(crate) value: Dyn,
}

/// Type-erased cell state shared between `TRef` handles, journals, and the
/// commit coordinator.
pub(crate) struct CellCore {
    id: CellId,
    slot: Mutex<CellSlot>,
    todos: Mutex<FxHashMap<WakeupId, WakeupHandle>>,
}

impl CellCore {
    pub(crate) fn new(value: Dyn) -> Arc<Self> {
        Arc::new(CellCore {
            id: CellId::fresh(),
            slot: Mutex::new(CellSlot { version: 0, value }),
            todos: Mutex::new(FxHashMap::default()),
        })
    }

    pub(crate) fn id(&self) -> CellId {
        self.id
    }

    /// Consistent `(version, value)` pair for journal first-touch.
    pub(crate) fn snapshot(&self) -> (u64, Dyn) {
        let slot = self.slot.lock();
        (slot.version, slot.value.clone())
    }

    pub(crate) fn current_version(&self) -> u64 {
        self.slot.lock().version
    }

    /// Store a committed value and bump the version.
    ///
    /// Only the commit coordinator calls this, under the commit lock.
    pub(crate) fn publish(&self, value: Dyn) -> u64 {
        let mut slot = self.slot.lock();
        slot.version += 1;
        slot.value = value;
        slot.version
    }

    /// Journal-aware read: install a first-touch entry if absent.
    pub(crate) fn read_in(self: &Arc<Self>, journal: &mut Journal) -> Dyn {
        journal.read(self)
    }

    /// Journal-aware write: install or update the entry and mark it written.
    pub(crate) fn write_in(self: &Arc<Self>, journal: &mut Journal, value: Dyn) {
        journal.write(self, value);
    }

    pub(crate) fn register_todo(&self, handle: &WakeupHandle) {
        self.todos.lock().insert(handle.id(), handle.clone());
    }

    pub(crate) fn remove_todo(&self, id: WakeupId) {
        self.todos.lock().remove(&id);
    }

    /// Drain the registry, returning every parked handle.
    pub(crate) fn take_todos(&self) -> FxHashMap<WakeupId, WakeupHandle> {
        std::mem::take(&mut *self.todos.lock())
    }

    pub(crate) fn pending_todos(&self) -> usize {
        self.todos.lock().len()
    }
}

/// A transactional reference: one versioned slot of `T`
///
/// `TRef` handles are cheap to clone and compare equal when they point at
/// the same cell. All access goes through transactions:
///
/// ```
/// use lattice_stm::{atomically, TRef};
/// use std::convert::Infallible;
///
/// let counter = TRef::new(0_i64);
/// let bump = counter.update::<Infallible>(|n| n + 1);
/// atomically(&bump).unwrap();
/// assert_eq!(atomically(&counter.get::<Infallible>()), Ok(1));
/// ```
pub struct TRef<T> {
    pub(crate) core: Arc<CellCore>,
    marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TRef<T> {
    fn clone(&self) -> Self {
        TRef {
            core: Arc::clone(&self.core),
            marker: PhantomData,
        }
    }
}

impl<T> PartialEq for TRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.core.id() == other.core.id()
    }
}

impl<T> Eq for TRef<T> {}

impl<T> std::fmt::Debug for TRef<T> {
    // Prints the cell identity only; the value may be mid-transaction.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TRef(#{})", self.core.id().as_u64())
    }
}

impl<T: TxValue> TRef<T> {
    /// Create a cell holding `value`
    pub fn new(value: T) -> Self {
        TRef {
            core: CellCore::new(Arc::new(value)),
            marker: PhantomData,
        }
    }

    /// In-transaction constructor
    ///
    /// Allocates a fresh cell on every attempt, so a term holding `make`
    /// can be re-executed safely.
    pub fn make<E: TxValue>(value: T) -> Stm<TRef<T>, E> {
        Stm::sync(move || TRef::new(value.clone()))
    }

    /// Read the cell
    pub fn get<E: TxValue>(&self) -> Stm<T, E> {
        Stm::from_term(Arc::new(Term::Read(Arc::clone(&self.core))))
    }

    /// Replace the cell's value
    pub fn set<E: TxValue>(&self, value: T) -> Stm<(), E> {
        Stm::from_term(Arc::new(Term::Write(
            Arc::clone(&self.core),
            Arc::new(value) as Dyn,
        )))
    }

    /// Apply `f` to the current value and store the result
    pub fn update<E: TxValue>(
        &self,
        f: impl Fn(&T) -> T + Send + Sync + 'static,
    ) -> Stm<(), E> {
        let cell = self.clone();
        self.get().flat_map(move |value: T| cell.set(f(&value)))
    }

    /// Apply `f`, store the new value, and return the extracted output
    pub fn modify<B: TxValue, E: TxValue>(
        &self,
        f: impl Fn(&T) -> (B, T) + Send + Sync + 'static,
    ) -> Stm<B, E> {
        let cell = self.clone();
        self.get().flat_map(move |value: T| {
            let (out, next) = f(&value);
            cell.set(next).map(move |_| out.clone())
        })
    }

    /// Replace the value, returning the previous one
    pub fn get_and_set<E: TxValue>(&self, value: T) -> Stm<T, E> {
        let cell = self.clone();
        self.get()
            .flat_map(move |old: T| cell.set(value.clone()).map(move |_| old.clone()))
    }

    /// Apply `f`, store the result, and return the previous value
    pub fn get_and_update<E: TxValue>(
        &self,
        f: impl Fn(&T) -> T + Send + Sync + 'static,
    ) -> Stm<T, E> {
        let cell = self.clone();
        self.get()
            .flat_map(move |old: T| cell.set(f(&old)).map(move |_| old.clone()))
    }
}
