//! Commit coordination
//!
//! A single global commit lock serialises journal validation, write
//! publication, and retry-parking. Transaction bodies run outside the
//! lock; only the decision points run under it. That split is also what
//! makes the wakeup protocol airtight: a parking reader registers its
//! handle under the same lock a writer must take to publish, so the writer
//! either fires the handle or commits early enough for the reader's
//! validation to notice and re-run instead of parking.
//!
//! ## Commit sequence
//!
//! ```text
//! 1. Execute the term outside the lock (pure work over the journal)
//! 2. Acquire the commit lock
//! 3. Re-validate the journal; stale -> release, re-run from scratch
//! 4. Retry outcome: register wakeup handle in every observed cell,
//!    release, park; on wakeup deregister and re-run
//! 5. Success: publish writes, bump versions, drain written cells'
//!    registries, release, fire handles, deliver the value
//! 6. Failure/Die: release without publishing, deliver
//! ```

use crate::executor::{self, Outcome};
use crate::journal::Journal;
use crate::term::{cast, Dyn, Stm, TxValue};
use lattice_core::error::TxnOutcome;
use lattice_core::sched::ThreadScheduler;
use lattice_core::traits::Scheduler;
use lattice_core::wakeup::{Wakeup, WakeupHandle};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// The global critical section for validation, publication, and parking.
static COMMIT_LOCK: Mutex<()> = Mutex::new(());

/// Submit a transaction on the current thread's fiber
///
/// Blocks transparently across retries and conflict restarts and returns
/// the typed result.
///
/// # Panics
///
/// Panics when the transaction dies with a defect, or when the driving
/// fiber is cancelled mid-transaction. Use [`atomically_outcome`] on
/// fibers that participate in cancellation.
pub fn atomically<A: TxValue, E: TxValue>(stm: &Stm<A, E>) -> Result<A, E> {
    match atomically_outcome(stm, ThreadScheduler::global()) {
        TxnOutcome::Success(value) => Ok(value),
        TxnOutcome::Failure(error) => Err(error),
        TxnOutcome::Die(defect) => panic!("{defect}"),
        TxnOutcome::Interrupted => {
            panic!("transaction interrupted: fiber cancelled; use atomically_outcome")
        }
    }
}

/// Submit a transaction under an explicit scheduler
///
/// Reports every terminal outcome, including defects and interruption, so
/// the enclosing runtime decides how to route them.
pub fn atomically_outcome<A: TxValue, E: TxValue>(
    stm: &Stm<A, E>,
    sched: &dyn Scheduler,
) -> TxnOutcome<A, E> {
    let env: Dyn = Arc::new(());
    let fiber = sched.current_fiber();
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        if sched.is_cancelled() {
            return TxnOutcome::Interrupted;
        }

        let mut journal = Journal::new();
        match executor::run(&stm.term, &env, &mut journal, sched) {
            Outcome::Invalid => {
                debug!(
                    fiber = fiber.as_u64(),
                    attempt, "journal went stale mid-attempt; restarting"
                );
                continue;
            }
            Outcome::Interrupted => return TxnOutcome::Interrupted,
            Outcome::Retry => {
                if journal.is_empty() {
                    warn!(
                        fiber = fiber.as_u64(),
                        "transaction retried with no observed cells; it will never resume"
                    );
                }
                let wakeup = Wakeup::handle();
                {
                    let _commit = COMMIT_LOCK.lock();
                    if journal.is_invalid() {
                        debug!(
                            fiber = fiber.as_u64(),
                            attempt, "stale at park; restarting instead of blocking"
                        );
                        continue;
                    }
                    journal.register_todos(&wakeup);
                }
                trace!(
                    fiber = fiber.as_u64(),
                    cells = journal.len(),
                    "parked awaiting a write"
                );
                sched.park(&wakeup);
                {
                    // A fired handle may still sit in registries of cells
                    // that were not written; sweep it out before re-running.
                    let _commit = COMMIT_LOCK.lock();
                    journal.deregister_todos(wakeup.id());
                }
                if sched.is_cancelled() {
                    return TxnOutcome::Interrupted;
                }
                continue;
            }
            Outcome::Success(value) => {
                let woken: SmallVec<[WakeupHandle; 8]> = {
                    let _commit = COMMIT_LOCK.lock();
                    if journal.is_invalid() {
                        debug!(fiber = fiber.as_u64(), attempt, "conflict at commit; restarting");
                        continue;
                    }
                    journal.publish().into_values().collect()
                };
                trace!(
                    fiber = fiber.as_u64(),
                    attempt,
                    cells = journal.len(),
                    woken = woken.len(),
                    "committed"
                );
                for handle in &woken {
                    sched.resume(handle);
                }
                return TxnOutcome::Success(cast::<A>(&value));
            }
            Outcome::Failure(error) => {
                {
                    // A failure computed from a stale view must re-run,
                    // not surface; writes are discarded either way.
                    let _commit = COMMIT_LOCK.lock();
                    if journal.is_invalid() {
                        debug!(fiber = fiber.as_u64(), attempt, "stale failure; restarting");
                        continue;
                    }
                }
                return TxnOutcome::Failure(cast::<E>(&error));
            }
            Outcome::Die(defect) => {
                {
                    let _commit = COMMIT_LOCK.lock();
                    if journal.is_invalid() {
                        debug!(fiber = fiber.as_u64(), attempt, "stale defect; restarting");
                        continue;
                    }
                }
                return TxnOutcome::Die(defect);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::TRef;
    use lattice_core::error::{Defect, ShutdownError};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Barrier};
    use std::thread;
    use std::time::Duration;

    type St<T> = Stm<T, Infallible>;

    // === Outcomes ===

    #[test]
    fn test_success_returns_value() {
        assert_eq!(atomically(&St::succeed(1)), Ok(1));
    }

    #[test]
    fn test_failure_returns_error() {
        let tx: Stm<i32, ShutdownError> = Stm::fail(ShutdownError);
        assert_eq!(atomically(&tx), Err(ShutdownError));
    }

    #[test]
    #[should_panic(expected = "transaction defect")]
    fn test_die_panics_in_atomically() {
        let tx: St<i32> = Stm::die("invariant breached");
        let _ = atomically(&tx);
    }

    #[test]
    fn test_die_reported_by_outcome_api() {
        let tx: St<i32> = Stm::die("invariant breached");
        match atomically_outcome(&tx, ThreadScheduler::global()) {
            TxnOutcome::Die(defect) => {
                assert_eq!(defect, Defect::new("invariant breached"));
            }
            _ => panic!("expected die"),
        }
    }

    // === Writes and wakeups ===

    #[test]
    fn test_commit_publishes_all_writes_atomically() {
        let a = TRef::new(0_i32);
        let b = TRef::new(0_i32);
        let (wa, wb) = (a.clone(), b.clone());
        let tx: St<()> = wa.set(1).flat_map(move |_| wb.set(2));
        atomically(&tx).unwrap();
        assert_eq!(atomically(&a.get::<Infallible>()), Ok(1));
        assert_eq!(atomically(&b.get::<Infallible>()), Ok(2));
    }

    #[test]
    fn test_blocked_reader_wakes_on_write() {
        let cell = TRef::new(0_i32);
        let reader_cell = cell.clone();
        let reader = thread::spawn(move || {
            let wait_positive: St<i32> = reader_cell.get().flat_map(|n: i32| {
                if n > 0 {
                    Stm::succeed(n)
                } else {
                    Stm::retry()
                }
            });
            atomically(&wait_positive)
        });

        thread::sleep(Duration::from_millis(50));
        atomically(&cell.set::<Infallible>(42)).unwrap();
        assert_eq!(reader.join().unwrap(), Ok(42));
    }

    #[test]
    fn test_wakeup_not_missed_when_write_races_park() {
        // Hammer the park/write race: many rounds of a reader blocking on
        // a flag while a writer sets it with no synchronization beyond the
        // commit protocol itself.
        for round in 0..100 {
            let flag = TRef::new(false);
            let barrier = Arc::new(Barrier::new(2));

            let reader = {
                let flag = flag.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let wait: St<bool> = flag
                        .get()
                        .flat_map(|set| if set { Stm::succeed(true) } else { Stm::retry() });
                    barrier.wait();
                    atomically(&wait)
                })
            };

            let writer = {
                let flag = flag.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    atomically(&flag.set::<Infallible>(true)).unwrap();
                })
            };

            writer.join().unwrap();
            assert_eq!(reader.join().unwrap(), Ok(true), "round {round} hung or failed");
        }
    }

    // === Conflicts ===

    #[test]
    fn test_conflicting_increments_all_land() {
        let counter = TRef::new(0_i64);
        let threads = 8;
        let per_thread = 100;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    let bump: St<()> = counter.update(|n| n + 1);
                    for _ in 0..per_thread {
                        atomically(&bump).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(
            atomically(&counter.get::<Infallible>()),
            Ok(threads * per_thread)
        );
    }

    #[test]
    fn test_read_only_transactions_commit_without_bumping() {
        let cell = TRef::new(5_i32);
        for _ in 0..10 {
            assert_eq!(atomically(&cell.get::<Infallible>()), Ok(5));
        }
        assert_eq!(cell.core.current_version(), 0);
    }

    // === Cancellation ===

    #[test]
    fn test_cancelled_parked_fiber_reports_interrupted() {
        let cell = TRef::new(0_i32);
        let (tx_id, rx_id) = mpsc::channel();
        let blocked = {
            let cell = cell.clone();
            thread::spawn(move || {
                let sched = ThreadScheduler::global();
                tx_id.send(sched.current_fiber()).unwrap();
                let never: St<i32> = cell
                    .get()
                    .flat_map(|n| if n > 0 { Stm::succeed(n) } else { Stm::retry() });
                atomically_outcome(&never, sched)
            })
        };
        let fiber = rx_id.recv().unwrap();
        thread::sleep(Duration::from_millis(50));
        ThreadScheduler::global().cancel(fiber);
        assert!(blocked.join().unwrap().is_interrupted());
        // The parked handle was deregistered on the way out.
        assert_eq!(cell.core.pending_todos(), 0);
    }

    // === Referential transparency of attempts ===

    #[test]
    fn test_side_effect_free_re_execution_on_conflict() {
        // Count executor passes through a sync thunk while a writer forces
        // at least one restart; only the final pass's result is observable.
        let cell = TRef::new(0_i64);
        let passes = Arc::new(AtomicUsize::new(0));
        let threads = 4;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let cell = cell.clone();
                let passes = Arc::clone(&passes);
                thread::spawn(move || {
                    let tx: St<()> = Stm::sync(move || {
                        passes.fetch_add(1, Ordering::SeqCst);
                    })
                    .flat_map(move |_| cell.update(|n| n + 1));
                    for _ in 0..50 {
                        atomically(&tx).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let committed = atomically(&cell.get::<Infallible>()).unwrap();
        assert_eq!(committed, threads * 50);
        // Restarts re-ran the thunk; committed count never exceeds passes.
        assert!(passes.load(Ordering::SeqCst) as i64 >= committed);
    }
}
