//! Engine integration tests
//!
//! These exercise the runtime across real threads: optimistic validation
//! under racing commits, the retry/wakeup protocol, branch journals, and
//! cancellation. Collection-level scenarios live in `hub_queue.rs`.
//!
//! ## Running These Tests
//!
//! ```bash
//! cargo test --test stm_engine
//! ```

use lattice::{
    atomically, atomically_outcome, Scheduler, Stm, TQueue, TRef, TSemaphore, ThreadScheduler,
    TxnOutcome,
};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

type St<T> = Stm<T, Infallible>;

/// Route commit/retry trace events through the test harness when
/// `RUST_LOG` asks for them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ============================================================================
// SECTION 1: Validation under racing commits
// ============================================================================

/// One transaction reads A and writes what it saw into B while another
/// writes A. Whatever the interleaving, B must end up holding a value A
/// actually held at that commit's point in the total order.
#[test]
fn test_read_write_race_settles_on_a_consistent_snapshot() {
    init_tracing();
    for _ in 0..50 {
        let a = TRef::new(0_i32);
        let b = TRef::new(-1_i32);
        let barrier = Arc::new(Barrier::new(2));

        let copier = {
            let (a, b) = (a.clone(), b.clone());
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let copy: St<()> = a.get().flat_map(move |seen: i32| b.set(seen));
                barrier.wait();
                atomically(&copy).unwrap();
            })
        };
        let writer = {
            let a = a.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                atomically(&a.set::<Infallible>(7)).unwrap();
            })
        };
        copier.join().unwrap();
        writer.join().unwrap();

        let copied = atomically(&b.get::<Infallible>()).unwrap();
        assert!(copied == 0 || copied == 7, "B holds {copied}, never a torn value");
    }
}

/// Two transactions that both read and write the same cell: every
/// increment lands exactly once regardless of conflicts.
#[test]
fn test_no_lost_updates_under_contention() {
    init_tracing();
    let counter = TRef::new(0_i64);
    let threads = 8_i64;
    let per_thread = 200_i64;

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
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(
        atomically(&counter.get::<Infallible>()),
        Ok(threads * per_thread)
    );
}

/// The classic bank-transfer shape: concurrent transfers between two
/// accounts never create or destroy money, and never expose a state where
/// only one side of a transfer happened.
#[test]
fn test_transfers_conserve_the_total() {
    let left = TRef::new(500_i64);
    let right = TRef::new(500_i64);

    let auditor_total = {
        let (left, right) = (left.clone(), right.clone());
        left.get().zip(right.get()).map(|(l, r): (i64, i64)| l + r)
    };

    let movers: Vec<_> = (0..4)
        .map(|i| {
            let (from, to) = if i % 2 == 0 {
                (left.clone(), right.clone())
            } else {
                (right.clone(), left.clone())
            };
            thread::spawn(move || {
                let transfer: St<()> = from.get().flat_map(move |balance: i64| {
                    let deposit = to.update(move |b| b + 1);
                    from.set(balance - 1).flat_map(move |_| deposit.clone())
                });
                for _ in 0..100 {
                    atomically(&transfer).unwrap();
                }
            })
        })
        .collect();

    let auditor = {
        let total: St<i64> = auditor_total.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                assert_eq!(atomically(&total), Ok(1000));
            }
        })
    };

    for mover in movers {
        mover.join().unwrap();
    }
    auditor.join().unwrap();
    assert_eq!(atomically(&auditor_total), Ok(1000));
}

// ============================================================================
// SECTION 2: Retry and wakeups
// ============================================================================

/// A parked transaction wakes only for writes to cells it observed.
#[test]
fn test_wakeup_is_scoped_to_observed_cells() {
    let watched = TRef::new(0_i32);
    let unrelated = TRef::new(0_i32);
    let woke = Arc::new(AtomicUsize::new(0));

    let waiter = {
        let watched = watched.clone();
        let woke = Arc::clone(&woke);
        thread::spawn(move || {
            let wait: St<i32> = watched
                .get()
                .flat_map(|n: i32| if n > 0 { Stm::succeed(n) } else { Stm::retry() });
            let got = atomically(&wait).unwrap();
            woke.fetch_add(1, Ordering::SeqCst);
            got
        })
    };

    thread::sleep(Duration::from_millis(50));
    // Traffic on an unrelated cell must not resume the waiter.
    for _ in 0..10 {
        atomically(&unrelated.update::<Infallible>(|n| n + 1)).unwrap();
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(woke.load(Ordering::SeqCst), 0);

    atomically(&watched.set::<Infallible>(9)).unwrap();
    assert_eq!(waiter.join().unwrap(), 9);
}

/// Many fibers parked on one cell all resume when it changes.
#[test]
fn test_single_write_wakes_every_parked_fiber() {
    let gate = TRef::new(false);
    let waiters: Vec<_> = (0..6)
        .map(|_| {
            let gate = gate.clone();
            thread::spawn(move || {
                let wait: St<bool> = gate
                    .get()
                    .flat_map(|open| if open { Stm::succeed(open) } else { Stm::retry() });
                atomically(&wait)
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    atomically(&gate.set::<Infallible>(true)).unwrap();
    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), Ok(true));
    }
}

// ============================================================================
// SECTION 3: Branching
// ============================================================================

/// `or_try` falls through retrying branches and commits the first branch
/// that settles, without leaking the losers' writes.
#[test]
fn test_or_try_takes_from_whichever_queue_has_data() {
    let first: TQueue<i32> = TQueue::unbounded();
    let second: TQueue<i32> = TQueue::unbounded();
    atomically(&second.offer(2)).unwrap();

    let either = first.take().or_try(second.take());
    assert_eq!(atomically(&either), Ok(2));

    atomically(&first.offer(1)).unwrap();
    assert_eq!(atomically(&either), Ok(1));
}

/// A retrying `or_try` branch still contributes its observations: a write
/// to a cell only the abandoned branch read must wake the parked fiber.
#[test]
fn test_abandoned_branch_observations_still_wake() {
    let branch_cell = TRef::new(0_i32);
    let waiter = {
        let branch_cell = branch_cell.clone();
        thread::spawn(move || {
            let left: St<i32> = branch_cell
                .get()
                .flat_map(|n: i32| if n > 0 { Stm::succeed(n) } else { Stm::retry() });
            // Both branches block, so the whole transaction parks on the
            // union of both branches' cells.
            let tx = left.or_try(Stm::retry());
            atomically(&tx)
        })
    };

    thread::sleep(Duration::from_millis(50));
    atomically(&branch_cell.set::<Infallible>(3)).unwrap();
    assert_eq!(waiter.join().unwrap(), Ok(3));
}

// ============================================================================
// SECTION 4: Cross-structure composition
// ============================================================================

/// Moving a value between queues is one atomic step: no observer can see
/// it in both queues or in neither (given it was in exactly one).
#[test]
fn test_atomic_move_between_queues() {
    let source: TQueue<i32> = TQueue::unbounded();
    let sink: TQueue<i32> = TQueue::unbounded();
    atomically(&source.offer_all(vec![1, 2, 3])).unwrap();

    let relay = {
        let sink = sink.clone();
        source
            .take()
            .flat_map(move |value: i32| sink.offer(value))
    };
    for _ in 0..3 {
        atomically(&relay).unwrap();
    }

    assert_eq!(atomically(&source.poll()), Ok(None));
    assert_eq!(atomically(&sink.take_all()), Ok(vec![1, 2, 3]));
}

/// A semaphore gating a queue: the take and the permit move in one step.
#[test]
fn test_semaphore_gated_take() {
    let permits = TSemaphore::new(1);
    let queue: TQueue<&'static str> = TQueue::unbounded();
    atomically(&queue.offer("guarded")).unwrap();

    let gated = {
        let queue = queue.clone();
        permits
            .acquire::<lattice::ShutdownError>()
            .flat_map(move |_| queue.take())
    };
    assert_eq!(atomically(&gated), Ok("guarded"));
    assert_eq!(
        atomically(&permits.available::<Infallible>()),
        Ok(0)
    );
}

// ============================================================================
// SECTION 5: Cancellation
// ============================================================================

/// Cancelling a fiber parked on retry unblocks it with an interruption
/// outcome and deregisters its wakeup handles.
#[test]
fn test_cancellation_unparks_with_interrupted() {
    let cell = TRef::new(0_i32);
    let (send_fiber, recv_fiber) = mpsc::channel();

    let blocked = {
        let cell = cell.clone();
        thread::spawn(move || {
            let sched = ThreadScheduler::global();
            send_fiber.send(sched.current_fiber()).unwrap();
            let forever: St<i32> = cell
                .get()
                .flat_map(|n: i32| if n > 0 { Stm::succeed(n) } else { Stm::retry() });
            atomically_outcome(&forever, sched)
        })
    };

    let fiber = recv_fiber.recv().unwrap();
    thread::sleep(Duration::from_millis(50));
    ThreadScheduler::global().cancel(fiber);

    assert!(matches!(blocked.join().unwrap(), TxnOutcome::Interrupted));
    // A later write finds no stale registration to fire.
    atomically(&cell.set::<Infallible>(1)).unwrap();
}
