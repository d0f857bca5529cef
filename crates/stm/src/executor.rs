//! Iterative transaction executor
//!
//! Walks a term tree against a journal using an explicit continuation
//! stack, so arbitrarily deep combinator nesting never touches host
//! recursion. The walk produces one of the coordinator-facing outcomes;
//! two extra internal outcomes signal a stale journal (restart) and an
//! observed cancellation (abandon).
//!
//! The executor runs entirely outside the commit lock. Validity is
//! re-checked after every journal-touching primitive so an attempt that
//! has seen an inconsistent snapshot stops computing on top of it.

use crate::journal::Journal;
use crate::term::{ContFn, Dyn, Term};
use lattice_core::error::Defect;
use lattice_core::traits::Scheduler;
use std::mem;
use std::sync::Arc;

/// Result of one executed attempt
pub(crate) enum Outcome {
    Success(Dyn),
    Failure(Dyn),
    Retry,
    Die(Defect),
    /// The journal went stale mid-attempt; re-run with a fresh one.
    Invalid,
    /// The driving fiber was cancelled; abandon without publishing.
    Interrupted,
}

/// Result of evaluating a single primitive, before unwinding.
enum Leaf {
    Value(Dyn),
    Error(Dyn),
    Retry,
    Die(Defect),
}

/// Pending continuation frames.
enum Frame {
    /// Feed a success value into the continuation.
    AndThen(ContFn),
    /// Trap Failure; pass Retry and Die through.
    Fold { on_fail: ContFn, on_succeed: ContFn },
    /// Run the right branch if the left one retries; `parent` is the
    /// journal as it stood when the branch began.
    OrElse { right: Arc<Term>, parent: Journal },
    /// Restore the environment shadowed by `provide_env`.
    RestoreEnv(Dyn),
}

/// Execute `term` to completion against `journal`
pub(crate) fn run(
    term: &Arc<Term>,
    env: &Dyn,
    journal: &mut Journal,
    sched: &dyn Scheduler,
) -> Outcome {
    let mut stack: Vec<Frame> = Vec::new();
    let mut env: Dyn = env.clone();
    let mut current: Arc<Term> = Arc::clone(term);

    loop {
        // Cancellation checkpoint between primitives.
        if sched.is_cancelled() {
            return Outcome::Interrupted;
        }

        let node = Arc::clone(&current);
        let mut leaf = match &*node {
            Term::FlatMap(inner, k) => {
                stack.push(Frame::AndThen(Arc::clone(k)));
                current = Arc::clone(inner);
                continue;
            }
            Term::Fold(inner, on_fail, on_succeed) => {
                stack.push(Frame::Fold {
                    on_fail: Arc::clone(on_fail),
                    on_succeed: Arc::clone(on_succeed),
                });
                current = Arc::clone(inner);
                continue;
            }
            Term::OrTry(left, right) => {
                // The branch runs on a fresh child journal; the parent is
                // parked in the frame until the branch settles.
                let parent = mem::take(journal);
                stack.push(Frame::OrElse {
                    right: Arc::clone(right),
                    parent,
                });
                current = Arc::clone(left);
                continue;
            }
            Term::ProvideEnv(context, inner) => {
                stack.push(Frame::RestoreEnv(env.clone()));
                env = context.clone();
                current = Arc::clone(inner);
                continue;
            }
            Term::Succeed(value) => Leaf::Value(value.clone()),
            Term::Sync(thunk) => Leaf::Value(thunk()),
            Term::Fail(error) => Leaf::Error(error.clone()),
            Term::Retry => Leaf::Retry,
            Term::Die(defect) => Leaf::Die(defect.clone()),
            Term::Interrupt => Leaf::Die(Defect::new("transaction interrupted")),
            Term::Read(cell) => {
                let value = cell.read_in(journal);
                if journal.is_invalid() {
                    return Outcome::Invalid;
                }
                Leaf::Value(value)
            }
            Term::Write(cell, value) => {
                cell.write_in(journal, value.clone());
                if journal.is_invalid() {
                    return Outcome::Invalid;
                }
                Leaf::Value(Arc::new(()))
            }
            Term::WithEnv(project) => match project(&env) {
                Ok(value) => Leaf::Value(value),
                Err(defect) => Leaf::Die(defect),
            },
        };

        // Unwind the stack until a frame resumes evaluation or the stack
        // empties and the attempt settles.
        current = loop {
            match stack.pop() {
                None => {
                    return match leaf {
                        Leaf::Value(value) => Outcome::Success(value),
                        Leaf::Error(error) => Outcome::Failure(error),
                        Leaf::Retry => Outcome::Retry,
                        Leaf::Die(defect) => Outcome::Die(defect),
                    };
                }
                Some(Frame::AndThen(k)) => match leaf {
                    Leaf::Value(value) => break k(value),
                    other => leaf = other,
                },
                Some(Frame::Fold {
                    on_fail,
                    on_succeed,
                }) => match leaf {
                    Leaf::Value(value) => break on_succeed(value),
                    Leaf::Error(error) => break on_fail(error),
                    other => leaf = other,
                },
                Some(Frame::OrElse { right, parent }) => match leaf {
                    Leaf::Retry => {
                        // Keep the branch's observations for wakeups but
                        // none of its writes, then try the alternative.
                        let child = mem::replace(journal, parent);
                        journal.merge_observations(child);
                        break right;
                    }
                    other => {
                        let child = mem::replace(journal, parent);
                        journal.adopt(child);
                        leaf = other;
                    }
                },
                Some(Frame::RestoreEnv(saved)) => {
                    env = saved;
                }
            }
        };
    }
}
