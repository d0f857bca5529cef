//! Error and outcome types for the transactional runtime
//!
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.
//!
//! A transaction has four orthogonal outcomes:
//!
//! - **Success**: the journal committed and the value is delivered.
//! - **Failure**: a typed error raised with `fail`; writes are discarded
//!   and the error is delivered. Recoverable with `fold` / `catch_all`.
//! - **Die**: a defect (invariant breach or caller-supplied `die`); writes
//!   are discarded and the defect propagates to the fiber.
//! - **Interrupted**: the driving fiber was cancelled between primitives;
//!   nothing is published.
//!
//! Retry is deliberately absent here: blocked transactions park and re-run
//! transparently, so callers never observe it.

use thiserror::Error;

/// Error raised by operations on a structure that has been shut down
///
/// Queues and hubs surface shutdown as a failure of this dedicated kind;
/// operations on a terminated hub subscription report the same error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("structure has been shut down")]
pub struct ShutdownError;

/// A defect: an unrecoverable breach observed inside a transaction
///
/// Defects are not part of the typed error channel. They propagate to the
/// fiber (as a panic under [`crate::sched::ThreadScheduler`]-driven
/// commits) and cannot be trapped by `fold`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transaction defect: {message}")]
pub struct Defect {
    message: String,
}

impl Defect {
    /// Create a defect with the given message
    pub fn new(message: impl Into<String>) -> Self {
        Defect {
            message: message.into(),
        }
    }

    /// The defect message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for Defect {
    fn from(message: &str) -> Self {
        Defect::new(message)
    }
}

impl From<String> for Defect {
    fn from(message: String) -> Self {
        Defect { message }
    }
}

/// Final outcome of submitting a transaction
///
/// Returned by `atomically_outcome`; the plain `atomically` entry point
/// collapses this to `Result<A, E>` and panics on `Die`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOutcome<A, E> {
    /// The transaction committed; writes are visible to later transactions.
    Success(A),
    /// The transaction aborted with a typed error; writes were discarded.
    Failure(E),
    /// The transaction aborted with a defect; writes were discarded.
    Die(Defect),
    /// The driving fiber was cancelled; nothing was published.
    Interrupted,
}

impl<A, E> TxnOutcome<A, E> {
    /// True for [`TxnOutcome::Success`]
    pub fn is_success(&self) -> bool {
        matches!(self, TxnOutcome::Success(_))
    }

    /// True for [`TxnOutcome::Failure`]
    pub fn is_failure(&self) -> bool {
        matches!(self, TxnOutcome::Failure(_))
    }

    /// True for [`TxnOutcome::Interrupted`]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, TxnOutcome::Interrupted)
    }

    /// Extract the success value, if any
    pub fn success(self) -> Option<A> {
        match self {
            TxnOutcome::Success(a) => Some(a),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_error_display() {
        assert_eq!(ShutdownError.to_string(), "structure has been shut down");
    }

    #[test]
    fn test_defect_carries_message() {
        let d = Defect::new("remaining-subscriber counter underflow");
        assert_eq!(d.message(), "remaining-subscriber counter underflow");
        assert!(d.to_string().contains("underflow"));
    }

    #[test]
    fn test_defect_from_str_and_string() {
        let a: Defect = "boom".into();
        let b: Defect = String::from("boom").into();
        assert_eq!(a, b);
    }

    #[test]
    fn test_outcome_predicates() {
        let ok: TxnOutcome<i32, ShutdownError> = TxnOutcome::Success(3);
        assert!(ok.is_success());
        assert_eq!(ok.success(), Some(3));

        let failed: TxnOutcome<i32, ShutdownError> = TxnOutcome::Failure(ShutdownError);
        assert!(failed.is_failure());
        assert_eq!(failed.success(), None);

        let stopped: TxnOutcome<i32, ShutdownError> = TxnOutcome::Interrupted;
        assert!(stopped.is_interrupted());
    }
}
