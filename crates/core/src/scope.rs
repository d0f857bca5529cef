//! Structured scopes with deterministic release
//!
//! A [`Scope`] collects finalizers and runs them exactly once, in reverse
//! registration order, when the scope closes. Scoped resources such as hub
//! subscriptions register their release action here so that dropping the
//! scope tears them down even when the owning fiber is cancelled.

use parking_lot::Mutex;
use tracing::trace;

type Finalizer = Box<dyn FnOnce() + Send>;

struct ScopeState {
    finalizers: Vec<Finalizer>,
    closed: bool,
}

/// A bag of finalizers released LIFO on close
///
/// Closing is idempotent: the first `close` runs every finalizer, later
/// calls are no-ops. Dropping an open scope closes it.
pub struct Scope {
    state: Mutex<ScopeState>,
}

impl Scope {
    /// Create an open scope with no finalizers
    pub fn new() -> Self {
        Scope {
            state: Mutex::new(ScopeState {
                finalizers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Register a finalizer to run when the scope closes
    ///
    /// Finalizers run in reverse registration order. Registering against a
    /// scope that has already closed runs the finalizer immediately, so
    /// release can never be lost to a close/acquire race.
    pub fn add_finalizer(&self, f: impl FnOnce() + Send + 'static) {
        let late = {
            let mut state = self.state.lock();
            if state.closed {
                true
            } else {
                state.finalizers.push(Box::new(f));
                return;
            }
        };
        if late {
            f();
        }
    }

    /// True once the scope has closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close the scope, running pending finalizers LIFO
    pub fn close(&self) {
        let finalizers = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.finalizers)
        };
        trace!(count = finalizers.len(), "scope closing");
        for f in finalizers.into_iter().rev() {
            f();
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::new()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_finalizers_run_lifo_on_close() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            scope.add_finalizer(move || order.lock().push(i));
        }
        scope.close();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let scope = Scope::new();
        {
            let count = Arc::clone(&count);
            scope.add_finalizer(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        scope.close();
        scope.close();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_closes_open_scope() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let scope = Scope::new();
            let count = Arc::clone(&count);
            scope.add_finalizer(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_registration_runs_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let scope = Scope::new();
        scope.close();
        {
            let count = Arc::clone(&count);
            scope.add_finalizer(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
