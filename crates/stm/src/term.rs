//! Transaction terms and the typed combinator surface
//!
//! A transaction is described, not executed: [`Stm<A, E>`] wraps an
//! immutable, `Arc`-shared term tree that the executor interprets against
//! a journal. Terms can be re-executed any number of times (on conflict
//! restarts and retry wakeups), so everything captured in them must be
//! referentially transparent outside the journal.
//!
//! Internally values and errors travel type-erased (`Arc<dyn Any>`); the
//! typed wrappers downcast at the seams. A failed downcast is unreachable
//! by construction of the typed surface.

use crate::cell::CellCore;
use lattice_core::error::Defect;
use std::any::Any;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;

/// Type-erased transactional value
pub(crate) type Dyn = Arc<dyn Any + Send + Sync>;

/// Continuation from an erased value to the next term
pub(crate) type ContFn = Arc<dyn Fn(Dyn) -> Arc<Term> + Send + Sync>;

/// Deferred computation of an erased value
pub(crate) type SyncFn = Arc<dyn Fn() -> Dyn + Send + Sync>;

/// Projection out of the transaction environment
pub(crate) type EnvFn = Arc<dyn Fn(&Dyn) -> Result<Dyn, Defect> + Send + Sync>;

/// Kinds of values that can flow through a transaction
///
/// Blanket-implemented; spelled out once here instead of repeating the
/// bound list on every combinator.
pub trait TxValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> TxValue for T {}

/// The tagged-variant transaction term tree
///
/// Every public combinator desugars to these primitives.
pub(crate) enum Term {
    Succeed(Dyn),
    Sync(SyncFn),
    Fail(Dyn),
    Retry,
    Die(Defect),
    Interrupt,
    Read(Arc<CellCore>),
    Write(Arc<CellCore>, Dyn),
    FlatMap(Arc<Term>, ContFn),
    /// `(term, on_fail, on_succeed)`; traps Failure only.
    Fold(Arc<Term>, ContFn, ContFn),
    OrTry(Arc<Term>, Arc<Term>),
    ProvideEnv(Dyn, Arc<Term>),
    WithEnv(EnvFn),
}

impl Term {
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Term::Succeed(_) => "succeed",
            Term::Sync(_) => "sync",
            Term::Fail(_) => "fail",
            Term::Retry => "retry",
            Term::Die(_) => "die",
            Term::Interrupt => "interrupt",
            Term::Read(_) => "read",
            Term::Write(_, _) => "write",
            Term::FlatMap(_, _) => "flat_map",
            Term::Fold(_, _, _) => "fold",
            Term::OrTry(_, _) => "or_try",
            Term::ProvideEnv(_, _) => "provide_env",
            Term::WithEnv(_) => "with_env",
        }
    }
}

/// Downcast an erased transactional value to its concrete type
pub(crate) fn cast<T: TxValue>(value: &Dyn) -> T {
    match value.downcast_ref::<T>() {
        Some(v) => v.clone(),
        None => unreachable!("transactional value has wrong type"),
    }
}

/// A composable transaction producing `A` or failing with `E`
///
/// `Stm` values are inert descriptions: nothing runs until they are
/// submitted with [`crate::atomically`]. They are cheap to clone and share.
pub struct Stm<A, E = Infallible> {
    pub(crate) term: Arc<Term>,
    marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Stm<A, E> {
    fn clone(&self) -> Self {
        Stm {
            term: Arc::clone(&self.term),
            marker: PhantomData,
        }
    }
}

impl<A, E> std::fmt::Debug for Stm<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stm({})", self.term.tag())
    }
}

impl<A: TxValue, E: TxValue> Stm<A, E> {
    pub(crate) fn from_term(term: Arc<Term>) -> Self {
        Stm {
            term,
            marker: PhantomData,
        }
    }

    /// Transaction that immediately produces `value`
    pub fn succeed(value: A) -> Self {
        Stm::from_term(Arc::new(Term::Succeed(Arc::new(value))))
    }

    /// Transaction that evaluates `f` on every attempt
    ///
    /// `f` must be free of observable side effects; attempts are re-run on
    /// conflicts and wakeups.
    pub fn sync(f: impl Fn() -> A + Send + Sync + 'static) -> Self {
        let thunk: SyncFn = Arc::new(move || Arc::new(f()) as Dyn);
        Stm::from_term(Arc::new(Term::Sync(thunk)))
    }

    /// Defer construction of a transaction until execution
    ///
    /// Required for recursive transactional code: the recursive call sits
    /// inside `f`, so the term tree unfolds lazily instead of diverging at
    /// construction time.
    pub fn suspend(f: impl Fn() -> Stm<A, E> + Send + Sync + 'static) -> Self {
        let cont: ContFn = Arc::new(move |_| f().term);
        Stm::from_term(Arc::new(Term::FlatMap(
            Arc::new(Term::Succeed(Arc::new(()))),
            cont,
        )))
    }

    /// Transaction that aborts with the typed error `error`
    pub fn fail(error: E) -> Self {
        Stm::from_term(Arc::new(Term::Fail(Arc::new(error))))
    }

    /// Block this transaction until any observed cell changes
    ///
    /// The attempt is abandoned, the fiber parks, and the whole
    /// transaction re-runs after a wakeup. Never observable by callers.
    pub fn retry() -> Self {
        Stm::from_term(Arc::new(Term::Retry))
    }

    /// Abort with a defect
    ///
    /// Defects bypass the typed error channel and cannot be trapped by
    /// [`Stm::fold`].
    pub fn die(defect: impl Into<Defect>) -> Self {
        Stm::from_term(Arc::new(Term::Die(defect.into())))
    }

    /// Abort as if the driving fiber were interrupted
    pub fn interrupt() -> Self {
        Stm::from_term(Arc::new(Term::Interrupt))
    }

    /// Project a value out of the transaction environment
    ///
    /// Dies with a defect when no context of type `R` was provided.
    pub fn with_env<R: TxValue>(f: impl Fn(&R) -> A + Send + Sync + 'static) -> Self {
        let project: EnvFn = Arc::new(move |env: &Dyn| match env.downcast_ref::<R>() {
            Some(context) => Ok(Arc::new(f(context)) as Dyn),
            None => Err(Defect::new(
                "transaction environment missing requested context",
            )),
        });
        Stm::from_term(Arc::new(Term::WithEnv(project)))
    }

    /// Run this transaction with `context` as its environment
    pub fn provide_env<R: TxValue>(self, context: R) -> Self {
        Stm::from_term(Arc::new(Term::ProvideEnv(Arc::new(context), self.term)))
    }

    /// Sequence: feed this transaction's result into `f`
    pub fn flat_map<B: TxValue>(
        self,
        f: impl Fn(A) -> Stm<B, E> + Send + Sync + 'static,
    ) -> Stm<B, E> {
        let cont: ContFn = Arc::new(move |value| f(cast::<A>(&value)).term);
        Stm::from_term(Arc::new(Term::FlatMap(self.term, cont)))
    }

    /// Transform the result
    pub fn map<B: TxValue>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Stm<B, E> {
        self.flat_map(move |a| Stm::succeed(f(a)))
    }

    /// Discard the result
    pub fn as_unit(self) -> Stm<(), E> {
        self.map(|_| ())
    }

    /// Handle both outcomes of the typed channel
    ///
    /// Traps Failure only: retries pass through untouched (the blocked
    /// state is not an error) and defects are never recoverable here.
    pub fn fold<B: TxValue, F: TxValue>(
        self,
        on_fail: impl Fn(E) -> Stm<B, F> + Send + Sync + 'static,
        on_succeed: impl Fn(A) -> Stm<B, F> + Send + Sync + 'static,
    ) -> Stm<B, F> {
        let fail_cont: ContFn = Arc::new(move |value| on_fail(cast::<E>(&value)).term);
        let ok_cont: ContFn = Arc::new(move |value| on_succeed(cast::<A>(&value)).term);
        Stm::from_term(Arc::new(Term::Fold(self.term, fail_cont, ok_cont)))
    }

    /// Recover from a typed error
    pub fn catch_all<F: TxValue>(
        self,
        f: impl Fn(E) -> Stm<A, F> + Send + Sync + 'static,
    ) -> Stm<A, F> {
        self.fold(f, Stm::succeed)
    }

    /// Transform the error channel
    pub fn map_err<F: TxValue>(self, f: impl Fn(E) -> F + Send + Sync + 'static) -> Stm<A, F> {
        self.fold(move |e| Stm::fail(f(e)), Stm::succeed)
    }

    /// Try this transaction; fall back to `alternative` if it retries
    ///
    /// The first branch runs on its own child journal. When it blocks, its
    /// writes are discarded but its observations are kept, and
    /// `alternative` runs instead. Success, failure, and defects commit to
    /// the first branch.
    pub fn or_try(self, alternative: Stm<A, E>) -> Stm<A, E> {
        Stm::from_term(Arc::new(Term::OrTry(self.term, alternative.term)))
    }

    /// Combine two transactions with `f`
    pub fn zip_with<B: TxValue, C: TxValue>(
        self,
        other: Stm<B, E>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Stm<C, E> {
        let f = Arc::new(f);
        self.flat_map(move |a: A| {
            let f = Arc::clone(&f);
            other.clone().map(move |b: B| f(a.clone(), b))
        })
    }

    /// Pair the results of two transactions
    pub fn zip<B: TxValue>(self, other: Stm<B, E>) -> Stm<(A, B), E> {
        self.zip_with(other, |a, b| (a, b))
    }

    /// Run `f` for its transactional effect, keeping this result
    pub fn tap(self, f: impl Fn(A) -> Stm<(), E> + Send + Sync + 'static) -> Stm<A, E> {
        self.flat_map(move |a: A| f(a.clone()).map(move |_| a.clone()))
    }
}

impl<E: TxValue> Stm<(), E> {
    /// Succeed when `pass` holds, block otherwise
    pub fn check(pass: bool) -> Stm<(), E> {
        if pass {
            Stm::succeed(())
        } else {
            Stm::retry()
        }
    }

    /// Run `f` over `items` in order, sequencing the effects
    pub fn for_each<I: TxValue>(
        items: Vec<I>,
        f: impl Fn(I) -> Stm<(), E> + Send + Sync + 'static,
    ) -> Stm<(), E> {
        let mut chain = Stm::succeed(());
        for item in items {
            let step = f(item);
            chain = chain.flat_map(move |_| step.clone());
        }
        chain
    }
}
