//! Defines the `Deferred` struct and related functionality.
//!
//! A `Deferred` represents a result that may not be available yet. Handlers are
//! attached as success/error pairs and run strictly in the order they were added,
//! each receiving the value produced by the previous one. A handler may switch the
//! chain between its success and error branches, or suspend it on another
//! `Deferred` until that one produces a result.
//!
//! The chain of one instance is drained by one context at a time. Producers on
//! other threads hand their result over through a [`Resolver`]; whichever thread
//! wins the instance's lock drains the chain, and every other thread only appends
//! to it.
use std::{
    cmp::Ordering,
    collections::VecDeque,
    fmt,
    future::IntoFuture,
    mem,
    pin::Pin,
    sync::{
        Arc,
        atomic::{self, AtomicU64},
    },
    task::{Context, Poll},
    time::Instant,
};

use futures::channel::oneshot;
use parking_lot::{Mutex, MutexGuard};
use pin_project_lite::pin_project;

use crate::error::{Error, ReuseError};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Where a deferred is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// No result yet.
    Pending,

    /// The chain currently carries a value.
    Succeeded,

    /// The chain currently carries an [`Error`].
    Failed,
}

/// What a handler hands back to the chain.
///
/// `Ok` keeps (or puts) the chain on its success branch, `Err` switches it to the
/// error branch, and `Await` suspends the chain until the returned deferred has a
/// result, which then becomes the chain's current value.
pub enum Step<T> {
    Ok(T),
    Err(Error),
    Await(Deferred<T>),
}

impl<T> From<Result<T, Error>> for Step<T> {
    fn from(result: Result<T, Error>) -> Self {
        match result {
            Ok(value) => Step::Ok(value),
            Err(error) => Step::Err(error),
        }
    }
}

impl<T> From<Deferred<T>> for Step<T> {
    fn from(deferred: Deferred<T>) -> Self {
        Step::Await(deferred)
    }
}

type Outcome<T> = Result<T, Error>;
type OnSuccess<T> = Box<dyn FnOnce(T) -> Step<T> + Send>;
type OnError<T> = Box<dyn FnOnce(Error) -> Step<T> + Send>;
type Hook = Box<dyn FnOnce() + Send>;

// One entry of the chain.
pub(crate) enum Link<T> {
    // A missing side passes the current value through unchanged.
    Pair {
        on_success: Option<OnSuccess<T>>,
        on_error: Option<OnError<T>>,
    },
    Both(Box<dyn FnOnce(Outcome<T>) -> Step<T> + Send>),
    // Observes the outcome without changing it.
    Inspect(Box<dyn FnOnce(&Outcome<T>) + Send>),
    // Takes the outcome; the instance is spent afterwards.
    Consume(Box<dyn FnOnce(Outcome<T>) + Send>),
}

enum Next<T> {
    Settled(Outcome<T>),
    Await(Deferred<T>),
    Spent,
}

impl<T> From<Step<T>> for Next<T> {
    fn from(step: Step<T>) -> Self {
        match step {
            Step::Ok(value) => Next::Settled(Ok(value)),
            Step::Err(error) => Next::Settled(Err(error)),
            Step::Await(deferred) => Next::Await(deferred),
        }
    }
}

fn run_link<T>(link: Link<T>, outcome: Outcome<T>) -> Next<T> {
    match link {
        Link::Pair {
            on_success,
            on_error,
        } => match outcome {
            Ok(value) => match on_success {
                Some(f) => f(value).into(),
                None => Next::Settled(Ok(value)),
            },
            Err(error) => match on_error {
                Some(f) => f(error).into(),
                None => Next::Settled(Err(error)),
            },
        },
        Link::Both(f) => f(outcome).into(),
        Link::Inspect(f) => {
            f(&outcome);
            Next::Settled(outcome)
        }
        Link::Consume(f) => {
            f(outcome);
            Next::Spent
        }
    }
}

struct Inner<T> {
    state: State,
    result: Option<Outcome<T>>,
    chain: VecDeque<Link<T>>,
    paused: usize,
    // Set while one context owns the drain loop.
    draining: bool,
    chained: bool,
    // A consuming link has been attached; nothing may follow it.
    consumed: bool,
    finalized: bool,
    canceled: bool,
    silently_canceled: bool,
    canceller: Option<Hook>,
    finalizer: Option<Box<dyn FnOnce(&Outcome<T>) + Send>>,
    // Cancels the chained deferred the chain is suspended on.
    awaiting: Option<Hook>,
    // Deferred start of the underlying work, run on the resume that unpauses.
    starter: Option<Hook>,
    // Notified once, when the first result arrives, independent of the chain.
    watchers: Vec<Hook>,
    started: Instant,
}

impl<T> Inner<T> {
    fn new(paused: usize, canceller: Option<Hook>) -> Self {
        Self {
            state: State::Pending,
            result: None,
            chain: VecDeque::with_capacity(4),
            paused,
            draining: false,
            chained: false,
            consumed: false,
            finalized: false,
            canceled: false,
            silently_canceled: false,
            canceller,
            finalizer: None,
            awaiting: None,
            starter: None,
            watchers: Vec::new(),
            started: Instant::now(),
        }
    }

    fn settle(&mut self, outcome: Outcome<T>) {
        self.state = if outcome.is_ok() {
            State::Succeeded
        } else {
            State::Failed
        };
        self.result = Some(outcome);
    }

    // Moves out of `Pending`; returns what has to be dropped or run unlocked.
    fn settle_first(&mut self, outcome: Outcome<T>) -> (Option<Hook>, Vec<Hook>) {
        self.settle(outcome);
        (self.canceller.take(), mem::take(&mut self.watchers))
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // A consumed outcome has been taken out of `result`; a silent cancel has
        // nobody to report to.
        if self.silently_canceled {
            return;
        }
        if let Some(finalizer) = self.finalizer.take()
            && let Some(outcome) = self.result.as_ref()
        {
            finalizer(outcome);
        }
    }
}

fn notify(watchers: Vec<Hook>) {
    for watcher in watchers {
        watcher();
    }
}

/// A single-assignment result with a chain of success and error handlers.
///
/// Cloning a `Deferred` yields another handle to the same instance. A deferred
/// resolves at most once; attaching handlers after that runs them right away
/// (unless the deferred is paused), in the order they were added.
///
/// # Example
/// ```
/// # use deferkit::{Deferred, Step};
/// let d = Deferred::new();
/// d.add_callback(|v: i32| Step::Ok(v + 1))
///     .add_callback(|v| Step::Ok(v * 2));
/// d.callback(1).unwrap();
/// assert_eq!(deferkit::wait_for_deferred(d), Ok(4));
/// ```
pub struct Deferred<T> {
    id: u64,
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Deferred")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("paused", &inner.paused)
            .field("pending_links", &inner.chain.len())
            .finish()
    }
}

impl<T: Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Deferred<T> {
    fn build(inner: Inner<T>) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, atomic::Ordering::Relaxed),
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Creates a pending deferred.
    #[must_use]
    pub fn new() -> Self {
        Self::build(Inner::new(0, None))
    }

    /// Creates a pending deferred whose cancellation runs `canceller` first.
    ///
    /// The canceller is dropped once the deferred resolves.
    #[must_use]
    pub fn with_canceller(canceller: impl FnOnce() + Send + 'static) -> Self {
        Self::build(Inner::new(0, Some(Box::new(canceller))))
    }

    /// Creates a pending deferred that is already paused once.
    ///
    /// Handlers will not run until [`resume`](Self::resume) is called, even if a
    /// result arrives first. This is how work is handed to a
    /// [`DeferredPool`](crate::DeferredPool).
    #[must_use]
    pub fn paused() -> Self {
        Self::build(Inner::new(1, None))
    }

    /// Creates a pending deferred together with the capability to resolve it.
    ///
    /// Keep the [`Resolver`] with the code that produces the result. It keeps
    /// working after the deferred has been returned from a handler and became
    /// chained, while [`callback`](Self::callback) on the deferred itself does not.
    #[must_use]
    pub fn with_resolver() -> (Self, Resolver<T>) {
        let deferred = Self::new();
        let resolver = Resolver {
            deferred: deferred.clone(),
        };
        (deferred, resolver)
    }

    /// Creates a deferred that has already succeeded with `value`.
    #[must_use]
    pub fn succeed(value: T) -> Self {
        let deferred = Self::new();
        deferred.settle_and_fire(Ok(value));
        deferred
    }

    /// Creates a deferred that has already failed with `error`.
    #[must_use]
    pub fn fail(error: Error) -> Self {
        let deferred = Self::new();
        deferred.settle_and_fire(Err(error));
        deferred
    }

    /// Calls `f(arg)` right away and wraps whatever it returns in a deferred.
    ///
    /// If `f` returns [`Step::Await`] that deferred is returned as is.
    pub fn maybe_deferred<A>(f: impl FnOnce(A) -> Step<T>, arg: A) -> Self {
        match f(arg) {
            Step::Ok(value) => Self::succeed(value),
            Step::Err(error) => Self::fail(error),
            Step::Await(deferred) => deferred,
        }
    }

    /// Process-unique identifier of this instance.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// Creation time, used as the default scheduling order.
    #[must_use]
    pub fn started(&self) -> Instant {
        self.inner.lock().started
    }

    /// Overrides the scheduling timestamp.
    pub fn set_started(&self, started: Instant) {
        self.inner.lock().started = started;
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused > 0
    }

    #[must_use]
    pub fn pause_count(&self) -> usize {
        self.inner.lock().paused
    }

    #[must_use]
    pub fn is_chained(&self) -> bool {
        self.inner.lock().chained
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.inner.lock().finalized
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.lock().canceled
    }

    #[must_use]
    pub fn is_silently_canceled(&self) -> bool {
        self.inner.lock().silently_canceled
    }

    /// Returns `true` if both handles point at the same instance.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves the deferred with a value and runs the chain.
    ///
    /// # Errors
    ///
    /// - `ReuseError::AlreadyFired` if the deferred already has a result.
    /// - `ReuseError::Chained` if the deferred was returned by a handler; only its
    ///   [`Resolver`] may resolve it then.
    /// - `ReuseError::Finalized` if the deferred has been spent.
    ///
    /// Resolving a deferred that was canceled is silently ignored.
    pub fn callback(&self, value: T) -> Result<(), ReuseError> {
        self.resolve_from(Ok(value), true)
    }

    /// Resolves the deferred with an error and runs the chain.
    ///
    /// # Errors
    ///
    /// Same as [`callback`](Self::callback).
    pub fn errback(&self, error: Error) -> Result<(), ReuseError> {
        self.resolve_from(Err(error), true)
    }

    fn resolve_from(&self, outcome: Outcome<T>, external: bool) -> Result<(), ReuseError> {
        let settled = {
            let mut inner = self.inner.lock();
            if inner.canceled && inner.state != State::Pending {
                tracing::trace!(id = self.id, "ignoring result of a canceled deferred");
                return Ok(());
            }
            if inner.finalized {
                return Err(ReuseError::Finalized);
            }
            if inner.state != State::Pending {
                return Err(ReuseError::AlreadyFired);
            }
            if external && inner.chained {
                return Err(ReuseError::Chained);
            }
            inner.settle_first(outcome)
        };
        self.after_settle(settled);
        Ok(())
    }

    fn settle_and_fire(&self, outcome: Outcome<T>) {
        let settled = self.inner.lock().settle_first(outcome);
        self.after_settle(settled);
    }

    fn after_settle(&self, (canceller, watchers): (Option<Hook>, Vec<Hook>)) {
        // Nothing left to cancel.
        drop(canceller);
        self.fire();
        notify(watchers);
    }

    pub(crate) fn resolver(&self) -> Resolver<T> {
        Resolver {
            deferred: self.clone(),
        }
    }

    // Runs `f` once the deferred has its first result, right away if it has one.
    pub(crate) fn watch(&self, f: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock();
        if inner.state == State::Pending {
            inner.watchers.push(Box::new(f));
        } else {
            drop(inner);
            f();
        }
    }

    /// Appends a success handler. Errors pass through it unchanged.
    ///
    /// # Panics
    ///
    /// Panics if the deferred is chained or finalized.
    pub fn add_callback(&self, f: impl FnOnce(T) -> Step<T> + Send + 'static) -> &Self {
        self.attach(Link::Pair {
            on_success: Some(Box::new(f)),
            on_error: None,
        })
    }

    /// Appends an error handler. Values pass through it unchanged.
    ///
    /// # Panics
    ///
    /// Panics if the deferred is chained or finalized.
    pub fn add_errback(&self, f: impl FnOnce(Error) -> Step<T> + Send + 'static) -> &Self {
        self.attach(Link::Pair {
            on_success: None,
            on_error: Some(Box::new(f)),
        })
    }

    /// Appends a handler pair; exactly one side runs, depending on the branch.
    ///
    /// # Panics
    ///
    /// Panics if the deferred is chained or finalized.
    pub fn add_callbacks(
        &self,
        on_success: impl FnOnce(T) -> Step<T> + Send + 'static,
        on_error: impl FnOnce(Error) -> Step<T> + Send + 'static,
    ) -> &Self {
        self.attach(Link::Pair {
            on_success: Some(Box::new(on_success)),
            on_error: Some(Box::new(on_error)),
        })
    }

    /// Appends a handler that runs on either branch.
    ///
    /// # Panics
    ///
    /// Panics if the deferred is chained or finalized.
    pub fn add_both(&self, f: impl FnOnce(Result<T, Error>) -> Step<T> + Send + 'static) -> &Self {
        self.attach(Link::Both(Box::new(f)))
    }

    /// Consumes the result of this chain into a new deferred of another type.
    ///
    /// Errors are forwarded unchanged. This deferred is spent afterwards and
    /// accepts no more handlers.
    ///
    /// # Panics
    ///
    /// Panics if the deferred is chained or finalized.
    pub fn then<U: Send + 'static>(
        &self,
        f: impl FnOnce(T) -> Step<U> + Send + 'static,
    ) -> Deferred<U> {
        let (next, resolver) = Deferred::with_resolver();
        self.attach(Link::Consume(Box::new(move |outcome| {
            let step = match outcome {
                Ok(value) => f(value),
                Err(error) => Step::Err(error),
            };
            resolver.resolve_step(step);
        })));
        next
    }

    pub(crate) fn attach(&self, link: Link<T>) -> &Self {
        {
            let mut inner = self.inner.lock();
            if inner.chained {
                panic!("{}", ReuseError::Chained);
            }
            if inner.finalized || inner.consumed {
                panic!("{}", ReuseError::Finalized);
            }
            inner.consumed = matches!(link, Link::Consume(_));
        }
        self.push_link(link);
        self
    }

    fn push_link(&self, link: Link<T>) {
        self.inner.lock().chain.push_back(link);
        self.fire();
    }

    /// Suspends chain draining until a matching [`resume`](Self::resume).
    pub fn pause(&self) -> &Self {
        self.inner.lock().paused += 1;
        self
    }

    /// Undoes one [`pause`](Self::pause) and continues draining once no pause is
    /// left.
    ///
    /// A deferred created paused by an executor-backed constructor submits its work
    /// on the resume that unpauses it.
    pub fn resume(&self) {
        let starter = {
            let mut inner = self.inner.lock();
            if inner.paused == 0 {
                tracing::warn!(id = self.id, "resume called on a deferred that is not paused");
                return;
            }
            inner.paused -= 1;
            if inner.paused == 0 {
                inner.starter.take()
            } else {
                None
            }
        };
        if let Some(start) = starter {
            start();
        }
        self.fire();
    }

    pub(crate) fn set_starter(&self, starter: impl FnOnce() + Send + 'static) {
        self.inner.lock().starter = Some(Box::new(starter));
    }

    /// Cancels the deferred.
    ///
    /// Does nothing if it already has a result, unless its chain is suspended on a
    /// chained deferred, in which case that one is canceled instead. Otherwise the
    /// canceller runs first and the deferred then fails with [`Error::Canceled`],
    /// unless the canceller resolved it. A result delivered by the producer later
    /// is ignored.
    pub fn cancel(&self) {
        self.cancel_with(Error::Canceled);
    }

    pub(crate) fn cancel_with(&self, error: Error) {
        let (canceller, starter, awaiting) = {
            let mut inner = self.inner.lock();
            if inner.state == State::Pending {
                inner.canceled = true;
                (inner.canceller.take(), inner.starter.take(), None)
            } else {
                (None, None, inner.awaiting.take())
            }
        };
        if let Some(cancel_awaited) = awaiting {
            cancel_awaited();
            return;
        }
        drop(starter);
        if let Some(canceller) = canceller {
            canceller();
        }
        let settled = {
            let mut inner = self.inner.lock();
            (inner.state == State::Pending).then(|| inner.settle_first(Err(error)))
        };
        if let Some(settled) = settled {
            tracing::debug!(id = self.id, "deferred canceled");
            self.after_settle(settled);
        }
    }

    /// Cancels the deferred without telling any of its handlers.
    ///
    /// The chain is discarded unrun and the instance is finalized. Used by
    /// [`DeferredPool`](crate::DeferredPool) to reject a duplicate key.
    pub fn cancel_silently(&self) {
        let (canceller, starter) = {
            let mut inner = self.inner.lock();
            if inner.state != State::Pending {
                return;
            }
            inner.canceled = true;
            inner.silently_canceled = true;
            (inner.canceller.take(), inner.starter.take())
        };
        drop(starter);
        if let Some(canceller) = canceller {
            canceller();
        }
        let (chain, watchers) = {
            let mut inner = self.inner.lock();
            if inner.state != State::Pending {
                return;
            }
            let (_, watchers) = inner.settle_first(Err(Error::Canceled));
            inner.finalized = true;
            (mem::take(&mut inner.chain), watchers)
        };
        tracing::debug!(id = self.id, discarded = chain.len(), "deferred silently canceled");
        drop(chain);
        notify(watchers);
    }

    /// Installs a hook that sees the outcome left at the end of the chain when the
    /// last handle to this deferred is dropped.
    ///
    /// The hook does not run if the deferred never fired, if its outcome was
    /// consumed (by awaiting it or through [`then`](Self::then)), or if it was
    /// canceled silently. Handlers may still be added after it is installed.
    pub fn set_finalizer(&self, f: impl FnOnce(&Result<T, Error>) + Send + 'static) -> &Self {
        self.inner.lock().finalizer = Some(Box::new(f));
        self
    }

    /// Installs a finalizer that logs an error nobody handled.
    pub fn report_unconsumed_errors(&self) -> &Self {
        let id = self.id;
        self.set_finalizer(move |outcome| {
            if let Err(error) = outcome {
                tracing::warn!(id, %error, "deferred finished with an unconsumed error");
            }
        })
    }

    // Returns `false` if the deferred was already chained.
    fn mark_chained(&self) -> bool {
        let mut inner = self.inner.lock();
        !mem::replace(&mut inner.chained, true)
    }

    fn fire(&self) {
        let mut inner = self.inner.lock();
        if inner.draining {
            return;
        }
        inner.draining = true;
        loop {
            if inner.paused > 0 || inner.state == State::Pending || inner.finalized {
                break;
            }
            let Some(link) = inner.chain.pop_front() else {
                break;
            };
            let Some(outcome) = inner.result.take() else {
                break;
            };
            tracing::trace!(id = self.id, state = ?inner.state, "running chain link");
            match MutexGuard::unlocked(&mut inner, || run_link(link, outcome)) {
                Next::Settled(outcome) => inner.settle(outcome),
                Next::Spent => inner.finalized = true,
                Next::Await(awaited) => {
                    inner.paused += 1;
                    MutexGuard::unlocked(&mut inner, || self.await_chained(awaited));
                }
            }
        }
        inner.draining = false;
    }

    fn await_chained(&self, awaited: Deferred<T>) {
        if !awaited.mark_chained() {
            self.resume_from_chained(Err(Error::msg(ReuseError::Chained.to_string())));
            return;
        }
        let cancel_target = awaited.clone();
        self.inner.lock().awaiting = Some(Box::new(move || cancel_target.cancel()));
        let outer = self.clone();
        awaited.push_link(Link::Consume(Box::new(move |outcome| {
            outer.resume_from_chained(outcome);
        })));
    }

    fn resume_from_chained(&self, outcome: Outcome<T>) {
        let awaiting = {
            let mut inner = self.inner.lock();
            inner.settle(outcome);
            inner.paused = inner.paused.saturating_sub(1);
            inner.awaiting.take()
        };
        drop(awaiting);
        self.fire();
    }

    /// Orders by start time, then by creation order.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        self.compare_dates(other).then(self.id.cmp(&other.id))
    }

    /// Orders by start time, earliest first.
    #[must_use]
    pub fn compare_dates(&self, other: &Self) -> Ordering {
        self.started().cmp(&other.started())
    }

    /// Orders by start time, latest first.
    #[must_use]
    pub fn reverse_compare_dates(&self, other: &Self) -> Ordering {
        other.compare_dates(self)
    }
}

/// The producer side of a [`Deferred`].
///
/// Obtained from [`Deferred::with_resolver`]. A resolver may resolve its deferred
/// even after it was returned from a handler and became chained.
pub struct Resolver<T> {
    deferred: Deferred<T>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            deferred: self.deferred.clone(),
        }
    }
}

impl<T: Send + 'static> Resolver<T> {
    /// Resolves with a value.
    ///
    /// # Errors
    ///
    /// `ReuseError::AlreadyFired` or `ReuseError::Finalized`, as for
    /// [`Deferred::callback`].
    pub fn callback(&self, value: T) -> Result<(), ReuseError> {
        self.deferred.resolve_from(Ok(value), false)
    }

    /// Resolves with an error.
    ///
    /// # Errors
    ///
    /// Same as [`callback`](Self::callback).
    pub fn errback(&self, error: Error) -> Result<(), ReuseError> {
        self.deferred.resolve_from(Err(error), false)
    }

    /// Resolves with either branch.
    ///
    /// # Errors
    ///
    /// Same as [`callback`](Self::callback).
    pub fn resolve(&self, outcome: Result<T, Error>) -> Result<(), ReuseError> {
        self.deferred.resolve_from(outcome, false)
    }

    /// Resolves from a handler's [`Step`], waiting on the inner deferred if there
    /// is one. Misuse is logged, since there is no caller left to report it to.
    pub fn resolve_step(self, step: Step<T>) {
        match step {
            Step::Ok(value) => self.report(self.callback(value)),
            Step::Err(error) => self.report(self.errback(error)),
            Step::Await(awaited) => {
                if !awaited.mark_chained() {
                    self.report(Err(ReuseError::Chained));
                    return;
                }
                awaited.push_link(Link::Consume(Box::new(move |outcome| {
                    self.report(self.resolve(outcome));
                })));
            }
        }
    }

    fn report(&self, result: Result<(), ReuseError>) {
        if let Err(error) = result {
            tracing::error!(id = self.deferred.id, %error, "failed to resolve deferred");
        }
    }

    #[must_use]
    pub fn deferred(&self) -> &Deferred<T> {
        &self.deferred
    }

    /// Returns `true` once the consumer canceled; the producer may stop early.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.deferred.is_canceled()
    }
}

pin_project! {
    /// Future returned by awaiting a [`Deferred`].
    ///
    /// Resolves with the outcome at the end of the chain. Awaiting spends the
    /// deferred. If the deferred is dropped without ever producing a result, was
    /// canceled silently, or was already spent, this yields [`Error::Canceled`].
    #[must_use = "futures do nothing unless polled or .awaited"]
    pub struct DeferredFuture<T> {
        #[pin]
        receiver: oneshot::Receiver<Result<T, Error>>,
    }
}

impl<T> Future for DeferredFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().receiver.poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::Canceled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: Send + 'static> IntoFuture for Deferred<T> {
    type Output = Result<T, Error>;
    type IntoFuture = DeferredFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        let (sender, receiver) = oneshot::channel();
        let spent = {
            let inner = self.inner.lock();
            inner.finalized || inner.consumed
        };
        if spent {
            let _ = sender.send(Err(Error::Canceled));
            return DeferredFuture { receiver };
        }
        self.attach(Link::Consume(Box::new(move |outcome| {
            let _ = sender.send(outcome);
        })));
        DeferredFuture { receiver }
    }
}

/// Blocks the calling thread until `deferred` has a result.
///
/// Meant for tests and prototypes only. Never call it from an executor thread or
/// from work admitted by a [`DeferredPool`](crate::DeferredPool): the thread it
/// blocks may be the one that has to deliver the result.
pub fn wait_for_deferred<T: Send + 'static>(deferred: Deferred<T>) -> Result<T, Error> {
    futures::executor::block_on(deferred.into_future())
}
