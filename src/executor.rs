//! Executors that run units of work away from the calling context, and the
//! deferreds backed by them.
//!
//! Work submitted through [`Deferred::defer_on`] and friends runs on another
//! thread and hands its result back through the deferred's [`Resolver`], so the
//! deferred's chain is still drained by one context at a time. Work may be
//! submitted lazily: the `_paused` constructors only submit once the deferred is
//! resumed, which is how a [`DeferredPool`](crate::DeferredPool) starts admitted work.
//!
//! Executor-backed work must not block on other deferreds with
//! [`wait_for_deferred`](crate::wait_for_deferred): the thread it blocks may be
//! the one that has to deliver the result.
use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, OnceLock},
    thread,
};

use futures::executor::{ThreadPool, ThreadPoolBuilder};

use crate::{
    deferred::{Deferred, Resolver},
    error::Error,
};

static THREAD_POOL: OnceLock<ThreadPool> = OnceLock::new();

/// A boxed unit of work.
pub type Work = Box<dyn FnOnce() + Send>;

/// Runs units of work on some other thread.
pub trait Executor: Send + Sync {
    fn execute(&self, work: Work);
}

impl Executor for ThreadPool {
    fn execute(&self, work: Work) {
        self.spawn_ok(async move { work() });
    }
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, work: Work) {
        (**self).execute(work);
    }
}

/// Runs every unit of work on its own dedicated thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn execute(&self, work: Work) {
        let spawned = thread::Builder::new()
            .name("deferkit-thread".into())
            .spawn(work);
        if let Err(error) = spawned {
            tracing::error!(%error, "failed to spawn worker thread");
        }
    }
}

/// The worker pool shared by [`Deferred::defer`] and
/// [`DeferredExt`](crate::ext::DeferredExt).
pub fn shared_pool() -> &'static ThreadPool {
    THREAD_POOL.get_or_init(|| {
        ThreadPoolBuilder::new()
            .pool_size(40)
            .name_prefix("deferkit-pool-")
            .create()
            .expect("Thread pool creation failed")
    })
}

/// Creates a pool with a single worker; work submitted to it runs one unit at a
/// time in submission order.
///
/// # Errors
///
/// Fails if the worker thread can not be spawned.
pub fn serial_executor() -> io::Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .pool_size(1)
        .name_prefix("deferkit-serial-")
        .create()
}

/// Calls `f(arg)`, turning a panic into an [`Error::Generic`] so that the
/// deferred waiting on the result still resolves.
pub(crate) fn run_guarded<A, T>(f: impl FnOnce(A) -> Result<T, Error>, arg: A) -> Result<T, Error> {
    panic::catch_unwind(AssertUnwindSafe(|| f(arg))).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        tracing::error!(%message, "deferred work panicked");
        Err(Error::msg(format!("work panicked: {message}")))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn submit<E, A, T>(
    executor: &E,
    resolver: Resolver<T>,
    f: impl FnOnce(A) -> Result<T, Error> + Send + 'static,
    arg: A,
) where
    E: Executor + ?Sized,
    A: Send + 'static,
    T: Send + 'static,
{
    executor.execute(Box::new(move || {
        // Canceled before a worker picked it up.
        if resolver.is_canceled() {
            return;
        }
        if let Err(error) = resolver.resolve(run_guarded(f, arg)) {
            tracing::error!(id = resolver.deferred().id(), %error, "worker result rejected");
        }
    }));
}

impl<T: Send + 'static> Deferred<T> {
    /// Runs `f(arg)` on the shared worker pool.
    pub fn defer<A: Send + 'static>(
        f: impl FnOnce(A) -> Result<T, Error> + Send + 'static,
        arg: A,
    ) -> Self {
        Self::defer_on(shared_pool(), f, arg)
    }

    /// Runs `f(arg)` on `executor` and resolves with its result.
    pub fn defer_on<E, A>(
        executor: &E,
        f: impl FnOnce(A) -> Result<T, Error> + Send + 'static,
        arg: A,
    ) -> Self
    where
        E: Executor + ?Sized,
        A: Send + 'static,
    {
        let deferred = Self::new();
        submit(executor, deferred.resolver(), f, arg);
        deferred
    }

    /// Like [`defer_on`](Self::defer_on), but the deferred starts paused and `f`
    /// is only submitted once it is resumed.
    pub fn defer_on_paused<E, A>(
        executor: E,
        f: impl FnOnce(A) -> Result<T, Error> + Send + 'static,
        arg: A,
    ) -> Self
    where
        E: Executor + 'static,
        A: Send + 'static,
    {
        let deferred = Self::paused();
        let resolver = deferred.resolver();
        deferred.set_starter(move || submit(&executor, resolver, f, arg));
        deferred
    }

    /// Runs `f(arg)` on a dedicated thread.
    pub fn defer_in_thread<A: Send + 'static>(
        f: impl FnOnce(A) -> Result<T, Error> + Send + 'static,
        arg: A,
    ) -> Self {
        Self::defer_on(&ThreadExecutor, f, arg)
    }

    /// Like [`defer_in_thread`](Self::defer_in_thread), but the thread is only
    /// started once the deferred is resumed.
    pub fn defer_in_thread_paused<A: Send + 'static>(
        f: impl FnOnce(A) -> Result<T, Error> + Send + 'static,
        arg: A,
    ) -> Self {
        Self::defer_on_paused(ThreadExecutor, f, arg)
    }
}
