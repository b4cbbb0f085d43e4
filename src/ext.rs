use futures::future::{AbortHandle, Abortable};

use crate::{deferred::Deferred, error::Error, executor::shared_pool};

/// Extend `Future` with a bridge into the deferred world.
pub trait DeferredExt: Future {
    /// Drives the future on the shared worker pool and resolves a deferred with
    /// its output. Canceling the deferred aborts the future.
    ///
    /// The future runs outside of any particular async runtime, so it must not
    /// rely on runtime-specific facilities such as `tokio::time::sleep()`.
    fn into_deferred<T>(self) -> Deferred<T>
    where
        Self: Future<Output = Result<T, Error>> + Sized + Send + 'static,
        T: Send + 'static,
    {
        let (abort, registration) = AbortHandle::new_pair();
        let deferred = Deferred::with_canceller(move || abort.abort());
        let resolver = deferred.resolver();
        let future = Abortable::new(self, registration);
        shared_pool().spawn_ok(async move {
            if let Ok(outcome) = future.await
                && let Err(error) = resolver.resolve(outcome)
            {
                tracing::error!(id = resolver.deferred().id(), %error, "future result rejected");
            }
        });
        deferred
    }
}

impl<F> DeferredExt for F where F: Future {}
