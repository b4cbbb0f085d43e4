use std::{fmt, sync::Arc};

/// A reusable unary function object.
///
/// Handlers passed to a [`Deferred`](crate::Deferred) are plain closures; a
/// `Callback` is for the places where the same function has to be stored, shared
/// between threads and composed with others before it is used.
pub struct Callback<A, B> {
    f: Arc<dyn Fn(A) -> B + Send + Sync>,
}

impl<A: 'static, B: 'static> Callback<A, B> {
    /// Wraps a closure.
    pub fn new(f: impl Fn(A) -> B + Send + Sync + 'static) -> Self {
        Self { f: Arc::new(f) }
    }

    /// Calls the function.
    pub fn invoke(&self, arg: A) -> B {
        (self.f)(arg)
    }

    /// Returns a callback that runs `self` and feeds its result to `next`.
    pub fn and_then<C: 'static>(&self, next: &Callback<B, C>) -> Callback<A, C> {
        let first = Arc::clone(&self.f);
        let second = Arc::clone(&next.f);
        Callback {
            f: Arc::new(move |arg| second(first(arg))),
        }
    }

    /// Returns a callback that runs `inner` first and feeds its result to `self`.
    pub fn compose_with<Z: 'static>(&self, inner: &Callback<Z, A>) -> Callback<Z, B> {
        inner.and_then(self)
    }

    /// Turns the callback into a closure suitable for a one-shot handler.
    pub fn into_fn(self) -> impl Fn(A) -> B + Send + Sync + 'static {
        move |arg| (self.f)(arg)
    }
}

impl<A, B> Clone for Callback<A, B> {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
        }
    }
}

impl<A, B> fmt::Debug for Callback<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").finish_non_exhaustive()
    }
}
