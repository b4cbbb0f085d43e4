//! Aggregation of several deferreds into one.
//!
//! A [`DeferredList`] watches a fixed set of children and resolves a single
//! aggregate deferred, either as soon as one child succeeds or fails, or once all
//! of them are done. Gathered results are kept in the order of the children, not
//! in the order they completed.

use std::{mem, sync::Arc};

use parking_lot::Mutex;

use crate::{
    deferred::{Deferred, Resolver, Step},
    error::Error,
};

/// The value an aggregate deferred resolves with.
#[derive(Debug, Clone, PartialEq)]
pub enum ListOutcome<T> {
    /// The first child to succeed, with its position in the list.
    First { index: usize, value: T },

    /// Every child's outcome, in the order the children were given.
    All(Vec<Result<T, Error>>),
}

type Absorb<T> = Arc<dyn Fn() -> T + Send + Sync>;

/// Builder for an aggregate over several deferreds.
///
/// By default the aggregate succeeds with [`ListOutcome::All`] once every child is
/// done, whatever their outcomes.
///
/// # Example
/// ```
/// # use deferkit::{Deferred, DeferredList, ListOutcome, wait_for_deferred};
/// let a = Deferred::new();
/// let b = Deferred::new();
/// let all = DeferredList::new(vec![a.clone(), b.clone()]).start();
///
/// b.callback(2).unwrap();
/// a.callback(1).unwrap();
/// assert_eq!(wait_for_deferred(all), Ok(ListOutcome::All(vec![Ok(1), Ok(2)])));
/// ```
pub struct DeferredList<T> {
    children: Vec<Deferred<T>>,
    fire_on_first_success: bool,
    fire_on_first_error: bool,
    absorb: Option<Absorb<T>>,
    canceller: Option<Box<dyn FnOnce() + Send>>,
}

struct Progress<T> {
    results: Vec<Option<Result<T, Error>>>,
    finished: usize,
    done: bool,
}

impl<T: Clone + Send + 'static> DeferredList<T> {
    #[must_use]
    pub fn new(children: Vec<Deferred<T>>) -> Self {
        Self {
            children,
            fire_on_first_success: false,
            fire_on_first_error: false,
            absorb: None,
            canceller: None,
        }
    }

    /// Resolve with [`ListOutcome::First`] as soon as any child succeeds.
    ///
    /// The remaining children keep running.
    #[must_use]
    pub fn fire_on_first_success(mut self) -> Self {
        self.fire_on_first_success = true;
        self
    }

    /// Fail with the first error any child fails with.
    #[must_use]
    pub fn fire_on_first_error(mut self) -> Self {
        self.fire_on_first_error = true;
        self
    }

    /// Runs `canceller` instead of canceling every child when the aggregate is
    /// canceled.
    #[must_use]
    pub fn with_canceller(mut self, canceller: impl FnOnce() + Send + 'static) -> Self {
        self.canceller = Some(Box::new(canceller));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Attaches to every child and returns the aggregate deferred.
    ///
    /// The attached handlers pass each child's outcome on unchanged, so handlers
    /// added to a child afterwards still see it.
    pub fn start(self) -> Deferred<ListOutcome<T>> {
        let Self {
            children,
            fire_on_first_success,
            fire_on_first_error,
            absorb,
            canceller,
        } = self;

        let canceller: Box<dyn FnOnce() + Send> = match canceller {
            Some(canceller) => canceller,
            None => {
                let children = children.clone();
                Box::new(move || {
                    for child in children {
                        child.cancel();
                    }
                })
            }
        };
        let aggregate = Deferred::with_canceller(canceller);
        let resolver = aggregate.resolver();

        if children.is_empty() {
            report(&resolver, Ok(ListOutcome::All(Vec::new())));
            return aggregate;
        }

        let progress = Arc::new(Mutex::new(Progress {
            results: (0..children.len()).map(|_| None).collect(),
            finished: 0,
            done: false,
        }));
        let record = Arc::new(move |index: usize, outcome: Result<T, Error>| {
            let decision = {
                let mut progress = progress.lock();
                if progress.done {
                    return;
                }
                progress.results[index] = Some(outcome.clone());
                progress.finished += 1;
                if outcome.is_ok() && fire_on_first_success {
                    progress.done = true;
                    outcome.map(|value| ListOutcome::First { index, value }).ok().map(Ok)
                } else if fire_on_first_error && let Err(error) = outcome {
                    progress.done = true;
                    Some(Err(error))
                } else if progress.finished == progress.results.len() {
                    progress.done = true;
                    let results = mem::take(&mut progress.results).into_iter().flatten().collect();
                    Some(Ok(ListOutcome::All(results)))
                } else {
                    None
                }
            };
            if let Some(outcome) = decision {
                report(&resolver, outcome);
            }
        });

        for (index, child) in children.iter().enumerate() {
            let on_success = {
                let record = Arc::clone(&record);
                move |value: T| {
                    record(index, Ok(value.clone()));
                    Step::Ok(value)
                }
            };
            let on_error = {
                let record = Arc::clone(&record);
                let absorb = absorb.clone();
                move |error: Error| {
                    record(index, Err(error.clone()));
                    match absorb {
                        Some(replacement) => Step::Ok(replacement()),
                        None => Step::Err(error),
                    }
                }
            };
            child.add_callbacks(on_success, on_error);
        }
        aggregate
    }
}

impl<T: Clone + Default + Send + 'static> DeferredList<T> {
    /// Absorb child failures into the aggregate.
    ///
    /// A failed child's error is recorded in its slot and the child's own chain
    /// continues on the success branch with `T::default()` instead.
    #[must_use]
    pub fn consume_errors(mut self) -> Self {
        self.absorb = Some(Arc::new(T::default));
        self
    }
}

fn report<T: Send + 'static>(resolver: &Resolver<T>, outcome: Result<T, Error>) {
    if let Err(error) = resolver.resolve(outcome) {
        tracing::error!(id = resolver.deferred().id(), %error, "aggregate result rejected");
    }
}

/// Succeeds with every child's value in order, or fails with the first error.
pub fn gather_results<T: Clone + Send + 'static>(children: Vec<Deferred<T>>) -> Deferred<Vec<T>> {
    DeferredList::new(children)
        .fire_on_first_error()
        .start()
        .then(|outcome| match outcome {
            ListOutcome::All(results) => results.into_iter().collect::<Result<Vec<_>, _>>().into(),
            ListOutcome::First { value, .. } => Step::Ok(vec![value]),
        })
}
