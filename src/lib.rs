//! Deferred results with chained continuations, and the schedulers built on them.
//!
//! `deferkit` provides a callback-chain flavour of asynchronous programming that
//! works alongside, and independently of, any specific async runtime. Results
//! are produced on worker threads and handed back to a single draining context
//! per instance, so handler chains read as if everything ran on one thread.
//!
//! Features include:
//! - A `Deferred` whose success and error handlers run in the order they were
//!   added, can switch branches, and can suspend on an inner `Deferred`
//! - Pause/resume, cooperative cancellation, and a finalizer for surfacing
//!   errors nobody handled
//! - A `DeferredList` for gathering children or racing them for the first
//!   success or failure
//! - Executor-backed deferreds that run work on dedicated threads or a bounded
//!   worker pool, optionally starting only when first resumed
//! - A `MappedPriorityQueue` and a `DeferredPool` that admits keyed work with
//!   bounded concurrency and at most one in-flight entry per key
//! - A bounded `Cache` whose operations are deferreds
//!
//! Every `Deferred` can also be `.await`ed from any executor.

pub mod cache;
pub mod callback;
pub mod deferred;
pub mod error;
pub mod executor;
pub mod ext;
pub mod list;
pub mod pool;
pub mod queue;
pub mod timing;

pub use cache::{Cache, CacheConfig, MemoryStorage, Storage};
pub use callback::Callback;
pub use deferred::{Deferred, DeferredFuture, Resolver, State, Step, wait_for_deferred};
pub use error::{Error, ReuseError};
pub use executor::{Executor, ThreadExecutor, serial_executor, shared_pool};
pub use ext::DeferredExt;
pub use list::{DeferredList, ListOutcome, gather_results};
pub use pool::{DeferredPool, Id, PoolConfig};
pub use queue::{Comparator, MappedPriorityQueue, by_latest_start, by_start_time};
