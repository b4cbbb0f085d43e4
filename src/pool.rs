//! Provides the `DeferredPool` for running keyed deferreds with bounded concurrency.
//!
//! Deferreds are added under a key and wait in a [`MappedPriorityQueue`] until a
//! concurrency slot is free. Admission moves the highest-priority entry into the
//! running set and resumes it; entries are expected to be created paused, so that
//! admission is what starts their work. At most one deferred per key is queued or
//! running at any time: adding another under a busy key silently cancels the
//! newcomer.
//!
//! The pending and running collections are guarded by a single lock, because
//! deferreds are added from callers and complete on whatever thread resolves them.
//! No user code runs while that lock is held.

use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    deferred::Deferred,
    error::Error,
    queue::{Comparator, MappedPriorityQueue, by_start_time},
    timing::schedule_after,
};

/// A trait for types that can be used as keys of pooled deferreds.
///
/// This trait is used by the [`DeferredPool`] and the [`MappedPriorityQueue`] to
/// uniquely identify entries. Implementations must support equality comparison,
/// hashing and cloning to ensure reliable storage and retrieval, and must be
/// printable for diagnostics.
///
/// It is automatically implemented for common identifier types such as `char`,
/// `String`, `&str`, and all primitive numeric types.
pub trait Id: Eq + Hash + Clone + fmt::Debug {}

impl Id for char {}
impl Id for &str {}
impl Id for String {}
impl Id for i8 {}
impl Id for u8 {}
impl Id for i16 {}
impl Id for u16 {}
impl Id for i32 {}
impl Id for u32 {}
impl Id for i64 {}
impl Id for u64 {}
impl Id for i128 {}
impl Id for u128 {}
impl Id for isize {}
impl Id for usize {}

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of deferreds running at once.
    pub concurrency: usize,
    /// How long an admitted deferred may hold its slot before it is canceled with
    /// [`Error::PoolTimeout`]. `None` never times out.
    pub timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            timeout: None,
        }
    }
}

type DrainedHook = Arc<dyn Fn() + Send + Sync>;

struct PoolState<K, T> {
    pending: MappedPriorityQueue<K, Deferred<T>>,
    running: HashMap<K, Deferred<T>>,
    concurrency: usize,
    timeout: Option<Duration>,
    comparator: Comparator<Deferred<T>>,
    on_drained: Option<DrainedHook>,
}

impl<K: Id, T> PoolState<K, T> {
    fn drained_hook(&self) -> Option<DrainedHook> {
        if self.running.is_empty() && self.pending.is_empty() {
            self.on_drained.clone()
        } else {
            None
        }
    }
}

type Shared<K, T> = Arc<Mutex<PoolState<K, T>>>;

/// A keyed, concurrency-bounded scheduler of deferreds.
///
/// Dropping the pool drains it.
///
/// # Example
/// ```
/// # use deferkit::{Deferred, DeferredPool, wait_for_deferred};
/// let pool = DeferredPool::new();
///
/// let work = Deferred::defer_in_thread_paused(|n: u32| Ok(n * 2), 21);
/// let admitted = pool.add(work, "answer").unwrap();
///
/// // A second deferred under a busy key is rejected and silently canceled.
/// let duplicate = Deferred::defer_in_thread_paused(|n: u32| Ok(n), 0);
/// assert!(pool.add(duplicate.clone(), "answer").is_none());
/// assert!(duplicate.is_silently_canceled());
///
/// assert_eq!(wait_for_deferred(admitted), Ok(42));
/// ```
pub struct DeferredPool<K: Id + Send + 'static, T: Send + 'static> {
    shared: Shared<K, T>,
}

impl<K: Id + Send + 'static, T: Send + 'static> DeferredPool<K, T> {
    /// Creates a pool with the default [`PoolConfig`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    #[must_use]
    pub fn with_config(config: PoolConfig) -> Self {
        let comparator = by_start_time();
        Self {
            shared: Arc::new(Mutex::new(PoolState {
                pending: MappedPriorityQueue::with_comparator(Arc::clone(&comparator)),
                running: HashMap::with_capacity(config.concurrency),
                concurrency: config.concurrency,
                timeout: config.timeout,
                comparator,
                on_drained: None,
            })),
        }
    }

    /// Adds a deferred under `key` and admits it if a slot is free.
    ///
    /// Returns the deferred, or `None` if `key` is already queued or running. In
    /// that case the passed deferred is canceled silently and the existing entry
    /// carries on.
    pub fn add(&self, deferred: Deferred<T>, key: K) -> Option<Deferred<T>> {
        let rejected = {
            let mut state = self.shared.lock();
            if state.running.contains_key(&key) {
                Some(deferred.clone())
            } else {
                let comparator = Arc::clone(&state.comparator);
                state
                    .pending
                    .enqueue_with(deferred.clone(), key.clone(), comparator)
                    .err()
            }
        };
        if let Some(rejected) = rejected {
            tracing::debug!(?key, id = rejected.id(), "key already pooled, canceling newcomer");
            rejected.cancel_silently();
            return None;
        }
        tracing::debug!(?key, id = deferred.id(), "deferred queued");
        admit(&self.shared);
        Some(deferred)
    }

    /// Cancels every queued and running deferred and forgets them.
    ///
    /// The [`on_drained`](Self::on_drained) hook runs once afterwards if the pool
    /// held anything.
    pub fn drain(&self) {
        let (pending, running, drained) = {
            let mut state = self.shared.lock();
            let pending = state.pending.drain();
            let running: Vec<_> = state.running.drain().collect();
            let drained = if pending.is_empty() && running.is_empty() {
                None
            } else {
                state.on_drained.clone()
            };
            (pending, running, drained)
        };
        tracing::debug!(pending = pending.len(), running = running.len(), "draining pool");
        for (_, deferred) in pending.into_iter().chain(running) {
            deferred.cancel();
            // Queued entries were never admitted; let their handlers see the
            // cancellation.
            if deferred.is_paused() {
                deferred.resume();
            }
        }
        if let Some(hook) = drained {
            hook();
        }
    }

    /// Number of deferreds currently running.
    #[must_use]
    pub fn running(&self) -> usize {
        self.shared.lock().running.len()
    }

    /// Number of deferreds waiting for a slot.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.count()
    }

    /// Returns `true` if `key` is queued or running.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        let state = self.shared.lock();
        state.running.contains_key(key) || state.pending.contains_key(key)
    }

    /// Returns `true` if `key` is running.
    #[must_use]
    pub fn is_running(&self, key: &K) -> bool {
        self.shared.lock().running.contains_key(key)
    }

    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.shared.lock().concurrency
    }

    /// Changes the number of slots; raising it admits waiting entries right away.
    pub fn set_concurrency(&self, concurrency: usize) {
        self.shared.lock().concurrency = concurrency;
        admit(&self.shared);
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.shared.lock().timeout
    }

    /// Changes the slot timeout for entries admitted from now on.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.shared.lock().timeout = timeout;
    }

    /// Changes the ordering of entries added from now on.
    pub fn set_comparator(&self, comparator: Comparator<Deferred<T>>) {
        self.shared.lock().comparator = comparator;
    }

    /// Runs `hook` whenever a completion, a timeout or a [`drain`](Self::drain)
    /// leaves the pool with nothing queued and nothing running.
    pub fn on_drained(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.shared.lock().on_drained = Some(Arc::new(hook));
    }
}

impl<K: Id + Send + 'static, T: Send + 'static> Default for DeferredPool<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Id + Send + 'static, T: Send + 'static> Drop for DeferredPool<K, T> {
    fn drop(&mut self) {
        self.drain();
    }
}

impl<K: Id + Send + 'static, T: Send + 'static> fmt::Debug for DeferredPool<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("DeferredPool")
            .field("pending", &state.pending.count())
            .field("running", &state.running.len())
            .field("concurrency", &state.concurrency)
            .finish()
    }
}

fn admit<K: Id + Send + 'static, T: Send + 'static>(shared: &Shared<K, T>) {
    let (admitted, timeout) = {
        let mut state = shared.lock();
        let mut admitted = Vec::new();
        while state.running.len() < state.concurrency {
            let Some((key, deferred)) = state.pending.dequeue() else {
                break;
            };
            state.running.insert(key.clone(), deferred.clone());
            admitted.push((key, deferred));
        }
        (admitted, state.timeout)
    };

    for (key, deferred) in admitted {
        tracing::debug!(?key, id = deferred.id(), "deferred admitted");
        let id = deferred.id();
        let weak = Arc::downgrade(shared);
        let completed_key = key.clone();
        deferred.watch(move || {
            if let Some(shared) = weak.upgrade() {
                complete(&shared, &completed_key, id);
            }
        });
        if let Some(timeout) = timeout {
            let weak = Arc::downgrade(shared);
            let key = key.clone();
            schedule_after(timeout, move || expire(&weak, &key, id));
        }
        if deferred.is_paused() {
            deferred.resume();
        }
    }
}

fn complete<K: Id + Send + 'static, T: Send + 'static>(shared: &Shared<K, T>, key: &K, id: u64) {
    let drained = {
        let mut state = shared.lock();
        // Entries taken out by `drain` or a timeout were accounted for there.
        if state.running.get(key).is_some_and(|running| running.id() == id) {
            state.running.remove(key);
            state.drained_hook()
        } else {
            None
        }
    };
    tracing::debug!(?key, id, "pooled deferred completed");
    if let Some(hook) = drained {
        hook();
    }
    admit(shared);
}

fn expire<K: Id + Send + 'static, T: Send + 'static>(shared: &Weak<Mutex<PoolState<K, T>>>, key: &K, id: u64) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let (expired, drained) = {
        let mut state = shared.lock();
        match state.running.get(key) {
            Some(running) if running.id() == id => {
                let expired = state.running.remove(key);
                (expired, state.drained_hook())
            }
            _ => (None, None),
        }
    };
    if let Some(deferred) = expired {
        tracing::debug!(?key, id, "pooled deferred timed out");
        deferred.cancel_with(Error::PoolTimeout);
    }
    if let Some(hook) = drained {
        hook();
    }
}
