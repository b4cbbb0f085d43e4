//! A bounded key-value cache whose operations are deferreds.
//!
//! Values are opaque byte blobs kept by a [`Storage`] collaborator. The cache
//! itself only keeps an index of which keys are live, when they expire and when
//! they were last written. Every operation, reads included, runs on one serial
//! worker, so operations take effect in the order they were issued and a read
//! always observes the writes issued before it.
//!
//! The index is published as an immutable snapshot. A cull pass builds the whole
//! post-cull index before publishing it, so [`Cache::has_key`] and
//! [`Cache::len`] see either the state before a cull or the state after it.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use futures::executor::ThreadPool;
use parking_lot::Mutex;

use crate::{deferred::Deferred, error::Error, executor::serial_executor};

/// Where cached blobs are kept.
///
/// Implementations report their own failures, typically as [`Error::Storage`];
/// the cache passes them on to the caller unchanged.
pub trait Storage: Send + Sync + 'static {
    /// Reads the blob stored under `key`, if any.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Stores `value` under `key`, replacing what was there.
    fn write(&self, key: &str, value: &[u8]) -> Result<(), Error>;

    /// Removes the blob stored under `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), Error>;
}

/// Keeps blobs in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        self.blobs.lock().insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        self.blobs.lock().remove(key);
        Ok(())
    }
}

impl<S: Storage> Storage for Arc<S> {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        (**self).read(key)
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        (**self).write(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        (**self).delete(key)
    }
}

/// Cache settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry count a cull pass trims the cache down to.
    pub max_entries: usize,
    /// Number of writes between cull passes. `0` disables culling.
    pub cull_every: usize,
    /// Lifetime of entries written without an explicit timeout.
    pub default_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 300,
            cull_every: 10,
            default_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct EntryMeta {
    // `None` when the timeout reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
    last_touched: Instant,
    // Write order; breaks `last_touched` ties.
    seq: u64,
}

impl EntryMeta {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

// Writers copy the whole map before publishing, so a write costs O(entries).
// Cheap at the default bound; a persistent map would pay off for much larger
// `max_entries`.
type Index = HashMap<String, EntryMeta>;

struct Shared<S> {
    storage: S,
    index: ArcSwap<Index>,
    config: CacheConfig,
    writes: AtomicUsize,
    seq: AtomicU64,
    worker: ThreadPool,
}

/// A bounded cache with timeout-based expiry and count-based eviction.
///
/// Cloning yields another handle to the same cache.
///
/// # Example
/// ```
/// # use deferkit::{Cache, CacheConfig, MemoryStorage, wait_for_deferred};
/// let cache = Cache::new(MemoryStorage::new(), CacheConfig::default()).unwrap();
///
/// wait_for_deferred(cache.set("greeting", b"hello".to_vec(), None)).unwrap();
/// assert!(cache.has_key("greeting"));
/// assert_eq!(wait_for_deferred(cache.get("greeting")), Ok(Some(b"hello".to_vec())));
/// assert_eq!(wait_for_deferred(cache.get("missing")), Ok(None));
/// ```
pub struct Cache<S: Storage> {
    shared: Arc<Shared<S>>,
}

impl<S: Storage> Clone for Cache<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Storage> fmt::Debug for Cache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("entries", &self.shared.index.load().len())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl<S: Storage> Cache<S> {
    /// Creates an empty cache over `storage`.
    ///
    /// Blobs already present in `storage` are not indexed and stay invisible.
    ///
    /// # Errors
    ///
    /// Fails if the cache's worker thread can not be spawned.
    pub fn new(storage: S, config: CacheConfig) -> Result<Self, Error> {
        let worker = serial_executor().map_err(Error::other)?;
        Ok(Self {
            shared: Arc::new(Shared {
                storage,
                index: ArcSwap::from_pointee(Index::new()),
                config,
                writes: AtomicUsize::new(0),
                seq: AtomicU64::new(0),
                worker,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.shared.storage
    }

    fn run<T: Send + 'static>(
        &self,
        f: impl FnOnce(&Shared<S>) -> Result<T, Error> + Send + 'static,
    ) -> Deferred<T> {
        Deferred::defer_on(
            &self.shared.worker,
            move |shared: Arc<Shared<S>>| f(&shared),
            Arc::clone(&self.shared),
        )
    }

    /// Stores `value` under `key` for `timeout`, or for the default timeout.
    ///
    /// A zero timeout stores an entry that is already expired. A timeout too
    /// large to represent, such as [`Duration::MAX`], never expires.
    pub fn set(&self, key: impl Into<String>, value: Vec<u8>, timeout: Option<Duration>) -> Deferred<()> {
        let key = key.into();
        self.run(move |shared| {
            let timeout = timeout.unwrap_or(shared.config.default_timeout);
            shared.store(&key, &value, timeout)
        })
    }

    /// Looks `key` up; a missing or expired key yields `None`.
    pub fn get(&self, key: impl Into<String>) -> Deferred<Option<Vec<u8>>> {
        let key = key.into();
        self.run(move |shared| shared.lookup(&key, Instant::now()))
    }

    /// Looks several keys up at once. Missing and expired keys are left out.
    pub fn get_many<I>(&self, keys: I) -> Deferred<HashMap<String, Vec<u8>>>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        self.run(move |shared| {
            let now = Instant::now();
            let mut found = HashMap::with_capacity(keys.len());
            for key in keys {
                if let Some(value) = shared.lookup(&key, now)? {
                    found.insert(key, value);
                }
            }
            Ok(found)
        })
    }

    /// Removes `key`.
    pub fn delete(&self, key: impl Into<String>) -> Deferred<()> {
        let key = key.into();
        self.run(move |shared| {
            shared.forget(&key);
            shared.storage.delete(&key)
        })
    }

    /// Returns `true` if `key` is live in the current index snapshot.
    ///
    /// Operations still queued on the worker are not taken into account.
    #[must_use]
    pub fn has_key(&self, key: &str) -> bool {
        self.shared
            .index
            .load()
            .get(key)
            .is_some_and(|meta| meta.is_live(Instant::now()))
    }

    /// Number of indexed entries, expired ones not yet culled included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.index.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.index.load().is_empty()
    }

    /// Adds `delta` to the counter under `key` and yields the new count.
    ///
    /// A missing or expired counter starts at zero. The counter is rewritten with
    /// the default timeout.
    pub fn incr(&self, key: impl Into<String>, delta: i64) -> Deferred<i64> {
        let key = key.into();
        self.run(move |shared| shared.add_to_counter(&key, delta))
    }

    /// Subtracts `delta` from the counter under `key` and yields the new count.
    pub fn decr(&self, key: impl Into<String>, delta: i64) -> Deferred<i64> {
        let key = key.into();
        self.run(move |shared| {
            let delta = delta
                .checked_neg()
                .ok_or_else(|| Error::msg(format!("counter delta {delta} out of range")))?;
            shared.add_to_counter(&key, delta)
        })
    }
}

// Everything below runs on the serial worker, the only writer of the index.
impl<S: Storage> Shared<S> {
    fn store(&self, key: &str, value: &[u8], timeout: Duration) -> Result<(), Error> {
        self.storage.write(key, value)?;
        let now = Instant::now();
        let meta = EntryMeta {
            expires_at: now.checked_add(timeout),
            last_touched: now,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        let mut index = Index::clone(&self.index.load());
        index.insert(key.to_owned(), meta);
        self.index.store(Arc::new(index));
        self.count_write();
        Ok(())
    }

    fn lookup(&self, key: &str, now: Instant) -> Result<Option<Vec<u8>>, Error> {
        let Some(meta) = self.index.load().get(key).copied() else {
            return Ok(None);
        };
        if !meta.is_live(now) {
            tracing::trace!(key, "cache entry expired");
            self.forget(key);
            self.discard(key);
            return Ok(None);
        }
        self.storage.read(key)
    }

    fn add_to_counter(&self, key: &str, delta: i64) -> Result<i64, Error> {
        let current = match self.lookup(key, Instant::now())? {
            Some(bytes) => parse_counter(key, &bytes)?,
            None => 0,
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| Error::msg(format!("counter {key:?} overflowed")))?;
        self.store(key, next.to_string().as_bytes(), self.config.default_timeout)?;
        Ok(next)
    }

    fn forget(&self, key: &str) {
        let index = self.index.load();
        if index.contains_key(key) {
            let mut index = Index::clone(&index);
            index.remove(key);
            self.index.store(Arc::new(index));
        }
    }

    fn discard(&self, key: &str) {
        if let Err(error) = self.storage.delete(key) {
            tracing::warn!(key, %error, "failed to delete cached blob");
        }
    }

    fn count_write(&self) {
        let every = self.config.cull_every;
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if every > 0 && writes % every == 0 {
            self.cull();
        }
    }

    fn cull(&self) {
        let now = Instant::now();
        let index = self.index.load_full();
        let (mut live, expired): (Vec<_>, Vec<_>) = index
            .iter()
            .map(|(key, meta)| (key.clone(), *meta))
            .partition(|(_, meta)| meta.is_live(now));

        let mut evicted = Vec::new();
        if live.len() > self.config.max_entries {
            live.sort_by_key(|(_, meta)| (meta.last_touched, meta.seq));
            let excess = live.len() - self.config.max_entries;
            evicted.extend(live.drain(..excess));
        }
        if expired.is_empty() && evicted.is_empty() {
            return;
        }

        tracing::debug!(
            expired = expired.len(),
            evicted = evicted.len(),
            remaining = live.len(),
            "culling cache"
        );
        self.index.store(Arc::new(live.into_iter().collect()));
        for (key, _) in expired.iter().chain(&evicted) {
            self.discard(key);
        }
    }
}

fn parse_counter(key: &str, bytes: &[u8]) -> Result<i64, Error> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .ok_or_else(|| Error::msg(format!("value of {key:?} is not a counter")))
}
