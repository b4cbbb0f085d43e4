//! A priority queue whose entries are addressed by key.
//!
//! Keys live in a binary min-heap; each key maps to its value and to the
//! comparator it was enqueued with. When two keys are compared, the comparator of
//! the left-hand key decides. Sifting follows the scheme of Python's `heapq`: a
//! removed root is replaced by the last key, pushed down to a leaf along the
//! smaller children and then bubbled up again, which keeps comparisons low.
//!
//! The queue is not synchronized. [`DeferredPool`](crate::DeferredPool) only
//! touches it while holding its own lock.

use std::{cmp::Ordering, collections::HashMap, fmt, mem, sync::Arc};

use crate::{deferred::Deferred, pool::Id};

/// Ordering used to prioritize queued values; `Less` is dequeued first.
pub type Comparator<V> = Arc<dyn Fn(&V, &V) -> Ordering + Send + Sync>;

/// Orders deferreds by start time, earliest first.
pub fn by_start_time<T: Send + 'static>() -> Comparator<Deferred<T>> {
    Arc::new(|a: &Deferred<T>, b: &Deferred<T>| a.compare(b))
}

/// Orders deferreds by start time, latest first.
pub fn by_latest_start<T: Send + 'static>() -> Comparator<Deferred<T>> {
    Arc::new(|a: &Deferred<T>, b: &Deferred<T>| a.reverse_compare_dates(b).then(b.id().cmp(&a.id())))
}

/// A keyed min-priority queue that ignores duplicate keys.
///
/// # Example
/// ```
/// # use deferkit::MappedPriorityQueue;
/// let mut queue = MappedPriorityQueue::new();
/// queue.enqueue(30, "c").unwrap();
/// queue.enqueue(10, "a").unwrap();
/// // First writer wins: the duplicate is handed back untouched.
/// assert_eq!(queue.enqueue(5, "a"), Err(5));
///
/// assert_eq!(queue.dequeue(), Some(("a", 10)));
/// assert_eq!(queue.dequeue(), Some(("c", 30)));
/// ```
pub struct MappedPriorityQueue<K, V> {
    entries: HashMap<K, (Comparator<V>, V)>,
    heap: Vec<K>,
    comparator: Comparator<V>,
}

impl<K: Id, V: Ord + 'static> MappedPriorityQueue<K, V> {
    /// Creates a queue ordered by `V`'s natural order.
    #[must_use]
    pub fn new() -> Self {
        Self::with_comparator(Arc::new(|a: &V, b: &V| a.cmp(b)))
    }
}

impl<K: Id, V: Ord + 'static> Default for MappedPriorityQueue<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Id, V> MappedPriorityQueue<K, V> {
    /// Creates a queue whose entries are ordered by `comparator` unless they are
    /// enqueued with one of their own.
    #[must_use]
    pub fn with_comparator(comparator: Comparator<V>) -> Self {
        Self {
            entries: HashMap::with_capacity(8),
            heap: Vec::with_capacity(8),
            comparator,
        }
    }

    /// Adds `value` under `key` using the queue's comparator.
    ///
    /// # Errors
    ///
    /// Hands `value` back if `key` is already queued; the queued entry is kept.
    pub fn enqueue(&mut self, value: V, key: K) -> Result<(), V> {
        let comparator = Arc::clone(&self.comparator);
        self.enqueue_with(value, key, comparator)
    }

    /// Adds `value` under `key`, ordering it with `comparator` whenever this key
    /// is the left-hand side of a comparison.
    ///
    /// # Errors
    ///
    /// Hands `value` back if `key` is already queued; the queued entry is kept.
    pub fn enqueue_with(&mut self, value: V, key: K, comparator: Comparator<V>) -> Result<(), V> {
        if self.entries.contains_key(&key) {
            return Err(value);
        }
        self.entries.insert(key.clone(), (comparator, value));
        self.heap.push(key);
        self.sift_toward_root(0, self.heap.len() - 1);
        Ok(())
    }

    /// Removes and returns the entry that orders first.
    pub fn dequeue(&mut self) -> Option<(K, V)> {
        let last = self.heap.pop()?;
        let root = if self.heap.is_empty() {
            last
        } else {
            let root = mem::replace(&mut self.heap[0], last);
            self.sift_toward_leaf(0);
            root
        };
        let (_, value) = self.entries.remove(&root)?;
        Some((root, value))
    }

    /// Returns the entry that orders first without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<(&K, &V)> {
        let key = self.heap.first()?;
        self.entries.get(key).map(|(_, value)| (key, value))
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(_, value)| value)
    }

    /// All queued keys, in no particular order.
    #[must_use]
    pub fn all_keys(&self) -> Vec<&K> {
        self.entries.keys().collect()
    }

    /// All queued values, in no particular order.
    #[must_use]
    pub fn all_values(&self) -> Vec<&V> {
        self.entries.values().map(|(_, value)| value).collect()
    }

    /// Empties the queue, returning its entries in no particular order.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        self.heap.clear();
        self.entries
            .drain()
            .map(|(key, (_, value))| (key, value))
            .collect()
    }

    fn less(&self, left: usize, right: usize) -> bool {
        let (comparator, left) = &self.entries[&self.heap[left]];
        let (_, right) = &self.entries[&self.heap[right]];
        comparator(left, right) == Ordering::Less
    }

    // Bubbles the key at `pos` up while it orders before its parent, never
    // moving it above `start`.
    fn sift_toward_root(&mut self, start: usize, mut pos: usize) {
        while pos > start {
            let parent = (pos - 1) / 2;
            if !self.less(pos, parent) {
                break;
            }
            self.heap.swap(pos, parent);
            pos = parent;
        }
    }

    // Moves the key at `pos` down to a leaf along the smaller children, then
    // lets it bubble back up to its place.
    fn sift_toward_leaf(&mut self, mut pos: usize) {
        let end = self.heap.len();
        let start = pos;
        let mut child = 2 * pos + 1;
        while child < end {
            let right = child + 1;
            if right < end && !self.less(child, right) {
                child = right;
            }
            self.heap.swap(pos, child);
            pos = child;
            child = 2 * pos + 1;
        }
        self.sift_toward_root(start, pos);
    }
}

impl<K: Id, V> fmt::Debug for MappedPriorityQueue<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedPriorityQueue")
            .field("keys", &self.heap)
            .finish_non_exhaustive()
    }
}
