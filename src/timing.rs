//! Timer-driven deferreds.
//!
//! Every timer shares one thread that sleeps until the earliest deadline. Due
//! callbacks are handed to the shared worker pool, so a slow callback never holds
//! up the timers behind it and a long delay never occupies a worker.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    sync::{Arc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    deferred::Deferred,
    error::Error,
    executor::{run_guarded, shared_pool},
};

static TIMER_QUEUE: OnceLock<Arc<TimerQueue>> = OnceLock::new();

struct Timer {
    due: Instant,
    // Insertion order; timers with the same deadline fire in the order they were
    // scheduled.
    seq: u64,
    callback: Box<dyn FnOnce() + Send>,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

#[derive(Default)]
struct Timers {
    heap: BinaryHeap<Reverse<Timer>>,
    next_seq: u64,
}

#[derive(Default)]
struct TimerQueue {
    timers: Mutex<Timers>,
    wakeup: Condvar,
}

impl TimerQueue {
    fn run(&self) {
        let mut timers = self.timers.lock();
        loop {
            let Some(due) = timers.heap.peek().map(|Reverse(timer)| timer.due) else {
                self.wakeup.wait(&mut timers);
                continue;
            };
            if due > Instant::now() {
                // Woken early when a timer with an earlier deadline arrives.
                self.wakeup.wait_until(&mut timers, due);
                continue;
            }
            if let Some(Reverse(timer)) = timers.heap.pop() {
                shared_pool().spawn_ok(async move { (timer.callback)() });
            }
        }
    }
}

fn timer_queue() -> &'static TimerQueue {
    TIMER_QUEUE.get_or_init(|| {
        let queue = Arc::new(TimerQueue::default());
        let worker = Arc::clone(&queue);
        thread::Builder::new()
            .name("deferkit-timer".into())
            .spawn(move || worker.run())
            .expect("Timer thread creation failed");
        queue
    })
}

/// Runs `f` on the shared worker pool once `delay` has elapsed.
///
/// A delay too large to represent never fires.
pub(crate) fn schedule_after(delay: Duration, f: impl FnOnce() + Send + 'static) {
    let Some(due) = Instant::now().checked_add(delay) else {
        tracing::trace!(?delay, "timer delay out of range, never firing");
        return;
    };
    let queue = timer_queue();
    let earliest = {
        let mut timers = queue.timers.lock();
        let seq = timers.next_seq;
        timers.next_seq += 1;
        let earliest = timers.heap.peek().is_none_or(|Reverse(next)| due < next.due);
        timers.heap.push(Reverse(Timer {
            due,
            seq,
            callback: Box::new(f),
        }));
        earliest
    };
    if earliest {
        queue.wakeup.notify_one();
    }
}

impl<T: Send + 'static> Deferred<T> {
    /// Succeeds with `value` after `delay`.
    pub fn wait(delay: Duration, value: T) -> Self {
        Self::call_later(delay, move || Ok(value))
    }

    /// Resolves with the result of `f`, called on a worker thread after `delay`.
    ///
    /// `f` is not called if the deferred is canceled first. A panic in `f` fails
    /// the deferred with [`Error::Generic`].
    pub fn call_later(delay: Duration, f: impl FnOnce() -> Result<T, Error> + Send + 'static) -> Self {
        let deferred = Self::new();
        let resolver = deferred.resolver();
        schedule_after(delay, move || {
            if resolver.is_canceled() {
                return;
            }
            if let Err(error) = resolver.resolve(run_guarded(|()| f(), ())) {
                tracing::error!(id = resolver.deferred().id(), %error, "timer result rejected");
            }
        });
        deferred
    }
}
