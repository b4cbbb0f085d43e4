use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use deferkit::{Deferred, DeferredPool, Error, PoolConfig};

fn pool_of(concurrency: usize) -> DeferredPool<u32, i32> {
    DeferredPool::with_config(PoolConfig {
        concurrency,
        ..PoolConfig::default()
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_limits_concurrency_and_queues_in_order() {
    let pool = pool_of(2);
    let entries: Vec<_> = (1..=5).map(|_| Deferred::paused()).collect();
    for (key, entry) in (1..=5).zip(&entries) {
        let admitted = pool.add(entry.clone(), key);
        assert!(admitted.is_some_and(|d| d.same_as(entry)));
    }

    assert_eq!(pool.running(), 2);
    assert_eq!(pool.pending(), 3);
    assert!(pool.is_running(&1) && pool.is_running(&2), "Earliest entries run first");
    assert!(entries[2].is_paused(), "Queued entries stay paused");

    entries[0].callback(10).unwrap();
    assert_eq!(pool.running(), 2);
    assert!(pool.is_running(&3), "Next entry in order should be admitted");
    assert!(!pool.contains(&1));

    for (value, entry) in (20..).step_by(10).zip(&entries[1..]) {
        entry.callback(value).unwrap();
    }
    assert_eq!(pool.running(), 0);
    assert_eq!(pool.pending(), 0);
    assert_eq!(entries[4].clone().await, Ok(50));
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_suppresses_duplicate_keys() {
    let pool = pool_of(1);
    let running = Deferred::paused();
    let queued = Deferred::paused();
    pool.add(running.clone(), 1).unwrap();
    pool.add(queued.clone(), 2).unwrap();

    let dup_running = Deferred::paused();
    let dup_queued = Deferred::paused();
    assert!(pool.add(dup_running.clone(), 1).is_none());
    assert!(pool.add(dup_queued.clone(), 2).is_none());

    assert!(dup_running.is_silently_canceled());
    assert!(dup_queued.is_silently_canceled());
    assert!(!running.is_canceled(), "Original entry should carry on");
    assert!(!queued.is_canceled());
    assert_eq!(pool.running(), 1);
    assert_eq!(pool.pending(), 1);

    running.callback(1).unwrap();
    queued.callback(2).unwrap();
    assert_eq!(queued.await, Ok(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_never_exceeds_concurrency() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let pool = pool_of(2);
    let mut admitted = Vec::new();
    for key in 0..6 {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        let work = Deferred::defer_in_thread_paused(
            move |n: i32| {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(n * n)
            },
            key as i32,
        );
        admitted.push(pool.add(work, key).unwrap());
    }

    let mut results = Vec::new();
    for d in admitted {
        results.push(d.await.unwrap());
    }
    assert_eq!(results, vec![0, 1, 4, 9, 16, 25]);
    assert!(peak.load(Ordering::SeqCst) <= 2, "At most two entries may run at once");
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_drain_cancels_everything() {
    let pool = pool_of(1);
    let entries: Vec<_> = (0..3).map(|_| Deferred::paused()).collect();
    for (key, entry) in (0..).zip(&entries) {
        pool.add(entry.clone(), key).unwrap();
    }

    pool.drain();

    assert_eq!(pool.running(), 0);
    assert_eq!(pool.pending(), 0);
    for entry in entries {
        assert!(entry.is_canceled());
        assert_eq!(entry.await, Err(Error::Canceled));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_drop_drains() {
    let entry = Deferred::<i32>::paused();
    {
        let pool = DeferredPool::new();
        pool.add(entry.clone(), "key").unwrap();
    }
    assert_eq!(entry.await, Err(Error::Canceled));
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_calls_on_drained_once_empty() {
    let drained = Arc::new(AtomicUsize::new(0));
    let drained_cl = Arc::clone(&drained);

    let pool = pool_of(1);
    pool.on_drained(move || {
        drained_cl.fetch_add(1, Ordering::SeqCst);
    });
    let first = Deferred::paused();
    let second = Deferred::paused();
    pool.add(first.clone(), 1).unwrap();
    pool.add(second.clone(), 2).unwrap();

    first.callback(1).unwrap();
    assert_eq!(drained.load(Ordering::SeqCst), 0, "Pool still has queued work");
    second.errback(Error::msg("failed")).unwrap();
    assert_eq!(drained.load(Ordering::SeqCst), 1, "Failures complete entries too");
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_timeout_reclaims_slot() {
    let pool = DeferredPool::with_config(PoolConfig {
        concurrency: 1,
        timeout: Some(Duration::from_millis(50)),
    });
    let stuck = Deferred::<i32>::paused();
    let next = Deferred::paused();
    pool.add(stuck.clone(), "stuck").unwrap();
    pool.add(next.clone(), "next").unwrap();

    assert_eq!(stuck.await, Err(Error::PoolTimeout));

    // Settles while queued; runs its chain once the freed slot admits it.
    next.callback(7).unwrap();
    assert_eq!(next.await, Ok(7));
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_raising_concurrency_admits_waiting_entries() {
    let pool = pool_of(1);
    for key in 0..3 {
        pool.add(Deferred::paused(), key).unwrap();
    }
    assert_eq!(pool.running(), 1);

    pool.set_concurrency(3);
    assert_eq!(pool.concurrency(), 3);
    assert_eq!(pool.running(), 3);
    assert_eq!(pool.pending(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_rejected_duplicate_awaits_as_canceled() {
    let pool = pool_of(1);
    pool.add(Deferred::paused(), 1).unwrap();

    let duplicate = Deferred::paused();
    assert!(pool.add(duplicate.clone(), 1).is_none());
    assert_eq!(duplicate.await, Err(Error::Canceled));
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_drain_calls_on_drained_once() {
    let drained = Arc::new(AtomicUsize::new(0));
    let drained_cl = Arc::clone(&drained);

    let pool = pool_of(3);
    pool.on_drained(move || {
        drained_cl.fetch_add(1, Ordering::SeqCst);
    });
    for key in 0..5 {
        pool.add(Deferred::paused(), key).unwrap();
    }
    assert_eq!(pool.running(), 3);

    pool.drain();
    assert_eq!(drained.load(Ordering::SeqCst), 1);
    pool.drain();
    assert_eq!(drained.load(Ordering::SeqCst), 1, "Draining an empty pool changes nothing");
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_panicking_work_frees_its_slot() {
    let pool = pool_of(1);
    let panicking = Deferred::defer_in_thread_paused(|_: i32| -> Result<i32, Error> { panic!("worker blew up") }, 0);
    let next = Deferred::defer_in_thread_paused(|n: i32| Ok(n), 7);
    let panicking = pool.add(panicking, 1).unwrap();
    let next = pool.add(next, 2).unwrap();

    assert!(matches!(panicking.await, Err(Error::Generic(message)) if message.contains("worker blew up")));
    assert_eq!(next.await, Ok(7));
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_timeouts_are_not_held_up_by_other_timers() {
    let long: Vec<_> = (0..20).map(|i| Deferred::wait(Duration::from_secs(2), i)).collect();

    let pool = DeferredPool::with_config(PoolConfig {
        concurrency: 32,
        timeout: Some(Duration::from_millis(50)),
    });
    let start = Instant::now();
    let stuck: Vec<_> = (0..24)
        .map(|key| pool.add(Deferred::<i32>::paused(), key).unwrap())
        .collect();
    for entry in stuck {
        assert_eq!(entry.await, Err(Error::PoolTimeout));
    }

    assert!(start.elapsed() < Duration::from_millis(500), "Timeouts fired late: {:?}", start.elapsed());
    assert_eq!(pool.running(), 0);
    for d in long {
        d.cancel();
    }
}
