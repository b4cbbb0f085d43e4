use std::{thread, time::Duration};

use deferkit::{Deferred, DeferredPool, Error, PoolConfig, Step};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("deferkit=debug"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter)
        .init();
}

fn fetch(name: &'static str) -> Result<String, Error> {
    println!("Running `{name}`");
    thread::sleep(Duration::from_millis(200));
    Ok(format!("{name} done"))
}

#[tokio::main]
async fn main() {
    init_tracing();

    // Two slots: entries are admitted in the order they were created, earliest
    // first, no matter in which order they are added.
    let pool = DeferredPool::with_config(PoolConfig {
        concurrency: 2,
        timeout: Some(Duration::from_secs(1)),
    });
    pool.on_drained(|| println!("Pool drained"));

    let first = Deferred::defer_in_thread_paused(fetch, "first");
    let second = Deferred::defer_in_thread_paused(fetch, "second");
    let third = Deferred::defer_in_thread_paused(fetch, "third");

    let mut admitted = Vec::new();
    for (key, deferred) in [("c", third), ("a", first), ("b", second)] {
        if let Some(deferred) = pool.add(deferred, key) {
            admitted.push(deferred);
        }
    }

    // Same key as a queued or running entry: silently canceled, never runs.
    let duplicate = Deferred::defer_in_thread_paused(fetch, "duplicate");
    if pool.add(duplicate, "a").is_none() {
        println!("Key `a` is already pooled");
    }

    // Never finishes; the pool timeout reclaims its slot.
    let stuck = Deferred::<String>::paused();
    stuck.add_errback(|error| {
        println!("`stuck` failed: {error}");
        Step::Err(error)
    });
    pool.add(stuck.clone(), "stuck");
    admitted.push(stuck);

    for deferred in admitted {
        match deferred.await {
            Ok(result) => println!("Result: {result}"),
            Err(error) => println!("Error {}: {error}", error.code()),
        }
    }
}
