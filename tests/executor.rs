use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use deferkit::{Callback, Deferred, DeferredExt, Error, Executor, State, Step, serial_executor};

#[tokio::test(flavor = "multi_thread")]
async fn defer_in_thread_runs_on_dedicated_thread() {
    let d = Deferred::defer_in_thread(
        |suffix: &'static str| {
            let name = thread::current().name().unwrap_or_default().to_string();
            Ok(format!("{name}{suffix}"))
        },
        "!",
    );
    assert_eq!(d.await, Ok("deferkit-thread!".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn defer_runs_on_shared_pool() {
    let d = Deferred::defer(
        |_: ()| Ok(thread::current().name().unwrap_or_default().to_string()),
        (),
    );
    let name = d.await.unwrap();
    assert!(name.starts_with("deferkit-pool-"), "Ran on `{name}`");
}

#[tokio::test(flavor = "multi_thread")]
async fn defer_propagates_work_errors() {
    let d = Deferred::<()>::defer_in_thread(|_: ()| Err(Error::Transport("refused".into())), ());
    assert_eq!(d.await, Err(Error::Transport("refused".into())));
}

#[tokio::test(flavor = "multi_thread")]
async fn paused_work_starts_on_resume() {
    let started = Arc::new(AtomicBool::new(false));
    let started_cl = Arc::clone(&started);

    let d = Deferred::defer_in_thread_paused(
        move |n: i32| {
            started_cl.store(true, Ordering::SeqCst);
            Ok(n + 1)
        },
        1,
    );
    d.pause();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!started.load(Ordering::SeqCst), "Work should not start while paused");

    d.resume();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!started.load(Ordering::SeqCst), "Nested pause needs a second resume");

    d.resume();
    assert_eq!(d.await, Ok(2));
    assert!(started.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn paused_work_canceled_before_start_never_runs() {
    let started = Arc::new(AtomicBool::new(false));
    let started_cl = Arc::clone(&started);

    let d = Deferred::defer_in_thread_paused(
        move |_: ()| {
            started_cl.store(true, Ordering::SeqCst);
            Ok(())
        },
        (),
    );
    d.cancel();
    d.resume();

    assert_eq!(d.await, Err(Error::Canceled));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!started.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn serial_executor_keeps_submission_order() {
    let pool = serial_executor().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut last = None;
    for i in 0..10 {
        let seen = Arc::clone(&seen);
        last = Some(Deferred::defer_on(
            &pool,
            move |i: usize| {
                seen.lock().unwrap().push(i);
                Ok(i)
            },
            i,
        ));
    }

    assert_eq!(last.unwrap().await, Ok(9));
    assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

struct Inline;

impl Executor for Inline {
    fn execute(&self, work: Box<dyn FnOnce() + Send>) {
        work();
    }
}

#[test]
fn custom_executor_resolves_through_chain() {
    let d = Deferred::defer_on(&Inline, |n: i32| Ok(n * 3), 3);
    assert_eq!(d.state(), State::Succeeded, "Inline executor resolves right away");

    let double = Callback::new(|n: i32| n * 2);
    let increment = Callback::new(|n: i32| n + 1);
    let handler = double.and_then(&increment).into_fn();
    d.add_callback(move |n| Step::Ok(handler(n)));
    assert_eq!(deferkit::wait_for_deferred(d), Ok(19));
}

#[test]
fn callback_composition_order() {
    let double = Callback::new(|n: i32| n * 2);
    let increment = Callback::new(|n: i32| n + 1);

    assert_eq!(double.and_then(&increment).invoke(5), 11);
    assert_eq!(double.compose_with(&increment).invoke(5), 12);
}

#[tokio::test(flavor = "multi_thread")]
async fn future_into_deferred() {
    let d = async { Ok::<_, Error>(5) }.into_deferred();
    assert_eq!(d.await, Ok(5));
}

#[tokio::test(flavor = "multi_thread")]
async fn canceling_future_deferred_aborts_it() {
    let d = futures::future::pending::<Result<i32, Error>>().into_deferred();
    d.cancel();
    assert_eq!(d.await, Err(Error::Canceled));
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_resolves_after_delay() {
    let start = std::time::Instant::now();
    let d = Deferred::wait(Duration::from_millis(30), "done");
    assert_eq!(d.await, Ok("done"));
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[tokio::test(flavor = "multi_thread")]
async fn call_later_skips_canceled_work() {
    let called = Arc::new(AtomicBool::new(false));
    let called_cl = Arc::clone(&called);

    let d = Deferred::call_later(Duration::from_millis(20), move || {
        called_cl.store(true, Ordering::SeqCst);
        Ok(1)
    });
    d.cancel();
    assert_eq!(d.clone().await, Err(Error::Canceled));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!called.load(Ordering::SeqCst));
}

#[test]
fn deferred_future_is_executor_agnostic() {
    let d = Deferred::defer_in_thread(|n: u8| Ok(n), 8);
    assert_eq!(futures_lite::future::block_on(d.into_future()), Ok(8));

    let d = Deferred::defer(|n: u8| Ok(n), 9);
    assert_eq!(smol::block_on(async { d.await }), Ok(9));
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_work_fails_the_deferred() {
    let d = Deferred::<i32>::defer(|_: ()| panic!("boom"), ());
    assert!(matches!(d.await, Err(Error::Generic(message)) if message.contains("boom")));

    let later = Deferred::<i32>::call_later(Duration::from_millis(5), || panic!("late boom"));
    assert!(matches!(later.await, Err(Error::Generic(message)) if message.contains("late boom")));
}

#[tokio::test(flavor = "multi_thread")]
async fn short_timer_is_not_held_up_by_long_ones() {
    let long: Vec<_> = (0..20).map(|i| Deferred::wait(Duration::from_secs(2), i)).collect();

    let start = std::time::Instant::now();
    let short = Deferred::wait(Duration::from_millis(10), "short");
    assert_eq!(short.await, Ok("short"));
    assert!(start.elapsed() < Duration::from_millis(500), "Short timer fired after {:?}", start.elapsed());

    for d in long {
        d.cancel();
    }
}
