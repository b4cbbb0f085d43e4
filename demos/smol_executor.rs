use deferkit::{Deferred, DeferredList, ListOutcome, Step};
use macro_rules_attribute::apply;
use smol::Timer;
use smol_macros::{Executor, main};
use std::{thread, time::Duration};

fn slow_square(n: u64) -> Result<u64, deferkit::Error> {
    println!("Squaring {n}");
    thread::sleep(Duration::from_millis(100 * n));
    Ok(n * n)
}

#[apply(main!)]
async fn main(ex: &Executor<'_>) {
    let children: Vec<_> = (1..=3)
        .rev()
        .map(|n| Deferred::defer_in_thread(slow_square, n))
        .collect();

    let sum = DeferredList::new(children).start().then(|outcome| match outcome {
        ListOutcome::All(results) => Step::from(results.into_iter().sum::<Result<u64, _>>()),
        ListOutcome::First { value, .. } => Step::Ok(value),
    });

    // Deferreds are plain futures, so any executor can await them.
    let task = ex.spawn(async move {
        match sum.await {
            Ok(total) => println!("Sum of squares: {total}"),
            Err(error) => println!("Failed: {error}"),
        }
    });

    println!("After task spawn");
    Timer::after(Duration::from_millis(50)).await;
    task.await;
}
