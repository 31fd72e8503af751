//! Runs the sample workload through every join strategy and reports how long each one took.
//!
//! ```text
//! RUST_LOG=debug cargo run --example compare -- [delay-ms]
//! ```

use std::{
    env,
    sync::Arc,
    time::{Duration, Instant},
};

use affinity_join::{
    sample::{self, make_result, SlowOps},
    BackgroundPool, JoinRunner, JoinStrategy, Looper,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let delay = match env::args().nth(1) {
        Some(ms) => Duration::from_millis(ms.parse()?),
        None => SlowOps::default().delay(),
    };
    let ops = SlowOps::new(delay);

    let looper = Looper::new();
    let delegate = Arc::new(BackgroundPool::builder().name("common").threads(2).spawn()?);
    let runner = JoinRunner::builder()
        .name("io")
        .delegate(delegate)
        .build(looper.dispatcher())?;

    // A background context to act as the caller for the caller-sensitive strategy.
    let worker = BackgroundPool::builder().name("caller").threads(1).spawn()?;
    let runner = Arc::new(runner);

    log::info!("single offloaded call, {delay:?} per task");
    let start = Instant::now();
    runner.offload(
        move |cx| ops.too_slow_method(cx),
        sample::success_process,
        sample::error_process,
    );
    looper.pump_timeout(delay * 10);
    log::info!("offload: {:?}", start.elapsed());

    for strategy in JoinStrategy::ALL {
        let start = Instant::now();
        let job = {
            let runner = runner.clone();
            move |caller: &affinity_join::Context| {
                runner.run(
                    caller,
                    strategy,
                    move |cx| ops.slow_method_a(cx),
                    move |cx| ops.slow_method_b(cx),
                    make_result,
                    sample::success_process,
                    sample::error_process,
                );
            }
        };
        if strategy == JoinStrategy::CallerAffinitySensitive {
            worker.execute(job);
        } else {
            job(looper.context());
        }
        looper.pump_timeout(delay * 10);
        log::info!("{strategy}: {:?}", start.elapsed());
    }

    // Started from the restricted context, the caller-sensitive strategy refuses to run.
    runner.run(
        looper.context(),
        JoinStrategy::CallerAffinitySensitive,
        move |cx| ops.slow_method_a(cx),
        move |cx| ops.slow_method_b(cx),
        make_result,
        sample::success_process,
        sample::error_process,
    );
    looper.pump_timeout(delay * 10);

    drop(worker);
    Ok(())
}
