use instance_forge::{EventLoop, RecurringTask, SingleInstance};
use signal_hook::consts::signal::*;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // 1. Claim the instance token; a second copy of this program stops here.
    let Some(guard) = SingleInstance::new("single_ticker")
        .namespace("InstanceForgeDemo")
        .build()?
        .claim()
    else {
        println!("single_ticker is already running.");
        return Ok(());
    };
    println!("[Ticker] Instance claimed ({}). PID: {}", guard.token(), std::process::id());

    // 2. Stop cleanly on SIGTERM / SIGINT.
    let event_loop = EventLoop::new();
    event_loop.stop_on_signal(SIGTERM)?;
    event_loop.stop_on_signal(SIGINT)?;

    let phrases = [
        "They are alive",
        "I have no mouth",
        "I must scream",
        "Hello world",
        "Goodbye world :0",
    ];

    // 3. Tick every three seconds, starting now, for at most 100 ticks.
    let mut i = 0;
    let ticker = RecurringTask::every(Duration::from_secs(3))
        .call_on_start(true)
        .start(&event_loop, move |keep_going| {
            println!("[Ticker] Ping #{} - {}", i, phrases[i % phrases.len()]);
            i += 1;
            *keep_going = i < 100;
        });

    let outcome = event_loop.run();
    println!("[Ticker] Loop ended ({:?}) after {} ticks. Shutting down.", outcome, ticker.invocations());

    drop(ticker);
    guard.release();
    Ok(())
}
