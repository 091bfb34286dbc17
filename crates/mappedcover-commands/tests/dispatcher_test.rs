//! Dispatcher behaviour across concurrent callers

use std::sync::Arc;
use std::time::Duration;

use mappedcover_commands::{CommandDispatcher, CoverCommand, DispatchOutcome, RetryPolicy};
use mappedcover_core::SourceState;
use mappedcover_devices::{CoverSimulator, DeviceStateStore, SimulatedCover, TravelMode};
use tokio_util::sync::CancellationToken;

const INTERVAL: Duration = Duration::from_millis(100);

fn setup(devices: &[&str]) -> (Arc<CoverSimulator>, Arc<CommandDispatcher>) {
    let store = DeviceStateStore::new();
    let sim = Arc::new(CoverSimulator::new(store.clone()));
    for id in devices {
        sim.add_cover(SimulatedCover::new(*id, SourceState::available(50).with_tilt(50)));
    }
    let dispatcher = Arc::new(CommandDispatcher::new(sim.clone(), Arc::new(store), INTERVAL));
    (sim, dispatcher)
}

#[tokio::test(start_paused = true)]
async fn test_spacing_across_concurrent_callers() {
    let (sim, dispatcher) = setup(&["cover.a"]);

    let tasks: Vec<_> = (0..8u8)
        .map(|i| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let command = if i % 2 == 0 {
                    CoverCommand::set_position("cover.a", 10 + i)
                } else {
                    CoverCommand::set_tilt_position("cover.a", 10 + i)
                };
                dispatcher.dispatch(&command, &CancellationToken::new()).await
            })
        })
        .collect();
    for outcome in futures::future::join_all(tasks).await {
        assert!(outcome.unwrap().is_completed());
    }

    let calls = sim.calls_for("cover.a");
    assert_eq!(calls.len(), 8);
    for pair in calls.windows(2) {
        assert!(
            pair[1].at - pair[0].at >= INTERVAL,
            "calls {:?} and {:?} too close",
            pair[0].action,
            pair[1].action
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_devices_are_throttled_independently() {
    let (sim, dispatcher) = setup(&["cover.a", "cover.b"]);

    let a = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .dispatch(&CoverCommand::stop("cover.a"), &CancellationToken::new())
                .await
        })
    };
    let b = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .dispatch(&CoverCommand::stop("cover.b"), &CancellationToken::new())
                .await
        })
    };
    a.await.unwrap();
    b.await.unwrap();

    let calls = sim.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].at - calls[0].at < INTERVAL);
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_confirmation_stops_retries() {
    let (sim, dispatcher) = setup(&["cover.a"]);
    sim.set_travel("cover.a", TravelMode::Stuck);
    let token = CancellationToken::new();

    let handle = {
        let dispatcher = dispatcher.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let command = CoverCommand::set_position("cover.a", 90)
                .with_retry_policy(RetryPolicy::default())
                .with_confirmation();
            dispatcher.dispatch(&command, &token).await
        })
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    token.cancel();
    assert_eq!(handle.await.unwrap(), DispatchOutcome::Aborted);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(sim.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_retry_delay() {
    let (sim, dispatcher) = setup(&["cover.a"]);
    sim.fail_next("cover.a", 10);
    let token = CancellationToken::new();

    let handle = {
        let dispatcher = dispatcher.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let command = CoverCommand::stop("cover.a").with_retries(3);
            dispatcher.dispatch(&command, &token).await
        })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    token.cancel();
    assert_eq!(handle.await.unwrap(), DispatchOutcome::Aborted);
    assert_eq!(sim.call_count(), 1);
}
