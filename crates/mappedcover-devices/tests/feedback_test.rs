//! Simulator feedback observed through the waiter

use std::sync::Arc;
use std::time::Duration;

use mappedcover_core::{Attribute, SourceState};
use mappedcover_devices::{
    wait_for_attribute, AttributeWait, CoverService, CoverSimulator, DeviceStateStore,
    SimulatedCover, StateFeed, TravelMode, WaitOutcome,
};
use tokio_util::sync::CancellationToken;

fn gradual_simulator() -> Arc<CoverSimulator> {
    let sim = Arc::new(CoverSimulator::new(DeviceStateStore::new()));
    sim.add_cover(
        SimulatedCover::new("cover.a", SourceState::available(0).with_tilt(0))
            .with_travel(TravelMode::Gradual { step: 5, interval_ms: 100 }),
    );
    sim
}

#[tokio::test(start_paused = true)]
async fn test_wait_tracks_gradual_travel() {
    let sim = gradual_simulator();
    sim.set_position("cover.a", 50).await.unwrap();

    let start = tokio::time::Instant::now();
    let wait = AttributeWait::new("cover.a", Attribute::CurrentPosition, 50);
    let outcome = wait_for_attribute(sim.store(), &wait, &CancellationToken::new()).await;

    assert_eq!(outcome, WaitOutcome::Reached);
    // Tolerance 1 is met at 50, reached after ten steps
    assert!(start.elapsed() >= Duration::from_millis(1000));
    assert!(start.elapsed() < Duration::from_millis(1100));
}

#[tokio::test(start_paused = true)]
async fn test_wait_times_out_on_stuck_cover() {
    let sim = gradual_simulator();
    sim.set_travel("cover.a", TravelMode::Stuck);
    sim.set_tilt_position("cover.a", 80).await.unwrap();

    let wait = AttributeWait::new("cover.a", Attribute::CurrentTiltPosition, 80)
        .with_timeout(Duration::from_secs(2));
    let outcome = wait_for_attribute(sim.store(), &wait, &CancellationToken::new()).await;
    assert_eq!(outcome, WaitOutcome::TimedOut);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_call_never_returns() {
    let sim = gradual_simulator();
    sim.set_hang("cover.a", true);

    let result = tokio::time::timeout(Duration::from_secs(5), sim.stop("cover.a")).await;
    assert!(result.is_err());
    assert_eq!(sim.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_latency_delays_effect() {
    let sim = gradual_simulator();
    sim.set_travel("cover.a", TravelMode::Instant);
    sim.set_latency(Duration::from_millis(300));

    let start = tokio::time::Instant::now();
    sim.set_position("cover.a", 30).await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert_eq!(sim.store().current("cover.a").unwrap().position(), Some(30));
}
