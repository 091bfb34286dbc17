//! Throttled, retrying command dispatcher.
//!
//! One dispatcher serves any number of devices. Each device gets its own
//! [`Throttle`], so commands to one device are spaced and ordered while
//! devices stay independent.
//!
//! A dispatch is a loop of attempts:
//!
//! 1. check abort, then wait for a throttle slot
//! 2. call the remote service once, bounded by the call timeout
//! 3. if confirmation is requested, wait for the device to report the target
//! 4. on failure, wait the retry delay and go again while retries remain
//!
//! The remote call itself is never interrupted by an abort. Aborts are seen at
//! the slot wait, the confirmation wait and the retry delay.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use mappedcover_core::{PhysicalValue, SourceId};
use mappedcover_devices::{
    wait_for_attribute, ServiceError, SharedCoverService, SharedStateFeed, StateFeed,
    WaitOutcome,
};

use crate::command::{CoverCommand, DispatchError, DispatchFailure, DispatchOutcome, RetryPolicy};
use crate::throttle::{SharedThrottles, Throttle};

/// Sends commands to covers through the remote service.
pub struct CommandDispatcher {
    service: SharedCoverService,
    feed: SharedStateFeed,
    interval: Duration,
    throttles: SharedThrottles,
    last_position_command: DashMap<SourceId, Instant>,
}

impl CommandDispatcher {
    pub fn new(service: SharedCoverService, feed: SharedStateFeed, interval: Duration) -> Self {
        Self {
            service,
            feed,
            interval,
            throttles: SharedThrottles::default(),
            last_position_command: DashMap::new(),
        }
    }

    /// Space commands through `throttles`, shared with other dispatchers
    /// that may drive the same devices.
    pub fn with_throttles(mut self, throttles: SharedThrottles) -> Self {
        self.throttles = throttles;
        self
    }

    pub fn feed(&self) -> &dyn StateFeed {
        self.feed.as_ref()
    }

    pub fn shared_feed(&self) -> SharedStateFeed {
        self.feed.clone()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn throttle_for(&self, device_id: &str) -> Arc<Throttle> {
        self.throttles
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Throttle::new(self.interval)))
            .clone()
    }

    /// When the last position command attempt to a device was made.
    pub fn last_position_command(&self, device_id: &str) -> Option<Instant> {
        self.last_position_command.get(device_id).map(|t| *t)
    }

    /// A position command was attempted within `window`.
    pub fn recently_commanded(&self, device_id: &str, window: Duration) -> bool {
        self.last_position_command(device_id)
            .is_some_and(|at| at.elapsed() < window)
    }

    /// Dispatch by host service name.
    ///
    /// Unknown services are rejected before anything is sent.
    pub async fn dispatch_named(
        &self,
        device_id: &str,
        service: &str,
        value: Option<PhysicalValue>,
        policy: RetryPolicy,
        confirm: bool,
        abort: &CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        let mut command = CoverCommand::parse(device_id, service, value)?.with_retry_policy(policy);
        command.confirm = confirm;
        Ok(self.dispatch(&command, abort).await)
    }

    /// Send a command, retrying transient failures.
    pub async fn dispatch(&self, command: &CoverCommand, abort: &CancellationToken) -> DispatchOutcome {
        let device_id = command.device_id.as_str();
        let policy = &command.retry_policy;
        let throttle = self.throttle_for(device_id);
        let confirmation = command.confirmation();
        let mut attempt: u32 = 0;

        loop {
            if abort.is_cancelled() {
                tracing::debug!(category = "dispatch", device = %device_id, action = %command.action, "Aborted before sending");
                return DispatchOutcome::Aborted;
            }
            if !throttle.acquire_after(self.interval, abort).await {
                return DispatchOutcome::Aborted;
            }

            attempt += 1;
            if command.action.is_position_class() {
                self.last_position_command
                    .insert(device_id.to_string(), Instant::now());
            }

            tracing::debug!(
                category = "dispatch",
                device = %device_id,
                action = %command.action,
                attempt,
                "Calling service"
            );
            let call = self.service.execute(device_id, command.action);
            let result = match tokio::time::timeout(policy.call_timeout(), call).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::Timeout(policy.call_timeout_ms)),
            };

            let failure = match result {
                Ok(()) => match &confirmation {
                    None => return DispatchOutcome::Completed { attempts: attempt },
                    Some(wait) => match wait_for_attribute(self.feed(), wait, abort).await {
                        WaitOutcome::Reached => {
                            return DispatchOutcome::Completed { attempts: attempt }
                        }
                        WaitOutcome::Aborted => return DispatchOutcome::Aborted,
                        WaitOutcome::TimedOut => {
                            tracing::debug!(
                                category = "dispatch",
                                device = %device_id,
                                action = %command.action,
                                attempt,
                                "Target not reported"
                            );
                            DispatchFailure::NotConfirmed {
                                attribute: wait.attribute,
                                target: wait.target,
                            }
                        }
                    },
                },
                Err(e) => {
                    tracing::warn!(
                        category = "dispatch",
                        device = %device_id,
                        action = %command.action,
                        attempt,
                        error = %e,
                        "Service call failed"
                    );
                    DispatchFailure::Service(e)
                }
            };

            if attempt > policy.retries {
                if policy.retries > 0 {
                    tracing::warn!(
                        category = "dispatch",
                        device = %device_id,
                        action = %command.action,
                        retries = policy.retries,
                        error = %failure,
                        "Max retries reached"
                    );
                }
                return DispatchOutcome::Failed {
                    attempts: attempt,
                    error: failure,
                };
            }

            tokio::select! {
                biased;
                _ = abort.cancelled() => return DispatchOutcome::Aborted,
                _ = tokio::time::sleep(policy.delay_for_attempt(attempt)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mappedcover_core::SourceState;
    use mappedcover_devices::{
        CoverSimulator, DeviceStateStore, ServiceAction, SimulatedCover, TravelMode,
    };

    fn setup() -> (Arc<CoverSimulator>, CommandDispatcher) {
        let store = DeviceStateStore::new();
        let sim = Arc::new(CoverSimulator::new(store.clone()));
        sim.add_cover(SimulatedCover::new("cover.a", SourceState::available(10).with_tilt(0)));
        let dispatcher =
            CommandDispatcher::new(sim.clone(), Arc::new(store), Duration::from_millis(100));
        (sim, dispatcher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_success() {
        let (sim, dispatcher) = setup();
        let outcome = dispatcher
            .dispatch(&CoverCommand::stop("cover.a"), &CancellationToken::new())
            .await;
        assert_eq!(outcome, DispatchOutcome::Completed { attempts: 1 });
        assert_eq!(sim.actions_for("cover.a"), vec![ServiceAction::Stop]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let (sim, dispatcher) = setup();
        sim.fail_next("cover.a", 2);
        let command = CoverCommand::set_position("cover.a", 60)
            .with_retry_policy(RetryPolicy::default())
            .with_confirmation();

        let start = Instant::now();
        let outcome = dispatcher.dispatch(&command, &CancellationToken::new()).await;
        assert_eq!(outcome, DispatchOutcome::Completed { attempts: 3 });
        assert_eq!(sim.call_count(), 3);
        // Two retry delays of one second
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries() {
        let (sim, dispatcher) = setup();
        sim.fail_next("cover.a", 10);
        let command = CoverCommand::set_position("cover.a", 60).with_retries(3);

        let outcome = dispatcher.dispatch(&command, &CancellationToken::new()).await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed {
                attempts: 4,
                error: DispatchFailure::Service(ServiceError::Transport(_))
            }
        ));
        assert_eq!(sim.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_timeout_is_retried() {
        let (sim, dispatcher) = setup();
        sim.set_travel("cover.a", TravelMode::Stuck);
        let command = CoverCommand::set_tilt_position("cover.a", 50)
            .with_retry_policy(RetryPolicy::default().with_retries(1))
            .with_confirmation();

        let outcome = dispatcher.dispatch(&command, &CancellationToken::new()).await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed {
                attempts: 2,
                error: DispatchFailure::NotConfirmed { target: 50, .. }
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_is_a_failure() {
        let (sim, dispatcher) = setup();
        sim.set_hang("cover.a", true);
        let command = CoverCommand::stop("cover.a");

        let outcome = dispatcher.dispatch(&command, &CancellationToken::new()).await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed {
                attempts: 1,
                error: DispatchFailure::Service(ServiceError::Timeout(30_000))
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_allowed_is_rejected_without_sending() {
        let (sim, dispatcher) = setup();
        let result = dispatcher
            .dispatch_named(
                "cover.a",
                "open_cover",
                None,
                RetryPolicy::default(),
                true,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result, Err(DispatchError::NotAllowed("open_cover".to_string())));
        assert_eq!(sim.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_aborted_sends_nothing() {
        let (sim, dispatcher) = setup();
        let token = CancellationToken::new();
        token.cancel();
        let outcome = dispatcher.dispatch(&CoverCommand::stop("cover.a"), &token).await;
        assert_eq!(outcome, DispatchOutcome::Aborted);
        assert_eq!(sim.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_timestamp_stamped_on_failure() {
        let (sim, dispatcher) = setup();
        sim.fail_next("cover.a", 1);
        assert!(dispatcher.last_position_command("cover.a").is_none());

        let outcome = dispatcher
            .dispatch(&CoverCommand::set_position("cover.a", 30), &CancellationToken::new())
            .await;
        assert!(outcome.is_failed());
        assert!(dispatcher.recently_commanded("cover.a", Duration::from_secs(5)));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!dispatcher.recently_commanded("cover.a", Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tilt_does_not_stamp_position_timestamp() {
        let (_sim, dispatcher) = setup();
        dispatcher
            .dispatch(&CoverCommand::set_tilt_position("cover.a", 30), &CancellationToken::new())
            .await;
        dispatcher
            .dispatch(&CoverCommand::stop_tilt("cover.a"), &CancellationToken::new())
            .await;
        assert!(dispatcher.last_position_command("cover.a").is_none());
    }
}
