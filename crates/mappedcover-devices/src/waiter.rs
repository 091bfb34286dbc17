//! Waiting for a device attribute to reach a value.
//!
//! The waiter subscribes before it reads the snapshot, so an update that
//! lands between the two is never missed. An unavailable device or a
//! missing attribute never matches; the wait simply continues.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mappedcover_core::config::controller;
use mappedcover_core::{Attribute, PhysicalValue, SourceId, SourceState};

use crate::store::{FeedError, StateFeed};

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Reached,
    Aborted,
    TimedOut,
}

impl WaitOutcome {
    pub fn is_reached(&self) -> bool {
        matches!(self, WaitOutcome::Reached)
    }
}

/// What to wait for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeWait {
    pub device_id: SourceId,
    pub attribute: Attribute,
    pub target: PhysicalValue,
    pub tolerance: u8,
    pub timeout: Duration,
}

impl AttributeWait {
    pub fn new(device_id: impl Into<SourceId>, attribute: Attribute, target: PhysicalValue) -> Self {
        Self {
            device_id: device_id.into(),
            attribute,
            target,
            tolerance: controller::TOLERANCE,
            timeout: Duration::from_secs(controller::WAIT_TIMEOUT_SECS),
        }
    }

    pub fn with_tolerance(mut self, tolerance: u8) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Default comparison: within tolerance of the target.
    pub fn within_tolerance(&self, value: PhysicalValue) -> bool {
        value.abs_diff(self.target) <= self.tolerance
    }

    fn matches<F>(&self, state: Option<&SourceState>, compare: &F) -> bool
    where
        F: Fn(PhysicalValue, PhysicalValue) -> bool,
    {
        state
            .and_then(|s| s.attribute(self.attribute))
            .is_some_and(|value| compare(value, self.target))
    }
}

/// Wait until the attribute is within tolerance of the target.
pub async fn wait_for_attribute(
    feed: &dyn StateFeed,
    wait: &AttributeWait,
    abort: &CancellationToken,
) -> WaitOutcome {
    let tolerance = wait.tolerance;
    wait_for_attribute_with(feed, wait, abort, move |value, target| {
        value.abs_diff(target) <= tolerance
    })
    .await
}

/// Wait until `compare(value, target)` holds.
pub async fn wait_for_attribute_with<F>(
    feed: &dyn StateFeed,
    wait: &AttributeWait,
    abort: &CancellationToken,
    compare: F,
) -> WaitOutcome
where
    F: Fn(PhysicalValue, PhysicalValue) -> bool,
{
    let mut rx = feed.subscribe_device(&wait.device_id);

    if wait.matches(feed.current(&wait.device_id).as_ref(), &compare) {
        return WaitOutcome::Reached;
    }

    let deadline = tokio::time::sleep(wait.timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = abort.cancelled() => return WaitOutcome::Aborted,
            _ = &mut deadline => {
                tracing::debug!(
                    category = "waiter",
                    device = %wait.device_id,
                    attribute = %wait.attribute,
                    target = wait.target,
                    "Wait timed out"
                );
                return WaitOutcome::TimedOut;
            }
            event = rx.recv() => match event {
                Ok(changed) => {
                    if wait.matches(Some(&changed.new), &compare) {
                        return WaitOutcome::Reached;
                    }
                }
                Err(FeedError::Lagged(_)) => {
                    if wait.matches(feed.current(&wait.device_id).as_ref(), &compare) {
                        return WaitOutcome::Reached;
                    }
                }
                Err(FeedError::Closed) => {
                    // Nothing more will arrive
                    tokio::select! {
                        biased;
                        _ = abort.cancelled() => return WaitOutcome::Aborted,
                        _ = &mut deadline => return WaitOutcome::TimedOut,
                    }
                }
            }
        }
    }
}
