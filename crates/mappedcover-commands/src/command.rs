//! Command data structures.
//!
//! Defines what the dispatcher sends and how it retries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use mappedcover_core::config::controller;
use mappedcover_core::{Attribute, ControllerSettings, PhysicalValue, SourceId};
use mappedcover_devices::{AttributeWait, ServiceAction, ServiceError};

/// Service names a command may carry.
pub const ALLOWED_SERVICES: [&str; 4] = [
    "set_cover_position",
    "set_cover_tilt_position",
    "stop_cover",
    "stop_cover_tilt",
];

/// Contract violations. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Service is not one of [`ALLOWED_SERVICES`]
    #[error("Command {0} not allowed")]
    NotAllowed(String),

    /// A set command came without a value
    #[error("Command {0} requires a value")]
    MissingValue(String),
}

/// Why a dispatch gave up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchFailure {
    /// The remote call failed or timed out
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The call succeeded but the device never reported the target
    #[error("{attribute} did not reach {target}")]
    NotConfirmed {
        attribute: Attribute,
        target: PhysicalValue,
    },
}

/// Result of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Sent, and confirmed when confirmation was requested
    Completed { attempts: u32 },
    /// Abort observed before completion
    Aborted,
    /// Out of attempts
    Failed {
        attempts: u32,
        error: DispatchFailure,
    },
}

impl DispatchOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, DispatchOutcome::Completed { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, DispatchOutcome::Aborted)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, DispatchOutcome::Failed { .. })
    }
}

/// Command retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first
    pub retries: u32,
    /// Initial retry delay in milliseconds
    pub initial_delay_ms: u64,
    /// Backoff multiplier, 1.0 for a fixed delay
    pub backoff_multiplier: f64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
    /// Bound on a single remote call
    pub call_timeout_ms: u64,
    /// Bound on waiting for confirmation
    pub confirm_timeout_ms: u64,
    /// Confirmation tolerance
    pub tolerance: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: controller::RETRIES,
            initial_delay_ms: controller::RETRY_DELAY_MS,
            backoff_multiplier: 1.0,
            max_delay_ms: controller::RETRY_DELAY_MS,
            call_timeout_ms: controller::CALL_TIMEOUT_SECS * 1000,
            confirm_timeout_ms: controller::WAIT_TIMEOUT_SECS * 1000,
            tolerance: controller::TOLERANCE,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no confirmation.
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Default::default()
        }
    }

    /// Policy matching controller settings.
    pub fn from_settings(settings: &ControllerSettings) -> Self {
        let delay_ms = settings.retry_delay.as_millis() as u64;
        Self {
            retries: settings.retries,
            initial_delay_ms: delay_ms,
            backoff_multiplier: 1.0,
            max_delay_ms: delay_ms,
            call_timeout_ms: settings.call_timeout.as_millis() as u64,
            confirm_timeout_ms: settings.wait_timeout.as_millis() as u64,
            tolerance: settings.tolerance,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Calculate retry delay for a given attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = (self.initial_delay_ms as f64
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32))
        .min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }
}

/// A command bound for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverCommand {
    pub device_id: SourceId,
    pub action: ServiceAction,
    /// Wait for the device to report the target after sending
    pub confirm: bool,
    pub retry_policy: RetryPolicy,
}

impl CoverCommand {
    /// Single-attempt command.
    pub fn new(device_id: impl Into<SourceId>, action: ServiceAction) -> Self {
        Self {
            device_id: device_id.into(),
            action,
            confirm: false,
            retry_policy: RetryPolicy::none(),
        }
    }

    pub fn set_position(device_id: impl Into<SourceId>, position: PhysicalValue) -> Self {
        Self::new(device_id, ServiceAction::SetPosition(position))
    }

    pub fn set_tilt_position(device_id: impl Into<SourceId>, tilt: PhysicalValue) -> Self {
        Self::new(device_id, ServiceAction::SetTiltPosition(tilt))
    }

    pub fn stop(device_id: impl Into<SourceId>) -> Self {
        Self::new(device_id, ServiceAction::Stop)
    }

    pub fn stop_tilt(device_id: impl Into<SourceId>) -> Self {
        Self::new(device_id, ServiceAction::StopTilt)
    }

    /// Build a command from a host service name.
    pub fn parse(
        device_id: impl Into<SourceId>,
        service: &str,
        value: Option<PhysicalValue>,
    ) -> Result<Self, DispatchError> {
        let missing = || DispatchError::MissingValue(service.to_string());
        let action = match service {
            "set_cover_position" => ServiceAction::SetPosition(value.ok_or_else(missing)?),
            "set_cover_tilt_position" => {
                ServiceAction::SetTiltPosition(value.ok_or_else(missing)?)
            }
            "stop_cover" => ServiceAction::Stop,
            "stop_cover_tilt" => ServiceAction::StopTilt,
            other => return Err(DispatchError::NotAllowed(other.to_string())),
        };
        Ok(Self::new(device_id, action))
    }

    pub fn with_confirmation(mut self) -> Self {
        self.confirm = true;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retry_policy.retries = retries;
        self
    }

    /// Confirmation wait, if this command has one.
    ///
    /// Only set commands with retries left are confirmed.
    pub fn confirmation(&self) -> Option<AttributeWait> {
        if !self.confirm || self.retry_policy.retries == 0 {
            return None;
        }
        let (attribute, target) = match self.action {
            ServiceAction::SetPosition(v) => (Attribute::CurrentPosition, v),
            ServiceAction::SetTiltPosition(v) => (Attribute::CurrentTiltPosition, v),
            ServiceAction::Stop | ServiceAction::StopTilt => return None,
        };
        Some(
            AttributeWait::new(self.device_id.clone(), attribute, target)
                .with_tolerance(self.retry_policy.tolerance)
                .with_timeout(self.retry_policy.confirm_timeout()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_allowed_services() {
        for service in ALLOWED_SERVICES {
            let command = CoverCommand::parse("cover.a", service, Some(10)).unwrap();
            assert_eq!(command.action.service_name(), service);
        }
    }

    #[test]
    fn test_parse_rejects_other_services() {
        assert_eq!(
            CoverCommand::parse("cover.a", "open_cover", None),
            Err(DispatchError::NotAllowed("open_cover".to_string()))
        );
        assert_eq!(
            CoverCommand::parse("cover.a", "set_cover_position", None),
            Err(DispatchError::MissingValue("set_cover_position".to_string()))
        );
    }

    #[test]
    fn test_confirmation_requires_retries() {
        let command = CoverCommand::set_position("cover.a", 40).with_confirmation();
        assert!(command.confirmation().is_none());

        let command = command.with_retries(3);
        let wait = command.confirmation().unwrap();
        assert_eq!(wait.attribute, Attribute::CurrentPosition);
        assert_eq!(wait.target, 40);
        assert_eq!(wait.tolerance, 1);

        let stop = CoverCommand::stop("cover.a").with_confirmation().with_retries(3);
        assert!(stop.confirmation().is_none());
    }

    #[test]
    fn test_fixed_retry_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retries, 3);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            backoff_multiplier: 2.0,
            max_delay_ms: 3000,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3000));
    }

    #[test]
    fn test_policy_from_settings() {
        let settings = ControllerSettings {
            retries: 5,
            retry_delay: Duration::from_millis(250),
            ..Default::default()
        };
        let policy = RetryPolicy::from_settings(&settings);
        assert_eq!(policy.retries, 5);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(250));
        assert_eq!(policy.call_timeout(), Duration::from_secs(30));
    }
}
