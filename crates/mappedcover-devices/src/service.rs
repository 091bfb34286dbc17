//! Remote cover command service.
//!
//! [`CoverService`] is the single seam through which commands leave the
//! process. Each call is one attempt; retrying, spacing and confirmation are
//! the dispatcher's job.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mappedcover_core::PhysicalValue;

/// Errors returned by a remote service call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// The device is not reachable
    #[error("Device {0} is unavailable")]
    Unavailable(String),

    /// The device or host refused the command
    #[error("Command rejected: {0}")]
    Rejected(String),

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Call did not finish within the call timeout
    #[error("Call timed out after {0} ms")]
    Timeout(u64),
}

/// One remote action, in device units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "snake_case")]
pub enum ServiceAction {
    SetPosition(PhysicalValue),
    SetTiltPosition(PhysicalValue),
    Stop,
    StopTilt,
}

impl ServiceAction {
    /// Host service name.
    pub fn service_name(&self) -> &'static str {
        match self {
            ServiceAction::SetPosition(_) => "set_cover_position",
            ServiceAction::SetTiltPosition(_) => "set_cover_tilt_position",
            ServiceAction::Stop => "stop_cover",
            ServiceAction::StopTilt => "stop_cover_tilt",
        }
    }

    /// Position-class actions move the cover itself. Tilt only turns the slats.
    pub fn is_position_class(&self) -> bool {
        matches!(self, ServiceAction::SetPosition(_))
    }
}

impl std::fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceAction::SetPosition(v) | ServiceAction::SetTiltPosition(v) => {
                write!(f, "{}({})", self.service_name(), v)
            }
            _ => write!(f, "{}", self.service_name()),
        }
    }
}

/// Remote command service for physical covers.
#[async_trait]
pub trait CoverService: Send + Sync {
    async fn set_position(
        &self,
        device_id: &str,
        position: PhysicalValue,
    ) -> Result<(), ServiceError>;

    async fn set_tilt_position(
        &self,
        device_id: &str,
        tilt: PhysicalValue,
    ) -> Result<(), ServiceError>;

    async fn stop(&self, device_id: &str) -> Result<(), ServiceError>;

    async fn stop_tilt(&self, device_id: &str) -> Result<(), ServiceError>;

    /// Route an action to the matching method.
    async fn execute(&self, device_id: &str, action: ServiceAction) -> Result<(), ServiceError> {
        match action {
            ServiceAction::SetPosition(v) => self.set_position(device_id, v).await,
            ServiceAction::SetTiltPosition(v) => self.set_tilt_position(device_id, v).await,
            ServiceAction::Stop => self.stop(device_id).await,
            ServiceAction::StopTilt => self.stop_tilt(device_id).await,
        }
    }
}

/// Shared service handle.
pub type SharedCoverService = Arc<dyn CoverService>;
