//! Simulated covers for tests and the CLI.
//!
//! [`CoverSimulator`] implements [`CoverService`] on top of a
//! [`DeviceStateStore`]: commands move the simulated cover and the resulting
//! state changes flow through the store like real device feedback. Failures,
//! hangs, latency and unavailability can be injected per device, and every
//! call is recorded with its arrival time.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use mappedcover_core::{Availability, Axis, MotionState, PhysicalValue, SourceId, SourceState};

use crate::service::{CoverService, ServiceAction, ServiceError};
use crate::store::{DeviceStateStore, StateFeed};

/// How a simulated cover reacts to movement commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TravelMode {
    /// Jump to the target as soon as the command is accepted
    #[default]
    Instant,
    /// Move `step` units every `interval_ms`
    Gradual { step: u8, interval_ms: u64 },
    /// Accept commands but never move
    Stuck,
}

/// A cover to simulate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedCover {
    pub id: SourceId,
    pub state: SourceState,
    #[serde(default)]
    pub travel: TravelMode,
}

impl SimulatedCover {
    pub fn new(id: impl Into<SourceId>, state: SourceState) -> Self {
        Self {
            id: id.into(),
            state,
            travel: TravelMode::Instant,
        }
    }

    pub fn with_travel(mut self, travel: TravelMode) -> Self {
        self.travel = travel;
        self
    }
}

/// A recorded service call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCall {
    pub device_id: SourceId,
    pub action: ServiceAction,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct DeviceSim {
    travel: TravelMode,
    fail_next: u32,
    hang: bool,
    position_travel: Option<CancellationToken>,
    tilt_travel: Option<CancellationToken>,
}

/// Simulated remote cover service.
pub struct CoverSimulator {
    store: DeviceStateStore,
    devices: DashMap<SourceId, DeviceSim>,
    calls: Mutex<Vec<ServiceCall>>,
    latency: Mutex<Duration>,
}

impl CoverSimulator {
    pub fn new(store: DeviceStateStore) -> Self {
        Self {
            store,
            devices: DashMap::new(),
            calls: Mutex::new(Vec::new()),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// The store the simulator writes feedback into.
    pub fn store(&self) -> &DeviceStateStore {
        &self.store
    }

    /// Add a cover and publish its initial state.
    pub fn add_cover(&self, cover: SimulatedCover) {
        self.devices.insert(
            cover.id.clone(),
            DeviceSim {
                travel: cover.travel,
                ..Default::default()
            },
        );
        self.store.set_state(cover.id, cover.state);
    }

    pub fn set_travel(&self, device_id: &str, travel: TravelMode) {
        if let Some(mut device) = self.devices.get_mut(device_id) {
            device.travel = travel;
        }
    }

    /// Fail the next `count` calls to a device with a transport error.
    pub fn fail_next(&self, device_id: &str, count: u32) {
        if let Some(mut device) = self.devices.get_mut(device_id) {
            device.fail_next = count;
        }
    }

    /// Make calls to a device never return.
    pub fn set_hang(&self, device_id: &str, hang: bool) {
        if let Some(mut device) = self.devices.get_mut(device_id) {
            device.hang = hang;
        }
    }

    /// Delay applied to every call before it takes effect.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn set_available(&self, device_id: &str, available: bool) {
        let availability = if available {
            Availability::Available
        } else {
            Availability::Unavailable
        };
        self.store.set_availability(device_id, availability);
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, device_id: &str) -> Vec<ServiceCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.device_id == device_id)
            .cloned()
            .collect()
    }

    pub fn actions_for(&self, device_id: &str) -> Vec<ServiceAction> {
        self.calls_for(device_id).into_iter().map(|c| c.action).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Record the call and decide whether it is accepted.
    async fn accept(&self, device_id: &str, action: ServiceAction) -> Result<TravelMode, ServiceError> {
        self.calls.lock().push(ServiceCall {
            device_id: device_id.to_string(),
            action,
            at: Instant::now(),
        });
        tracing::debug!(category = "simulator", device = %device_id, %action, "Service call");

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let (hang, failing, travel) = {
            let mut device = self
                .devices
                .get_mut(device_id)
                .ok_or_else(|| ServiceError::Rejected(format!("unknown device {}", device_id)))?;
            let failing = device.fail_next > 0;
            if failing {
                device.fail_next -= 1;
            }
            (device.hang, failing, device.travel)
        };

        if hang {
            std::future::pending::<()>().await;
        }
        let available = self
            .store
            .current(device_id)
            .is_some_and(|s| s.is_available());
        if !available {
            return Err(ServiceError::Unavailable(device_id.to_string()));
        }
        if failing {
            return Err(ServiceError::Transport("injected failure".to_string()));
        }
        Ok(travel)
    }

    fn replace_travel(&self, device_id: &str, axis: Axis, token: Option<CancellationToken>) {
        if let Some(mut device) = self.devices.get_mut(device_id) {
            let slot = match axis {
                Axis::Position => &mut device.position_travel,
                Axis::Tilt => &mut device.tilt_travel,
            };
            if let Some(previous) = std::mem::replace(slot, token) {
                previous.cancel();
            }
        }
    }

    fn move_axis(&self, device_id: &str, axis: Axis, target: PhysicalValue, travel: TravelMode) {
        self.replace_travel(device_id, axis, None);
        match travel {
            TravelMode::Instant => {
                self.store.update(device_id, |s| {
                    set_axis(s, axis, target);
                    if axis == Axis::Position {
                        s.motion = settled(target);
                    }
                });
            }
            TravelMode::Gradual { step, interval_ms } => {
                if axis == Axis::Position {
                    self.store.update(device_id, |s| {
                        let current = s.current_position.unwrap_or(0);
                        if target > current {
                            s.motion = MotionState::Opening;
                        } else if target < current {
                            s.motion = MotionState::Closing;
                        }
                    });
                }
                let token = CancellationToken::new();
                self.replace_travel(device_id, axis, Some(token.clone()));
                spawn_travel(
                    self.store.clone(),
                    device_id.to_string(),
                    axis,
                    target,
                    step.max(1),
                    Duration::from_millis(interval_ms),
                    token,
                );
            }
            TravelMode::Stuck => {}
        }
    }
}

fn settled(position: PhysicalValue) -> MotionState {
    if position == 0 {
        MotionState::Closed
    } else {
        MotionState::Open
    }
}

fn axis_value(state: &SourceState, axis: Axis) -> Option<PhysicalValue> {
    match axis {
        Axis::Position => state.current_position,
        Axis::Tilt => state.current_tilt_position,
    }
}

fn set_axis(state: &mut SourceState, axis: Axis, value: PhysicalValue) {
    match axis {
        Axis::Position => state.current_position = Some(value),
        Axis::Tilt => state.current_tilt_position = Some(value),
    }
}

fn spawn_travel(
    store: DeviceStateStore,
    device_id: SourceId,
    axis: Axis,
    target: PhysicalValue,
    step: u8,
    interval: Duration,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let Some(state) = store.current(&device_id) else {
                break;
            };
            let current = axis_value(&state, axis).unwrap_or(0);
            let next = if current < target {
                current.saturating_add(step).min(target)
            } else {
                current.saturating_sub(step).max(target)
            };
            store.update(&device_id, |s| {
                set_axis(s, axis, next);
                if axis == Axis::Position {
                    s.motion = match next.cmp(&target) {
                        std::cmp::Ordering::Equal => settled(next),
                        std::cmp::Ordering::Less => MotionState::Opening,
                        std::cmp::Ordering::Greater => MotionState::Closing,
                    };
                }
            });
            if next == target {
                break;
            }
        }
    });
}

#[async_trait]
impl CoverService for CoverSimulator {
    async fn set_position(&self, device_id: &str, position: PhysicalValue) -> Result<(), ServiceError> {
        let travel = self.accept(device_id, ServiceAction::SetPosition(position)).await?;
        self.move_axis(device_id, Axis::Position, position, travel);
        Ok(())
    }

    async fn set_tilt_position(&self, device_id: &str, tilt: PhysicalValue) -> Result<(), ServiceError> {
        let travel = self.accept(device_id, ServiceAction::SetTiltPosition(tilt)).await?;
        self.move_axis(device_id, Axis::Tilt, tilt, travel);
        Ok(())
    }

    async fn stop(&self, device_id: &str) -> Result<(), ServiceError> {
        self.accept(device_id, ServiceAction::Stop).await?;
        self.replace_travel(device_id, Axis::Position, None);
        self.store.update(device_id, |s| {
            s.motion = settled(s.current_position.unwrap_or(0));
        });
        Ok(())
    }

    async fn stop_tilt(&self, device_id: &str) -> Result<(), ServiceError> {
        self.accept(device_id, ServiceAction::StopTilt).await?;
        self.replace_travel(device_id, Axis::Tilt, None);
        Ok(())
    }
}
