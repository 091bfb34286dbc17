//! Device state store and the state feed interface.
//!
//! The store keeps the latest [`SourceState`] per device and broadcasts a
//! [`StateChanged`] event for every write. Readers either take a snapshot
//! with [`StateFeed::current`] or follow changes through a [`StateReceiver`].

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use mappedcover_core::{Availability, MotionState, PhysicalValue, SourceId, SourceState};

/// Default channel capacity for state change events.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A device state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChanged {
    pub device_id: SourceId,
    pub old: Option<SourceState>,
    pub new: SourceState,
}

/// Errors from a state subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// The receiver fell behind and skipped events
    #[error("Receiver lagged by {0} events")]
    Lagged(u64),

    /// The feed was dropped
    #[error("State feed closed")]
    Closed,
}

/// Source of device state snapshots and change notifications.
pub trait StateFeed: Send + Sync {
    /// Latest known state of a device.
    fn current(&self, device_id: &str) -> Option<SourceState>;

    /// Follow changes of every device.
    fn subscribe(&self) -> StateReceiver;

    /// Follow changes of one device.
    fn subscribe_device(&self, device_id: &str) -> StateReceiver {
        self.subscribe().for_device(device_id)
    }
}

/// Shared state feed handle.
pub type SharedStateFeed = Arc<dyn StateFeed>;

/// Receiver for state change events, optionally limited to one device.
pub struct StateReceiver {
    rx: broadcast::Receiver<StateChanged>,
    device_id: Option<SourceId>,
}

impl StateReceiver {
    pub fn new(rx: broadcast::Receiver<StateChanged>) -> Self {
        Self { rx, device_id: None }
    }

    /// Only deliver events of `device_id`.
    pub fn for_device(mut self, device_id: impl Into<SourceId>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Receive the next matching event.
    ///
    /// A lag is reported once so the caller can re-read the snapshot; the
    /// receiver keeps working afterwards.
    pub async fn recv(&mut self) -> Result<StateChanged, FeedError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => return Err(FeedError::Lagged(n)),
                Err(broadcast::error::RecvError::Closed) => return Err(FeedError::Closed),
            }
        }
    }

    /// Try to receive a matching event without waiting.
    pub fn try_recv(&mut self) -> Option<StateChanged> {
        while let Ok(event) = self.rx.try_recv() {
            if self.matches(&event) {
                return Some(event);
            }
        }
        None
    }

    fn matches(&self, event: &StateChanged) -> bool {
        self.device_id
            .as_deref()
            .map_or(true, |id| id == event.device_id)
    }
}

/// In-memory state store.
#[derive(Clone)]
pub struct DeviceStateStore {
    states: Arc<DashMap<SourceId, SourceState>>,
    tx: broadcast::Sender<StateChanged>,
}

impl DeviceStateStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Capacity bounds how far a slow subscriber may fall behind.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            states: Arc::new(DashMap::new()),
            tx,
        }
    }

    /// Replace a device's state and notify subscribers.
    pub fn set_state(&self, device_id: impl Into<SourceId>, mut state: SourceState) {
        let device_id = device_id.into();
        state.last_changed = chrono::Utc::now().timestamp();
        let old = self.states.insert(device_id.clone(), state.clone());
        tracing::trace!(category = "state", device = %device_id, ?state, "State changed");
        // No subscribers is fine
        let _ = self.tx.send(StateChanged {
            device_id,
            old,
            new: state,
        });
    }

    /// Modify a device's state in place. Returns false if the device is unknown.
    pub fn update<F>(&self, device_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut SourceState),
    {
        let (old, state) = {
            let Some(mut entry) = self.states.get_mut(device_id) else {
                return false;
            };
            let old = entry.value().clone();
            f(entry.value_mut());
            entry.last_changed = chrono::Utc::now().timestamp();
            (old, entry.value().clone())
        };
        tracing::trace!(category = "state", device = %device_id, ?state, "State changed");
        let _ = self.tx.send(StateChanged {
            device_id: device_id.to_string(),
            old: Some(old),
            new: state,
        });
        true
    }

    pub fn set_position(&self, device_id: &str, position: PhysicalValue) -> bool {
        self.update(device_id, |s| s.current_position = Some(position))
    }

    pub fn set_tilt_position(&self, device_id: &str, tilt: PhysicalValue) -> bool {
        self.update(device_id, |s| s.current_tilt_position = Some(tilt))
    }

    pub fn set_motion(&self, device_id: &str, motion: MotionState) -> bool {
        self.update(device_id, |s| s.motion = motion)
    }

    pub fn set_availability(&self, device_id: &str, availability: Availability) -> bool {
        self.update(device_id, |s| s.availability = availability)
    }

    /// Forget a device.
    pub fn remove(&self, device_id: &str) -> Option<SourceState> {
        self.states.remove(device_id).map(|(_, s)| s)
    }

    pub fn device_ids(&self) -> Vec<SourceId> {
        let mut ids: Vec<SourceId> = self.states.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for DeviceStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateFeed for DeviceStateStore {
    fn current(&self, device_id: &str) -> Option<SourceState> {
        self.states.get(device_id).map(|s| s.value().clone())
    }

    fn subscribe(&self) -> StateReceiver {
        StateReceiver::new(self.tx.subscribe())
    }
}
