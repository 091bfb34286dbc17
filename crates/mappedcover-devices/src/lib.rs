//! Device side of mapped covers.
//!
//! - [`store`]: device state snapshots and change notifications
//! - [`waiter`]: waiting for an attribute to reach a value
//! - [`service`]: the remote command service interface
//! - [`simulator`]: simulated covers implementing that service

pub mod service;
pub mod simulator;
pub mod store;
pub mod waiter;

pub use service::{CoverService, ServiceAction, ServiceError, SharedCoverService};
pub use simulator::{CoverSimulator, ServiceCall, SimulatedCover, TravelMode};
pub use store::{
    DeviceStateStore, FeedError, SharedStateFeed, StateChanged, StateFeed, StateReceiver,
};
pub use waiter::{wait_for_attribute, wait_for_attribute_with, AttributeWait, WaitOutcome};
