//! Command dispatch for mapped covers.
//!
//! Provides:
//! - Command data structures and retry policy
//! - Per-device throttling
//! - The retrying, confirming dispatcher

pub mod command;
pub mod dispatcher;
pub mod throttle;

// Re-exports
pub use command::{
    CoverCommand, DispatchError, DispatchFailure, DispatchOutcome, RetryPolicy, ALLOWED_SERVICES,
};
pub use dispatcher::CommandDispatcher;
pub use throttle::{SharedThrottles, Throttle};
