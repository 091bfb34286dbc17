//! Mapped covers.
//!
//! - [`controller`]: the convergence state machine
//! - [`entity`]: the caller-facing remapped cover
//! - [`platform`]: per-entry setup and unload

pub mod controller;
pub mod entity;
pub mod platform;

pub use controller::{ConvergenceRun, RunFailure, RunOptions, RunOutcome, RunState, Targets};
pub use entity::{Applied, CoverError, CoverParams, MappedCover, RunStats};
pub use platform::{CoverSnapshot, MappedCoverPlatform, PlatformError};
