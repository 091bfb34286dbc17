//! Core types for mapped covers.
//!
//! This crate holds the pieces every other crate shares: the value remapper,
//! the source state model, configuration and the registry interface.

pub mod config;
pub mod error;
pub mod registry;
pub mod remap;
pub mod state;

pub use config::{ConfigFile, ControllerSettings, EntryConfig, RenameRule, DOMAIN};
pub use error::{ConfigError, RemapError};
pub use registry::{EntityRegistry, InMemoryEntityRegistry, RegistryEntry, RegistryError};
pub use remap::{
    remap, to_normalized, to_normalized_opt, to_physical, NormalizedValue, PhysicalValue,
    RemapDirection, RemapRange, SCALE_MAX,
};
pub use state::{
    Attribute, Availability, Axis, AxisRanges, Capabilities, CoverFeatures, MotionState,
    SourceId, SourceState,
};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{ControllerSettings, EntryConfig};
    pub use crate::remap::{to_normalized, to_physical, RemapRange};
    pub use crate::state::{Attribute, Availability, Axis, MotionState, SourceState};
}
