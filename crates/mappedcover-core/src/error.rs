//! Error types for the core crate.

use std::path::PathBuf;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML for this schema
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A range bound lies outside the 0-100 scale
    #[error("Entry '{entry}': {field} = {value} is outside 0..=100")]
    OutOfScale {
        entry: String,
        field: &'static str,
        value: u8,
    },

    /// Rename pattern does not compile
    #[error("Entry '{entry}': invalid rename pattern: {source}")]
    InvalidPattern {
        entry: String,
        #[source]
        source: regex::Error,
    },

    /// Entry has no source covers
    #[error("Entry '{0}' has no covers")]
    NoCovers(String),

    /// Throttle interval must be positive
    #[error("Entry '{0}': throttle_ms must be greater than 0")]
    InvalidThrottle(String),

    /// Two entries share an id
    #[error("Duplicate entry id: {0}")]
    DuplicateEntry(String),
}

/// Errors raised while parsing remap inputs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemapError {
    /// Value is not an integer
    #[error("Invalid value '{0}'")]
    InvalidValue(String),

    /// Value exceeds the 0-100 scale
    #[error("Value {0} is outside 0..=100")]
    OutOfScale(u32),

    /// Range is not written as `min:max`
    #[error("Invalid range '{0}', expected MIN:MAX")]
    InvalidRange(String),
}
