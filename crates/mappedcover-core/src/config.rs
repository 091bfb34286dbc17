//! Configuration defaults and the TOML entry schema.
//!
//! Every constant used across the workspace lives here so crates don't
//! redefine the same numbers. An entry file looks like:
//!
//! ```toml
//! [[entry]]
//! id = "living_room"
//! label = "Living room"
//! covers = ["cover.living_left", "cover.living_right"]
//! min_position = 10
//! max_position = 90
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::remap::{RemapRange, SCALE_MAX};
use crate::state::AxisRanges;

/// Integration domain, also the prefix for generated ids.
pub const DOMAIN: &str = "mappedcover";

/// Entry defaults
pub mod defaults {
    pub const MIN_POSITION: u8 = 0;
    pub const MAX_POSITION: u8 = 100;
    pub const MIN_TILT: u8 = 0;
    pub const MAX_TILT: u8 = 100;
    pub const RENAME_PATTERN: &str = "^.*$";
    pub const RENAME_REPLACEMENT: &str = "Mapped $0";
    pub const CLOSE_TILT_IF_DOWN: bool = true;
    pub const THROTTLE_MS: u64 = 100;
}

/// Controller timing defaults
pub mod controller {
    /// Allowed distance between an attribute and its target
    pub const TOLERANCE: u8 = 1;
    pub const WAIT_TIMEOUT_SECS: u64 = 30;
    /// A position command younger than this counts as movement
    pub const RECENT_MOVEMENT_SECS: u64 = 5;
    /// Additional attempts after the first
    pub const RETRIES: u32 = 3;
    pub const RETRY_DELAY_MS: u64 = 1000;
    pub const CALL_TIMEOUT_SECS: u64 = 30;
    /// How long tilt may settle on its own after a position move
    pub const TILT_SETTLE_SECS: u64 = 5;
}

/// Environment variables
pub mod env_vars {
    use super::defaults;

    pub const CONFIG_PATH: &str = "MAPPEDCOVER_CONFIG";
    pub const LOG_JSON: &str = "MAPPEDCOVER_LOG_JSON";
    pub const THROTTLE_MS: &str = "MAPPEDCOVER_THROTTLE_MS";

    /// JSON log output requested.
    pub fn log_json() -> bool {
        std::env::var(LOG_JSON)
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false)
    }

    /// Throttle override, or the entry default.
    pub fn throttle_ms() -> u64 {
        std::env::var(THROTTLE_MS)
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(defaults::THROTTLE_MS)
    }

    pub fn config_path() -> Option<String> {
        std::env::var(CONFIG_PATH).ok()
    }
}

fn default_min() -> u8 {
    defaults::MIN_POSITION
}

fn default_max() -> u8 {
    defaults::MAX_POSITION
}

fn default_rename_pattern() -> String {
    defaults::RENAME_PATTERN.to_string()
}

fn default_rename_replacement() -> String {
    defaults::RENAME_REPLACEMENT.to_string()
}

fn default_close_tilt_if_down() -> bool {
    defaults::CLOSE_TILT_IF_DOWN
}

fn default_throttle_ms() -> u64 {
    env_vars::throttle_ms()
}

fn default_entry_id() -> String {
    DOMAIN.to_string()
}

/// One configured group of mapped covers sharing ranges and options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryConfig {
    #[serde(default = "default_entry_id")]
    pub id: String,
    #[serde(default)]
    pub label: String,
    /// Source device ids
    #[serde(default)]
    pub covers: Vec<String>,
    #[serde(default = "default_min")]
    pub min_position: u8,
    #[serde(default = "default_max")]
    pub max_position: u8,
    #[serde(default = "default_min")]
    pub min_tilt: u8,
    #[serde(default = "default_max")]
    pub max_tilt: u8,
    #[serde(default = "default_rename_pattern")]
    pub rename_pattern: String,
    #[serde(default = "default_rename_replacement")]
    pub rename_replacement: String,
    #[serde(default = "default_close_tilt_if_down")]
    pub close_tilt_if_down: bool,
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            id: default_entry_id(),
            label: String::new(),
            covers: Vec::new(),
            min_position: defaults::MIN_POSITION,
            max_position: defaults::MAX_POSITION,
            min_tilt: defaults::MIN_TILT,
            max_tilt: defaults::MAX_TILT,
            rename_pattern: default_rename_pattern(),
            rename_replacement: default_rename_replacement(),
            close_tilt_if_down: defaults::CLOSE_TILT_IF_DOWN,
            throttle_ms: defaults::THROTTLE_MS,
        }
    }
}

impl EntryConfig {
    pub fn new(id: impl Into<String>, covers: Vec<String>) -> Self {
        Self {
            id: id.into(),
            covers,
            ..Default::default()
        }
    }

    pub fn with_position_range(mut self, min: u8, max: u8) -> Self {
        self.min_position = min;
        self.max_position = max;
        self
    }

    pub fn with_tilt_range(mut self, min: u8, max: u8) -> Self {
        self.min_tilt = min;
        self.max_tilt = max;
        self
    }

    pub fn with_throttle_ms(mut self, ms: u64) -> Self {
        self.throttle_ms = ms;
        self
    }

    pub fn with_close_tilt_if_down(mut self, enabled: bool) -> Self {
        self.close_tilt_if_down = enabled;
        self
    }

    pub fn position_range(&self) -> RemapRange {
        RemapRange::new(self.min_position, self.max_position)
    }

    pub fn tilt_range(&self) -> RemapRange {
        RemapRange::new(self.min_tilt, self.max_tilt)
    }

    pub fn ranges(&self) -> AxisRanges {
        AxisRanges {
            position: self.position_range(),
            tilt: self.tilt_range(),
        }
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn rename_rule(&self) -> Result<RenameRule, ConfigError> {
        RenameRule::new(&self.rename_pattern, &self.rename_replacement).map_err(|source| {
            ConfigError::InvalidPattern {
                entry: self.id.clone(),
                source,
            }
        })
    }

    /// Check bounds, pattern, covers and throttle.
    ///
    /// Inverted ranges are accepted; they behave like a single-point range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("min_position", self.min_position),
            ("max_position", self.max_position),
            ("min_tilt", self.min_tilt),
            ("max_tilt", self.max_tilt),
        ] {
            if value > SCALE_MAX {
                return Err(ConfigError::OutOfScale {
                    entry: self.id.clone(),
                    field,
                    value,
                });
            }
        }
        if self.covers.is_empty() {
            return Err(ConfigError::NoCovers(self.id.clone()));
        }
        if self.throttle_ms == 0 {
            return Err(ConfigError::InvalidThrottle(self.id.clone()));
        }
        self.rename_rule()?;

        for (axis, range) in [("position", self.position_range()), ("tilt", self.tilt_range())] {
            if range.is_inverted() {
                tracing::warn!(
                    category = "config",
                    entry = %self.id,
                    axis,
                    %range,
                    "Inverted range, every non-zero value maps to min"
                );
            }
        }
        Ok(())
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default, rename = "entry")]
    pub entries: Vec<EntryConfig>,
}

impl ConfigFile {
    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        file.validate()?;
        Ok(file)
    }

    /// Read, parse and validate a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file = Self::from_toml(&text)?;
        tracing::info!(
            category = "config",
            path = %path.display(),
            entries = file.entries.len(),
            "Loaded configuration"
        );
        Ok(file)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for entry in &self.entries {
            if !seen.insert(entry.id.as_str()) {
                return Err(ConfigError::DuplicateEntry(entry.id.clone()));
            }
            entry.validate()?;
        }
        Ok(())
    }

    pub fn entry(&self, id: &str) -> Option<&EntryConfig> {
        self.entries.iter().find(|e| e.id == id)
    }
}

/// Regex rename applied to source names to build mapped entity names.
#[derive(Debug, Clone)]
pub struct RenameRule {
    pattern: Regex,
    replacement: String,
}

impl RenameRule {
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.to_string(),
        })
    }

    /// Replace the first match. Names without a match are returned unchanged.
    pub fn apply(&self, name: &str) -> String {
        self.pattern
            .replace(name, self.replacement.as_str())
            .trim()
            .to_string()
    }
}

impl Default for RenameRule {
    fn default() -> Self {
        Self {
            pattern: Regex::new(defaults::RENAME_PATTERN).expect("default pattern compiles"),
            replacement: defaults::RENAME_REPLACEMENT.to_string(),
        }
    }
}

/// Timings and limits of the convergence controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub tolerance: u8,
    pub wait_timeout: Duration,
    pub recent_movement: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    pub call_timeout: Duration,
    pub tilt_settle: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            tolerance: controller::TOLERANCE,
            wait_timeout: Duration::from_secs(controller::WAIT_TIMEOUT_SECS),
            recent_movement: Duration::from_secs(controller::RECENT_MOVEMENT_SECS),
            retries: controller::RETRIES,
            retry_delay: Duration::from_millis(controller::RETRY_DELAY_MS),
            call_timeout: Duration::from_secs(controller::CALL_TIMEOUT_SECS),
            tilt_settle: Duration::from_secs(controller::TILT_SETTLE_SECS),
        }
    }
}
