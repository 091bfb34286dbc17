//! Value remapping between the normalized control surface and the physical device range.
//!
//! Callers always speak 0-100. The source device is only usable inside a
//! sub-range `[min, max]` of its own 0-100 scale, so user values 1..=100 are
//! spread linearly across that sub-range. 0 is reserved on both sides and
//! always means "fully closed".
//!
//! Degenerate ranges (`min == max`) cannot be inverted. Inverted ranges
//! (`min > max`) are treated the same way: every non-zero user value maps to
//! `min` and every physical reading maps back to 0.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RemapError;

/// Value on the normalized 0-100 scale exposed to callers.
pub type NormalizedValue = u8;

/// Value on the device's native 0-100 scale.
pub type PhysicalValue = u8;

/// Upper bound shared by both scales.
pub const SCALE_MAX: u8 = 100;

/// Physical sub-range a normalized value is spread across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemapRange {
    /// Physical value for normalized 1
    pub min: PhysicalValue,
    /// Physical value for normalized 100
    pub max: PhysicalValue,
}

impl RemapRange {
    /// Create a range. `min > max` is accepted and handled as degenerate.
    pub const fn new(min: PhysicalValue, max: PhysicalValue) -> Self {
        Self { min, max }
    }

    /// The pass-through range `[0, 100]`.
    pub const fn full() -> Self {
        Self::new(0, SCALE_MAX)
    }

    /// True when the range has no spread or is inverted.
    pub fn is_degenerate(&self) -> bool {
        self.min >= self.max
    }

    /// True when `min > max`.
    pub fn is_inverted(&self) -> bool {
        self.min > self.max
    }

    fn span(&self) -> f64 {
        f64::from(self.max) - f64::from(self.min)
    }
}

impl Default for RemapRange {
    fn default() -> Self {
        Self::full()
    }
}

impl std::fmt::Display for RemapRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

impl FromStr for RemapRange {
    type Err = RemapError;

    /// Parse `MIN:MAX`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (min, max) = s
            .split_once(':')
            .ok_or_else(|| RemapError::InvalidRange(s.to_string()))?;
        Ok(Self::new(parse_value(min)?, parse_value(max)?))
    }
}

/// Parse a value on the 0-100 scale.
pub fn parse_value(s: &str) -> Result<u8, RemapError> {
    let value: u32 = s
        .trim()
        .parse()
        .map_err(|_| RemapError::InvalidValue(s.to_string()))?;
    if value > u32::from(SCALE_MAX) {
        return Err(RemapError::OutOfScale(value));
    }
    Ok(value as u8)
}

/// Direction of a remap operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemapDirection {
    /// Normalized 0-100 to the physical range
    ToSource,
    /// Physical range to normalized 0-100
    FromSource,
}

/// Convert a normalized value into the physical range.
pub fn to_physical(user: NormalizedValue, range: RemapRange) -> PhysicalValue {
    if user == 0 {
        return 0;
    }
    if range.is_degenerate() {
        return range.min.min(SCALE_MAX);
    }

    let user = f64::from(user.min(SCALE_MAX));
    let scaled = f64::from(range.min) + (user - 1.0) * range.span() / 99.0;
    clamp_round(scaled, 0, SCALE_MAX)
}

/// Convert a physical reading into the normalized scale.
///
/// Readings below `min` report 1, never 0: the device is slightly open, not closed.
pub fn to_normalized(physical: PhysicalValue, range: RemapRange) -> NormalizedValue {
    if physical == 0 || range.is_degenerate() {
        return 0;
    }
    if physical < range.min {
        return 1;
    }

    let offset = f64::from(physical) - f64::from(range.min);
    let scaled = 1.0 + offset * 99.0 / range.span();
    clamp_round(scaled, 1, SCALE_MAX)
}

/// Like [`to_normalized`], propagating an absent reading as absent.
pub fn to_normalized_opt(
    physical: Option<PhysicalValue>,
    range: RemapRange,
) -> Option<NormalizedValue> {
    physical.map(|p| to_normalized(p, range))
}

/// Remap in the given direction.
pub fn remap(value: Option<u8>, range: RemapRange, direction: RemapDirection) -> Option<u8> {
    value.map(|v| match direction {
        RemapDirection::ToSource => to_physical(v, range),
        RemapDirection::FromSource => to_normalized(v, range),
    })
}

fn clamp_round(value: f64, lo: u8, hi: u8) -> u8 {
    value.round().clamp(f64::from(lo), f64::from(hi)) as u8
}
