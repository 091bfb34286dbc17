//! Source device state model.
//!
//! A [`SourceState`] is the snapshot of one physical cover as reported by the
//! state feed. Attribute reads go through [`SourceState::attribute`], which
//! treats an unavailable or unknown device as having no attributes at all.

use serde::{Deserialize, Serialize};

use crate::remap::{PhysicalValue, RemapRange};

/// Identifier of a physical source device.
pub type SourceId = String;

/// Control axis of a cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Position,
    Tilt,
}

impl Axis {
    /// The attribute reporting this axis.
    pub fn attribute(&self) -> Attribute {
        match self {
            Axis::Position => Attribute::CurrentPosition,
            Axis::Tilt => Attribute::CurrentTiltPosition,
        }
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::Position => write!(f, "position"),
            Axis::Tilt => write!(f, "tilt"),
        }
    }
}

/// Observable numeric attribute of a source cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    CurrentPosition,
    CurrentTiltPosition,
}

impl Attribute {
    /// Attribute name as reported by the host.
    pub fn name(&self) -> &'static str {
        match self {
            Attribute::CurrentPosition => "current_position",
            Attribute::CurrentTiltPosition => "current_tilt_position",
        }
    }
}

impl std::fmt::Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Whether the source is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Unavailable,
    #[default]
    Unknown,
}

/// Motion state reported by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionState {
    Open,
    #[default]
    Closed,
    Opening,
    Closing,
}

impl MotionState {
    /// True while the device reports active movement.
    pub fn is_moving(&self) -> bool {
        matches!(self, MotionState::Opening | MotionState::Closing)
    }
}

/// Cover feature bits, numbered like the host's cover features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoverFeatures(u32);

impl CoverFeatures {
    pub const OPEN: Self = Self(1);
    pub const CLOSE: Self = Self(2);
    pub const SET_POSITION: Self = Self(4);
    pub const STOP: Self = Self(8);
    pub const OPEN_TILT: Self = Self(16);
    pub const CLOSE_TILT: Self = Self(32);
    pub const STOP_TILT: Self = Self(64);
    pub const SET_TILT_POSITION: Self = Self(128);

    /// Every feature the mapped cover remaps.
    pub const REMAPPED: Self = Self(1 | 2 | 4 | 8 | 16 | 32 | 64 | 128);

    /// Features of a position-only cover.
    pub const POSITION_ONLY: Self = Self(1 | 2 | 4 | 8);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// True when any tilt control is offered.
    pub const fn supports_tilt(&self) -> bool {
        self.intersects(Self(Self::OPEN_TILT.0 | Self::SET_TILT_POSITION.0))
    }
}

impl std::ops::BitOr for CoverFeatures {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl std::ops::BitAnd for CoverFeatures {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.intersection(rhs)
    }
}

/// Capabilities resolved once when a mapped cover is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Tilt can be commanded
    pub tilt: bool,
}

impl Capabilities {
    pub fn from_features(features: CoverFeatures) -> Self {
        Self {
            tilt: features.supports_tilt(),
        }
    }
}

/// Snapshot of a source cover.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceState {
    pub availability: Availability,
    pub motion: MotionState,
    pub current_position: Option<PhysicalValue>,
    pub current_tilt_position: Option<PhysicalValue>,
    pub supported_features: CoverFeatures,
    pub device_class: Option<String>,
    /// Unix timestamp of the last change
    pub last_changed: i64,
}

impl SourceState {
    /// Available cover at the given position.
    pub fn available(position: PhysicalValue) -> Self {
        Self {
            availability: Availability::Available,
            motion: if position == 0 {
                MotionState::Closed
            } else {
                MotionState::Open
            },
            current_position: Some(position),
            current_tilt_position: None,
            supported_features: CoverFeatures::POSITION_ONLY,
            device_class: None,
            last_changed: chrono::Utc::now().timestamp(),
        }
    }

    /// Unavailable cover without attributes.
    pub fn unavailable() -> Self {
        Self {
            availability: Availability::Unavailable,
            last_changed: chrono::Utc::now().timestamp(),
            ..Default::default()
        }
    }

    /// Add a tilt reading and tilt features.
    pub fn with_tilt(mut self, tilt: PhysicalValue) -> Self {
        self.current_tilt_position = Some(tilt);
        self.supported_features = CoverFeatures::REMAPPED;
        self
    }

    pub fn with_motion(mut self, motion: MotionState) -> Self {
        self.motion = motion;
        self
    }

    pub fn with_features(mut self, features: CoverFeatures) -> Self {
        self.supported_features = features;
        self
    }

    pub fn with_device_class(mut self, device_class: impl Into<String>) -> Self {
        self.device_class = Some(device_class.into());
        self
    }

    /// True only when the device is explicitly available.
    pub fn is_available(&self) -> bool {
        self.availability == Availability::Available
    }

    /// Read an attribute. Absent while the device is not available.
    pub fn attribute(&self, attribute: Attribute) -> Option<PhysicalValue> {
        if !self.is_available() {
            return None;
        }
        match attribute {
            Attribute::CurrentPosition => self.current_position,
            Attribute::CurrentTiltPosition => self.current_tilt_position,
        }
    }

    pub fn position(&self) -> Option<PhysicalValue> {
        self.attribute(Attribute::CurrentPosition)
    }

    pub fn tilt_position(&self) -> Option<PhysicalValue> {
        self.attribute(Attribute::CurrentTiltPosition)
    }

    /// True while the device reports movement and is available.
    pub fn is_moving(&self) -> bool {
        self.is_available() && self.motion.is_moving()
    }
}

/// Physical ranges for both axes of one mapped cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AxisRanges {
    pub position: RemapRange,
    pub tilt: RemapRange,
}

impl AxisRanges {
    pub fn for_axis(&self, axis: Axis) -> RemapRange {
        match axis {
            Axis::Position => self.position,
            Axis::Tilt => self.tilt,
        }
    }
}
