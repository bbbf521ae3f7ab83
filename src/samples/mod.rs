//! Sensor sample value types.

pub mod types;

pub use types::{HeartRateSample, PositionFix, SessionKind};
