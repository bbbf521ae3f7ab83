//! Value types for position and heart-rate samples, plus the session kind enum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A single location sample from the platform location service.
///
/// Ordering compares timestamps only. Consumers must tolerate out-of-order
/// or duplicate timestamps; arrival order is authoritative and the engine
/// never re-sorts fixes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionFix {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Altitude above sea level in meters
    pub altitude_meters: f64,
    /// Estimated horizontal accuracy radius in meters
    pub horizontal_accuracy_meters: f64,
    /// When the fix was produced
    pub timestamp: DateTime<Utc>,
}

impl PositionFix {
    /// Create a fix at the given coordinates with the given accuracy.
    pub fn new(
        latitude: f64,
        longitude: f64,
        horizontal_accuracy_meters: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            latitude,
            longitude,
            altitude_meters: 0.0,
            horizontal_accuracy_meters,
            timestamp,
        }
    }
}

impl PartialEq for PositionFix {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
    }
}

impl PartialOrd for PositionFix {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.timestamp.cmp(&other.timestamp))
    }
}

/// A single heart-rate sample.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeartRateSample {
    /// Heart rate in beats per minute
    pub bpm: u16,
    /// When the sample was produced
    pub timestamp: DateTime<Utc>,
}

impl HeartRateSample {
    /// Create a new heart-rate sample.
    pub fn new(bpm: u16, timestamp: DateTime<Utc>) -> Self {
        Self { bpm, timestamp }
    }
}

impl PartialEq for HeartRateSample {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
    }
}

impl PartialOrd for HeartRateSample {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.timestamp.cmp(&other.timestamp))
    }
}

/// Kind of workout session.
///
/// Determines whether GPS distance integration is meaningful and which
/// energy-estimation coefficient applies (see `metrics::kinds`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Outdoor or treadmill running
    Running,
    /// Walking
    Walking,
    /// Road or trail cycling
    Cycling,
    /// Pool or open-water swimming
    Swimming,
    /// Gym strength training
    StrengthTraining,
    /// Yoga
    Yoga,
    /// Hiking
    Hiking,
    /// Anything else
    Other,
}

impl SessionKind {
    /// All kinds, for table construction and exhaustive iteration.
    pub const ALL: [SessionKind; 8] = [
        SessionKind::Running,
        SessionKind::Walking,
        SessionKind::Cycling,
        SessionKind::Swimming,
        SessionKind::StrengthTraining,
        SessionKind::Yoga,
        SessionKind::Hiking,
        SessionKind::Other,
    ];
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKind::Running => write!(f, "Running"),
            SessionKind::Walking => write!(f, "Walking"),
            SessionKind::Cycling => write!(f, "Cycling"),
            SessionKind::Swimming => write!(f, "Swimming"),
            SessionKind::StrengthTraining => write!(f, "Strength Training"),
            SessionKind::Yoga => write!(f, "Yoga"),
            SessionKind::Hiking => write!(f, "Hiking"),
            SessionKind::Other => write!(f, "Other"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fix_ordering_by_timestamp() {
        let earlier = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 5).unwrap();

        let a = PositionFix::new(48.85, 2.35, 5.0, earlier);
        let b = PositionFix::new(48.86, 2.36, 5.0, later);

        assert!(a < b);
        // Equality ignores coordinates
        let c = PositionFix::new(0.0, 0.0, 100.0, earlier);
        assert_eq!(a, c);
    }

    #[test]
    fn test_kind_serde_round_trip() {
        let json = serde_json::to_string(&SessionKind::StrengthTraining).unwrap();
        assert_eq!(json, "\"strength_training\"");
        let back: SessionKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SessionKind::StrengthTraining);
    }
}
