//! Session entities: lifecycle states, the in-flight session, the immutable
//! summary, and session errors.

use crate::permissions::Capability;
use crate::samples::{HeartRateSample, PositionFix, SessionKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle state of a workout session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session in flight
    #[default]
    Idle,
    /// Capability checks in flight
    Starting,
    /// Accepting sensor data, duration accruing
    Active,
    /// Duration, distance, and energy frozen
    Paused,
    /// Finalizing the summary and handing it to persistence
    Ending,
    /// Terminal; the session is immutable
    Completed,
    /// Terminal; cancelled or lost a required capability
    Aborted,
}

impl SessionState {
    /// Whether the session is finished (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Starting => write!(f, "Starting"),
            SessionState::Active => write!(f, "Active"),
            SessionState::Paused => write!(f, "Paused"),
            SessionState::Ending => write!(f, "Ending"),
            SessionState::Completed => write!(f, "Completed"),
            SessionState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Why a session was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// A required capability was denied at start
    CapabilityDenied(Capability),
    /// A required capability was revoked mid-session
    CapabilityLost(Capability),
    /// Explicit cancel from the host
    Cancelled,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::CapabilityDenied(cap) => write!(f, "capability denied: {cap}"),
            AbortReason::CapabilityLost(cap) => write!(f, "capability lost: {cap}"),
            AbortReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The in-flight workout session.
///
/// Mutated only by the session engine; `active_duration` and
/// `total_distance_meters` never decrease, and nothing changes after a
/// terminal state is reached.
#[derive(Debug, Clone)]
pub struct WorkoutSession {
    /// Unique identifier, assigned at creation
    pub id: Uuid,
    /// Kind, fixed at creation
    pub kind: SessionKind,
    /// Current lifecycle state
    pub state: SessionState,
    /// Set on the transition to Active
    pub started_at: Option<DateTime<Utc>>,
    /// Accumulated active time, excluding paused intervals
    pub active_duration: Duration,
    /// All received fixes in arrival order, including rejected ones
    pub route: Vec<PositionFix>,
    /// All received heart-rate samples in arrival order
    pub heart_rate_samples: Vec<HeartRateSample>,
    /// Accepted distance total in meters
    pub total_distance_meters: f64,
    /// Running energy estimate in kcal
    pub estimated_energy_kcal: f64,
    /// Whether location integration is on for this session
    pub location_enabled: bool,
    /// Set when the session continues without a normally-expected capability
    pub degraded: bool,
}

impl WorkoutSession {
    /// Create a session in the Starting state.
    pub fn new(kind: SessionKind, location_enabled: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            state: SessionState::Starting,
            started_at: None,
            active_duration: Duration::ZERO,
            route: Vec::new(),
            heart_rate_samples: Vec::new(),
            total_distance_meters: 0.0,
            estimated_energy_kcal: 0.0,
            location_enabled,
            degraded: false,
        }
    }
}

/// Immutable snapshot of a finished session; the record handed to
/// persistence. Built exactly once, at the Ending transition (or on abort,
/// for the recover-last-session affordance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session identifier; persistence dedupes on this
    pub id: Uuid,
    /// Session kind
    pub kind: SessionKind,
    /// When the session became Active
    pub started_at: DateTime<Utc>,
    /// When the session ended
    pub ended_at: DateTime<Utc>,
    /// Accumulated active time, excluding paused intervals
    pub active_duration: Duration,
    /// Accepted distance total in meters
    pub total_distance_meters: f64,
    /// Energy estimate in kcal
    pub estimated_energy_kcal: f64,
    /// Average heart rate while active
    pub avg_heart_rate: Option<u16>,
    /// Maximum heart rate while active
    pub max_heart_rate: Option<u16>,
    /// Average speed over active time in m/s, when distance was accrued
    pub avg_speed_mps: Option<f64>,
    /// Route, possibly down-sampled
    pub route: Vec<PositionFix>,
    /// Heart-rate series, possibly down-sampled
    pub heart_rate_samples: Vec<HeartRateSample>,
    /// Opaque provenance key/value pairs
    pub source_metadata: BTreeMap<String, String>,
}

/// Consistent snapshot of live metrics for display.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveMetrics {
    /// Current lifecycle state (Idle when no session is in flight)
    pub state: SessionState,
    /// Active time so far
    pub active_duration: Duration,
    /// Accepted distance so far in meters
    pub total_distance_meters: f64,
    /// Time per kilometer over the pace window; `None` when undefined
    pub current_pace: Option<Duration>,
    /// Fresh heart rate; `None` when absent or stale
    pub current_heart_rate: Option<u16>,
    /// Energy estimate so far in kcal
    pub estimated_energy_kcal: f64,
}

impl Default for LiveMetrics {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            active_duration: Duration::ZERO,
            total_distance_meters: 0.0,
            current_pace: None,
            current_heart_rate: None,
            estimated_energy_kcal: 0.0,
        }
    }
}

/// Errors surfaced by session commands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// A required capability was denied at start
    #[error("capability denied: {0}")]
    CapabilityDenied(Capability),

    /// A required capability was revoked mid-session
    #[error("capability lost: {0}")]
    CapabilityLost(Capability),

    /// Command not valid for the current state
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// State the session was in
        from: SessionState,
        /// State the command asked for
        to: SessionState,
    },

    /// A session is already in flight
    #[error("another session is already in progress")]
    SessionConflict,
}

/// Down-sample a series to at most `cap` entries by stride, always keeping
/// the first and last entries.
pub(crate) fn downsample<T: Clone>(series: &[T], cap: usize) -> Vec<T> {
    if cap == 0 || series.len() <= cap {
        return series.to_vec();
    }
    let stride = series.len().div_ceil(cap);
    let mut out: Vec<T> = series.iter().step_by(stride).cloned().collect();
    // step_by keeps the first entry; make sure the last one survives too
    let last_kept_index = (series.len() - 1) / stride * stride;
    if last_kept_index != series.len() - 1 {
        let last = series[series.len() - 1].clone();
        if out.len() < cap {
            out.push(last);
        } else if let Some(slot) = out.last_mut() {
            *slot = last;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Aborted.is_terminal());
        assert!(!SessionState::Active.is_terminal());
        assert!(!SessionState::Ending.is_terminal());
    }

    #[test]
    fn test_downsample_short_series_untouched() {
        let series: Vec<u32> = (0..10).collect();
        assert_eq!(downsample(&series, 100), series);
    }

    #[test]
    fn test_downsample_keeps_endpoints() {
        let series: Vec<u32> = (0..5000).collect();
        let sampled = downsample(&series, 1000);
        assert!(sampled.len() <= 1000);
        assert_eq!(sampled.first(), Some(&0));
        assert_eq!(sampled.last(), Some(&4999));
    }
}
