//! Metrics accumulator: folds sensor samples into distance, pace, and
//! energy estimates.
//!
//! Pure computation with no lifecycle knowledge. The session engine decides
//! *when* samples reach the accumulator; the accumulator decides *whether*
//! a position fix is believable and what it contributes.

use crate::metrics::kinds::{KindProfile, KindTable};
use crate::samples::{HeartRateSample, PositionFix, SessionKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Mean Earth radius in meters.
const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Configuration for metrics computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Fixes with worse horizontal accuracy than this are rejected (meters)
    pub accuracy_threshold_meters: f64,
    /// Number of accepted fixes in the pace window
    pub pace_window_fixes: usize,
    /// Maximum age of a heart-rate sample still reported as "current" (seconds)
    pub hr_freshness_secs: f64,
    /// Cap on the heart-rate energy multiplier
    pub hr_multiplier_cap: f64,
    /// Average heart rate at which the multiplier starts ramping up (bpm)
    pub hr_ramp_low_bpm: f64,
    /// Average heart rate at which the multiplier reaches the cap (bpm)
    pub hr_ramp_high_bpm: f64,
    /// Body mass used for energy estimation (kg)
    pub body_mass_kg: f64,
    /// Per-kind profiles (plausibility ceilings, energy coefficients)
    pub kinds: KindTable,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            accuracy_threshold_meters: 50.0,
            pace_window_fixes: 5,
            hr_freshness_secs: 10.0,
            hr_multiplier_cap: 2.0,
            hr_ramp_low_bpm: 90.0,
            hr_ramp_high_bpm: 180.0,
            body_mass_kg: 70.0,
            kinds: KindTable::default(),
        }
    }
}

/// Result of feeding one position fix to the accumulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionOutcome {
    /// Fix accepted; `delta_meters` was added to the running total
    Accepted { delta_meters: f64 },
    /// Fix rejected; totals unchanged (the fix may still be kept for the route)
    Rejected(RejectReason),
}

/// Why a position fix was excluded from distance integration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RejectReason {
    /// Horizontal accuracy above the configured threshold
    PoorAccuracy { accuracy_meters: f64 },
    /// Implied speed from the previous accepted fix above the kind's ceiling
    ImplausibleSpeed { speed_mps: f64 },
    /// GPS distance is not meaningful for this session kind
    DistanceDisabled,
}

/// A fix admitted to the pace window.
#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    timestamp: DateTime<Utc>,
    cumulative_meters: f64,
}

/// Folds position and heart-rate samples into live metrics for one session.
pub struct MetricsAccumulator {
    config: MetricsConfig,
    profile: KindProfile,
    /// Previous accepted fix; baseline for the next distance delta
    last_accepted: Option<PositionFix>,
    /// Last N accepted fixes for pace derivation
    window: VecDeque<WindowEntry>,
    total_distance_meters: f64,
    last_heart_rate: Option<HeartRateSample>,
    hr_sum: u64,
    hr_count: u32,
    max_heart_rate: u16,
    /// Highest energy estimate handed out so far; keeps the estimate monotonic
    energy_floor_kcal: f64,
}

impl MetricsAccumulator {
    /// Create an accumulator for a session of the given kind.
    pub fn new(kind: SessionKind, config: MetricsConfig) -> Self {
        let profile = config.kinds.get(kind);
        Self {
            config,
            profile,
            last_accepted: None,
            window: VecDeque::new(),
            total_distance_meters: 0.0,
            last_heart_rate: None,
            hr_sum: 0,
            hr_count: 0,
            max_heart_rate: 0,
            energy_floor_kcal: 0.0,
        }
    }

    /// Feed one position fix.
    ///
    /// Returns whether the fix was accepted and how much distance it added.
    /// Rejected fixes never change the running total.
    pub fn ingest_position(&mut self, fix: &PositionFix) -> PositionOutcome {
        if !self.profile.uses_gps_distance {
            return PositionOutcome::Rejected(RejectReason::DistanceDisabled);
        }

        if fix.horizontal_accuracy_meters > self.config.accuracy_threshold_meters {
            return PositionOutcome::Rejected(RejectReason::PoorAccuracy {
                accuracy_meters: fix.horizontal_accuracy_meters,
            });
        }

        let delta_meters = match &self.last_accepted {
            Some(prev) => {
                let delta = haversine_meters(prev, fix);
                let elapsed = (fix.timestamp - prev.timestamp)
                    .num_milliseconds() as f64
                    / 1000.0;
                // Zero or backwards elapsed time gives no believable speed;
                // covers duplicate timestamps from jittery delivery.
                let speed_mps = if elapsed > 0.0 {
                    delta / elapsed
                } else {
                    f64::INFINITY
                };
                if speed_mps > self.profile.max_speed_mps {
                    tracing::debug!(speed_mps, delta, "rejected implausible fix");
                    return PositionOutcome::Rejected(RejectReason::ImplausibleSpeed {
                        speed_mps,
                    });
                }
                delta
            }
            None => 0.0,
        };

        self.total_distance_meters += delta_meters;
        self.last_accepted = Some(fix.clone());
        self.window.push_back(WindowEntry {
            timestamp: fix.timestamp,
            cumulative_meters: self.total_distance_meters,
        });
        while self.window.len() > self.config.pace_window_fixes {
            self.window.pop_front();
        }

        PositionOutcome::Accepted { delta_meters }
    }

    /// Feed one heart-rate sample, updating both the live value and the
    /// running statistics used by the energy estimate.
    pub fn ingest_heart_rate(&mut self, sample: HeartRateSample) {
        self.hr_sum += u64::from(sample.bpm);
        self.hr_count += 1;
        self.max_heart_rate = self.max_heart_rate.max(sample.bpm);
        self.last_heart_rate = Some(sample);
    }

    /// Update only the live heart-rate value, leaving the statistics
    /// untouched. Used while the session is paused so the vitals readout
    /// stays fresh without moving any metric totals.
    pub fn touch_heart_rate(&mut self, sample: HeartRateSample) {
        self.last_heart_rate = Some(sample);
    }

    /// Total accepted distance in meters. Monotonic non-decreasing.
    pub fn total_distance_meters(&self) -> f64 {
        self.total_distance_meters
    }

    /// Current pace as time per kilometer, derived from the pace window.
    ///
    /// `None` (not zero) when fewer than two accepted fixes exist in the
    /// window or the window covers no distance. Callers must treat `None`
    /// distinctly from a zero pace.
    pub fn current_pace(&self) -> Option<Duration> {
        let first = self.window.front()?;
        let last = self.window.back()?;
        if self.window.len() < 2 {
            return None;
        }

        let meters = last.cumulative_meters - first.cumulative_meters;
        let elapsed = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0;
        if meters <= 0.0 || elapsed <= 0.0 {
            return None;
        }

        let secs_per_km = elapsed / (meters / 1000.0);
        Some(Duration::from_secs_f64(secs_per_km))
    }

    /// Most recent heart rate, or `None` if the latest sample is older than
    /// the freshness window. Stale data is reported as absent, never as a
    /// stale number.
    pub fn current_heart_rate(&self, now: DateTime<Utc>) -> Option<u16> {
        let sample = self.last_heart_rate?;
        let age_secs = (now - sample.timestamp).num_milliseconds() as f64 / 1000.0;
        if age_secs <= self.config.hr_freshness_secs {
            Some(sample.bpm)
        } else {
            None
        }
    }

    /// Average heart rate over all ingested samples.
    pub fn average_heart_rate(&self) -> Option<u16> {
        if self.hr_count > 0 {
            Some((self.hr_sum / u64::from(self.hr_count)) as u16)
        } else {
            None
        }
    }

    /// Maximum heart rate over all ingested samples.
    pub fn max_heart_rate(&self) -> Option<u16> {
        if self.max_heart_rate > 0 {
            Some(self.max_heart_rate)
        } else {
            None
        }
    }

    /// Estimated energy expenditure in kcal for the given active duration.
    ///
    /// Kind coefficient x body mass x active hours, scaled by a heart-rate
    /// multiplier when heart-rate data is present. Clamped so the returned
    /// value never decreases across calls.
    pub fn estimated_energy_kcal(&mut self, active: Duration) -> f64 {
        let hours = active.as_secs_f64() / 3600.0;
        let base = self.profile.kcal_per_kg_hour * self.config.body_mass_kg * hours;
        let estimate = base * self.heart_rate_multiplier();

        if estimate > self.energy_floor_kcal {
            self.energy_floor_kcal = estimate;
        }
        self.energy_floor_kcal
    }

    /// Multiplier from sustained heart rate: 1.0 up to the ramp floor,
    /// linear up to the cap at the ramp ceiling.
    fn heart_rate_multiplier(&self) -> f64 {
        let Some(avg) = self.average_heart_rate() else {
            return 1.0;
        };
        let avg = f64::from(avg);
        let low = self.config.hr_ramp_low_bpm;
        let high = self.config.hr_ramp_high_bpm;
        let cap = self.config.hr_multiplier_cap;
        if avg <= low || high <= low {
            return 1.0;
        }
        let fraction = ((avg - low) / (high - low)).min(1.0);
        1.0 + fraction * (cap - 1.0)
    }
}

/// Great-circle distance between two fixes in meters (haversine).
pub fn haversine_meters(a: &PositionFix, b: &PositionFix) -> f64 {
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_METERS * c
}
