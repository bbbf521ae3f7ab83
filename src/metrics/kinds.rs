//! Per-kind metric parameters.
//!
//! Each `SessionKind` maps to a profile: whether GPS distance is meaningful,
//! the maximum believable instantaneous speed (used to reject GPS jumps),
//! and the energy-expenditure coefficient. The table is keyed by the closed
//! kind enum so a new kind cannot be added without a profile.

use crate::samples::SessionKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metric parameters for one session kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KindProfile {
    /// Whether GPS-based distance accrual applies to this kind
    pub uses_gps_distance: bool,
    /// Plausibility ceiling in m/s; fixes implying a faster speed are rejected
    pub max_speed_mps: f64,
    /// Energy coefficient in kcal per kg of body mass per hour
    pub kcal_per_kg_hour: f64,
}

impl KindProfile {
    /// Default profile for a kind.
    pub fn defaults_for(kind: SessionKind) -> Self {
        match kind {
            SessionKind::Running => Self {
                uses_gps_distance: true,
                max_speed_mps: 12.0,
                kcal_per_kg_hour: 9.8,
            },
            SessionKind::Walking => Self {
                uses_gps_distance: true,
                max_speed_mps: 4.0,
                kcal_per_kg_hour: 3.5,
            },
            SessionKind::Cycling => Self {
                uses_gps_distance: true,
                max_speed_mps: 25.0,
                kcal_per_kg_hour: 7.5,
            },
            SessionKind::Swimming => Self {
                uses_gps_distance: false,
                max_speed_mps: 3.0,
                kcal_per_kg_hour: 8.0,
            },
            SessionKind::StrengthTraining => Self {
                uses_gps_distance: false,
                max_speed_mps: 0.0,
                kcal_per_kg_hour: 5.0,
            },
            SessionKind::Yoga => Self {
                uses_gps_distance: false,
                max_speed_mps: 0.0,
                kcal_per_kg_hour: 2.5,
            },
            SessionKind::Hiking => Self {
                uses_gps_distance: true,
                max_speed_mps: 4.0,
                kcal_per_kg_hour: 6.0,
            },
            SessionKind::Other => Self {
                uses_gps_distance: true,
                max_speed_mps: 15.0,
                kcal_per_kg_hour: 4.0,
            },
        }
    }
}

/// Lookup table from session kind to profile.
///
/// The default table covers every kind; hosts may override individual
/// entries through configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindTable {
    profiles: BTreeMap<SessionKind, KindProfile>,
}

impl Default for KindTable {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        for kind in SessionKind::ALL {
            profiles.insert(kind, KindProfile::defaults_for(kind));
        }
        Self { profiles }
    }
}

impl KindTable {
    /// Get the profile for a kind.
    pub fn get(&self, kind: SessionKind) -> KindProfile {
        self.profiles
            .get(&kind)
            .copied()
            .unwrap_or_else(|| KindProfile::defaults_for(kind))
    }

    /// Override the profile for a kind.
    pub fn set(&mut self, kind: SessionKind, profile: KindProfile) {
        self.profiles.insert(kind, profile);
    }
}
