//! Engine configuration with TOML loading.

use crate::metrics::MetricsConfig;
use crate::storage::gateway::RetryPolicy;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Top-level engine configuration.
///
/// Everything has a sensible default; hosts may override any subset through
/// a TOML file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Metrics thresholds and per-kind profiles
    pub metrics: MetricsConfig,
    /// Persistence retry/backoff policy
    pub persistence: RetryPolicy,
    /// Summary down-sampling caps
    pub summary: SummaryConfig,
}

/// Caps applied when building a summary from the retained series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    /// Maximum route points kept on a summary
    pub route_points_cap: usize,
    /// Maximum heart-rate samples kept on a summary
    pub heart_rate_points_cap: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            route_points_cap: 1000,
            heart_rate_points_cap: 1000,
        }
    }
}

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the config file
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl EngineConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Platform config file path (`config.toml` under the app config dir).
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "stridelog", "stridelog")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the platform config path, falling back to defaults when the
    /// file is absent. A present-but-invalid file is an error rather than a
    /// silent fallback.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(&path)?;
                tracing::info!(path = %path.display(), "loaded engine config");
                Self::from_toml(&text)
            }
            _ => Ok(Self::default()),
        }
    }
}
