//! Detector tuning.
//!
//! Defaults come from hand testing with phones thrown and caught by the same
//! person. All accelerations are m/s², all delays milliseconds.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, DetectorError};

/// Standard gravity in m/s².
pub const STANDARD_GRAVITY: f64 = 9.81;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct DetectorConfig {
    /// Gravity removed from the z axis and used in the height formula.
    pub gravity: f64,
    /// Floor of the adaptive throw trigger.
    pub throw_threshold: f64,
    /// Magnitude below which the phone is considered unsupported.
    pub freefall_threshold: f64,
    /// Magnitude above which a free-fall ends in a catch.
    pub impact_threshold: f64,
    /// Heights above this are clamped (meters).
    pub max_realistic_height: f64,
    /// Shortest free-fall accepted as a throw (seconds, inclusive).
    pub min_freefall_time: f64,
    /// Startup jitter window after arming during which nothing can trigger.
    pub settling_delay_ms: u64,
    /// Overall budget for one throw attempt.
    pub session_timeout_ms: u64,
    /// Number of magnitudes kept for the adaptive threshold.
    pub history_size: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            gravity: STANDARD_GRAVITY,
            throw_threshold: 14.0,
            freefall_threshold: 4.0,
            impact_threshold: 8.0,
            max_realistic_height: 20.0,
            min_freefall_time: 0.1,
            settling_delay_ms: 1000,
            session_timeout_ms: 20_000,
            history_size: 20,
        }
    }
}

impl DetectorConfig {
    /// Load a JSON config file. Missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, DetectorError> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("gravity", self.gravity),
            ("throwThreshold", self.throw_threshold),
            ("freefallThreshold", self.freefall_threshold),
            ("impactThreshold", self.impact_threshold),
            ("maxRealisticHeight", self.max_realistic_height),
            ("minFreefallTime", self.min_freefall_time),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::NotPositive { name, value });
            }
        }
        if self.history_size == 0 {
            return Err(ConfigError::EmptyHistory);
        }
        if self.settling_delay_ms >= self.session_timeout_ms {
            return Err(ConfigError::SettlingExceedsTimeout {
                settling_ms: self.settling_delay_ms,
                timeout_ms: self.session_timeout_ms,
            });
        }
        Ok(())
    }
}
