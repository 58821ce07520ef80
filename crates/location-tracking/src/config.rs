//! Service configuration

use crate::geocode::GeocodeConfig;
use crate::position::PositionOptions;
use crate::scorer::ScorerConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// When to skip a reverse lookup for a new sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvePolicy {
    /// Samples closer than this to the last resolved position reuse its
    /// address. 0 resolves every sample.
    pub min_distance_m: f64,
}

impl Default for ResolvePolicy {
    fn default() -> Self {
        Self {
            min_distance_m: 0.0,
        }
    }
}

/// Everything a [`crate::LocationService`] needs besides its collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Options for the continuous watch
    pub watch: PositionOptions,
    /// Options for one-shot refresh requests
    pub refresh: PositionOptions,
    pub geocode: GeocodeConfig,
    pub scorer: ScorerConfig,
    pub resolve: ResolvePolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            watch: PositionOptions::watch(),
            refresh: PositionOptions::one_shot(),
            geocode: GeocodeConfig::default(),
            scorer: ScorerConfig::default(),
            resolve: ResolvePolicy::default(),
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.resolve.min_distance_m.is_finite() || self.resolve.min_distance_m < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "resolve.min_distance_m must be a non-negative number, got {}",
                self.resolve.min_distance_m
            )));
        }
        if self.watch.timeout_ms == 0 || self.refresh.timeout_ms == 0 {
            return Err(ConfigError::Invalid("position timeouts must be non-zero".into()));
        }
        self.geocode.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert!(config.watch.enable_high_accuracy);
        assert_eq!(config.watch.timeout(), Duration::from_secs(15));
        assert_eq!(config.watch.maximum_age(), Duration::from_secs(60));
        assert!(config.refresh.timeout() < config.watch.timeout());
        assert_eq!(config.resolve.min_distance_m, 0.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_negative_distance_rejected() {
        let mut config = ServiceConfig::default();
        config.resolve.min_distance_m = -5.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_partial_json() {
        let config: ServiceConfig =
            serde_json::from_str(r#"{"resolve": {"min_distance_m": 25.0}}"#).unwrap();
        assert_eq!(config.resolve.min_distance_m, 25.0);
        assert_eq!(config.geocode.country_codes, vec!["in".to_string()]);
    }
}
