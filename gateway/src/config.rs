//! Gateway configuration from environment variables
//!
//! | Variable | Default |
//! |----------|---------|
//! | `SURAKSHA_GATEWAY_PORT` / `PORT` | 18700 |
//! | `SURAKSHA_GEOCODE_URL` | `https://nominatim.openstreetmap.org` |
//! | `SURAKSHA_COUNTRY_CODES` | `in` |
//! | `SURAKSHA_SCORER_CONFIG` | built-in tables |
//! | `SURAKSHA_GEOCODE_MIN_DISTANCE_M` | 25 |
//! | `SURAKSHA_POSITIONING` | enabled (`disabled` to turn off) |
//! | `SURAKSHA_CONNECTIVITY_PROBE_URL` | none |
//! | `SURAKSHA_CONNECTIVITY_PROBE_SECS` | 30 |

use anyhow::{Context, Result};
use location_tracking::{ScorerConfig, ServiceConfig};
use std::time::Duration;

const DEFAULT_PORT: u16 = 18700;
const DEFAULT_MIN_DISTANCE_M: f64 = 25.0;
const DEFAULT_PROBE_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    /// False makes the host feed report no positioning capability
    pub positioning_enabled: bool,
    pub probe_url: Option<String>,
    pub probe_interval: Duration,
    pub service: ServiceConfig,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = match lookup("SURAKSHA_GATEWAY_PORT").or_else(|| lookup("PORT")) {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid gateway port {:?}", raw))?,
            None => DEFAULT_PORT,
        };

        let mut service = ServiceConfig::default();

        if let Some(url) = lookup("SURAKSHA_GEOCODE_URL") {
            service.geocode.base_url = url;
        }
        if let Some(codes) = lookup("SURAKSHA_COUNTRY_CODES") {
            service.geocode.country_codes = codes
                .split(',')
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .collect();
        }
        if let Some(path) = lookup("SURAKSHA_SCORER_CONFIG") {
            service.scorer = ScorerConfig::from_json_file(&path)
                .with_context(|| format!("loading scorer tables from {}", path))?;
        }
        service.resolve.min_distance_m = match lookup("SURAKSHA_GEOCODE_MIN_DISTANCE_M") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid minimum distance {:?}", raw))?,
            None => DEFAULT_MIN_DISTANCE_M,
        };
        service.validate()?;

        let positioning_enabled = !matches!(
            lookup("SURAKSHA_POSITIONING").as_deref(),
            Some("disabled") | Some("off") | Some("false")
        );

        let probe_secs = match lookup("SURAKSHA_CONNECTIVITY_PROBE_SECS") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid probe interval {:?}", raw))?,
            None => DEFAULT_PROBE_SECS,
        };

        Ok(Self {
            port,
            positioning_enabled,
            probe_url: lookup("SURAKSHA_CONNECTIVITY_PROBE_URL").filter(|u| !u.is_empty()),
            probe_interval: Duration::from_secs(probe_secs.max(1)),
            service,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn config(vars: &[(&str, &str)]) -> Result<GatewayConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.port, 18700);
        assert!(config.positioning_enabled);
        assert!(config.probe_url.is_none());
        assert_eq!(config.probe_interval, Duration::from_secs(30));
        assert_eq!(config.service.resolve.min_distance_m, 25.0);
        assert_eq!(config.service.geocode.country_codes, vec!["in".to_string()]);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("PORT", "9000"),
            ("SURAKSHA_GEOCODE_URL", "http://localhost:8088"),
            ("SURAKSHA_COUNTRY_CODES", "IN, np"),
            ("SURAKSHA_GEOCODE_MIN_DISTANCE_M", "0"),
            ("SURAKSHA_POSITIONING", "disabled"),
            ("SURAKSHA_CONNECTIVITY_PROBE_URL", "http://localhost:8088/status"),
        ])
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.service.geocode.base_url, "http://localhost:8088");
        assert_eq!(
            config.service.geocode.country_codes,
            vec!["in".to_string(), "np".to_string()]
        );
        assert_eq!(config.service.resolve.min_distance_m, 0.0);
        assert!(!config.positioning_enabled);
        assert_eq!(
            config.probe_url.as_deref(),
            Some("http://localhost:8088/status")
        );
    }

    #[test]
    fn test_gateway_port_wins_over_port() {
        let config = config(&[("SURAKSHA_GATEWAY_PORT", "18701"), ("PORT", "9000")]).unwrap();
        assert_eq!(config.port, 18701);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(config(&[("PORT", "not-a-port")]).is_err());
        assert!(config(&[("SURAKSHA_GEOCODE_MIN_DISTANCE_M", "-3")]).is_err());
        assert!(config(&[("SURAKSHA_SCORER_CONFIG", "/nonexistent/tables.json")]).is_err());
    }

    #[test]
    fn test_scorer_tables_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"major_cities": ["Kathmandu"]}"#).unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = config(&[("SURAKSHA_SCORER_CONFIG", path.as_str())]).unwrap();
        assert_eq!(config.service.scorer.major_cities, vec!["Kathmandu".to_string()]);
    }
}
