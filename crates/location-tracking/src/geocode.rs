//! Reverse Geocoding
//!
//! Turns a position into a readable place through Nominatim (OpenStreetMap,
//! no API key). Lookup failures never reach the caller: the coordinate form
//! is returned instead, with the reason attached.
//!
//! # Usage
//!
//! ```rust,ignore
//! let resolver = NominatimResolver::new(GeocodeConfig::default())?;
//! let address = resolver.resolve(&Position::new(28.6139, 77.2090)).await;
//! println!("{}", address.text);
//! ```

use crate::config::ConfigError;
use crate::Position;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

/// Reverse geocoding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocodeConfig {
    /// Nominatim base URL (the `/reverse` path is appended)
    pub base_url: String,
    /// ISO 3166-1 alpha-2 codes biasing the result set
    pub country_codes: Vec<String>,
    /// Preferred language for place names
    pub language: String,
    /// Nominatim's usage policy requires an identifying agent
    pub user_agent: String,
    /// Request timeout in seconds
    pub timeout_sec: u64,
    /// Cache TTL in seconds (default: 300 = 5 minutes)
    pub cache_ttl_sec: u64,
    /// Maximum concurrent lookups
    pub max_concurrent: usize,
    /// Decimal places of the coordinates sent upstream (4-6)
    pub coordinate_precision: usize,
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            country_codes: vec!["in".to_string()],
            language: "en".to_string(),
            user_agent: concat!("suraksha-location/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_sec: 10,
            cache_ttl_sec: 300,
            max_concurrent: 2,
            coordinate_precision: 6,
        }
    }
}

impl GeocodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("geocode.base_url is empty".into()));
        }
        if !(4..=6).contains(&self.coordinate_precision) {
            return Err(ConfigError::Invalid(format!(
                "geocode.coordinate_precision must be 4-6, got {}",
                self.coordinate_precision
            )));
        }
        if self.max_concurrent == 0 || self.timeout_sec == 0 {
            return Err(ConfigError::Invalid(
                "geocode.max_concurrent and geocode.timeout_sec must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Why a lookup produced no place name
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeocodeError {
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("Geocoder returned status {0}")]
    Status(u16),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("No address found")]
    EmptyResult,
    #[error("Rate limited")]
    RateLimited,
    #[error("Network offline")]
    Offline,
}

/// Whether an address came from the lookup or the coordinate fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressSource {
    Resolved,
    Fallback,
}

/// Formatted place text for one position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAddress {
    pub text: String,
    pub source: AddressSource,
    /// Reason the lookup failed, for fallbacks
    pub failure: Option<String>,
}

impl ResolvedAddress {
    pub fn resolved(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: AddressSource::Resolved,
            failure: None,
        }
    }

    pub fn fallback(position: &Position, error: &GeocodeError) -> Self {
        Self {
            text: position.fallback_label(),
            source: AddressSource::Fallback,
            failure: Some(error.to_string()),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.source == AddressSource::Fallback
    }
}

/// Structured address fields as returned by Nominatim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressComponents {
    pub house_number: Option<String>,
    pub road: Option<String>,
    pub street: Option<String>,
    pub suburb: Option<String>,
    pub neighbourhood: Option<String>,
    pub city: Option<String>,
    pub town: Option<String>,
    pub village: Option<String>,
    pub state_district: Option<String>,
    pub state: Option<String>,
    pub postcode: Option<String>,
}

impl AddressComponents {
    /// Join present parts in fixed order: number, street, neighbourhood,
    /// locality, district (unless equal to state), state, postcode.
    /// `None` when no part is present.
    pub fn format(&self) -> Option<String> {
        let street = first_present(&[&self.road, &self.street]);
        let neighbourhood = first_present(&[&self.suburb, &self.neighbourhood]);
        let locality = first_present(&[&self.city, &self.town, &self.village]);
        let state = first_present(&[&self.state]);
        let district = first_present(&[&self.state_district]).filter(|d| Some(*d) != state);

        let parts: Vec<&str> = [
            first_present(&[&self.house_number]),
            street,
            neighbourhood,
            locality,
            district,
            state,
            first_present(&[&self.postcode]),
        ]
        .into_iter()
        .flatten()
        .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

fn first_present<'a>(fields: &[&'a Option<String>]) -> Option<&'a str> {
    fields
        .iter()
        .filter_map(|f| f.as_deref())
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// Nominatim reverse response
#[derive(Debug, Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    address: Option<AddressComponents>,
    #[serde(default)]
    error: Option<String>,
}

impl ReverseResponse {
    fn into_text(self) -> Result<String, GeocodeError> {
        if let Some(error) = self.error {
            debug!("Geocoder reported: {}", error);
            return Err(GeocodeError::EmptyResult);
        }
        if let Some(text) = self.address.as_ref().and_then(AddressComponents::format) {
            return Ok(text);
        }
        self.display_name
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .ok_or(GeocodeError::EmptyResult)
    }
}

/// Reverse lookup capability
#[async_trait]
pub trait GeocodeResolver: Send + Sync {
    /// Always yields an address; failures come back as the coordinate form
    async fn resolve(&self, position: &Position) -> ResolvedAddress;
}

/// Cache entry with expiry
struct CacheEntry {
    text: String,
    expires_at: Instant,
}

/// Nominatim reverse geocoding client
pub struct NominatimResolver {
    config: GeocodeConfig,
    client: reqwest::Client,
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    permits: Semaphore,
}

impl NominatimResolver {
    pub fn new(config: GeocodeConfig) -> Result<Self, GeocodeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_sec))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| GeocodeError::RequestFailed(e.to_string()))?;

        Ok(Self::with_client(config, client))
    }

    /// Use a preconfigured client; its timeout bounds each lookup
    pub fn with_client(config: GeocodeConfig, client: reqwest::Client) -> Self {
        let permits = Semaphore::new(config.max_concurrent.max(1));
        Self {
            config,
            client,
            cache: Arc::new(RwLock::new(HashMap::new())),
            permits,
        }
    }

    /// Cache key from coordinates (rounded to 5 decimal places, ~1 m)
    fn cache_key(lat: f64, lon: f64) -> String {
        format!("{:.5},{:.5}", lat, lon)
    }

    /// Formatted place text, or the reason there is none
    pub async fn lookup(&self, lat: f64, lon: f64) -> Result<String, GeocodeError> {
        let key = Self::cache_key(lat, lon);

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&key) {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.text.clone());
                }
            }
        }

        let text = {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| GeocodeError::RequestFailed(e.to_string()))?;
            self.fetch(lat, lon).await?
        };

        {
            let now = Instant::now();
            let mut cache = self.cache.write().await;
            cache.retain(|_, e| e.expires_at > now);
            cache.insert(
                key,
                CacheEntry {
                    text: text.clone(),
                    expires_at: now + Duration::from_secs(self.config.cache_ttl_sec),
                },
            );
        }

        Ok(text)
    }

    async fn fetch(&self, lat: f64, lon: f64) -> Result<String, GeocodeError> {
        let url = format!("{}/reverse", self.config.base_url.trim_end_matches('/'));
        let precision = self.config.coordinate_precision;

        let mut params: Vec<(&str, String)> = vec![
            ("format", "json".to_string()),
            ("lat", format!("{:.*}", precision, lat)),
            ("lon", format!("{:.*}", precision, lon)),
            ("addressdetails", "1".to_string()),
            ("accept-language", self.config.language.clone()),
            ("limit", "1".to_string()),
        ];
        if !self.config.country_codes.is_empty() {
            params.push(("countrycodes", self.config.country_codes.join(",")));
        }

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| GeocodeError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GeocodeError::RateLimited);
        }
        if !status.is_success() {
            return Err(GeocodeError::Status(status.as_u16()));
        }

        let data: ReverseResponse = response
            .json()
            .await
            .map_err(|e| GeocodeError::ParseError(e.to_string()))?;

        data.into_text()
    }

    /// Clear the cache
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        cache.clear();
    }

    /// Get cache statistics (total, unexpired)
    pub async fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.read().await;
        let total = cache.len();
        let valid = cache
            .values()
            .filter(|e| e.expires_at > Instant::now())
            .count();
        (total, valid)
    }
}

#[async_trait]
impl GeocodeResolver for NominatimResolver {
    async fn resolve(&self, position: &Position) -> ResolvedAddress {
        match self.lookup(position.latitude, position.longitude).await {
            Ok(text) => ResolvedAddress::resolved(text),
            Err(e) => {
                warn!(
                    "Reverse geocoding failed for {}: {}",
                    position.fallback_label(),
                    e
                );
                ResolvedAddress::fallback(position, &e)
            }
        }
    }
}
