//! Location Tracking & Risk Scoring
//!
//! Keeps a continuously updated position for the traveller, resolves it to a
//! readable place through reverse geocoding, follows connectivity loss and
//! recovery, and derives a bounded safety score from the resolved place.
//!
//! # Data Flow
//!
//! ```text
//! PositionSource ──sample──▶ LocationService ──resolve──▶ GeocodeResolver
//!        │                        │    ▲                        │
//!        └──error────────────────▶│    └────────address─────────┘
//! ConnectivityMonitor ──online───▶│──score──▶ RiskScorer
//!                                 ▼
//!                     watch<Arc<LocationSnapshot>> ──▶ observers
//! ```
//!
//! Every transition ends with a complete [`LocationSnapshot`] replacing the
//! previous one, so observers never see a position paired with an address
//! from a different position.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

pub mod config;
pub mod connectivity;
pub mod geocode;
pub mod position;
pub mod scorer;
pub mod service;

pub use config::{ConfigError, ResolvePolicy, ServiceConfig};
pub use connectivity::{
    ConnectivityMonitor, ConnectivityProbe, ConnectivityUpdate, HostConnectivity,
};
pub use geocode::{
    AddressComponents, AddressSource, GeocodeConfig, GeocodeError, GeocodeResolver,
    NominatimResolver, ResolvedAddress,
};
pub use position::{
    HostPositionFeed, PositionError, PositionEvent, PositionOptions, PositionSource,
    PositionWatch, WatchId,
};
pub use scorer::{RiskScorer, SafetyScore, ScorerConfig};
pub use service::LocationService;

/// Address shown before the first sample arrives
pub const ADDRESS_LOCATING: &str = "Locating...";
/// Address shown while a manual refresh is outstanding
pub const ADDRESS_UPDATING: &str = "Updating location...";
/// Address shown after the position source reports a failure
pub const ADDRESS_UNAVAILABLE: &str = "Location unavailable";
/// Address shown when a manual refresh fails
pub const ADDRESS_REFRESH_FAILED: &str = "Unable to update location";
/// Address shown when the host has no positioning capability
pub const ADDRESS_UNSUPPORTED: &str = "Geolocation not supported";

/// Mean Earth radius in metres
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A single position sample. Replaced wholesale, never merged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Accuracy radius in metres
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    /// Finite coordinates in range, accuracy absent or non-negative
    pub fn is_valid(&self) -> bool {
        let lat_ok = self.latitude.is_finite() && (-90.0..=90.0).contains(&self.latitude);
        let lon_ok = self.longitude.is_finite() && (-180.0..=180.0).contains(&self.longitude);
        let acc_ok = self
            .accuracy
            .map_or(true, |a| a.is_finite() && a >= 0.0);
        lat_ok && lon_ok && acc_ok
    }

    /// Coordinate form used when no place name is available
    pub fn fallback_label(&self) -> String {
        format!("{:.4}, {:.4}", self.latitude, self.longitude)
    }

    /// Great-circle distance to another position in metres
    pub fn distance_m(&self, other: &Position) -> f64 {
        haversine_m(self.latitude, self.longitude, other.latitude, other.longitude)
    }

    pub fn accuracy_level(&self) -> AccuracyLevel {
        AccuracyLevel::from_accuracy(self.accuracy)
    }
}

/// Display classification of a sample's accuracy radius
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyLevel {
    VeryHigh,
    High,
    Medium,
    Low,
    Unknown,
}

impl AccuracyLevel {
    pub fn from_accuracy(accuracy: Option<f64>) -> Self {
        match accuracy {
            None => Self::Unknown,
            Some(a) if a < 10.0 => Self::VeryHigh,
            Some(a) if a < 50.0 => Self::High,
            Some(a) if a < 100.0 => Self::Medium,
            Some(_) => Self::Low,
        }
    }
}

/// Host network reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn from_online(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }
}

/// Whether the service holds a live, successfully sampled position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
    /// No sample accepted yet
    Idle,
    /// At least one sample accepted and the source is healthy
    Active,
    /// Source reported an error; the last position is kept for display
    Failed,
}

/// Coarse band of a safety score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    Safe,
    Caution,
    HighAlert,
}

impl SafetyLevel {
    pub fn from_score(score: SafetyScore) -> Self {
        match score.value() {
            s if s >= 80 => Self::Safe,
            s if s >= 60 => Self::Caution,
            _ => Self::HighAlert,
        }
    }
}

/// The complete published state of a [`LocationService`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSnapshot {
    pub position: Option<Position>,
    pub address: String,
    pub tracking: TrackingState,
    pub connectivity: ConnectivityState,
    pub last_error: Option<String>,
    pub score: SafetyScore,
    /// Incremented on every publication
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl LocationSnapshot {
    /// State published at construction, before any event
    pub fn initial(connectivity: ConnectivityState, score: SafetyScore) -> Self {
        Self {
            position: None,
            address: ADDRESS_LOCATING.to_string(),
            tracking: TrackingState::Idle,
            connectivity,
            last_error: None,
            score,
            revision: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn safety_level(&self) -> SafetyLevel {
        SafetyLevel::from_score(self.score)
    }

    pub fn accuracy_level(&self) -> AccuracyLevel {
        AccuracyLevel::from_accuracy(self.position.and_then(|p| p.accuracy))
    }
}

/// Haversine distance between two points in metres
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1 * PI / 180.0;
    let lat2_rad = lat2 * PI / 180.0;
    let dlat = (lat2 - lat1) * PI / 180.0;
    let dlon = (lon2 - lon1) * PI / 180.0;

    let a = (dlat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}
