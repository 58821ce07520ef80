//! Safety score heuristic
//!
//! Additive, table-driven model clamped to 0-100:
//!
//! ```text
//! Score = Base + B_acc + B_city + B_amenity + B_region
//! ```
//!
//! | Term      | Value | Condition |
//! |-----------|-------|-----------|
//! | Base      | 70    | tracking active |
//! | Base      | 75    | idle or failed (neutral, no bonuses) |
//! | B_acc     | 15/10/5/0 | accuracy < 10 / < 50 / < 100 / otherwise |
//! | B_city    | 10    | address names a major population centre |
//! | B_amenity | 8     | address contains an amenity keyword |
//! | B_region  | 5     | address names a tourism-heavy region |
//!
//! Table entries match whole words of the address, ignoring case. The
//! tables live in [`ScorerConfig`] so other regions can swap them.

use crate::config::ConfigError;
use crate::{Position, TrackingState};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Base score for an actively tracked position
pub const BASE_ACTIVE: u8 = 70;
/// Neutral score when nothing is being tracked
pub const BASE_UNTRACKED: u8 = 75;

pub const BONUS_MAJOR_CITY: u8 = 10;
pub const BONUS_AMENITY: u8 = 8;
pub const BONUS_TOURISM_REGION: u8 = 5;

/// Upper bound of the score range
pub const MAX_SCORE: u8 = 100;

/// Safety score in [0, 100]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SafetyScore(u8);

impl SafetyScore {
    /// Clamps to [0, 100]
    pub fn new(value: u8) -> Self {
        Self(value.min(MAX_SCORE))
    }

    pub fn neutral() -> Self {
        Self(BASE_UNTRACKED)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for SafetyScore {
    fn default() -> Self {
        Self::neutral()
    }
}

impl std::fmt::Display for SafetyScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Swappable bonus tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// High-traffic population centres
    pub major_cities: Vec<String>,
    /// Tourist amenity keywords
    pub amenity_keywords: Vec<String>,
    /// Tourism-heavy regions
    pub tourism_regions: Vec<String>,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        fn owned(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }

        Self {
            major_cities: owned(&[
                "New Delhi",
                "Delhi",
                "Mumbai",
                "Bengaluru",
                "Bangalore",
                "Chennai",
                "Kolkata",
                "Hyderabad",
                "Pune",
                "Ahmedabad",
                "Jaipur",
            ]),
            amenity_keywords: owned(&[
                "airport", "hotel", "mall", "tourist", "museum", "historic", "station",
                "shopping",
            ]),
            tourism_regions: owned(&[
                "Goa",
                "Kerala",
                "Rajasthan",
                "Agra",
                "Varanasi",
                "Rishikesh",
                "Udaipur",
                "Shimla",
                "Manali",
                "Darjeeling",
            ]),
        }
    }
}

impl ScorerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading scorer tables from {:?}", path);
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let tables = [
            ("major_cities", &self.major_cities),
            ("amenity_keywords", &self.amenity_keywords),
            ("tourism_regions", &self.tourism_regions),
        ];
        for (name, entries) in tables {
            if entries.iter().any(|e| e.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!("{} contains an empty entry", name)));
            }
        }
        Ok(())
    }
}

/// Pure scorer over the configured tables
#[derive(Debug, Clone)]
pub struct RiskScorer {
    major_cities: Vec<String>,
    amenity_keywords: Vec<String>,
    tourism_regions: Vec<String>,
}

impl RiskScorer {
    pub fn new(config: &ScorerConfig) -> Self {
        // Matching is case-insensitive; lowercase the tables once
        fn lower(entries: &[String]) -> Vec<String> {
            entries.iter().map(|e| e.trim().to_lowercase()).collect()
        }

        Self {
            major_cities: lower(&config.major_cities),
            amenity_keywords: lower(&config.amenity_keywords),
            tourism_regions: lower(&config.tourism_regions),
        }
    }

    /// Score a position and its address text under the given tracking state
    pub fn score(
        &self,
        position: Option<&Position>,
        address: &str,
        tracking: TrackingState,
    ) -> SafetyScore {
        if tracking != TrackingState::Active {
            return SafetyScore::neutral();
        }

        let text = address.to_lowercase();

        let accuracy_bonus = accuracy_bonus(position.and_then(|p| p.accuracy));
        let city_bonus = if contains_any(&text, &self.major_cities) {
            BONUS_MAJOR_CITY
        } else {
            0
        };
        let amenity_bonus = if contains_any(&text, &self.amenity_keywords) {
            BONUS_AMENITY
        } else {
            0
        };
        let region_bonus = if contains_any(&text, &self.tourism_regions) {
            BONUS_TOURISM_REGION
        } else {
            0
        };

        // u16 so the all-bonus sum (108) cannot wrap before the clamp
        let total = BASE_ACTIVE as u16
            + accuracy_bonus as u16
            + city_bonus as u16
            + amenity_bonus as u16
            + region_bonus as u16;

        SafetyScore::new(total.min(MAX_SCORE as u16) as u8)
    }
}

impl Default for RiskScorer {
    fn default() -> Self {
        Self::new(&ScorerConfig::default())
    }
}

/// Accuracy bonus by radius in metres
pub fn accuracy_bonus(accuracy: Option<f64>) -> u8 {
    match accuracy {
        Some(a) if a < 10.0 => 15,
        Some(a) if a < 50.0 => 10,
        Some(a) if a < 100.0 => 5,
        _ => 0,
    }
}

fn contains_any(text: &str, entries: &[String]) -> bool {
    entries
        .iter()
        .any(|e| !e.is_empty() && contains_word(text, e))
}

/// `word` occurs in `text` with no letter or digit directly on either side
fn contains_word(text: &str, word: &str) -> bool {
    text.match_indices(word).any(|(start, _)| {
        let before = text[..start].chars().next_back();
        let after = text[start + word.len()..].chars().next();
        !before.map_or(false, char::is_alphanumeric) && !after.map_or(false, char::is_alphanumeric)
    })
}
