//! Device, observation and capture types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type DeviceId = i64;
pub type CaptureId = i64;
pub type ObservationId = i64;

/// Category inferred from a device's canonical name when it is first created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Keys,
    Bag,
    Luggage,
    Vehicle,
    Wallet,
    Airtag,
}

/// Keyword table scanned in order; first hit wins
const TYPE_KEYWORDS: &[(&[&str], DeviceType)] = &[
    (&["key"], DeviceType::Keys),
    (&["bag", "pack"], DeviceType::Bag),
    (&["valize", "luggage"], DeviceType::Luggage),
    (&["auto", "car"], DeviceType::Vehicle),
    (&["wallet", "portefeu"], DeviceType::Wallet),
];

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Keys => "keys",
            DeviceType::Bag => "bag",
            DeviceType::Luggage => "luggage",
            DeviceType::Vehicle => "vehicle",
            DeviceType::Wallet => "wallet",
            DeviceType::Airtag => "airtag",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "keys" => Some(DeviceType::Keys),
            "bag" => Some(DeviceType::Bag),
            "luggage" => Some(DeviceType::Luggage),
            "vehicle" => Some(DeviceType::Vehicle),
            "wallet" => Some(DeviceType::Wallet),
            "airtag" => Some(DeviceType::Airtag),
            _ => None,
        }
    }

    /// Guess the category from a normalized device name
    pub fn infer(name: &str) -> Self {
        let lower = name.to_lowercase();
        TYPE_KEYWORDS
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| lower.contains(k)))
            .map(|(_, device_type)| *device_type)
            .unwrap_or(DeviceType::Airtag)
    }
}

/// A tracked physical object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    /// Most recently observed verbatim OCR name
    pub raw_name: String,
    /// Normalized name used for matching and display
    pub canonical_name: String,
    pub device_type: DeviceType,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<DeviceId>,
}

/// Which distance pattern produced the distance on line one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistancePattern {
    Exact,
    Decimal,
    Range,
    LetterZero,
    Tolerant,
    Missing,
}

/// One OCR block's interpretation of one capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedObservation {
    /// Name text exactly as it was left after removing the distance token
    pub device_name_raw: String,
    /// Normalized device name
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_text: Option<String>,
    pub observed_at: DateTime<Utc>,
    /// Product of per-field extraction weights, in [0, 1]
    pub confidence_score: f64,
    pub distance_pattern: DistancePattern,
}

/// WGS84 coordinate pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    /// Build a coordinate pair, rejecting out-of-range values
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        valid.then_some(Self {
            latitude,
            longitude,
        })
    }
}

/// A persisted observation bound to a device and capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationObservation {
    pub id: ObservationId,
    pub device_id: DeviceId,
    pub capture_id: CaptureId,
    pub block_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_text: Option<String>,
    pub observed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    pub confidence_score: f64,
}

/// A recorded screen capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capture {
    pub id: CaptureId,
    pub source: String,
    pub captured_at: DateTime<Utc>,
    pub processed: bool,
    pub blocks_total: usize,
    pub blocks_saved: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Merged,
    Dismissed,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Merged => "merged",
            ReviewStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ReviewStatus::Pending),
            "merged" => Some(ReviewStatus::Merged),
            "dismissed" => Some(ReviewStatus::Dismissed),
            _ => None,
        }
    }
}

/// A near-miss pairing waiting for a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeReview {
    pub id: i64,
    /// Device created because the score fell below the match threshold
    pub device_id: DeviceId,
    /// Closest existing device at creation time
    pub candidate_id: DeviceId,
    pub score: f64,
    pub status: ReviewStatus,
    pub created_at: DateTime<Utc>,
}

/// Convert unix seconds from storage into a UTC timestamp
pub fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_device_type() {
        assert_eq!(DeviceType::infer("Jelles Keys"), DeviceType::Keys);
        assert_eq!(DeviceType::infer("Backpack"), DeviceType::Bag);
        assert_eq!(DeviceType::infer("Black Valize"), DeviceType::Luggage);
        assert_eq!(DeviceType::infer("Auto"), DeviceType::Vehicle);
        assert_eq!(
            DeviceType::infer("Jelliede Bellie Portefeuille"),
            DeviceType::Wallet
        );
        assert_eq!(DeviceType::infer("Bike"), DeviceType::Airtag);
    }

    #[test]
    fn test_infer_first_keyword_wins() {
        // "key" is checked before "car"
        assert_eq!(DeviceType::infer("Car Keys"), DeviceType::Keys);
    }

    #[test]
    fn test_device_type_round_trip_str() {
        for t in [
            DeviceType::Keys,
            DeviceType::Bag,
            DeviceType::Luggage,
            DeviceType::Vehicle,
            DeviceType::Wallet,
            DeviceType::Airtag,
        ] {
            assert_eq!(DeviceType::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn test_coordinates_range() {
        assert!(Coordinates::new(51.05, 3.72).is_some());
        assert!(Coordinates::new(91.0, 3.72).is_none());
        assert!(Coordinates::new(51.05, -181.0).is_none());
        assert!(Coordinates::new(f64::NAN, 0.0).is_none());
    }
}
