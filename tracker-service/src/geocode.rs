//! Location text to coordinates
//!
//! `NominatimGeocoder` talks to an OpenStreetMap Nominatim endpoint, one
//! request per `min_interval` at most. `CachedGeocoder` wraps any geocoder
//! with an in-memory TTL cache that also remembers misses, so a location the
//! service cannot resolve is not asked for again on every cycle.

use crate::observation::Coordinates;
use crate::storage::{Storage, StorageError};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
pub const DEFAULT_USER_AGENT: &str = "AirTracker/1.0";

lazy_static! {
    static ref PAUSED_SUFFIX: Regex = Regex::new(r"(?i),\s*paused\b").unwrap();
}

#[derive(Error, Debug)]
pub enum GeocodeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("geocoder returned status {0}")]
    Status(u16),
    #[error("invalid geocoder response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` means the location is unknown to the provider
    async fn geocode(&self, location: &str) -> Result<Option<Coordinates>, GeocodeError>;
}

/// Appends `country` to location text that mentions one of `cities`
#[derive(Debug, Clone, PartialEq)]
pub struct CountryHint {
    pub country: String,
    pub cities: Vec<String>,
}

pub fn default_country_hints() -> Vec<CountryHint> {
    vec![CountryHint {
        country: "Belgium".to_string(),
        cities: ["Ghent", "Gent", "Brussels", "Brussel", "Antwerp", "Antwerpen"]
            .into_iter()
            .map(String::from)
            .collect(),
    }]
}

/// Prepare Find My location text for a geocoding query. Returns an empty
/// string when there is nothing worth looking up.
pub fn clean_location_text(text: &str, hints: &[CountryHint]) -> String {
    let mut cleaned = PAUSED_SUFFIX.replace_all(text.trim(), "").trim().to_string();

    if cleaned.to_lowercase().contains("no location") {
        return String::new();
    }

    for hint in hints {
        let mentions_city = hint.cities.iter().any(|city| cleaned.contains(city.as_str()));
        if mentions_city && !cleaned.contains(hint.country.as_str()) {
            cleaned.push_str(", ");
            cleaned.push_str(&hint.country);
        }
    }

    cleaned
}

#[derive(Debug, Deserialize)]
struct Place {
    lat: String,
    lon: String,
}

/// Nominatim search client
pub struct NominatimGeocoder {
    client: reqwest::Client,
    endpoint: String,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
    custom_locations: HashMap<String, Coordinates>,
    country_hints: Vec<CountryHint>,
}

impl NominatimGeocoder {
    pub fn new(
        endpoint: impl Into<String>,
        user_agent: &str,
        timeout: Duration,
        min_interval: Duration,
    ) -> Result<Self, GeocodeError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            min_interval,
            last_request: Mutex::new(None),
            custom_locations: HashMap::new(),
            country_hints: default_country_hints(),
        })
    }

    /// Fixed coordinates for places the provider does not know (home,
    /// office). Names match case-insensitively against the cleaned text.
    pub fn with_custom_locations<I>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = (String, Coordinates)>,
    {
        self.custom_locations.extend(
            locations
                .into_iter()
                .map(|(name, coords)| (name.trim().to_lowercase(), coords)),
        );
        self
    }

    pub fn with_country_hints(mut self, hints: Vec<CountryHint>) -> Self {
        self.country_hints = hints;
        self
    }

    /// Sleep until `min_interval` has passed since the previous request
    async fn wait_turn(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn search(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError> {
        self.wait_turn().await;

        debug!("Nominatim query: {}", query);
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json"), ("limit", "1")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GeocodeError::Status(response.status().as_u16()));
        }

        let places: Vec<Place> = response.json().await?;
        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };

        let parse = |value: &str| {
            value
                .parse::<f64>()
                .map_err(|e| GeocodeError::InvalidResponse(format!("{}: {}", value, e)))
        };
        let coordinates = Coordinates::new(parse(&place.lat)?, parse(&place.lon)?).ok_or_else(
            || GeocodeError::InvalidResponse(format!("out of range: {}, {}", place.lat, place.lon)),
        )?;

        info!(
            "Geocoded '{}' -> ({:.6}, {:.6})",
            query, coordinates.latitude, coordinates.longitude
        );
        Ok(Some(coordinates))
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, location: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let cleaned = clean_location_text(location, &self.country_hints);
        if cleaned.is_empty() {
            return Ok(None);
        }

        if let Some(coords) = self.custom_locations.get(&cleaned.to_lowercase()) {
            debug!("Custom coordinates for '{}'", cleaned);
            return Ok(Some(*coords));
        }

        self.search(&cleaned).await
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    coordinates: Option<Coordinates>,
    stored_at: Instant,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// In-memory TTL cache in front of another geocoder. Errors are not cached.
pub struct CachedGeocoder<G> {
    inner: G,
    state: Mutex<CacheState>,
    ttl: Duration,
    max_entries: usize,
}

impl<G: Geocoder> CachedGeocoder<G> {
    pub fn new(inner: G, ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
            ttl,
            max_entries,
        }
    }

    pub fn with_defaults(inner: G) -> Self {
        Self::new(
            inner,
            Duration::from_secs(7 * 24 * 60 * 60), // 7 days
            10_000,
        )
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            entries: state.entries.len(),
            max_entries: self.max_entries,
            hits: state.hits,
            misses: state.misses,
        }
    }

    fn key(location: &str) -> String {
        location.trim().to_lowercase()
    }

    async fn lookup(&self, key: &str) -> Option<Option<Coordinates>> {
        let mut state = self.state.lock().await;
        let fresh = state
            .entries
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| entry.coordinates);

        match fresh {
            Some(_) => state.hits += 1,
            None => {
                state.entries.remove(key);
                state.misses += 1;
            }
        }
        fresh
    }

    async fn store(&self, key: String, coordinates: Option<Coordinates>) {
        if self.max_entries == 0 {
            return;
        }
        let mut state = self.state.lock().await;

        if state.entries.len() >= self.max_entries {
            let ttl = self.ttl;
            state
                .entries
                .retain(|_, entry| entry.stored_at.elapsed() < ttl);
        }
        if state.entries.len() >= self.max_entries {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                state.entries.remove(&oldest);
            }
        }

        state.entries.insert(
            key,
            CacheEntry {
                coordinates,
                stored_at: Instant::now(),
            },
        );
    }
}

#[async_trait]
impl<G: Geocoder> Geocoder for CachedGeocoder<G> {
    async fn geocode(&self, location: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let key = Self::key(location);
        if key.is_empty() {
            return Ok(None);
        }

        if let Some(cached) = self.lookup(&key).await {
            return Ok(cached);
        }

        match self.inner.geocode(location).await {
            Ok(coordinates) => {
                self.store(key, coordinates).await;
                Ok(coordinates)
            }
            Err(e) => {
                warn!("Geocoding '{}' failed: {}", location, e);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<G: Geocoder + ?Sized> Geocoder for std::sync::Arc<G> {
    async fn geocode(&self, location: &str) -> Result<Option<Coordinates>, GeocodeError> {
        (**self).geocode(location).await
    }
}

/// Counts from one coordinate backfill run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackfillReport {
    pub checked: usize,
    pub geocoded: usize,
    pub not_found: usize,
    pub failed: usize,
}

/// Geocode stored observations that have location text but no coordinates,
/// newest first. Geocoder errors are counted and skipped; a storage error
/// stops the run.
pub async fn backfill_coordinates<G: Geocoder + ?Sized>(
    storage: &mut Storage,
    geocoder: &G,
    limit: Option<usize>,
) -> Result<BackfillReport, StorageError> {
    let pending = storage.observations_without_coordinates(limit)?;
    let mut report = BackfillReport {
        checked: pending.len(),
        ..Default::default()
    };

    for observation in pending {
        let Some(location) = observation.location_text.as_deref() else {
            continue;
        };
        match geocoder.geocode(location).await {
            Ok(Some(coordinates)) => {
                storage.set_coordinates(observation.id, coordinates)?;
                report.geocoded += 1;
            }
            Ok(None) => {
                debug!("No coordinates for '{}'", location);
                report.not_found += 1;
            }
            Err(e) => {
                warn!("Backfill of observation {} failed: {}", observation.id, e);
                report.failed += 1;
            }
        }
    }

    info!(
        "Backfilled {}/{} observations ({} not found, {} failed)",
        report.geocoded, report.checked, report.not_found, report.failed
    );
    Ok(report)
}
