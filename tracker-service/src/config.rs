//! Configuration for the tracker service.
//!
//! Loaded from a TOML file; every field has a default so a partial file (or
//! none at all) still yields a working setup.

use crate::geocode::{self, CountryHint};
use crate::matcher::MatchPolicy;
use crate::observation::Coordinates;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub matching: MatchingConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub geocoding: GeocodingConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between capture cycles
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    /// Hours between garbage collection / duplicate sweeps (0 disables)
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_hours: u64,

    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_seconds: u64,

    /// Per block
    #[serde(default = "default_ocr_timeout")]
    pub ocr_timeout_seconds: u64,

    /// Per block, including rate-limit waits
    #[serde(default = "default_geocode_timeout")]
    pub geocode_timeout_seconds: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            maintenance_interval_hours: default_maintenance_interval(),
            capture_timeout_seconds: default_capture_timeout(),
            ocr_timeout_seconds: default_ocr_timeout(),
            geocode_timeout_seconds: default_geocode_timeout(),
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn maintenance_interval(&self) -> Option<Duration> {
        (self.maintenance_interval_hours > 0)
            .then(|| Duration::from_secs(self.maintenance_interval_hours * 60 * 60))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Similarity (0-100) at or above which two names are the same device
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,

    /// Near misses at or above this are queued for manual review
    #[serde(default = "default_review_threshold")]
    pub review_threshold: f64,

    /// Merge duplicate devices automatically during maintenance
    #[serde(default = "default_true")]
    pub auto_sweep: bool,

    /// Additional strings that never name a device (case-insensitive)
    #[serde(default)]
    pub blocked_names: Vec<String>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            match_threshold: default_match_threshold(),
            review_threshold: default_review_threshold(),
            auto_sweep: true,
            blocked_names: Vec::new(),
        }
    }
}

impl MatchingConfig {
    pub fn policy(&self) -> MatchPolicy {
        MatchPolicy {
            match_threshold: self.match_threshold,
            review_threshold: self.review_threshold,
        }
    }
}

/// Where the list rows sit inside a Find My window screenshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionLayout {
    pub start_x: u32,
    pub start_y: u32,
    pub width: u32,
    pub height: u32,
    /// Vertical gap between rows
    pub spacing: u32,
    pub count: u32,
    /// Screenshots smaller than this in either dimension are rejected
    pub min_image_size: u32,
}

impl Default for RegionLayout {
    fn default() -> Self {
        Self {
            start_x: 120,
            start_y: 220,
            width: 460,
            height: 120,
            spacing: 30,
            count: 9,
            min_image_size: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Screenshot command; the output file path is appended as last argument
    #[serde(default = "default_capture_program")]
    pub capture_program: String,

    #[serde(default = "default_capture_args")]
    pub capture_args: Vec<String>,

    /// OCR command; invoked as `<program> <image> stdout <args...>`
    #[serde(default = "default_ocr_program")]
    pub ocr_program: String,

    #[serde(default = "default_ocr_args")]
    pub ocr_args: Vec<String>,

    /// Screenshots and cropped rows are written here
    #[serde(default = "default_screenshots_dir")]
    pub screenshots_dir: PathBuf,

    /// Delete screenshot files once a cycle has processed them
    #[serde(default)]
    pub delete_after_processing: bool,

    #[serde(default)]
    pub regions: RegionLayout,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capture_program: default_capture_program(),
            capture_args: default_capture_args(),
            ocr_program: default_ocr_program(),
            ocr_args: default_ocr_args(),
            screenshots_dir: default_screenshots_dir(),
            delete_after_processing: false,
            regions: RegionLayout::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CustomLocation {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Nominatim's usage policy requires an identifying user agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Minimum seconds between requests
    #[serde(default = "default_rate_limit")]
    pub rate_limit_seconds: f64,

    #[serde(default = "default_request_timeout")]
    pub timeout_seconds: u64,

    #[serde(default = "default_cache_ttl_days")]
    pub cache_ttl_days: u64,

    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    /// Location text (case-insensitive) -> fixed coordinates
    #[serde(default)]
    pub custom_locations: BTreeMap<String, CustomLocation>,

    /// Country -> city names that get ", <country>" appended to queries
    #[serde(default = "default_country_hints")]
    pub country_hints: BTreeMap<String, Vec<String>>,
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_endpoint(),
            user_agent: default_user_agent(),
            rate_limit_seconds: default_rate_limit(),
            timeout_seconds: default_request_timeout(),
            cache_ttl_days: default_cache_ttl_days(),
            cache_max_entries: default_cache_max_entries(),
            custom_locations: BTreeMap::new(),
            country_hints: default_country_hints(),
        }
    }
}

impl GeocodingConfig {
    pub fn rate_limit(&self) -> Duration {
        Duration::from_secs_f64(self.rate_limit_seconds.max(0.0))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_days * 24 * 60 * 60)
    }

    /// Custom locations with out-of-range coordinates are skipped
    pub fn custom_coordinates(&self) -> Vec<(String, Coordinates)> {
        self.custom_locations
            .iter()
            .filter_map(|(name, loc)| match Coordinates::new(loc.latitude, loc.longitude) {
                Some(coords) => Some((name.clone(), coords)),
                None => {
                    warn!("Ignoring custom location '{}': coordinates out of range", name);
                    None
                }
            })
            .collect()
    }

    pub fn hints(&self) -> Vec<CountryHint> {
        self.country_hints
            .iter()
            .map(|(country, cities)| CountryHint {
                country: country.clone(),
                cities: cities.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Serve queries on a Unix socket while the daemon runs
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: default_socket_path(),
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("airtracker")
}

fn default_db_path() -> PathBuf {
    data_dir().join("airtracker.db")
}

fn default_screenshots_dir() -> PathBuf {
    data_dir().join("screenshots")
}

fn default_interval() -> u64 {
    60
}

fn default_maintenance_interval() -> u64 {
    24
}

fn default_capture_timeout() -> u64 {
    30
}

fn default_ocr_timeout() -> u64 {
    15
}

fn default_geocode_timeout() -> u64 {
    15
}

fn default_match_threshold() -> f64 {
    MatchPolicy::default().match_threshold
}

fn default_review_threshold() -> f64 {
    MatchPolicy::default().review_threshold
}

fn default_capture_program() -> String {
    "screencapture".to_string()
}

fn default_capture_args() -> Vec<String> {
    vec!["-o".to_string(), "-x".to_string()]
}

fn default_ocr_program() -> String {
    "tesseract".to_string()
}

fn default_ocr_args() -> Vec<String> {
    ["--oem", "3", "--psm", "6"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_endpoint() -> String {
    geocode::DEFAULT_ENDPOINT.to_string()
}

fn default_user_agent() -> String {
    geocode::DEFAULT_USER_AGENT.to_string()
}

fn default_rate_limit() -> f64 {
    1.1
}

fn default_request_timeout() -> u64 {
    10
}

fn default_cache_ttl_days() -> u64 {
    7
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_country_hints() -> BTreeMap<String, Vec<String>> {
    geocode::default_country_hints()
        .into_iter()
        .map(|hint| (hint.country, hint.cities))
        .collect()
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/airtracker.sock")
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        Self::load_from_path(Self::default_config_path())
    }

    /// Load configuration from a specific path, falling back to defaults
    pub fn load_from_path(path: PathBuf) -> Self {
        match std::fs::read_to_string(&path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to load config file: {}, using defaults", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("No config file found at {:?}, using defaults", path);
                Self::default()
            }
        }
    }

    /// Load a file the user pointed at explicitly; errors are not swallowed
    pub fn try_load_from_path(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::parse(&contents)?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.matching;
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        if !in_range(m.match_threshold) || !in_range(m.review_threshold) {
            return Err(ConfigError::Invalid(
                "matching thresholds must be between 0 and 100".to_string(),
            ));
        }
        if m.review_threshold > m.match_threshold {
            return Err(ConfigError::Invalid(format!(
                "review_threshold ({}) is above match_threshold ({})",
                m.review_threshold, m.match_threshold
            )));
        }
        if self.schedule.interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "schedule.interval_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("airtracker")
            .join("config.toml")
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }
}
