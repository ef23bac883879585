//! AirTracker service library
//!
//! Turns periodic OCR captures of the Find My item list into a stable set of
//! devices and their location history. Device names come out of OCR mangled
//! in many small ways; normalization plus fuzzy matching keeps one record per
//! physical tracker.

pub mod config;
pub mod cycle;
pub mod extract;
pub mod geocode;
pub mod matcher;
pub mod normalize;
pub mod observation;
pub mod ocr;
pub mod registry;
pub mod server;
pub mod storage;
pub mod validator;

pub use config::Config;
pub use cycle::{BlockOutcome, CaptureCycle, CycleReport};
pub use extract::{parse_block, FieldExtractor};
pub use matcher::{FuzzyDeviceMatcher, MatchOutcome, MatchPolicy};
pub use normalize::DeviceNameNormalizer;
pub use observation::{Device, LocationObservation, ParsedObservation};
pub use registry::{save_observation, DeviceRegistry};
pub use server::QueryServer;
pub use storage::Storage;
pub use validator::DeviceNameValidator;
