//! One capture cycle: screenshot, OCR per row, parse, resolve, geocode, save
//!
//! A block that fails never affects its siblings. The only errors that abort
//! a cycle are a failed screenshot and being unable to record the capture.

use crate::config::ScheduleConfig;
use crate::extract::FieldExtractor;
use crate::geocode::Geocoder;
use crate::observation::{CaptureId, Coordinates, Device, DeviceId, ObservationId};
use crate::registry::{self, Consolidation, DeviceRegistry, RegistryError};
use crate::storage::{Storage, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// A screenshot split into per-device row images
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedScreen {
    /// Label stored with the capture, usually the screenshot file name
    pub source: String,
    pub captured_at: DateTime<Utc>,
    /// Row images in on-screen order
    pub blocks: Vec<PathBuf>,
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("command failed: {0}")]
    CommandFailed(String),
    #[error("invalid screenshot: {0}")]
    InvalidScreenshot(String),
}

#[async_trait]
pub trait ScreenCapturer: Send + Sync {
    async fn capture(&self) -> Result<CapturedScreen, CaptureError>;

    /// Called once the cycle is done with the screen's files
    async fn release(&self, _screen: &CapturedScreen) {}
}

#[async_trait]
pub trait TextRecognizer: Send + Sync {
    /// Text lines of one row image, top to bottom
    async fn recognize(&self, block: &Path) -> Result<Vec<String>, CaptureError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleTimeouts {
    pub capture: Duration,
    pub ocr: Duration,
    pub geocode: Duration,
}

impl Default for CycleTimeouts {
    fn default() -> Self {
        Self::from(&ScheduleConfig::default())
    }
}

impl From<&ScheduleConfig> for CycleTimeouts {
    fn from(schedule: &ScheduleConfig) -> Self {
        Self {
            capture: Duration::from_secs(schedule.capture_timeout_seconds),
            ocr: Duration::from_secs(schedule.ocr_timeout_seconds),
            geocode: Duration::from_secs(schedule.geocode_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BlockOutcome {
    Saved {
        block_index: usize,
        device_id: DeviceId,
        observation_id: ObservationId,
        created_device: bool,
        geocoded: bool,
    },
    /// The block held nothing usable; expected for empty rows and UI chrome
    Rejected { block_index: usize, reason: String },
    Failed { block_index: usize, error: String },
}

impl BlockOutcome {
    pub fn block_index(&self) -> usize {
        match self {
            BlockOutcome::Saved { block_index, .. }
            | BlockOutcome::Rejected { block_index, .. }
            | BlockOutcome::Failed { block_index, .. } => *block_index,
        }
    }

    pub fn is_saved(&self) -> bool {
        matches!(self, BlockOutcome::Saved { .. })
    }
}

/// What one maintenance pass changed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub deactivated: Vec<Device>,
    pub merged: Vec<Consolidation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub capture_id: CaptureId,
    pub source: String,
    pub captured_at: DateTime<Utc>,
    pub blocks: Vec<BlockOutcome>,
}

impl CycleReport {
    pub fn saved(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_saved()).count()
    }

    pub fn rejected(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| matches!(b, BlockOutcome::Rejected { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| matches!(b, BlockOutcome::Failed { .. }))
            .count()
    }
}

#[derive(Error, Debug)]
pub enum CycleError {
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("capture timed out after {0:?}")]
    CaptureTimeout(Duration),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub struct CaptureCycle {
    capturer: Arc<dyn ScreenCapturer>,
    recognizer: Arc<dyn TextRecognizer>,
    geocoder: Option<Arc<dyn Geocoder>>,
    extractor: FieldExtractor,
    registry: DeviceRegistry,
    storage: Arc<Mutex<Storage>>,
    timeouts: CycleTimeouts,
    /// Held for the whole cycle so manual and scheduled runs never overlap
    running: Mutex<()>,
}

impl CaptureCycle {
    pub fn new(
        capturer: Arc<dyn ScreenCapturer>,
        recognizer: Arc<dyn TextRecognizer>,
        storage: Arc<Mutex<Storage>>,
        registry: DeviceRegistry,
    ) -> Self {
        Self {
            capturer,
            recognizer,
            geocoder: None,
            extractor: FieldExtractor::default(),
            registry,
            storage,
            timeouts: CycleTimeouts::default(),
            running: Mutex::new(()),
        }
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn with_extractor(mut self, extractor: FieldExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_timeouts(mut self, timeouts: CycleTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn storage(&self) -> &Arc<Mutex<Storage>> {
        &self.storage
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Garbage-collect invalid devices and, with `sweep`, merge duplicates.
    /// Holds the cycle lock so a device cannot be merged away between its
    /// resolution and the save of its observation.
    pub async fn maintain(&self, sweep: bool) -> Result<MaintenanceReport, RegistryError> {
        let _running = self.running.lock().await;
        let mut storage = self.storage.lock().await;

        let deactivated = self.registry.collect_garbage(&mut storage)?;
        let merged = if sweep {
            self.registry.sweep_duplicates(&mut storage)?
        } else {
            Vec::new()
        };

        info!(
            "Maintenance: {} devices deactivated, {} merged",
            deactivated.len(),
            merged.len()
        );
        Ok(MaintenanceReport {
            deactivated,
            merged,
        })
    }

    /// Run a full cycle. Waits for any cycle already in progress.
    pub async fn run_once(&self) -> Result<CycleReport, CycleError> {
        let _running = self.running.lock().await;

        let screen = timeout(self.timeouts.capture, self.capturer.capture())
            .await
            .map_err(|_| CycleError::CaptureTimeout(self.timeouts.capture))??;
        info!(
            "Captured {} ({} blocks)",
            screen.source,
            screen.blocks.len()
        );

        let capture_id = self
            .storage
            .lock()
            .await
            .insert_capture(&screen.source, screen.captured_at)?;

        let mut blocks = Vec::with_capacity(screen.blocks.len());
        for (block_index, path) in screen.blocks.iter().enumerate() {
            let outcome = self
                .process_block(capture_id, block_index, path, screen.captured_at)
                .await;
            blocks.push(outcome);
        }

        let report = CycleReport {
            capture_id,
            source: screen.source.clone(),
            captured_at: screen.captured_at,
            blocks,
        };

        self.storage.lock().await.mark_capture_processed(
            capture_id,
            report.blocks.len(),
            report.saved(),
        )?;
        self.capturer.release(&screen).await;

        info!(
            "Capture {} processed: {}/{} blocks saved ({} rejected, {} failed)",
            capture_id,
            report.saved(),
            report.blocks.len(),
            report.rejected(),
            report.failed()
        );
        Ok(report)
    }

    async fn process_block(
        &self,
        capture_id: CaptureId,
        block_index: usize,
        path: &Path,
        captured_at: DateTime<Utc>,
    ) -> BlockOutcome {
        let failed = |error: String| {
            error!("Block {}: {}", block_index, error);
            BlockOutcome::Failed { block_index, error }
        };

        let lines = match timeout(self.timeouts.ocr, self.recognizer.recognize(path)).await {
            Ok(Ok(lines)) => lines,
            Ok(Err(e)) => return failed(format!("OCR failed: {}", e)),
            Err(_) => return failed(format!("OCR timed out after {:?}", self.timeouts.ocr)),
        };

        if !lines.is_empty() {
            let raw_text = lines.join("\n");
            let stored = self
                .storage
                .lock()
                .await
                .save_extracted_text(capture_id, block_index, &raw_text);
            if let Err(e) = stored {
                warn!("Block {}: could not store raw text: {}", block_index, e);
            }
        }

        let parsed = match self.extractor.extract(&lines, captured_at) {
            Ok(parsed) => parsed,
            Err(rejection) => {
                debug!("Block {} rejected: {}", block_index, rejection);
                return BlockOutcome::Rejected {
                    block_index,
                    reason: rejection.to_string(),
                };
            }
        };

        let resolution = {
            let mut storage = self.storage.lock().await;
            self.registry
                .resolve_or_create(&mut storage, &parsed.device_name_raw, parsed.observed_at)
        };
        let resolution = match resolution {
            Ok(resolution) => resolution,
            Err(e) => return failed(format!("device resolution failed: {}", e)),
        };

        let coordinates = match parsed.location_text.as_deref() {
            Some(location) => self.geocode(block_index, location).await,
            None => None,
        };

        let saved = {
            let mut storage = self.storage.lock().await;
            registry::save_observation(
                &mut storage,
                resolution.device_id,
                capture_id,
                block_index,
                &parsed,
                coordinates,
            )
        };

        match saved {
            Ok(observation_id) => {
                debug!(
                    "Block {}: '{}' -> device {} (observation {})",
                    block_index, parsed.device_name, resolution.device_id, observation_id
                );
                BlockOutcome::Saved {
                    block_index,
                    device_id: resolution.device_id,
                    observation_id,
                    created_device: resolution.created,
                    geocoded: coordinates.is_some(),
                }
            }
            Err(e) => failed(format!(
                "saving observation for device {} failed: {}",
                resolution.device_id, e
            )),
        }
    }

    /// Best effort: every failure ends as `None`
    async fn geocode(&self, block_index: usize, location: &str) -> Option<Coordinates> {
        let geocoder = self.geocoder.as_ref()?;
        if location.trim().is_empty() {
            return None;
        }

        match timeout(self.timeouts.geocode, geocoder.geocode(location)).await {
            Ok(Ok(coordinates)) => coordinates,
            Ok(Err(e)) => {
                warn!("Block {}: geocoding '{}' failed: {}", block_index, location, e);
                None
            }
            Err(_) => {
                warn!(
                    "Block {}: geocoding '{}' timed out after {:?}",
                    block_index, location, self.timeouts.geocode
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::GeocodeError;
    use chrono::TimeZone;
    use std::collections::HashMap;

    struct StaticCapturer {
        blocks: usize,
    }

    #[async_trait]
    impl ScreenCapturer for StaticCapturer {
        async fn capture(&self) -> Result<CapturedScreen, CaptureError> {
            Ok(CapturedScreen {
                source: "findmy_test.png".to_string(),
                captured_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                blocks: (0..self.blocks)
                    .map(|i| PathBuf::from(format!("airtag_{:02}.png", i + 1)))
                    .collect(),
            })
        }
    }

    struct FailingCapturer;

    #[async_trait]
    impl ScreenCapturer for FailingCapturer {
        async fn capture(&self) -> Result<CapturedScreen, CaptureError> {
            Err(CaptureError::CommandFailed("no window".to_string()))
        }
    }

    /// Serves canned text per block file name
    struct ScriptedRecognizer {
        texts: HashMap<String, Result<Vec<String>, String>>,
    }

    impl ScriptedRecognizer {
        fn new(texts: &[(&str, Result<&str, &str>)]) -> Self {
            Self {
                texts: texts
                    .iter()
                    .map(|(name, text)| {
                        let text = text
                            .map(|t| t.lines().map(String::from).collect())
                            .map_err(String::from);
                        (name.to_string(), text)
                    })
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl TextRecognizer for ScriptedRecognizer {
        async fn recognize(&self, block: &Path) -> Result<Vec<String>, CaptureError> {
            let name = block.to_string_lossy().to_string();
            match self.texts.get(&name) {
                Some(Ok(lines)) => Ok(lines.clone()),
                Some(Err(e)) => Err(CaptureError::CommandFailed(e.clone())),
                None => Ok(Vec::new()),
            }
        }
    }

    struct SlowGeocoder;

    #[async_trait]
    impl Geocoder for SlowGeocoder {
        async fn geocode(&self, _location: &str) -> Result<Option<Coordinates>, GeocodeError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Coordinates::new(0.0, 0.0))
        }
    }

    fn cycle(blocks: usize, recognizer: ScriptedRecognizer) -> CaptureCycle {
        let storage = Arc::new(Mutex::new(Storage::open_in_memory().unwrap()));
        CaptureCycle::new(
            Arc::new(StaticCapturer { blocks }),
            Arc::new(recognizer),
            storage,
            DeviceRegistry::default(),
        )
    }

    #[tokio::test]
    async fn test_blocks_are_isolated() {
        let recognizer = ScriptedRecognizer::new(&[
            ("airtag_01.png", Ok("Auto 2km\n5 min ago Kouter, Ghent")),
            ("airtag_02.png", Err("tesseract crashed")),
            ("airtag_03.png", Ok("Google Lens")),
            ("airtag_04.png", Ok("BlackValize 0km\nNow")),
        ]);
        let cycle = cycle(5, recognizer);

        let report = cycle.run_once().await.unwrap();
        assert_eq!(report.blocks.len(), 5);
        assert_eq!(report.saved(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.rejected(), 2);

        let storage = cycle.storage().lock().await;
        let capture = storage.find_capture(report.capture_id).unwrap().unwrap();
        assert!(capture.processed);
        assert_eq!(capture.blocks_total, 5);
        assert_eq!(capture.blocks_saved, 2);
        // Raw text is kept for rows that produced any text
        assert_eq!(storage.extracted_text(report.capture_id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_capture_failure_aborts_cycle() {
        let storage = Arc::new(Mutex::new(Storage::open_in_memory().unwrap()));
        let cycle = CaptureCycle::new(
            Arc::new(FailingCapturer),
            Arc::new(ScriptedRecognizer::new(&[])),
            storage.clone(),
            DeviceRegistry::default(),
        );

        assert!(matches!(cycle.run_once().await, Err(CycleError::Capture(_))));
        assert_eq!(storage.lock().await.stats().unwrap().captures, 0);
    }

    #[tokio::test]
    async fn test_geocode_timeout_keeps_observation() {
        let recognizer =
            ScriptedRecognizer::new(&[("airtag_01.png", Ok("Auto 2km\n5 min ago Kouter, Ghent"))]);
        let cycle = cycle(1, recognizer)
            .with_geocoder(Arc::new(SlowGeocoder))
            .with_timeouts(CycleTimeouts {
                capture: Duration::from_secs(5),
                ocr: Duration::from_secs(5),
                geocode: Duration::from_millis(20),
            });

        let report = cycle.run_once().await.unwrap();
        match &report.blocks[0] {
            BlockOutcome::Saved { geocoded, .. } => assert!(!geocoded),
            other => panic!("expected saved block, got {:?}", other),
        }
    }

    fn three_devices() -> ScriptedRecognizer {
        ScriptedRecognizer::new(&[
            ("airtag_01.png", Ok("Auto 2km\nNow")),
            ("airtag_02.png", Ok("BlackValize 9km\nKouter, Ghent - 5 min ago")),
            ("airtag_03.png", Ok("Jelles Keys 1km\nHome - Now")),
        ])
    }

    fn with_trigger(cycle: CaptureCycle, sql: &str) -> CaptureCycle {
        cycle
            .storage()
            .try_lock()
            .unwrap()
            .connection()
            .execute_batch(sql)
            .unwrap();
        cycle
    }

    #[tokio::test]
    async fn test_resolution_failure_fails_only_its_block() {
        let cycle = with_trigger(
            cycle(3, three_devices()),
            "CREATE TRIGGER reject_valize BEFORE INSERT ON devices
             WHEN NEW.canonical_name = 'Black Valize'
             BEGIN SELECT RAISE(ABORT, 'devices unavailable'); END;",
        );

        let report = cycle.run_once().await.unwrap();
        assert!(report.blocks[0].is_saved());
        assert!(matches!(
            &report.blocks[1],
            BlockOutcome::Failed { block_index: 1, error } if error.contains("resolution")
        ));
        assert!(report.blocks[2].is_saved());

        let storage = cycle.storage().lock().await;
        assert!(storage.find_by_canonical_name("Black Valize").unwrap().is_empty());
        assert_eq!(storage.active_devices().unwrap().len(), 2);
        let capture = storage.find_capture(report.capture_id).unwrap().unwrap();
        assert!(capture.processed);
        assert_eq!(capture.blocks_saved, 2);
    }

    #[tokio::test]
    async fn test_save_failure_keeps_resolved_device() {
        let cycle = with_trigger(
            cycle(3, three_devices()),
            "CREATE TRIGGER reject_second_row BEFORE INSERT ON observations
             WHEN NEW.block_index = 1
             BEGIN SELECT RAISE(ABORT, 'observations unavailable'); END;",
        );

        let report = cycle.run_once().await.unwrap();
        assert_eq!(report.saved(), 2);
        assert!(matches!(
            &report.blocks[1],
            BlockOutcome::Failed { block_index: 1, error } if error.contains("saving observation")
        ));

        let storage = cycle.storage().lock().await;
        let valize = storage.find_by_canonical_name("Black Valize").unwrap();
        assert_eq!(valize.len(), 1);
        assert!(valize[0].is_active);
        assert_eq!(storage.observation_count(valize[0].id).unwrap(), 0);

        let capture = storage.find_capture(report.capture_id).unwrap().unwrap();
        assert!(capture.processed);
        assert_eq!(capture.blocks_total, 3);
        assert_eq!(capture.blocks_saved, 2);
    }

    #[tokio::test]
    async fn test_maintenance_waits_for_running_cycle() {
        let cycle = Arc::new(cycle(0, ScriptedRecognizer::new(&[])));
        {
            let storage = cycle.storage().lock().await;
            let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
            for name in ["Black Valize", "Black Valise"] {
                crate::storage::insert_device(
                    storage.connection(),
                    name,
                    name,
                    crate::observation::DeviceType::Luggage,
                    at,
                )
                .unwrap();
            }
        }

        let in_progress = cycle.running.lock().await;
        let maintaining = Arc::clone(&cycle);
        let handle = tokio::spawn(async move { maintaining.maintain(true).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert_eq!(cycle.storage().lock().await.active_devices().unwrap().len(), 2);

        drop(in_progress);
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.merged.len(), 1);
        assert!(report.deactivated.is_empty());
        assert_eq!(cycle.storage().lock().await.active_devices().unwrap().len(), 1);
    }

    #[test]
    fn test_report_serializes_outcomes() {
        let outcome = BlockOutcome::Rejected {
            block_index: 2,
            reason: "block has no text".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["block_index"], 2);
    }
}
