//! SQLite storage for devices, captures and location observations

use crate::observation::{
    from_unix, Capture, CaptureId, Coordinates, Device, DeviceId, DeviceType,
    LocationObservation, MergeReview, ObservationId, ParsedObservation, ReviewStatus,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} not found")]
    NotFound(String),
}

const DEVICE_COLUMNS: &str = "id, raw_name, canonical_name, device_type, first_seen, last_seen, \
                              is_active, merged_into";

const OBSERVATION_COLUMNS: &str = "id, device_id, capture_id, block_index, distance_meters, \
                                   location_text, observed_at, latitude, longitude, confidence_score";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite storage manager
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        // Another process may hold the write lock for a resolution
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let storage = Self { conn };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let storage = Self { conn };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS devices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                raw_name TEXT NOT NULL,
                canonical_name TEXT NOT NULL CHECK (canonical_name != ''),
                device_type TEXT NOT NULL,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                merged_into INTEGER REFERENCES devices(id)
            );

            -- A raw name identifies at most one active device; merged or
            -- collected devices release theirs
            CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_active_raw_name
                ON devices(raw_name) WHERE is_active = 1;
            CREATE INDEX IF NOT EXISTS idx_devices_canonical_name ON devices(canonical_name);
            CREATE INDEX IF NOT EXISTS idx_devices_active ON devices(is_active);

            CREATE TABLE IF NOT EXISTS captures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                captured_at INTEGER NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                blocks_total INTEGER NOT NULL DEFAULT 0,
                blocks_saved INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_captures_captured_at ON captures(captured_at);

            -- Raw OCR text per block, kept for inspecting parser misses
            CREATE TABLE IF NOT EXISTS extracted_text (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                capture_id INTEGER NOT NULL REFERENCES captures(id) ON DELETE CASCADE,
                block_index INTEGER NOT NULL,
                raw_text TEXT NOT NULL,
                extracted_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id INTEGER NOT NULL REFERENCES devices(id),
                capture_id INTEGER NOT NULL REFERENCES captures(id) ON DELETE CASCADE,
                block_index INTEGER NOT NULL,
                distance_meters INTEGER CHECK (distance_meters IS NULL OR distance_meters >= 0),
                location_text TEXT,
                observed_at INTEGER NOT NULL,
                latitude REAL CHECK (latitude IS NULL OR (latitude >= -90 AND latitude <= 90)),
                longitude REAL CHECK (longitude IS NULL OR (longitude >= -180 AND longitude <= 180)),
                confidence_score REAL NOT NULL
                    CHECK (confidence_score >= 0 AND confidence_score <= 1),
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_observations_device ON observations(device_id, observed_at);
            CREATE INDEX IF NOT EXISTS idx_observations_observed_at ON observations(observed_at);

            CREATE TABLE IF NOT EXISTS merge_reviews (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id INTEGER NOT NULL REFERENCES devices(id),
                candidate_id INTEGER NOT NULL REFERENCES devices(id),
                score REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_merge_reviews_status ON merge_reviews(status);
            "#,
        )?;
        Ok(())
    }

    /// Start a write transaction that takes SQLite's write lock up front, so
    /// a check-then-insert inside it cannot interleave with another writer
    pub fn begin_immediate(&mut self) -> Result<Transaction<'_>, StorageError> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ---- devices -------------------------------------------------------

    /// Active devices in creation order (the matcher's roster)
    pub fn active_devices(&self) -> Result<Vec<Device>, StorageError> {
        active_devices(&self.conn)
    }

    pub fn list_devices(&self, include_inactive: bool) -> Result<Vec<Device>, StorageError> {
        let sql = if include_inactive {
            format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY id")
        } else {
            format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE is_active = 1 ORDER BY id")
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], device_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn find_device(&self, id: DeviceId) -> Result<Option<Device>, StorageError> {
        find_device(&self.conn, id)
    }

    /// Devices (active or not) whose canonical name matches exactly
    pub fn find_by_canonical_name(&self, name: &str) -> Result<Vec<Device>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE canonical_name = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![name], device_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Active devices not seen since `cutoff`
    pub fn stale_devices(&self, cutoff: DateTime<Utc>) -> Result<Vec<Device>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices
             WHERE is_active = 1 AND last_seen < ?1
             ORDER BY last_seen"
        ))?;
        let rows = stmt.query_map(params![cutoff.timestamp()], device_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ---- captures ------------------------------------------------------

    pub fn insert_capture(
        &mut self,
        source: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<CaptureId, StorageError> {
        self.conn.execute(
            "INSERT INTO captures (source, captured_at) VALUES (?1, ?2)",
            params![source, captured_at.timestamp()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn find_capture(&self, id: CaptureId) -> Result<Option<Capture>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, source, captured_at, processed, blocks_total, blocks_saved
                 FROM captures WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Capture {
                        id: row.get(0)?,
                        source: row.get(1)?,
                        captured_at: from_unix(row.get(2)?),
                        processed: row.get(3)?,
                        blocks_total: row.get::<_, i64>(4)? as usize,
                        blocks_saved: row.get::<_, i64>(5)? as usize,
                    })
                },
            )
            .optional()?)
    }

    pub fn mark_capture_processed(
        &mut self,
        id: CaptureId,
        blocks_total: usize,
        blocks_saved: usize,
    ) -> Result<(), StorageError> {
        let updated = self.conn.execute(
            "UPDATE captures SET processed = 1, blocks_total = ?1, blocks_saved = ?2
             WHERE id = ?3",
            params![blocks_total as i64, blocks_saved as i64, id],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("capture {}", id)));
        }
        Ok(())
    }

    pub fn save_extracted_text(
        &mut self,
        capture_id: CaptureId,
        block_index: usize,
        raw_text: &str,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO extracted_text (capture_id, block_index, raw_text, extracted_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![capture_id, block_index as i64, raw_text, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn extracted_text(&self, capture_id: CaptureId) -> Result<Vec<(usize, String)>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT block_index, raw_text FROM extracted_text
             WHERE capture_id = ?1 ORDER BY block_index, id",
        )?;
        let rows = stmt.query_map(params![capture_id], |row| {
            Ok((row.get::<_, i64>(0)? as usize, row.get(1)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ---- observations --------------------------------------------------

    /// Persist an observation. Device and capture must already exist; if
    /// either is missing nothing is written.
    pub fn insert_observation(
        &mut self,
        device_id: DeviceId,
        capture_id: CaptureId,
        block_index: usize,
        observation: &ParsedObservation,
        coordinates: Option<Coordinates>,
    ) -> Result<ObservationId, StorageError> {
        let tx = self.conn.transaction()?;

        if find_device(&tx, device_id)?.is_none() {
            return Err(StorageError::NotFound(format!("device {}", device_id)));
        }
        let capture_exists = tx
            .query_row(
                "SELECT 1 FROM captures WHERE id = ?1",
                params![capture_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !capture_exists {
            return Err(StorageError::NotFound(format!("capture {}", capture_id)));
        }

        tx.execute(
            "INSERT INTO observations (
                device_id, capture_id, block_index, distance_meters, location_text,
                observed_at, latitude, longitude, confidence_score, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                device_id,
                capture_id,
                block_index as i64,
                observation.distance_meters,
                observation.location_text,
                observation.observed_at.timestamp(),
                coordinates.map(|c| c.latitude),
                coordinates.map(|c| c.longitude),
                observation.confidence_score.clamp(0.0, 1.0),
                Utc::now().timestamp(),
            ],
        )?;
        let id = tx.last_insert_rowid();

        touch_device(&tx, device_id, observation.observed_at)?;

        tx.commit()?;
        Ok(id)
    }

    /// A device's observations in `[since, until]`, oldest first. With a
    /// limit, the most recent `limit` observations are returned.
    pub fn device_history(
        &self,
        device_id: DeviceId,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<LocationObservation>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations
             WHERE device_id = ?1 AND observed_at >= ?2 AND observed_at <= ?3
             ORDER BY observed_at DESC, id DESC
             LIMIT ?4"
        ))?;
        let rows = stmt.query_map(
            params![
                device_id,
                since.map_or(i64::MIN, |t| t.timestamp()),
                until.map_or(i64::MAX, |t| t.timestamp()),
                limit.map_or(-1, |l| l as i64),
            ],
            observation_from_row,
        )?;
        let mut history = rows.collect::<Result<Vec<_>, _>>()?;
        history.reverse();
        Ok(history)
    }

    /// All observations in a time range, oldest first
    pub fn observations_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<LocationObservation>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations
             WHERE observed_at >= ?1 AND observed_at <= ?2
             ORDER BY observed_at, id"
        ))?;
        let rows = stmt.query_map(
            params![since.timestamp(), until.timestamp()],
            observation_from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Observations with location text but no coordinates, newest first
    pub fn observations_without_coordinates(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<LocationObservation>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations
             WHERE latitude IS NULL AND location_text IS NOT NULL AND location_text != ''
             ORDER BY observed_at DESC, id DESC
             LIMIT ?1"
        ))?;
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let rows = stmt.query_map(params![limit], observation_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn set_coordinates(
        &mut self,
        observation_id: ObservationId,
        coordinates: Coordinates,
    ) -> Result<(), StorageError> {
        let updated = self.conn.execute(
            "UPDATE observations SET latitude = ?1, longitude = ?2 WHERE id = ?3",
            params![coordinates.latitude, coordinates.longitude, observation_id],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("observation {}", observation_id)));
        }
        Ok(())
    }

    /// Most recent observation of every active device
    pub fn latest_observations(&self) -> Result<Vec<(Device, LocationObservation)>, StorageError> {
        let mut latest = Vec::new();
        for device in self.active_devices()? {
            if let Some(obs) = self.device_history(device.id, None, None, Some(1))?.pop() {
                latest.push((device, obs));
            }
        }
        Ok(latest)
    }

    pub fn observation_count(&self, device_id: DeviceId) -> Result<usize, StorageError> {
        observation_count(&self.conn, device_id)
    }

    // ---- merge reviews -------------------------------------------------

    pub fn reviews(&self, status: Option<ReviewStatus>) -> Result<Vec<MergeReview>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, device_id, candidate_id, score, status, created_at
             FROM merge_reviews
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![status.map(|s| s.as_str())], review_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn find_review(&self, id: i64) -> Result<Option<MergeReview>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, device_id, candidate_id, score, status, created_at
                 FROM merge_reviews WHERE id = ?1",
                params![id],
                review_from_row,
            )
            .optional()?)
    }

    pub fn set_review_status(&mut self, id: i64, status: ReviewStatus) -> Result<(), StorageError> {
        let updated = self.conn.execute(
            "UPDATE merge_reviews SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("review {}", id)));
        }
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> Result<StorageStats, StorageError> {
        let count = |sql: &str| -> Result<usize, StorageError> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        let last_capture_at: Option<i64> =
            self.conn
                .query_row("SELECT MAX(captured_at) FROM captures", [], |row| row.get(0))?;

        Ok(StorageStats {
            active_devices: count("SELECT COUNT(*) FROM devices WHERE is_active = 1")?,
            inactive_devices: count("SELECT COUNT(*) FROM devices WHERE is_active = 0")?,
            observations: count("SELECT COUNT(*) FROM observations")?,
            geocoded_observations: count(
                "SELECT COUNT(*) FROM observations WHERE latitude IS NOT NULL",
            )?,
            captures: count("SELECT COUNT(*) FROM captures")?,
            pending_reviews: count("SELECT COUNT(*) FROM merge_reviews WHERE status = 'pending'")?,
            last_capture_at: last_capture_at.map(from_unix),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub active_devices: usize,
    pub inactive_devices: usize,
    pub observations: usize,
    pub geocoded_observations: usize,
    pub captures: usize,
    pub pending_reviews: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_capture_at: Option<DateTime<Utc>>,
}

// Statement helpers shared by `Storage` and by callers holding a transaction.

pub(crate) fn active_devices(conn: &Connection) -> Result<Vec<Device>, StorageError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE is_active = 1 ORDER BY id"
    ))?;
    let rows = stmt.query_map([], device_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub(crate) fn find_device(conn: &Connection, id: DeviceId) -> Result<Option<Device>, StorageError> {
    Ok(conn
        .query_row(
            &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"),
            params![id],
            device_from_row,
        )
        .optional()?)
}

pub(crate) fn insert_device(
    conn: &Connection,
    raw_name: &str,
    canonical_name: &str,
    device_type: DeviceType,
    seen_at: DateTime<Utc>,
) -> Result<DeviceId, StorageError> {
    conn.execute(
        "INSERT INTO devices (raw_name, canonical_name, device_type, first_seen, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![raw_name, canonical_name, device_type.as_str(), seen_at.timestamp()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Move `last_seen` forward; never backwards
pub(crate) fn touch_device(
    conn: &Connection,
    id: DeviceId,
    seen_at: DateTime<Utc>,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE devices SET last_seen = MAX(last_seen, ?1) WHERE id = ?2",
        params![seen_at.timestamp(), id],
    )?;
    Ok(())
}

/// Record the latest verbatim name unless another active device owns it
pub(crate) fn update_raw_name(
    conn: &Connection,
    id: DeviceId,
    raw_name: &str,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE devices SET raw_name = ?1
         WHERE id = ?2
           AND NOT EXISTS (
               SELECT 1 FROM devices WHERE raw_name = ?1 AND id != ?2 AND is_active = 1
           )",
        params![raw_name, id],
    )?;
    Ok(())
}

pub(crate) fn deactivate_device(
    conn: &Connection,
    id: DeviceId,
    merged_into: Option<DeviceId>,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE devices SET is_active = 0, merged_into = ?1 WHERE id = ?2",
        params![merged_into, id],
    )?;
    Ok(())
}

/// Fold `loser`'s seen window into `winner`
pub(crate) fn widen_seen_window(
    conn: &Connection,
    winner: DeviceId,
    loser: DeviceId,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE devices SET
            first_seen = MIN(first_seen, (SELECT first_seen FROM devices WHERE id = ?2)),
            last_seen = MAX(last_seen, (SELECT last_seen FROM devices WHERE id = ?2))
         WHERE id = ?1",
        params![winner, loser],
    )?;
    Ok(())
}

pub(crate) fn repoint_observations(
    conn: &Connection,
    from: DeviceId,
    to: DeviceId,
) -> Result<usize, StorageError> {
    Ok(conn.execute(
        "UPDATE observations SET device_id = ?1 WHERE device_id = ?2",
        params![to, from],
    )?)
}

pub(crate) fn observation_count(conn: &Connection, device_id: DeviceId) -> Result<usize, StorageError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM observations WHERE device_id = ?1",
        params![device_id],
        |row| row.get(0),
    )?;
    Ok(n as usize)
}

pub(crate) fn insert_review(
    conn: &Connection,
    device_id: DeviceId,
    candidate_id: DeviceId,
    score: f64,
) -> Result<i64, StorageError> {
    conn.execute(
        "INSERT INTO merge_reviews (device_id, candidate_id, score, status, created_at)
         VALUES (?1, ?2, ?3, 'pending', ?4)",
        params![device_id, candidate_id, score, Utc::now().timestamp()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Close pending reviews that mention `device_id`
pub(crate) fn close_reviews_for(
    conn: &Connection,
    device_id: DeviceId,
    status: ReviewStatus,
) -> Result<usize, StorageError> {
    Ok(conn.execute(
        "UPDATE merge_reviews SET status = ?1
         WHERE status = 'pending' AND (device_id = ?2 OR candidate_id = ?2)",
        params![status.as_str(), device_id],
    )?)
}

/// Close pending reviews for the pair `a`/`b`, in either direction
pub(crate) fn close_pair_reviews(
    conn: &Connection,
    a: DeviceId,
    b: DeviceId,
    status: ReviewStatus,
) -> Result<usize, StorageError> {
    Ok(conn.execute(
        "UPDATE merge_reviews SET status = ?1
         WHERE status = 'pending'
           AND ((device_id = ?2 AND candidate_id = ?3) OR (device_id = ?3 AND candidate_id = ?2))",
        params![status.as_str(), a, b],
    )?)
}

/// Keep `merged_into` pointing at an active device after `from` is merged
pub(crate) fn redirect_merged(
    conn: &Connection,
    from: DeviceId,
    to: DeviceId,
) -> Result<usize, StorageError> {
    Ok(conn.execute(
        "UPDATE devices SET merged_into = ?1 WHERE merged_into = ?2",
        params![to, from],
    )?)
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    let device_type: String = row.get(3)?;
    Ok(Device {
        id: row.get(0)?,
        raw_name: row.get(1)?,
        canonical_name: row.get(2)?,
        device_type: DeviceType::parse(&device_type).unwrap_or(DeviceType::Airtag),
        first_seen: from_unix(row.get(4)?),
        last_seen: from_unix(row.get(5)?),
        is_active: row.get(6)?,
        merged_into: row.get(7)?,
    })
}

fn observation_from_row(row: &Row<'_>) -> rusqlite::Result<LocationObservation> {
    let latitude: Option<f64> = row.get(7)?;
    let longitude: Option<f64> = row.get(8)?;
    Ok(LocationObservation {
        id: row.get(0)?,
        device_id: row.get(1)?,
        capture_id: row.get(2)?,
        block_index: row.get::<_, i64>(3)? as usize,
        distance_meters: row.get(4)?,
        location_text: row.get(5)?,
        observed_at: from_unix(row.get(6)?),
        coordinates: latitude
            .zip(longitude)
            .and_then(|(lat, lon)| Coordinates::new(lat, lon)),
        confidence_score: row.get(9)?,
    })
}

fn review_from_row(row: &Row<'_>) -> rusqlite::Result<MergeReview> {
    let status: String = row.get(4)?;
    Ok(MergeReview {
        id: row.get(0)?,
        device_id: row.get(1)?,
        candidate_id: row.get(2)?,
        score: row.get(3)?,
        status: ReviewStatus::parse(&status).unwrap_or(ReviewStatus::Pending),
        created_at: from_unix(row.get(5)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::DistancePattern;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn parsed(name: &str, at: DateTime<Utc>) -> ParsedObservation {
        ParsedObservation {
            device_name_raw: name.to_string(),
            device_name: name.to_string(),
            distance_meters: Some(9000),
            location_text: Some("Kouter, Ghent".to_string()),
            observed_at: at,
            confidence_score: 1.0,
            distance_pattern: DistancePattern::Exact,
        }
    }

    #[test]
    fn test_insert_and_find_device() {
        let storage = Storage::open_in_memory().unwrap();
        let id = insert_device(
            storage.connection(),
            "BlackValize",
            "Black Valize",
            DeviceType::Luggage,
            t0(),
        )
        .unwrap();

        let device = storage.find_device(id).unwrap().unwrap();
        assert_eq!(device.canonical_name, "Black Valize");
        assert_eq!(device.device_type, DeviceType::Luggage);
        assert_eq!(device.first_seen, t0());
        assert!(device.is_active);

        assert_eq!(storage.find_by_canonical_name("Black Valize").unwrap().len(), 1);
        assert!(storage.find_device(id + 1).unwrap().is_none());
    }

    #[test]
    fn test_empty_canonical_name_rejected() {
        let storage = Storage::open_in_memory().unwrap();
        let result = insert_device(storage.connection(), "x", "", DeviceType::Airtag, t0());
        assert!(matches!(result, Err(StorageError::Sqlite(_))));
    }

    #[test]
    fn test_observation_requires_device_and_capture() {
        let mut storage = Storage::open_in_memory().unwrap();
        let capture = storage.insert_capture("shot.png", t0()).unwrap();

        let result = storage.insert_observation(42, capture, 0, &parsed("Auto", t0()), None);
        assert!(matches!(result, Err(StorageError::NotFound(_))));

        let device =
            insert_device(storage.connection(), "Auto", "Auto", DeviceType::Vehicle, t0()).unwrap();
        let result = storage.insert_observation(device, capture + 1, 0, &parsed("Auto", t0()), None);
        assert!(matches!(result, Err(StorageError::NotFound(_))));

        assert_eq!(storage.stats().unwrap().observations, 0);
    }

    #[test]
    fn test_history_and_last_seen() {
        let mut storage = Storage::open_in_memory().unwrap();
        let capture = storage.insert_capture("shot.png", t0()).unwrap();
        let device =
            insert_device(storage.connection(), "Auto", "Auto", DeviceType::Vehicle, t0()).unwrap();

        let coords = Coordinates::new(51.05, 3.72);
        for minutes in [10, 30, 20] {
            let at = t0() + Duration::minutes(minutes);
            storage
                .insert_observation(device, capture, 0, &parsed("Auto", at), coords)
                .unwrap();
        }

        let history = storage.device_history(device, None, None, None).unwrap();
        let times: Vec<_> = history.iter().map(|o| o.observed_at).collect();
        assert_eq!(
            times,
            vec![
                t0() + Duration::minutes(10),
                t0() + Duration::minutes(20),
                t0() + Duration::minutes(30)
            ]
        );
        assert_eq!(history[0].coordinates, coords);

        let recent = storage.device_history(device, None, None, Some(2)).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].observed_at, t0() + Duration::minutes(30));

        let ranged = storage
            .device_history(
                device,
                Some(t0() + Duration::minutes(15)),
                Some(t0() + Duration::minutes(25)),
                None,
            )
            .unwrap();
        assert_eq!(ranged.len(), 1);

        let found = storage.find_device(device).unwrap().unwrap();
        assert_eq!(found.last_seen, t0() + Duration::minutes(30));

        let all = storage
            .observations_between(t0(), t0() + Duration::hours(1))
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(storage.latest_observations().unwrap().len(), 1);
    }

    #[test]
    fn test_capture_processing() {
        let mut storage = Storage::open_in_memory().unwrap();
        let capture = storage.insert_capture("shot.png", t0()).unwrap();
        storage.save_extracted_text(capture, 0, "Auto 0km\nNow").unwrap();
        storage.mark_capture_processed(capture, 3, 2).unwrap();

        let found = storage.find_capture(capture).unwrap().unwrap();
        assert!(found.processed);
        assert_eq!(found.blocks_total, 3);
        assert_eq!(found.blocks_saved, 2);
        assert_eq!(storage.extracted_text(capture).unwrap().len(), 1);

        assert!(matches!(
            storage.mark_capture_processed(capture + 1, 0, 0),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_observations_without_coordinates() {
        let mut storage = Storage::open_in_memory().unwrap();
        let capture = storage.insert_capture("shot.png", t0()).unwrap();
        let device =
            insert_device(storage.connection(), "Auto", "Auto", DeviceType::Vehicle, t0()).unwrap();

        let located = storage
            .insert_observation(device, capture, 0, &parsed("Auto", t0()), Coordinates::new(51.0, 3.7))
            .unwrap();
        let missing = storage
            .insert_observation(device, capture, 1, &parsed("Auto", t0()), None)
            .unwrap();
        let mut nowhere = parsed("Auto", t0());
        nowhere.location_text = None;
        storage
            .insert_observation(device, capture, 2, &nowhere, None)
            .unwrap();

        let pending = storage.observations_without_coordinates(None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, missing);
        assert_ne!(pending[0].id, located);

        let coords = Coordinates::new(51.05, 3.72).unwrap();
        storage.set_coordinates(missing, coords).unwrap();
        assert!(storage.observations_without_coordinates(None).unwrap().is_empty());
        assert_eq!(
            storage.device_history(device, None, None, None).unwrap()[1].coordinates,
            Some(coords)
        );

        assert!(matches!(
            storage.set_coordinates(missing + 10, coords),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_stale_devices() {
        let storage = Storage::open_in_memory().unwrap();
        insert_device(storage.connection(), "Auto", "Auto", DeviceType::Vehicle, t0()).unwrap();
        let stale = storage.stale_devices(t0() + Duration::hours(1)).unwrap();
        assert_eq!(stale.len(), 1);
        assert!(storage.stale_devices(t0()).unwrap().is_empty());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tracker.db");
        {
            let storage = Storage::open(&path).unwrap();
            insert_device(storage.connection(), "Auto", "Auto", DeviceType::Vehicle, t0()).unwrap();
        }
        let storage = Storage::open(&path).unwrap();
        assert_eq!(storage.stats().unwrap().active_devices, 1);
    }
}
