//! Authoritative device set
//!
//! Every write that depends on what the roster looked like a moment earlier
//! (resolve-then-insert, consolidation) runs inside an IMMEDIATE transaction,
//! so two writers cannot both decide a name is new.

use crate::matcher::{best_score, FuzzyDeviceMatcher, MatchOutcome};
use crate::normalize::DeviceNameNormalizer;
use crate::observation::{
    CaptureId, Coordinates, Device, DeviceId, DeviceType, MergeReview, ObservationId,
    ParsedObservation, ReviewStatus,
};
use crate::storage::{self, Storage, StorageError};
use crate::validator::NameRejection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid device name: {0}")]
    InvalidName(#[from] NameRejection),
    #[error("cannot merge device {0} into itself")]
    SameDevice(DeviceId),
    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),
    #[error("device {0} is inactive")]
    DeviceInactive(DeviceId),
    #[error("review {0} not found")]
    ReviewNotFound(i64),
    #[error("review {0} is already {1}")]
    ReviewClosed(i64, &'static str),
}

impl From<rusqlite::Error> for RegistryError {
    fn from(err: rusqlite::Error) -> Self {
        RegistryError::Storage(err.into())
    }
}

/// Result of binding a name to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub device_id: DeviceId,
    pub outcome: MatchOutcome,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consolidation {
    pub winner: DeviceId,
    pub loser: DeviceId,
    pub observations_moved: usize,
}

/// Two active devices similar enough to be the same physical tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicatePair {
    pub winner: DeviceId,
    pub loser: DeviceId,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    normalizer: DeviceNameNormalizer,
    matcher: FuzzyDeviceMatcher,
}

impl DeviceRegistry {
    pub fn new(normalizer: DeviceNameNormalizer, matcher: FuzzyDeviceMatcher) -> Self {
        Self {
            normalizer,
            matcher,
        }
    }

    pub fn matcher(&self) -> &FuzzyDeviceMatcher {
        &self.matcher
    }

    /// Map a raw OCR name to a device id, creating the device if nothing on
    /// the active roster matches. A match never rewrites the canonical name.
    pub fn resolve_or_create(
        &self,
        storage: &mut Storage,
        raw_name: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<Resolution, RegistryError> {
        let raw_name = raw_name.trim();
        let normalized = self.normalizer.normalize(raw_name)?;

        let tx = storage.begin_immediate()?;
        let roster = storage::active_devices(&tx)?;
        let outcome = self.matcher.resolve(&normalized, raw_name, &roster);

        let resolution = match outcome.device_id() {
            Some(device_id) => {
                storage::touch_device(&tx, device_id, seen_at)?;
                storage::update_raw_name(&tx, device_id, raw_name)?;
                debug!("'{}' resolved to device {} ({:?})", raw_name, device_id, outcome);
                Resolution {
                    device_id,
                    outcome,
                    created: false,
                }
            }
            None => {
                let device_type = DeviceType::infer(&normalized);
                let device_id =
                    storage::insert_device(&tx, raw_name, &normalized, device_type, seen_at)?;
                info!(
                    "New device {}: '{}' ({})",
                    device_id,
                    normalized,
                    device_type.as_str()
                );

                if let MatchOutcome::NoMatch {
                    nearest: Some((candidate_id, score)),
                } = outcome
                {
                    storage::insert_review(&tx, device_id, candidate_id, score)?;
                    info!(
                        "Device {} is {:.1}% similar to device {}, queued for review",
                        device_id, score, candidate_id
                    );
                }

                Resolution {
                    device_id,
                    outcome,
                    created: true,
                }
            }
        };

        tx.commit()?;
        Ok(resolution)
    }

    /// Same as [`resolve_or_create`](Self::resolve_or_create) when only the
    /// device id matters
    pub fn resolve_or_create_device(
        &self,
        storage: &mut Storage,
        raw_name: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<DeviceId, RegistryError> {
        self.resolve_or_create(storage, raw_name, seen_at)
            .map(|resolution| resolution.device_id)
    }

    /// Fold `loser` into `winner`. All of it happens or none of it does.
    pub fn consolidate(
        &self,
        storage: &mut Storage,
        winner: DeviceId,
        loser: DeviceId,
    ) -> Result<Consolidation, RegistryError> {
        if winner == loser {
            return Err(RegistryError::SameDevice(winner));
        }

        let tx = storage.begin_immediate()?;
        for id in [winner, loser] {
            let device = storage::find_device(&tx, id)?.ok_or(RegistryError::DeviceNotFound(id))?;
            if !device.is_active {
                return Err(RegistryError::DeviceInactive(id));
            }
        }

        let observations_moved = storage::repoint_observations(&tx, loser, winner)?;
        storage::widen_seen_window(&tx, winner, loser)?;
        storage::deactivate_device(&tx, loser, Some(winner))?;
        storage::redirect_merged(&tx, loser, winner)?;
        storage::close_pair_reviews(&tx, winner, loser, ReviewStatus::Merged)?;
        storage::close_reviews_for(&tx, loser, ReviewStatus::Dismissed)?;
        tx.commit()?;

        info!(
            "Merged device {} into {} ({} observations moved)",
            loser, winner, observations_moved
        );
        Ok(Consolidation {
            winner,
            loser,
            observations_moved,
        })
    }

    /// Deactivate active devices whose canonical name no longer passes
    /// validation. Their history is kept.
    pub fn collect_garbage(&self, storage: &mut Storage) -> Result<Vec<Device>, RegistryError> {
        let validator = self.normalizer.validator();
        let tx = storage.begin_immediate()?;

        let mut collected = Vec::new();
        for device in storage::active_devices(&tx)? {
            if let Err(reason) = validator.validate(&device.canonical_name) {
                storage::deactivate_device(&tx, device.id, None)?;
                storage::close_reviews_for(&tx, device.id, ReviewStatus::Dismissed)?;
                warn!("Deactivated device {}: {}", device.id, reason);
                collected.push(device);
            }
        }

        tx.commit()?;
        Ok(collected)
    }

    /// Active pairs scoring at or above the match threshold
    pub fn find_duplicates(&self, storage: &Storage) -> Result<Vec<DuplicatePair>, RegistryError> {
        let roster = storage.active_devices()?;
        let threshold = self.matcher.policy().match_threshold;

        let mut pairs = Vec::new();
        for (i, a) in roster.iter().enumerate() {
            for b in &roster[i + 1..] {
                let score = best_score(&a.canonical_name, &b.canonical_name);
                if score < threshold {
                    continue;
                }

                let a_count = storage.observation_count(a.id)?;
                let b_count = storage.observation_count(b.id)?;
                // Roster is in id order, so `a` is the older device
                let (winner, loser) = if b_count > a_count {
                    (b.id, a.id)
                } else {
                    (a.id, b.id)
                };
                pairs.push(DuplicatePair {
                    winner,
                    loser,
                    score,
                });
            }
        }
        Ok(pairs)
    }

    /// Consolidate every duplicate pair. A device merged away earlier in the
    /// sweep is not considered again.
    pub fn sweep_duplicates(
        &self,
        storage: &mut Storage,
    ) -> Result<Vec<Consolidation>, RegistryError> {
        let pairs = self.find_duplicates(storage)?;
        let mut merged: HashSet<DeviceId> = HashSet::new();
        let mut results = Vec::new();

        for pair in pairs {
            if merged.contains(&pair.winner) || merged.contains(&pair.loser) {
                continue;
            }
            results.push(self.consolidate(storage, pair.winner, pair.loser)?);
            merged.insert(pair.loser);
        }
        Ok(results)
    }

    pub fn pending_reviews(&self, storage: &Storage) -> Result<Vec<MergeReview>, RegistryError> {
        Ok(storage.reviews(Some(ReviewStatus::Pending))?)
    }

    /// Accept a review: the existing candidate absorbs the newer device
    pub fn approve_review(
        &self,
        storage: &mut Storage,
        review_id: i64,
    ) -> Result<Consolidation, RegistryError> {
        let review = self.open_review(storage, review_id)?;
        self.consolidate(storage, review.candidate_id, review.device_id)
    }

    pub fn dismiss_review(&self, storage: &mut Storage, review_id: i64) -> Result<(), RegistryError> {
        self.open_review(storage, review_id)?;
        storage.set_review_status(review_id, ReviewStatus::Dismissed)?;
        info!("Dismissed review {}", review_id);
        Ok(())
    }

    fn open_review(&self, storage: &Storage, review_id: i64) -> Result<MergeReview, RegistryError> {
        let review = storage
            .find_review(review_id)?
            .ok_or(RegistryError::ReviewNotFound(review_id))?;
        if review.status != ReviewStatus::Pending {
            return Err(RegistryError::ReviewClosed(review_id, review.status.as_str()));
        }
        Ok(review)
    }
}

/// Persist one observation against an existing device and capture
pub fn save_observation(
    storage: &mut Storage,
    device_id: DeviceId,
    capture_id: CaptureId,
    block_index: usize,
    observation: &ParsedObservation,
    coordinates: Option<Coordinates>,
) -> Result<ObservationId, StorageError> {
    storage.insert_observation(device_id, capture_id, block_index, observation, coordinates)
}
