//! Fuzzy device identity matching
//!
//! Resolution order: exact canonical name, exact raw name, then the best score
//! of three similarity scorers over every active device. Each scorer targets a
//! different OCR failure:
//!
//! - whole-string ratio: single character substitutions or drops
//! - token-sort ratio: words split or glued in a different order
//! - partial ratio: truncated names ("Jelliede Bellie Portef")

use crate::observation::{Device, DeviceId};
use serde::{Deserialize, Serialize};

/// How a name was tied to an existing device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExactField {
    Canonical,
    RawName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchOutcome {
    Exact { device_id: DeviceId, on: ExactField },
    Fuzzy { device_id: DeviceId, score: f64 },
    /// No device cleared the match threshold. `nearest` is set when the best
    /// candidate still cleared the review threshold.
    NoMatch { nearest: Option<(DeviceId, f64)> },
}

impl MatchOutcome {
    pub fn device_id(&self) -> Option<DeviceId> {
        match self {
            MatchOutcome::Exact { device_id, .. } | MatchOutcome::Fuzzy { device_id, .. } => {
                Some(*device_id)
            }
            MatchOutcome::NoMatch { .. } => None,
        }
    }
}

/// Thresholds on the 0-100 similarity scale
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    /// At or above: same device
    pub match_threshold: f64,
    /// At or above (but below `match_threshold`): new device, queued for review
    pub review_threshold: f64,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            match_threshold: 85.0,
            review_threshold: 75.0,
        }
    }
}

/// Whole-string similarity, 0-100
pub fn ratio(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&a.to_lowercase(), &b.to_lowercase()) * 100.0
}

/// Similarity after lowercasing and sorting whitespace-separated tokens
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    ratio(&sorted_tokens(a), &sorted_tokens(b))
}

fn sorted_tokens(text: &str) -> String {
    let lower = text.to_lowercase();
    let mut tokens: Vec<&str> = lower.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Best similarity of the shorter string against any equal-length window of
/// the longer one. Only scored when the shorter string is at least half as
/// long, so "Auto" does not swallow "Auto Keys".
pub fn partial_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };

    if short.is_empty() || short.len() * 2 < long.len() {
        return 0.0;
    }

    let needle: String = short.iter().collect();
    long.windows(short.len())
        .map(|w| {
            let window: String = w.iter().collect();
            strsim::normalized_levenshtein(&needle, &window) * 100.0
        })
        .fold(0.0, f64::max)
}

/// Max over the three scorers
pub fn best_score(a: &str, b: &str) -> f64 {
    ratio(a, b)
        .max(token_sort_ratio(a, b))
        .max(partial_ratio(a, b))
}

/// Decides whether a normalized name belongs to an existing device
#[derive(Debug, Clone, Default)]
pub struct FuzzyDeviceMatcher {
    policy: MatchPolicy,
}

impl FuzzyDeviceMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Match `normalized` (and the verbatim `raw` text) against the roster.
    /// Inactive devices are never matched. On equal scores the device that
    /// comes first in the roster wins.
    pub fn resolve(&self, normalized: &str, raw: &str, roster: &[Device]) -> MatchOutcome {
        let active = || roster.iter().filter(|d| d.is_active);

        if let Some(device) = active().find(|d| d.canonical_name == normalized) {
            return MatchOutcome::Exact {
                device_id: device.id,
                on: ExactField::Canonical,
            };
        }

        if let Some(device) = active().find(|d| d.raw_name == raw) {
            return MatchOutcome::Exact {
                device_id: device.id,
                on: ExactField::RawName,
            };
        }

        let mut best: Option<(DeviceId, f64)> = None;
        for device in active() {
            let score = best_score(normalized, &device.canonical_name);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((device.id, score));
            }
        }

        match best {
            Some((device_id, score)) if score >= self.policy.match_threshold => {
                MatchOutcome::Fuzzy { device_id, score }
            }
            Some((device_id, score)) if score >= self.policy.review_threshold => {
                MatchOutcome::NoMatch {
                    nearest: Some((device_id, score)),
                }
            }
            _ => MatchOutcome::NoMatch { nearest: None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::{from_unix, DeviceType};

    fn device(id: DeviceId, name: &str) -> Device {
        Device {
            id,
            raw_name: name.replace(' ', ""),
            canonical_name: name.to_string(),
            device_type: DeviceType::infer(name),
            first_seen: from_unix(0),
            last_seen: from_unix(0),
            is_active: true,
            merged_into: None,
        }
    }

    fn roster() -> Vec<Device> {
        vec![
            device(1, "Black Valize"),
            device(2, "Jelles Keys"),
            device(3, "Auto"),
            device(4, "Jelliede Bellie Portefeuille"),
        ]
    }

    #[test]
    fn test_scorers() {
        assert_eq!(ratio("Black Valize", "black valize"), 100.0);
        assert!(ratio("Blac Valize", "Black Valize") > 90.0);
        assert_eq!(token_sort_ratio("Keys Jelles", "Jelles Keys"), 100.0);
        assert_eq!(
            partial_ratio("Jelliede Bellie Portef", "Jelliede Bellie Portefeuille"),
            100.0
        );
        assert_eq!(partial_ratio("Auto", "Auto Keys"), 0.0);
        assert_eq!(partial_ratio("", "Auto"), 0.0);
    }

    #[test]
    fn test_exact_canonical_first() {
        let matcher = FuzzyDeviceMatcher::default();
        let outcome = matcher.resolve("Black Valize", "BlackValize", &roster());
        assert_eq!(
            outcome,
            MatchOutcome::Exact {
                device_id: 1,
                on: ExactField::Canonical
            }
        );
    }

    #[test]
    fn test_exact_raw_name() {
        let mut devices = roster();
        devices[2].canonical_name = "Auto Car".to_string();
        devices[2].raw_name = "Aut0".to_string();
        let outcome = FuzzyDeviceMatcher::default().resolve("Aut0", "Aut0", &devices);
        assert_eq!(
            outcome,
            MatchOutcome::Exact {
                device_id: 3,
                on: ExactField::RawName
            }
        );
    }

    #[test]
    fn test_fuzzy_dropped_character() {
        let outcome = FuzzyDeviceMatcher::default().resolve("Blac Valize", "BlacValize", &roster());
        match outcome {
            MatchOutcome::Fuzzy { device_id, score } => {
                assert_eq!(device_id, 1);
                assert!(score >= 85.0);
            }
            other => panic!("expected fuzzy match, got {:?}", other),
        }
    }

    #[test]
    fn test_fuzzy_truncated() {
        let outcome = FuzzyDeviceMatcher::default().resolve(
            "Jelliede Bellie Portefe",
            "Jelliede Bellie Portefe...",
            &roster(),
        );
        assert_eq!(outcome.device_id(), Some(4));
    }

    #[test]
    fn test_no_match() {
        let outcome = FuzzyDeviceMatcher::default().resolve("Bike", "Bike", &roster());
        assert_eq!(outcome, MatchOutcome::NoMatch { nearest: None });
    }

    #[test]
    fn test_near_miss_reported() {
        let matcher = FuzzyDeviceMatcher::new(MatchPolicy {
            match_threshold: 95.0,
            review_threshold: 75.0,
        });
        match matcher.resolve("Blac Valize", "BlacValize", &roster()) {
            MatchOutcome::NoMatch {
                nearest: Some((id, score)),
            } => {
                assert_eq!(id, 1);
                assert!(score >= 75.0 && score < 95.0);
            }
            other => panic!("expected near miss, got {:?}", other),
        }
    }

    #[test]
    fn test_inactive_devices_ignored() {
        let mut devices = roster();
        devices[0].is_active = false;
        let outcome = FuzzyDeviceMatcher::default().resolve("Black Valize", "BlackValize", &devices);
        assert_eq!(outcome.device_id(), None);
    }

    #[test]
    fn test_tie_prefers_roster_order() {
        let devices = vec![device(7, "Blue Bag"), device(3, "Blue Bag")];
        // Identical canonical names: exact match returns the first entry
        let outcome = FuzzyDeviceMatcher::default().resolve("Blue Bag", "x", &devices);
        assert_eq!(outcome.device_id(), Some(7));

        // Equal fuzzy scores also resolve to the first entry
        let outcome = FuzzyDeviceMatcher::default().resolve("Blue Bags", "x", &devices);
        assert_eq!(outcome.device_id(), Some(7));
    }

    #[test]
    fn test_threshold_boundary_matches() {
        // ratio("abcd", "abcx") == 75 exactly
        let matcher = FuzzyDeviceMatcher::new(MatchPolicy {
            match_threshold: 75.0,
            review_threshold: 60.0,
        });
        let outcome = matcher.resolve("abcx", "abcx", &[device(1, "abcd")]);
        assert_eq!(
            outcome,
            MatchOutcome::Fuzzy {
                device_id: 1,
                score: 75.0
            }
        );
    }
}
