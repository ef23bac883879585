//! Field extraction from OCR text blocks
//!
//! A Find My list entry OCRs into two or three lines:
//!
//! ```text
//! BlackValize 9km
//! Kouter, Ghent - 5 min ago
//! ```
//!
//! Line one carries the device name and a distance, line two the location and
//! a relative time, and an optional line three a (more recent) relative time.
//! Every field has a precise pattern and one or more fallbacks; each fallback
//! lowers the observation's confidence score.

use crate::normalize::DeviceNameNormalizer;
use crate::observation::{DistancePattern, ParsedObservation};
use crate::validator::NameRejection;
use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::ops::Range;
use thiserror::Error;

/// Confidence multiplier when line one has no distance token
const NO_DISTANCE_WEIGHT: f64 = 0.8;
/// Confidence multiplier when the device reports no location
const NO_LOCATION_WEIGHT: f64 = 0.8;
/// Confidence multiplier when line two has no relative time
const NO_TIME_WEIGHT: f64 = 0.7;

const NO_LOCATION_MARKERS: &[&str] = &["no location", "nolocationfound", "location unavailable"];

struct DistanceRule {
    kind: DistancePattern,
    regex: Regex,
    weight: f64,
}

#[derive(Clone, Copy)]
enum TimeUnit {
    Minutes,
    Hours,
    Now,
}

struct TimeRule {
    regex: Regex,
    unit: TimeUnit,
}

lazy_static! {
    // Most specific first. The `span` group is what gets cut out of the line.
    // The leading guard keeps "9-10km" and "9.5km" away from the exact rule
    // but lets a dash that follows a name through ("Valize - 9km").
    static ref DISTANCE_RULES: Vec<DistanceRule> = vec![
        DistanceRule {
            kind: DistancePattern::Exact,
            regex: Regex::new(r"(?i)(?:^|[^\d.,\-\s]|(?:^|[^\d.,\-\s])\s*-)\s*(?P<span>(?P<a>\d+)\s*km)").unwrap(),
            weight: 1.0,
        },
        DistanceRule {
            kind: DistancePattern::Decimal,
            regex: Regex::new(r"(?i)(?:^|[^\d.,\-\s]|(?:^|[^\d.,\-\s])\s*-)\s*(?P<span>(?P<a>\d+[.,]\d+)\s*km)").unwrap(),
            weight: 0.9,
        },
        DistanceRule {
            kind: DistancePattern::Range,
            regex: Regex::new(r"(?i)(?P<span>(?P<a>\d+)\s*-\s*(?P<b>\d+)\s*km)").unwrap(),
            weight: 0.8,
        },
        DistanceRule {
            kind: DistancePattern::LetterZero,
            regex: Regex::new(r"(?i)(?:^|\s)(?P<span>o\s*km)").unwrap(),
            weight: 0.8,
        },
        DistanceRule {
            kind: DistancePattern::Tolerant,
            regex: Regex::new(r"(?i)(?P<span>[%°'`]?(?P<a>\d+(?:[.,]\d+)?)\s*[%°'`.,]*\s*km)").unwrap(),
            weight: 0.7,
        },
    ];

    static ref TIME_RULES: Vec<TimeRule> = vec![
        TimeRule {
            regex: Regex::new(r"(?i)(?P<n>\d+)\s*min(?:ute)?s?\.?\s*ago").unwrap(),
            unit: TimeUnit::Minutes,
        },
        TimeRule {
            regex: Regex::new(r"(?i)(?P<n>\d+)\s*(?:hours?|hrs?|h)\.?\s*ago").unwrap(),
            unit: TimeUnit::Hours,
        },
        TimeRule {
            regex: Regex::new(r"(?i)\bjust\s*now\b").unwrap(),
            unit: TimeUnit::Now,
        },
        TimeRule {
            regex: Regex::new(r"(?i)\bnow\b").unwrap(),
            unit: TimeUnit::Now,
        },
    ];
}

/// Why a block produced no observation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("block has no text")]
    Empty,
    #[error("no usable device name in '{text}': {reason}")]
    InvalidName {
        text: String,
        reason: NameRejection,
    },
}

/// A distance token found on a line
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceMatch {
    pub meters: Option<u32>,
    pub pattern: DistancePattern,
    pub weight: f64,
    pub span: Range<usize>,
}

/// A relative-time phrase found on a line
#[derive(Debug, Clone, PartialEq)]
pub struct TimeMatch {
    pub offset: Duration,
    pub span: Range<usize>,
}

fn km_to_meters(km: f64) -> Option<u32> {
    let meters = (km * 1000.0).round();
    (meters.is_finite() && meters >= 0.0 && meters <= u32::MAX as f64).then(|| meters as u32)
}

fn parse_km(text: &str) -> Option<f64> {
    text.replace(',', ".").parse::<f64>().ok()
}

fn distance_from(kind: DistancePattern, caps: &Captures<'_>) -> Option<u32> {
    match kind {
        DistancePattern::LetterZero => Some(0),
        DistancePattern::Range => {
            let a = parse_km(caps.name("a")?.as_str())?;
            let b = parse_km(caps.name("b")?.as_str())?;
            km_to_meters((a + b) / 2.0)
        }
        _ => km_to_meters(parse_km(caps.name("a")?.as_str())?),
    }
}

/// Find the first distance token on a line, trying rules in order
pub fn find_distance(line: &str) -> Option<DistanceMatch> {
    DISTANCE_RULES.iter().find_map(|rule| {
        let caps = rule.regex.captures(line)?;
        let span = caps.name("span")?.range();
        Some(DistanceMatch {
            meters: distance_from(rule.kind, &caps),
            pattern: rule.kind,
            weight: rule.weight,
            span,
        })
    })
}

/// Distance in meters for a text such as "9km", "9-10km", "1,5 km" or "okm"
pub fn parse_distance(text: &str) -> Option<u32> {
    find_distance(text).and_then(|m| m.meters)
}

/// Find the first relative-time phrase on a line
pub fn find_relative_time(line: &str) -> Option<TimeMatch> {
    TIME_RULES.iter().find_map(|rule| {
        let caps = rule.regex.captures(line)?;
        let span = caps.get(0)?.range();
        let offset = match rule.unit {
            TimeUnit::Now => Duration::zero(),
            TimeUnit::Minutes | TimeUnit::Hours => {
                // Absurd values fall back to the capture time
                let n: i64 = caps.name("n")?.as_str().parse().unwrap_or(0);
                let offset = match rule.unit {
                    TimeUnit::Minutes => Duration::try_minutes(n),
                    _ => Duration::try_hours(n),
                };
                offset.unwrap_or_else(Duration::zero)
            }
        };
        Some(TimeMatch { offset, span })
    })
}

/// Resolve a relative phrase against the capture time; unparsable means "now"
pub fn parse_relative_time(text: &str, capture_time: DateTime<Utc>) -> DateTime<Utc> {
    find_relative_time(text)
        .and_then(|m| capture_time.checked_sub_signed(m.offset))
        .unwrap_or(capture_time)
}

fn cut(line: &str, span: &Range<usize>) -> String {
    format!("{}{}", &line[..span.start], &line[span.end..])
}

fn is_no_location(line: &str) -> bool {
    let lower = line.to_lowercase();
    NO_LOCATION_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Parses OCR blocks into observations
#[derive(Debug, Clone, Default)]
pub struct FieldExtractor {
    normalizer: DeviceNameNormalizer,
}

impl FieldExtractor {
    pub fn new(normalizer: DeviceNameNormalizer) -> Self {
        Self { normalizer }
    }

    pub fn normalizer(&self) -> &DeviceNameNormalizer {
        &self.normalizer
    }

    /// Interpret one block. Blank lines are ignored.
    pub fn extract<S: AsRef<str>>(
        &self,
        lines: &[S],
        capture_time: DateTime<Utc>,
    ) -> Result<ParsedObservation, Rejection> {
        let lines: Vec<&str> = lines
            .iter()
            .map(|l| l.as_ref().trim())
            .filter(|l| !l.is_empty())
            .collect();

        let Some(first) = lines.first() else {
            return Err(Rejection::Empty);
        };

        let mut confidence = 1.0;

        let (name_text, distance_meters, distance_pattern) = match find_distance(first) {
            Some(found) => {
                confidence *= found.weight;
                (cut(first, &found.span), found.meters, found.pattern)
            }
            None => {
                confidence *= NO_DISTANCE_WEIGHT;
                (first.to_string(), None, DistancePattern::Missing)
            }
        };
        let name_text = name_text.trim().to_string();

        let device_name = self
            .normalizer
            .normalize(&name_text)
            .map_err(|reason| Rejection::InvalidName {
                text: name_text.clone(),
                reason,
            })?;

        let mut observed_at = capture_time;
        let mut location_text = None;

        if let Some(second) = lines.get(1) {
            if is_no_location(second) {
                confidence *= NO_LOCATION_WEIGHT;
            } else {
                match find_relative_time(second) {
                    Some(time) => {
                        observed_at = capture_time
                            .checked_sub_signed(time.offset)
                            .unwrap_or(capture_time);
                        location_text = non_empty(&cut(second, &time.span));
                    }
                    None => {
                        confidence *= NO_TIME_WEIGHT;
                        location_text = non_empty(second);
                    }
                }
            }
        }

        for line in lines.iter().skip(2) {
            if let Some(time) = find_relative_time(line) {
                observed_at = capture_time
                    .checked_sub_signed(time.offset)
                    .unwrap_or(capture_time);
            }
        }

        Ok(ParsedObservation {
            device_name_raw: name_text,
            device_name,
            distance_meters,
            location_text,
            observed_at,
            confidence_score: confidence,
            distance_pattern,
        })
    }
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim_matches(|c: char| c.is_whitespace() || c == '-');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Interpret one block with the default normalizer
pub fn parse_block<S: AsRef<str>>(
    lines: &[S],
    capture_time: DateTime<Utc>,
) -> Result<ParsedObservation, Rejection> {
    FieldExtractor::default().extract(lines, capture_time)
}
