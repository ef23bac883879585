//! Structural plausibility checks for OCR device names

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

/// Minimum number of characters in a usable device name
pub const MIN_NAME_LEN: usize = 3;

lazy_static! {
    /// UI chrome and capture tooling that OCR picks up instead of a device.
    /// These are matched case-insensitively against the trimmed name.
    static ref BLOCKED_NAMES: Vec<Regex> = vec![
        Regex::new(r"(?i)google\s*lens").unwrap(),
        Regex::new(r"(?i)^find\s*my").unwrap(),
        Regex::new(r"(?i)^window$").unwrap(),
        Regex::new(r"(?i)screenshot").unwrap(),
        Regex::new(r"(?i)^o f ").unwrap(),
    ];

    static ref SINGLE_LETTER: Regex = Regex::new(r"^\p{L}$").unwrap();
    static ref ALL_DIGITS: Regex = Regex::new(r"^[0-9]+$").unwrap();
}

/// Why a name was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameRejection {
    #[error("name is empty")]
    Empty,
    #[error("name '{0}' is a known non-device string")]
    Blocked(String),
    #[error("name '{0}' is shorter than 3 characters")]
    TooShort(String),
    #[error("name '{0}' is a single letter")]
    SingleLetter(String),
    #[error("name '{0}' is all digits")]
    AllDigits(String),
    #[error("name '{0}' contains no letters")]
    NoLetters(String),
}

/// Gate for structurally implausible device names
#[derive(Debug, Clone, Default)]
pub struct DeviceNameValidator {
    extra_blocked: Vec<String>,
}

impl DeviceNameValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add case-insensitive substrings that should never become devices
    pub fn with_blocked<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_blocked
            .extend(names.into_iter().map(|n| n.into().to_lowercase()));
        self
    }

    pub fn validate(&self, name: &str) -> Result<(), NameRejection> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(NameRejection::Empty);
        }

        let owned = || trimmed.to_string();

        if BLOCKED_NAMES.iter().any(|re| re.is_match(trimmed)) {
            return Err(NameRejection::Blocked(owned()));
        }
        let lower = trimmed.to_lowercase();
        if self.extra_blocked.iter().any(|b| lower.contains(b.as_str())) {
            return Err(NameRejection::Blocked(owned()));
        }

        if SINGLE_LETTER.is_match(trimmed) {
            return Err(NameRejection::SingleLetter(owned()));
        }
        if ALL_DIGITS.is_match(trimmed) {
            return Err(NameRejection::AllDigits(owned()));
        }
        if trimmed.chars().count() < MIN_NAME_LEN {
            return Err(NameRejection::TooShort(owned()));
        }
        if !trimmed.chars().any(char::is_alphabetic) {
            return Err(NameRejection::NoLetters(owned()));
        }

        Ok(())
    }

    pub fn is_valid(&self, name: &str) -> bool {
        self.validate(name).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_ui_strings() {
        let v = DeviceNameValidator::new();
        assert!(matches!(v.validate("Google Lens"), Err(NameRejection::Blocked(_))));
        assert!(matches!(v.validate("googlelens"), Err(NameRejection::Blocked(_))));
        assert!(matches!(v.validate("Find My"), Err(NameRejection::Blocked(_))));
        assert!(matches!(v.validate("WINDOW"), Err(NameRejection::Blocked(_))));
        assert!(matches!(
            v.validate("Screenshot 2024-01-01"),
            Err(NameRejection::Blocked(_))
        ));
        assert!(matches!(v.validate("o F Keys"), Err(NameRejection::Blocked(_))));
    }

    #[test]
    fn test_rejects_structural_garbage() {
        let v = DeviceNameValidator::new();
        assert_eq!(v.validate("   "), Err(NameRejection::Empty));
        assert!(matches!(v.validate("a"), Err(NameRejection::SingleLetter(_))));
        assert!(matches!(v.validate("ab"), Err(NameRejection::TooShort(_))));
        assert!(matches!(v.validate("12345"), Err(NameRejection::AllDigits(_))));
        assert!(matches!(v.validate("-- %"), Err(NameRejection::NoLetters(_))));
    }

    #[test]
    fn test_accepts_devices() {
        let v = DeviceNameValidator::new();
        assert!(v.is_valid("Auto"));
        assert!(v.is_valid("Black Valize"));
        assert!(v.is_valid("Jelles Keys"));
        // "window" only blocks when it is the whole name
        assert!(v.is_valid("Window Cleaner Bag"));
    }

    #[test]
    fn test_extra_blocked() {
        let v = DeviceNameValidator::new().with_blocked(["Items"]);
        assert!(matches!(v.validate("ITEMS"), Err(NameRejection::Blocked(_))));
    }
}
