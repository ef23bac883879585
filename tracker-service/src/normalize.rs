//! Device name normalization
//!
//! Turns a raw OCR name token into the canonical form used for display and
//! matching. OCR on the Find My list regularly drops the space between words
//! ("BlackValize"), appends truncation ellipses ("Jelliede Bellie Portefe...")
//! and picks up stray percent/degree glyphs from the battery and distance
//! columns. Normalization undoes those artifacts and then re-validates.

use crate::validator::{DeviceNameValidator, NameRejection};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Ellipsis followed by battery/percent residue, e.g. "Portefe...%9k"
    static ref TRUNCATION_TAIL: Regex = Regex::new(r"\.{2,}\s*[%°].*$").unwrap();
    static ref TRAILING_ARTIFACTS: Regex = Regex::new(r"[\s.%°…'`\-]+$").unwrap();
    static ref CAMEL_BOUNDARY: Regex = Regex::new(r"(\p{Ll})(\p{Lu})").unwrap();
}

/// A targeted text substitution applied after camel-case splitting
#[derive(Debug, Clone)]
pub struct RepairRule {
    pattern: Regex,
    replacement: String,
}

impl RepairRule {
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.to_string(),
        })
    }

    pub fn apply(&self, text: &str) -> String {
        self.pattern
            .replace_all(text, self.replacement.as_str())
            .into_owned()
    }
}

/// Repairs for multi-word names seen glued together in OCR output
pub fn default_repair_rules() -> Vec<RepairRule> {
    vec![
        // lowercase "de" between a lowercase and an uppercase letter
        RepairRule::new(r"(\p{Ll})(de)(\p{Lu})", "${1} ${2} ${3}").unwrap(),
        // "Port" directly after a lowercase letter
        RepairRule::new(r"(\p{Ll})(Port)", "${1} ${2}").unwrap(),
    ]
}

/// Cleans and validates device names
#[derive(Debug, Clone)]
pub struct DeviceNameNormalizer {
    validator: DeviceNameValidator,
    repairs: Vec<RepairRule>,
}

impl DeviceNameNormalizer {
    pub fn new(validator: DeviceNameValidator, repairs: Vec<RepairRule>) -> Self {
        Self { validator, repairs }
    }

    pub fn with_defaults() -> Self {
        Self::new(DeviceNameValidator::new(), default_repair_rules())
    }

    pub fn validator(&self) -> &DeviceNameValidator {
        &self.validator
    }

    /// Append a repair rule; rules run in insertion order
    pub fn push_repair(&mut self, rule: RepairRule) {
        self.repairs.push(rule);
    }

    /// Normalize a raw OCR name, or say why it is unusable
    pub fn normalize(&self, raw: &str) -> Result<String, NameRejection> {
        self.validator.validate(raw)?;

        let mut name = raw.trim().to_string();
        name = TRUNCATION_TAIL.replace(&name, "").into_owned();
        name = TRAILING_ARTIFACTS.replace(&name, "").into_owned();

        name = CAMEL_BOUNDARY.replace_all(&name, "${1} ${2}").into_owned();
        for rule in &self.repairs {
            name = rule.apply(&name);
        }
        name = name.split_whitespace().collect::<Vec<_>>().join(" ");

        self.validator.validate(&name)?;
        Ok(name)
    }
}

impl Default for DeviceNameNormalizer {
    fn default() -> Self {
        Self::with_defaults()
    }
}
