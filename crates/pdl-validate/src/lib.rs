//! Structural, schema, and envelope validation for zone files.
//!
//! Every validator produces a [`ValidationReport`]: hard `errors` flip
//! `passed`, `warnings` never do, and `info` carries diagnostic facts such as
//! record counts.

use std::collections::BTreeMap;
use std::fmt;

use pdl_core::{DataLakeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

mod envelope;
mod file;
mod schema;

pub use envelope::{validate_dump, EnvelopeValidator};
pub use file::FileValidator;
pub use schema::{ascii_violations, SchemaStats, SchemaValidator};

pub const CRATE_NAME: &str = "pdl-validate";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub info: BTreeMap<String, JsonValue>,
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            passed: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            info: BTreeMap::new(),
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.passed = false;
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn info(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        self.info.insert(key.into(), value.into());
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Folds `other` into `self`; the merged report passes only if both did.
    pub fn merge(&mut self, other: ValidationReport) {
        self.passed &= other.passed;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.info.extend(other.info);
    }

    pub fn into_result(self, context: impl Into<String>) -> Result<Self> {
        if self.passed {
            Ok(self)
        } else {
            Err(DataLakeError::Validation {
                context: context.into(),
                errors: self.errors,
            })
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Validation {}", if self.passed { "PASSED" } else { "FAILED" })?;
        if !self.errors.is_empty() {
            writeln!(f, "\nErrors ({}):", self.errors.len())?;
            for error in &self.errors {
                writeln!(f, "  - {error}")?;
            }
        }
        if !self.warnings.is_empty() {
            writeln!(f, "\nWarnings ({}):", self.warnings.len())?;
            for warning in &self.warnings {
                writeln!(f, "  - {warning}")?;
            }
        }
        if !self.info.is_empty() {
            writeln!(f, "\nInfo:")?;
            for (key, value) in &self.info {
                writeln!(f, "  {key}: {value}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_never_flip_passed() {
        let mut report = ValidationReport::new();
        report.warning("field 'date' is empty");
        assert!(report.passed);
        report.error("missing required field 'grant_id'");
        assert!(!report.passed);
    }

    #[test]
    fn merge_and_display() {
        let mut a = ValidationReport::new();
        a.info("record_count", 2);
        let mut b = ValidationReport::new();
        b.error("bad amount");
        a.merge(b);

        assert!(!a.passed);
        let text = a.to_string();
        assert!(text.starts_with("Validation FAILED"));
        assert!(text.contains("  - bad amount"));
        assert!(text.contains("record_count: 2"));
        assert!(matches!(
            a.into_result("batch.json"),
            Err(DataLakeError::Validation { errors, .. }) if errors.len() == 1
        ));
    }
}
