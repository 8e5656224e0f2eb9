use std::path::Path;

use pdl_core::{DataLakeError, ExtractionMethod, ExtractionStatus, MetadataEnvelope, Result};
use pdl_storage::load_records;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::{SchemaValidator, ValidationReport};

/// Checks `_metadata.json` sidecars.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeValidator {
    /// Treat a record-count mismatch as an error instead of a warning.
    pub strict_record_count: bool,
}

impl EnvelopeValidator {
    pub fn new(strict_record_count: bool) -> Self {
        Self { strict_record_count }
    }

    /// `actual_records` is the size of the accompanying data file, when known.
    pub fn validate_value(&self, value: &JsonValue, actual_records: Option<usize>) -> ValidationReport {
        let mut report = ValidationReport::new();
        let Some(map) = value.as_object() else {
            report.error("metadata must be a JSON object");
            return report;
        };

        for field in MetadataEnvelope::REQUIRED_FIELDS {
            match map.get(field) {
                None => report.error(format!("missing required metadata field: {field}")),
                Some(JsonValue::Null) => report.warning(format!("empty metadata field: {field}")),
                Some(JsonValue::String(s)) if s.trim().is_empty() => {
                    report.warning(format!("empty metadata field: {field}"))
                }
                Some(_) => {}
            }
        }

        if let Some(method) = map.get("extraction_method").and_then(JsonValue::as_str) {
            if !ExtractionMethod::ALLOWED.iter().any(|m| *m == method) {
                report.error(format!("invalid extraction_method: {method}"));
            }
        }
        if let Some(status) = map.get("extraction_status").and_then(JsonValue::as_str) {
            if !ExtractionStatus::ALLOWED.iter().any(|s| *s == status) {
                report.error(format!("invalid extraction_status: {status}"));
            }
        }

        match map.get("record_count") {
            Some(JsonValue::Number(n)) => match n.as_u64() {
                Some(declared) => {
                    report.info("record_count", declared);
                    if declared == 0 {
                        report.warning("record count is 0");
                    }
                    if let Some(actual) = actual_records {
                        if declared != actual as u64 {
                            let message =
                                format!("record count mismatch: metadata says {declared}, data has {actual}");
                            if self.strict_record_count {
                                report.error(message);
                            } else {
                                report.warning(message);
                            }
                        }
                    }
                }
                None => report.error(format!("record_count must be a non-negative integer, got {n}")),
            },
            Some(JsonValue::Null) | None => {}
            Some(other) => report.error(format!("record_count must be a number, got {other}")),
        }

        if map.values().any(contains_non_ascii) {
            report.error("metadata contains non-ASCII characters");
        }
        if let Some(source) = map.get("source_name").and_then(JsonValue::as_str) {
            report.info("source_name", source);
        }
        report
    }

    pub fn validate_file(&self, path: &Path, actual_records: Option<usize>) -> ValidationReport {
        let parsed = std::fs::read_to_string(path)
            .map_err(DataLakeError::from)
            .and_then(|text| serde_json::from_str::<JsonValue>(&text).map_err(DataLakeError::from));
        match parsed {
            Ok(value) => self.validate_value(&value, actual_records),
            Err(err) => {
                let mut report = ValidationReport::new();
                report.error(format!("cannot read metadata {}: {err}", path.display()));
                report
            }
        }
    }
}

fn contains_non_ascii(value: &JsonValue) -> bool {
    match value {
        JsonValue::String(s) => !s.is_ascii(),
        JsonValue::Array(items) => items.iter().any(contains_non_ascii),
        JsonValue::Object(map) => map.values().any(contains_non_ascii),
        _ => false,
    }
}

/// Validates one extraction dump directory: the envelope, the data file
/// (`data.jsonl` or `data.json`), and that the two agree on the record count.
pub fn validate_dump(
    dir: &Path,
    envelope: EnvelopeValidator,
    schema: Option<&SchemaValidator>,
) -> Result<(ValidationReport, Option<MetadataEnvelope>)> {
    if !dir.is_dir() {
        return Err(DataLakeError::NotFound(dir.to_path_buf()));
    }
    info!(dump = %dir.display(), "validating dump");

    let mut report = ValidationReport::new();
    let data_file = ["data.jsonl", "data.json"]
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file());

    let mut actual = None;
    match &data_file {
        Some(path) => {
            report.info("data_file", path.display().to_string());
            match schema {
                Some(schema) => {
                    let (data_report, stats) = schema.validate_file(path)?;
                    actual = Some(stats.total_records);
                    report.merge(data_report);
                }
                None => {
                    let loaded = load_records(path)?;
                    actual = Some(loaded.records.len() + loaded.failures.len());
                    for failure in loaded.failures {
                        report.error(failure.to_string());
                    }
                }
            }
        }
        None => report.error("no data file found (expected data.jsonl or data.json)"),
    }

    let metadata_path = dir.join(MetadataEnvelope::FILE_NAME);
    let mut parsed = None;
    if metadata_path.is_file() {
        let envelope_report = envelope.validate_file(&metadata_path, actual);
        if envelope_report.passed {
            parsed = std::fs::read_to_string(&metadata_path)
                .ok()
                .and_then(|text| serde_json::from_str::<MetadataEnvelope>(&text).ok());
        }
        report.merge(envelope_report);
    } else {
        report.error(format!("missing {}", MetadataEnvelope::FILE_NAME));
    }

    if !report.passed {
        warn!(dump = %dir.display(), errors = report.errors.len(), "dump failed validation");
    }
    Ok((report, parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn envelope(count: u64) -> JsonValue {
        json!({
            "extraction_date": "2025-01-10T12:00:00Z",
            "source_name": "alignment_research",
            "source_url": "https://example.org/dataset",
            "extraction_method": "api",
            "extractor_version": "1.0.0",
            "data_format": "jsonl",
            "record_count": count,
            "extraction_status": "complete",
            "filters_applied": []
        })
    }

    #[test]
    fn count_mismatch_is_warning_unless_strict() {
        let lenient = EnvelopeValidator::default().validate_value(&envelope(3), Some(2));
        assert!(lenient.passed);
        assert!(lenient.warnings[0].contains("mismatch"));

        let strict = EnvelopeValidator::new(true).validate_value(&envelope(3), Some(2));
        assert!(!strict.passed);
    }

    #[test]
    fn rejects_unknown_method_and_missing_fields() {
        let mut value = envelope(1);
        value["extraction_method"] = json!("carrier_pigeon");
        value.as_object_mut().expect("object").remove("source_url");
        let report = EnvelopeValidator::default().validate_value(&value, None);
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn dump_directory_round_trip() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("data.jsonl"), "{\"id\":\"a\"}\n{\"id\":\"b\"}\n").expect("data");
        std::fs::write(
            dir.path().join(MetadataEnvelope::FILE_NAME),
            serde_json::to_vec(&envelope(2)).expect("json"),
        )
        .expect("metadata");

        let (report, parsed) = validate_dump(dir.path(), EnvelopeValidator::default(), None).expect("dump");
        assert!(report.passed, "{report}");
        assert_eq!(parsed.expect("envelope").record_count, Some(2));
    }

    #[test]
    fn dump_without_metadata_fails() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("data.json"), "[]").expect("data");
        let (report, parsed) = validate_dump(dir.path(), EnvelopeValidator::default(), None).expect("dump");
        assert!(!report.passed);
        assert!(parsed.is_none());
    }
}
