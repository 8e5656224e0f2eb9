use std::collections::HashSet;
use std::path::Path;

use jsonschema::JSONSchema;
use pdl_core::{record_id, str_field, DataLakeError, Record, Result};
use pdl_storage::load_records;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::ValidationReport;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaStats {
    pub total_records: usize,
    pub valid_records: usize,
    pub invalid_records: usize,
    pub schema_errors: usize,
    pub ascii_errors: usize,
    pub duplicate_ids: usize,
    pub missing_required_fields: usize,
    pub json_parse_errors: usize,
}

/// Checks records against a JSON Schema document plus the record rules the
/// schema language cannot express: unique ids, ASCII-only text, ISO dates,
/// http(s) urls.
pub struct SchemaValidator {
    compiled: JSONSchema,
    required: Vec<String>,
    sources: Vec<String>,
    check_ascii: bool,
    version: Option<String>,
}

impl std::fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("required", &self.required)
            .field("sources", &self.sources)
            .field("check_ascii", &self.check_ascii)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl SchemaValidator {
    pub fn from_value(schema: &JsonValue, check_ascii: bool) -> Result<Self> {
        let compiled = JSONSchema::compile(schema).map_err(|err| DataLakeError::Schema(err.to_string()))?;
        let required = schema
            .get("required")
            .and_then(JsonValue::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let sources = schema
            .pointer("/properties/source/enum")
            .and_then(JsonValue::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let version = match schema.get("version") {
            Some(JsonValue::String(v)) => Some(v.clone()),
            Some(JsonValue::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        Ok(Self {
            compiled,
            required,
            sources,
            check_ascii,
            version,
        })
    }

    /// The document's own `version` field, if it declares one.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// An unreadable or malformed schema document is a [`DataLakeError::Schema`].
    pub fn from_path(path: &Path, check_ascii: bool) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| DataLakeError::Schema(format!("{}: {err}", path.display())))?;
        let schema: JsonValue = serde_json::from_str(&text)
            .map_err(|err| DataLakeError::Schema(format!("{}: {err}", path.display())))?;
        info!(path = %path.display(), "loaded schema");
        Self::from_value(&schema, check_ascii)
    }

    /// Returns every problem with one record. `seen_ids` carries duplicate
    /// detection across a batch.
    pub fn check_record(&self, record: &Record, seen_ids: &mut HashSet<String>, stats: &mut SchemaStats) -> Vec<String> {
        let mut errors = Vec::new();
        let instance = JsonValue::Object(record.clone());

        if let Err(schema_errors) = self.compiled.validate(&instance) {
            let messages: Vec<String> = schema_errors
                .map(|err| {
                    let at = err.instance_path.to_string();
                    if at.is_empty() {
                        format!("schema: {err}")
                    } else {
                        format!("schema: {err} (at {at})")
                    }
                })
                .collect();
            if !messages.is_empty() {
                stats.schema_errors += 1;
                errors.extend(messages);
            }
        }

        for field in &self.required {
            let missing = match record.get(field) {
                None | Some(JsonValue::Null) => true,
                Some(JsonValue::String(s)) => s.is_empty(),
                Some(_) => false,
            };
            if missing {
                errors.push(format!("missing required field: {field}"));
                stats.missing_required_fields += 1;
            }
        }

        if let Some(id) = record_id(record) {
            if !seen_ids.insert(id.to_string()) {
                errors.push(format!("duplicate id: {id}"));
                stats.duplicate_ids += 1;
            }
        }

        if self.check_ascii {
            let ascii = ascii_violations(record);
            if !ascii.is_empty() {
                stats.ascii_errors += 1;
                errors.extend(ascii);
            }
        }

        let date_published = str_field(record, "date_published");
        if !date_published.is_empty() && !looks_like_iso_date(date_published) {
            errors.push(format!("invalid date format: {date_published}"));
        }

        let url = str_field(record, "url");
        if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(format!("invalid url format: {url}"));
        }

        let source = str_field(record, "source");
        if !source.is_empty() && !self.sources.is_empty() && !self.sources.iter().any(|s| s == source) {
            errors.push(format!("invalid source: {source}"));
        }

        errors
    }

    pub fn validate_records(&self, records: &[Record]) -> (ValidationReport, SchemaStats) {
        let mut report = ValidationReport::new();
        let mut stats = SchemaStats::default();
        let mut seen = HashSet::new();

        for (idx, record) in records.iter().enumerate() {
            stats.total_records += 1;
            let errors = self.check_record(record, &mut seen, &mut stats);
            if errors.is_empty() {
                stats.valid_records += 1;
                continue;
            }
            stats.invalid_records += 1;
            let label = record_id(record).unwrap_or("unknown");
            for error in errors {
                warn!(record = idx + 1, id = label, %error, "record failed schema validation");
                report.error(format!("record {} ({label}): {error}", idx + 1));
            }
        }

        report.info("total_records", stats.total_records);
        report.info("valid_records", stats.valid_records);
        (report, stats)
    }

    /// Unparseable lines count as invalid records rather than aborting the file.
    pub fn validate_file(&self, path: &Path) -> Result<(ValidationReport, SchemaStats)> {
        let loaded = load_records(path)?;
        let (mut report, mut stats) = self.validate_records(&loaded.records);
        for failure in loaded.failures {
            stats.total_records += 1;
            stats.invalid_records += 1;
            stats.json_parse_errors += 1;
            report.error(failure.to_string());
        }
        report.info("total_records", stats.total_records);
        info!(
            file = %path.display(),
            total = stats.total_records,
            valid = stats.valid_records,
            invalid = stats.invalid_records,
            "schema validation complete"
        );
        Ok((report, stats))
    }
}

fn looks_like_iso_date(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() >= 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes[..4].iter().chain(&bytes[5..7]).chain(&bytes[8..10]).all(u8::is_ascii_digit)
}

/// One message per string value (at any depth) holding a code point above 127.
pub fn ascii_violations(record: &Record) -> Vec<String> {
    let mut out = Vec::new();
    for (key, value) in record {
        walk_ascii(value, key, &mut out);
    }
    out
}

fn walk_ascii(value: &JsonValue, path: &str, out: &mut Vec<String>) {
    match value {
        JsonValue::String(s) => {
            if let Some((pos, ch)) = s.char_indices().find(|(_, c)| !c.is_ascii()) {
                out.push(format!(
                    "non-ASCII character U+{:04X} in field '{path}' at byte {pos}",
                    ch as u32
                ));
            }
        }
        JsonValue::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                walk_ascii(item, &format!("{path}[{idx}]"), out);
            }
        }
        JsonValue::Object(map) => {
            for (key, item) in map {
                walk_ascii(item, &format!("{path}.{key}"), out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> JsonValue {
        json!({
            "type": "object",
            "required": ["id", "title", "source"],
            "properties": {
                "id": {"type": "string"},
                "title": {"type": "string"},
                "source": {"type": "string", "enum": ["arxiv", "lesswrong", "distill"]},
                "tags": {"type": "array", "items": {"type": "string"}}
            }
        })
    }

    fn record(value: JsonValue) -> Record {
        match value {
            JsonValue::Object(map) => map,
            _ => unreachable!("test records are objects"),
        }
    }

    #[test]
    fn flags_duplicates_ascii_and_url_problems() {
        let validator = SchemaValidator::from_value(&schema(), true).expect("schema compiles");
        let records = vec![
            record(json!({"id": "a", "title": "Fine", "source": "arxiv", "url": "https://arxiv.org/abs/1"})),
            record(json!({"id": "a", "title": "Caf\u{e9}", "source": "arxiv"})),
            record(json!({"id": "c", "title": "Ok", "source": "arxiv", "url": "ftp://x"})),
        ];

        let (report, stats) = validator.validate_records(&records);

        assert!(!report.passed);
        assert_eq!(stats.valid_records, 1);
        assert_eq!(stats.duplicate_ids, 1);
        assert_eq!(stats.ascii_errors, 1);
        assert!(report.errors.iter().any(|e| e.contains("invalid url format")));
    }

    #[test]
    fn ascii_check_can_be_disabled() {
        let validator = SchemaValidator::from_value(&schema(), false).expect("schema compiles");
        let (report, _) = validator.validate_records(&[record(json!({"id": "a", "title": "na\u{ef}ve", "source": "arxiv"}))]);
        assert!(report.passed);
    }

    #[test]
    fn unknown_source_and_bad_date_are_errors() {
        let validator = SchemaValidator::from_value(&schema(), true).expect("schema compiles");
        let (report, stats) = validator.validate_records(&[record(
            json!({"id": "a", "title": "T", "source": "blog", "date_published": "May 2021"}),
        )]);
        assert_eq!(stats.schema_errors, 1);
        assert!(report.errors.iter().any(|e| e.contains("invalid source: blog")));
        assert!(report.errors.iter().any(|e| e.contains("invalid date format")));
    }

    #[test]
    fn malformed_schema_is_schema_error() {
        let err = SchemaValidator::from_value(&json!({"type": 12}), true).expect_err("bad schema");
        assert!(matches!(err, DataLakeError::Schema(_)));
    }

    #[test]
    fn nested_ascii_paths_are_reported() {
        let violations = ascii_violations(&record(json!({"tags": ["ok", "\u{2014}"]})));
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("tags[1]"));
    }
}
