use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use csv::Trim;
use pdl_core::Record;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{SchemaValidator, ValidationReport};

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d/%m/%Y"];

/// Validates whole data files: dispatches on the extension, applies the
/// configured field rules to every record, and optionally hands the records to
/// a [`SchemaValidator`].
#[derive(Debug, Clone)]
pub struct FileValidator {
    required_fields: Vec<String>,
    unique_fields: Vec<String>,
    date_fields: Vec<String>,
    schema: Option<Arc<SchemaValidator>>,
}

impl Default for FileValidator {
    fn default() -> Self {
        Self {
            required_fields: Vec::new(),
            unique_fields: Vec::new(),
            date_fields: vec!["date".to_string()],
            schema: None,
        }
    }
}

impl FileValidator {
    pub fn new(required_fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            required_fields: required_fields.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_unique_fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.unique_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_date_fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.date_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_schema(mut self, schema: Arc<SchemaValidator>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn required_fields(&self) -> &[String] {
        &self.required_fields
    }

    /// Never fails: unreadable or malformed files come back as a failed report.
    pub fn validate_file(&self, path: &Path) -> ValidationReport {
        let mut report = ValidationReport::new();
        if !path.is_file() {
            report.error(format!("file does not exist: {}", path.display()));
            return report;
        }
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                report.error(format!("cannot read file: {err}"));
                return report;
            }
        };
        report.info("file_size_bytes", content.len());

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        debug!(file = %path.display(), %extension, "validating file");

        let (records, rules) = match extension.as_str() {
            "json" => (self.json_records(&content, &mut report), Cow::Borrowed(self)),
            "jsonl" => (jsonl_records(&content, &mut report), Cow::Borrowed(self)),
            "csv" => {
                let (records, header) = self.csv_records(&content, &mut report);
                (records, Cow::Owned(self.restricted_to(&header)))
            }
            _ => {
                let shown = if extension.is_empty() { "(none)".to_string() } else { format!(".{extension}") };
                report.warning(format!("unknown file type: {shown}"));
                return report;
            }
        };

        for (context, record) in &records {
            rules.validate_record(record, context, &mut report);
        }
        self.check_unique(&records, &mut report);

        if let Some(schema) = &self.schema {
            let plain: Vec<Record> = records.into_iter().map(|(_, r)| r).collect();
            let (schema_report, _) = schema.validate_records(&plain);
            report.merge(schema_report);
        }
        report
    }

    /// Required-field and type-sanity rules for a single record.
    pub fn validate_record(&self, record: &Record, context: &str, report: &mut ValidationReport) {
        for field in &self.required_fields {
            match record.get(field) {
                None => report.error(format!("{context}: missing required field '{field}'")),
                Some(JsonValue::Null) => report.warning(format!("{context}: field '{field}' is empty")),
                Some(JsonValue::String(s)) if s.is_empty() => {
                    report.warning(format!("{context}: field '{field}' is empty"))
                }
                Some(_) => {}
            }
        }

        match record.get("amount") {
            Some(JsonValue::Number(_)) | Some(JsonValue::Null) | None => {}
            Some(JsonValue::String(s)) if parse_amount(s).is_some() => {}
            Some(JsonValue::String(s)) if s.is_empty() => {}
            Some(other) => report.error(format!("{context}: invalid amount value: {other}")),
        }

        for field in &self.date_fields {
            if let Some(JsonValue::String(value)) = record.get(field) {
                if !value.is_empty() && !is_accepted_date(value) {
                    report.warning(format!("{context}: date format may be non-standard: {value}"));
                }
            }
        }
    }

    fn json_records(&self, content: &str, report: &mut ValidationReport) -> Vec<(String, Record)> {
        let data: JsonValue = match serde_json::from_str(content) {
            Ok(data) => data,
            Err(err) => {
                report.error(format!("invalid JSON: {err}"));
                return Vec::new();
            }
        };
        report.info("format", "json");

        let mut records = Vec::new();
        match data {
            JsonValue::Array(items) => {
                for (idx, item) in items.into_iter().enumerate() {
                    match item {
                        JsonValue::Object(record) => records.push((format!("record {idx}"), record)),
                        other => report.error(format!("record {idx}: expected an object, got {}", type_name(&other))),
                    }
                }
            }
            JsonValue::Object(map) if self.is_id_keyed(&map) => {
                for (key, item) in map {
                    if let JsonValue::Object(record) = item {
                        records.push((format!("record '{key}'"), record));
                    }
                }
            }
            JsonValue::Object(record) => records.push(("root object".to_string(), record)),
            other => report.error(format!("JSON data must be an object or array, got {}", type_name(&other))),
        }
        report.info("record_count", records.len());
        records
    }

    /// An object of objects with none of the required fields at its top level
    /// is treated as a map from id to record.
    fn is_id_keyed(&self, map: &Record) -> bool {
        !map.is_empty()
            && map.values().all(JsonValue::is_object)
            && !self.required_fields.iter().any(|f| map.contains_key(f))
    }

    fn csv_records(&self, content: &str, report: &mut ValidationReport) -> (Vec<(String, Record)>, Vec<String>) {
        let mut reader = csv::ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(content.as_bytes());
        let header: Vec<String> = match reader.headers() {
            Ok(header) => header.iter().map(str::to_string).collect(),
            Err(err) => {
                report.error(format!("invalid CSV header: {err}"));
                return (Vec::new(), Vec::new());
            }
        };
        if header.iter().all(String::is_empty) {
            report.error("CSV file is empty");
            return (Vec::new(), Vec::new());
        }
        report.info("format", "csv");
        report.info("columns", header.clone());
        for required in &self.required_fields {
            if !header.contains(required) {
                report.error(format!("missing required column: {required}"));
            }
        }

        let mut records = Vec::new();
        for (idx, row) in reader.records().enumerate() {
            let context = format!("row {}", idx + 1);
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    report.error(format!("{context}: invalid CSV: {err}"));
                    continue;
                }
            };
            if row.len() != header.len() {
                report.warning(format!(
                    "{context}: expected {} columns, found {}",
                    header.len(),
                    row.len()
                ));
            }
            let record: Record = header
                .iter()
                .zip(row.iter())
                .map(|(column, cell)| (column.clone(), JsonValue::String(cell.to_string())))
                .collect();
            records.push((context, record));
        }
        if records.is_empty() {
            report.warning("CSV has header but no data rows");
        }
        report.info("record_count", records.len());
        (records, header)
    }

    /// Row rules for a CSV file: a missing column is reported once for the
    /// header, not again for every row.
    fn restricted_to(&self, header: &[String]) -> Self {
        Self {
            required_fields: self
                .required_fields
                .iter()
                .filter(|f| header.contains(*f))
                .cloned()
                .collect(),
            ..self.clone()
        }
    }

    fn check_unique(&self, records: &[(String, Record)], report: &mut ValidationReport) {
        for field in &self.unique_fields {
            let mut first_seen: HashMap<String, &str> = HashMap::new();
            for (context, record) in records {
                let Some(value) = record.get(field).filter(|v| !v.is_null()) else {
                    continue;
                };
                let key = match value {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if let Some(first) = first_seen.get(&key) {
                    report.error(format!("{context}: duplicate {field} '{key}' (first seen in {first})"));
                } else {
                    first_seen.insert(key, context);
                }
            }
        }
    }
}

fn jsonl_records(content: &str, report: &mut ValidationReport) -> Vec<(String, Record)> {
    report.info("format", "jsonl");
    let mut records = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JsonValue>(line) {
            Ok(JsonValue::Object(record)) => records.push((format!("line {}", idx + 1), record)),
            Ok(other) => report.error(format!("line {}: expected an object, got {}", idx + 1, type_name(&other))),
            Err(err) => report.error(format!("line {}: invalid JSON: {err}", idx + 1)),
        }
    }
    report.info("record_count", records.len());
    records
}

/// Currency symbols and thousands separators are ignored: `$50,000` parses.
fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '\u{20ac}' | '\u{a3}') && !c.is_whitespace())
        .collect();
    cleaned.parse::<f64>().ok()
}

fn is_accepted_date(value: &str) -> bool {
    DATE_FORMATS
        .iter()
        .any(|fmt| NaiveDate::parse_from_str(value, fmt).is_ok())
        || DateTime::parse_from_rfc3339(value).is_ok()
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn grants() -> FileValidator {
        FileValidator::new(["grant_id", "amount", "date", "source"])
    }

    fn write(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).expect("write");
        path
    }

    #[test]
    fn valid_grant_array_passes() {
        let dir = tempdir().expect("tempdir");
        let path = write(
            dir.path(),
            "grants.json",
            r#"[{"grant_id":"G1","amount":"$50,000","date":"2024-01-15","source":"SFF"},
                {"grant_id":"G2","amount":75000,"date":"02/20/2024","source":"SFF"}]"#,
        );
        let report = grants().validate_file(&path);
        assert!(report.passed, "{report}");
        assert!(report.warnings.is_empty());
        assert_eq!(report.info["record_count"], 2);
    }

    #[test]
    fn absent_field_is_error_but_empty_field_is_warning() {
        let dir = tempdir().expect("tempdir");
        let path = write(
            dir.path(),
            "grants.json",
            r#"[{"grant_id":"G1","amount":1,"date":"","source":"SFF"},{"grant_id":"G2","amount":2,"date":"2024-01-01"}]"#,
        );
        let report = grants().validate_file(&path);
        assert!(!report.passed);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("'source'"));
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn bad_amount_fails_and_odd_date_warns() {
        let dir = tempdir().expect("tempdir");
        let path = write(
            dir.path(),
            "g.json",
            r#"{"grant_id":"G1","amount":"lots","date":"Jan 5th","source":"SFF"}"#,
        );
        let report = grants().validate_file(&path);
        assert!(!report.passed);
        assert!(report.errors[0].contains("invalid amount"));
        assert!(report.warnings[0].contains("non-standard"));
    }

    #[test]
    fn csv_checks_header_and_rows() {
        let dir = tempdir().expect("tempdir");
        let missing = write(dir.path(), "a.csv", "grant_id,amount,date\nG1,10,2024-01-01\n");
        let report = grants().validate_file(&missing);
        assert!(!report.passed);
        assert_eq!(report.errors, vec!["missing required column: source".to_string()]);

        let header_only = write(dir.path(), "b.csv", "grant_id,amount,date,source\n");
        let report = grants().validate_file(&header_only);
        assert!(report.passed);
        assert!(report.warnings.iter().any(|w| w.contains("no data rows")));
    }

    #[test]
    fn csv_quoted_cells_keep_embedded_commas() {
        let dir = tempdir().expect("tempdir");
        let path = write(
            dir.path(),
            "quoted.csv",
            "grant_id,amount,date,source\nG1,\"$50,000\",2024-01-15,SFF\n\"G2\",\"1,250.50\",02/20/2024,\"Open, Phil\"\n",
        );
        let report = grants().validate_file(&path);
        assert!(report.passed, "{report}");
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(report.info["record_count"], 2);
    }

    #[test]
    fn csv_short_trailing_row_warns_and_misses_fields() {
        let dir = tempdir().expect("tempdir");
        let path = write(
            dir.path(),
            "short.csv",
            "grant_id,amount,date,source\nG1,10,2024-01-01,SFF\nG2,20\n",
        );
        let report = grants().validate_file(&path);
        assert!(!report.passed);
        assert_eq!(report.warnings, vec!["row 2: expected 4 columns, found 2".to_string()]);
        assert!(report.errors.iter().any(|e| e == "row 2: missing required field 'date'"));
        assert!(report.errors.iter().any(|e| e == "row 2: missing required field 'source'"));
    }

    #[test]
    fn unique_fields_reject_repeats() {
        let dir = tempdir().expect("tempdir");
        let path = write(
            dir.path(),
            "g.jsonl",
            "{\"grant_id\":\"G1\",\"amount\":1,\"date\":\"2024-01-01\",\"source\":\"S\"}\n{\"grant_id\":\"G1\",\"amount\":2,\"date\":\"2024-01-02\",\"source\":\"S\"}\n",
        );
        let report = grants().with_unique_fields(["grant_id"]).validate_file(&path);
        assert!(!report.passed);
        assert!(report.errors[0].contains("duplicate grant_id 'G1'"));
    }

    #[test]
    fn unknown_extension_only_warns() {
        let dir = tempdir().expect("tempdir");
        let path = write(dir.path(), "notes.txt", "hello");
        let report = grants().validate_file(&path);
        assert!(report.passed);
        assert_eq!(report.warnings, vec!["unknown file type: .txt".to_string()]);
    }

    #[test]
    fn id_keyed_object_validates_each_value() {
        let dir = tempdir().expect("tempdir");
        let path = write(
            dir.path(),
            "keyed.json",
            r#"{"g1": {"grant_id":"G1","amount":1,"date":"2024-01-01","source":"S"}, "g2": {"grant_id":"G2","amount":2,"date":"2024-01-01"}}"#,
        );
        let report = grants().validate_file(&path);
        assert_eq!(report.info["record_count"], 2);
        assert!(report.errors[0].starts_with("record 'g2'"));
    }
}
