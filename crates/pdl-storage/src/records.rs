use std::path::Path;
use std::str::FromStr;

use pdl_core::{DataLakeError, Record, Result};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    Jsonl,
    Json,
}

impl RecordFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "jsonl" => Some(RecordFormat::Jsonl),
            "json" => Some(RecordFormat::Json),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            RecordFormat::Jsonl => "jsonl",
            RecordFormat::Json => "json",
        }
    }
}

impl FromStr for RecordFormat {
    type Err = DataLakeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jsonl" => Ok(RecordFormat::Jsonl),
            "json" => Ok(RecordFormat::Json),
            other => Err(DataLakeError::Schema(format!("unsupported record format '{other}'"))),
        }
    }
}

/// Records read from one file plus the lines that could not be parsed.
#[derive(Debug, Default)]
pub struct LoadedRecords {
    pub records: Vec<Record>,
    pub failures: Vec<DataLakeError>,
}

/// Reads records from a `.jsonl` file (one object per line) or a `.json` file
/// holding an array, an id-keyed object of objects, or a single object.
/// Bad JSONL lines are skipped and reported in `failures`.
pub fn load_records(path: &Path) -> Result<LoadedRecords> {
    let format = RecordFormat::from_path(path)
        .ok_or_else(|| DataLakeError::Schema(format!("{}: not a .json or .jsonl file", path.display())))?;
    let text = std::fs::read_to_string(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            DataLakeError::NotFound(path.to_path_buf())
        } else {
            DataLakeError::Io(err)
        }
    })?;

    match format {
        RecordFormat::Jsonl => Ok(parse_jsonl(path, &text)),
        RecordFormat::Json => {
            let value: JsonValue = serde_json::from_str(&text).map_err(|err| DataLakeError::Parse {
                path: path.to_path_buf(),
                line: err.line(),
                message: err.to_string(),
            })?;
            Ok(records_from_json(path, value))
        }
    }
}

fn parse_jsonl(path: &Path, text: &str) -> LoadedRecords {
    let mut loaded = LoadedRecords::default();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = idx + 1;
        match serde_json::from_str::<JsonValue>(line) {
            Ok(JsonValue::Object(record)) => loaded.records.push(record),
            Ok(_) => loaded.failures.push(parse_failure(path, line_no, "line is not a JSON object".to_string())),
            Err(err) => loaded.failures.push(parse_failure(path, line_no, err.to_string())),
        }
    }
    loaded
}

fn records_from_json(path: &Path, value: JsonValue) -> LoadedRecords {
    let mut loaded = LoadedRecords::default();
    match value {
        JsonValue::Array(items) => {
            for (idx, item) in items.into_iter().enumerate() {
                match item {
                    JsonValue::Object(record) => loaded.records.push(record),
                    _ => loaded
                        .failures
                        .push(parse_failure(path, idx + 1, format!("array item {idx} is not an object"))),
                }
            }
        }
        JsonValue::Object(map) if is_id_keyed(&map) => {
            for (key, item) in map {
                if let JsonValue::Object(mut record) = item {
                    record.entry("id").or_insert(JsonValue::String(key));
                    loaded.records.push(record);
                }
            }
        }
        JsonValue::Object(record) => loaded.records.push(record),
        _ => loaded
            .failures
            .push(parse_failure(path, 1, "top-level value is not an array or object".to_string())),
    }
    loaded
}

fn is_id_keyed(map: &Record) -> bool {
    !map.is_empty() && !map.contains_key("id") && map.values().all(JsonValue::is_object)
}

fn parse_failure(path: &Path, line: usize, message: String) -> DataLakeError {
    warn!(path = %path.display(), line, %message, "skipping unparseable record");
    DataLakeError::Parse {
        path: path.to_path_buf(),
        line,
        message,
    }
}

/// Writes one compact JSON object per line, atomically.
pub async fn save_jsonl(path: &Path, records: &[Record]) -> Result<()> {
    let mut out = Vec::new();
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.push(b'\n');
    }
    write_atomic(path, &out).await
}

pub async fn save_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn jsonl_skips_bad_lines_and_reports_them() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("batch.jsonl");
        std::fs::write(&path, "{\"id\":\"a\"}\n\nnot json\n[1]\n{\"id\":\"b\"}\n").expect("write");

        let loaded = load_records(&path).expect("load");
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.failures.len(), 2);
        assert!(matches!(loaded.failures[0], DataLakeError::Parse { line: 3, .. }));
    }

    #[test]
    fn json_object_of_objects_is_keyed_by_id() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("events.json");
        std::fs::write(&path, r#"{"x": {"title": "X"}, "y": {"id": "custom", "title": "Y"}}"#).expect("write");

        let loaded = load_records(&path).expect("load");
        let ids: Vec<_> = loaded.records.iter().filter_map(pdl_core::record_id).collect();
        assert_eq!(ids, vec!["x", "custom"]);
    }

    #[test]
    fn single_json_object_is_one_record() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("one.json");
        std::fs::write(&path, r#"{"id": "solo", "title": "Solo"}"#).expect("write");
        assert_eq!(load_records(&path).expect("load").records.len(), 1);
    }

    #[tokio::test]
    async fn saved_jsonl_loads_back() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out/records.jsonl");
        let mut record = Record::new();
        record.insert("id".into(), JsonValue::String("a".into()));
        save_jsonl(&path, &[record.clone(), record]).await.expect("save");

        let loaded = load_records(&path).expect("load");
        assert_eq!(loaded.records.len(), 2);
        assert!(loaded.failures.is_empty());
    }
}
