use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use pdl_core::{record_id, str_field, Record};
use pdl_storage::RecordFormat;
use serde::Serialize;
use serde_json::Value as JsonValue;
use strsim::jaro_winkler;
use tracing::{info, warn};

use crate::text::normalize_text;
use crate::{ascii_fold, map_directory, DirectoryRun};

pub const TEXT_FIELDS: [&str; 4] = ["title", "text", "abstract", "description"];
pub const DATE_FIELDS: [&str; 2] = ["date_published", "date"];
pub const TRACKING_PARAMS: [&str; 7] = [
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_content",
    "utm_term",
    "fbclid",
    "gclid",
];
pub const DEFAULT_NEAR_DUPLICATE_THRESHOLD: f64 = 0.95;

/// Tried in order; `%m/%d` wins over `%d/%m` when both could apply.
const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d/%m/%Y"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%SZ"];

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanStats {
    pub total_records: usize,
    pub duplicates_removed: usize,
    pub records_without_id: usize,
    pub fields_normalized: usize,
    pub ascii_conversions: usize,
    pub unparsed_dates: usize,
    #[serde(flatten)]
    pub files: DirectoryRun,
    pub near_duplicates: Vec<NearDuplicate>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CleanStats {
    pub fn is_success(&self) -> bool {
        self.files.is_success()
    }
}

/// Two distinct records whose titles look alike. Reported, never merged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearDuplicate {
    pub id_a: String,
    pub id_b: String,
    pub similarity: f64,
}

#[derive(Debug, Clone)]
pub struct Cleaner {
    near_duplicate_threshold: f64,
}

impl Default for Cleaner {
    fn default() -> Self {
        Self {
            near_duplicate_threshold: DEFAULT_NEAR_DUPLICATE_THRESHOLD,
        }
    }
}

impl Cleaner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_near_duplicate_threshold(mut self, threshold: f64) -> Self {
        self.near_duplicate_threshold = threshold;
        self
    }

    /// Keeps the first record per id. Records without an id are all kept.
    pub fn deduplicate(&self, records: Vec<Record>, stats: &mut CleanStats) -> Vec<Record> {
        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(records.len());
        for record in records {
            match record_id(&record) {
                Some(id) => {
                    if !seen.insert(id.to_string()) {
                        stats.duplicates_removed += 1;
                        continue;
                    }
                }
                None => {
                    stats.records_without_id += 1;
                    warn!(title = str_field(&record, "title"), "record has no id; keeping it");
                }
            }
            kept.push(record);
        }
        kept
    }

    pub fn clean_record(&self, record: &Record, stats: &mut CleanStats) -> Record {
        let mut out = record.clone();

        for field in TEXT_FIELDS {
            if let Some(JsonValue::String(value)) = record.get(field) {
                if !value.is_ascii() {
                    stats.ascii_conversions += 1;
                }
                let cleaned = normalize_text(value);
                if cleaned != *value {
                    stats.fields_normalized += 1;
                    out.insert(field.to_string(), JsonValue::String(cleaned));
                }
            }
        }

        for field in DATE_FIELDS {
            let Some(JsonValue::String(value)) = record.get(field) else {
                continue;
            };
            if value.trim().is_empty() {
                continue;
            }
            match normalize_date(value) {
                Some(date) if date != *value => {
                    stats.fields_normalized += 1;
                    out.insert(field.to_string(), JsonValue::String(date));
                }
                Some(_) => {}
                None => {
                    stats.unparsed_dates += 1;
                    warn!(id = record_id(record).unwrap_or("unknown"), field, value = %value, "unrecognised date format; left unchanged");
                }
            }
        }

        if let Some(JsonValue::String(url)) = record.get("url") {
            let cleaned = normalize_url(url);
            if cleaned != *url {
                stats.fields_normalized += 1;
                out.insert("url".to_string(), JsonValue::String(cleaned));
            }
        }

        for (field, normalize) in [
            ("tags", normalize_tag as fn(&str) -> String),
            ("authors", normalize_author),
            ("sources", normalize_source),
        ] {
            let Some(JsonValue::Array(items)) = record.get(field) else {
                continue;
            };
            let cleaned: Vec<JsonValue> = items
                .iter()
                .filter_map(JsonValue::as_str)
                .map(normalize)
                .filter(|item| !item.is_empty())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(JsonValue::String)
                .collect();
            if cleaned != *items {
                stats.fields_normalized += 1;
                out.insert(field.to_string(), JsonValue::Array(cleaned));
            }
        }

        out
    }

    /// Deduplicates the whole batch, then normalises every surviving record.
    pub fn clean_batch(&self, records: Vec<Record>, stats: &mut CleanStats) -> Vec<Record> {
        stats.total_records += records.len();
        let deduped = self.deduplicate(records, stats);
        deduped.iter().map(|record| self.clean_record(record, stats)).collect()
    }

    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        jaro_winkler(&title_key(a), &title_key(b))
    }

    /// Pairs of distinct ids whose titles reach the near-duplicate threshold.
    pub fn near_duplicates(&self, records: &[Record]) -> Vec<NearDuplicate> {
        let titled: Vec<(&str, String)> = records
            .iter()
            .filter_map(|record| {
                let title = str_field(record, "title");
                let id = record_id(record)?;
                (!title.trim().is_empty()).then(|| (id, title_key(title)))
            })
            .collect();

        let mut pairs = Vec::new();
        for i in 0..titled.len() {
            for j in (i + 1)..titled.len() {
                if titled[i].0 == titled[j].0 {
                    continue;
                }
                let score = jaro_winkler(&titled[i].1, &titled[j].1);
                if score >= self.near_duplicate_threshold {
                    pairs.push(NearDuplicate {
                        id_a: titled[i].0.to_string(),
                        id_b: titled[j].0.to_string(),
                        similarity: score,
                    });
                }
            }
        }
        pairs
    }
}

fn title_key(title: &str) -> String {
    ascii_fold(title)
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `YYYY-MM-DD` form of `value`, or `None` when no accepted format matches.
pub fn normalize_date(value: &str) -> Option<String> {
    let value = value.trim();
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(value, format) {
            return Some(datetime.date().format("%Y-%m-%d").to_string());
        }
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|datetime| datetime.date_naive().format("%Y-%m-%d").to_string())
}

/// Drops tracking query parameters; a query left empty loses its `?`.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let (base, fragment) = match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    };
    let stripped = match base.split_once('?') {
        Some((path, query)) => {
            let kept: Vec<&str> = query
                .split('&')
                .filter(|pair| !pair.is_empty())
                .filter(|pair| {
                    let key = pair.split_once('=').map_or(*pair, |(key, _)| key);
                    !TRACKING_PARAMS.iter().any(|param| param.eq_ignore_ascii_case(key))
                })
                .collect();
            if kept.is_empty() {
                path.to_string()
            } else {
                format!("{path}?{}", kept.join("&"))
            }
        }
        None => base.to_string(),
    };
    match fragment {
        Some(fragment) => format!("{stripped}#{fragment}"),
        None => stripped,
    }
}

fn normalize_tag(tag: &str) -> String {
    ascii_fold(tag).trim().to_lowercase()
}

fn normalize_author(author: &str) -> String {
    ascii_fold(author).trim().to_string()
}

fn normalize_source(source: &str) -> String {
    normalize_url(&ascii_fold(source))
}

/// Cleans every record file under `source` into the same relative path under
/// `output`. Sidecars are copied across unchanged.
pub async fn clean_directory(source: &Path, output: &Path, format: RecordFormat, cleaner: &Cleaner) -> Result<CleanStats> {
    let mut stats = CleanStats {
        started_at: Some(Utc::now()),
        ..CleanStats::default()
    };
    let mut near_duplicates = Vec::new();
    let files = map_directory("clean", source, output, format, |records| {
        let cleaned = cleaner.clean_batch(records, &mut stats);
        for pair in cleaner.near_duplicates(&cleaned) {
            warn!(id_a = %pair.id_a, id_b = %pair.id_b, similarity = pair.similarity, "possible near-duplicate titles");
            near_duplicates.push(pair);
        }
        cleaned
    })
    .await?;
    stats.files = files;
    stats.near_duplicates = near_duplicates;

    stats.finished_at = Some(Utc::now());
    info!(
        records = stats.total_records,
        duplicates = stats.duplicates_removed,
        normalized = stats.fields_normalized,
        files = stats.files.files_written,
        "clean complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: JsonValue) -> Record {
        match value {
            JsonValue::Object(map) => map,
            _ => unreachable!("test records are objects"),
        }
    }

    #[test]
    fn dedup_keeps_first_occurrence_and_idless_records() {
        let cleaner = Cleaner::new();
        let mut stats = CleanStats::default();
        let out = cleaner.deduplicate(
            vec![
                record(json!({"id": "a", "title": "first"})),
                record(json!({"id": "b"})),
                record(json!({"id": "a", "title": "second"})),
                record(json!({"title": "anonymous"})),
                record(json!({"title": "anonymous"})),
            ],
            &mut stats,
        );
        assert_eq!(out.len(), 4);
        assert_eq!(out[0]["title"], "first");
        assert_eq!(stats.duplicates_removed, 1);
        assert_eq!(stats.records_without_id, 2);
    }

    #[test]
    fn dates_normalise_or_stay_put() {
        assert_eq!(normalize_date("2021-05-01").as_deref(), Some("2021-05-01"));
        assert_eq!(normalize_date("2021/05/01").as_deref(), Some("2021-05-01"));
        assert_eq!(normalize_date("05/01/2021").as_deref(), Some("2021-05-01"));
        assert_eq!(normalize_date("25/12/2020").as_deref(), Some("2020-12-25"));
        assert_eq!(normalize_date("2021-05-01T10:00:00").as_deref(), Some("2021-05-01"));
        assert_eq!(normalize_date("2021-05-01T10:00:00+02:00").as_deref(), Some("2021-05-01"));
        assert_eq!(normalize_date("sometime in May"), None);
        assert_eq!(normalize_date("2021-13-45"), None);
        assert_eq!(normalize_date("2021-02-30"), None);
    }

    #[test]
    fn tracking_params_are_stripped() {
        assert_eq!(
            normalize_url("https://example.org/post?utm_source=x&id=7&fbclid=abc"),
            "https://example.org/post?id=7"
        );
        assert_eq!(normalize_url(" https://example.org/a?gclid=1#top "), "https://example.org/a#top");
        assert_eq!(normalize_url("https://example.org/b"), "https://example.org/b");
    }

    #[test]
    fn lists_are_deduped_sorted_and_folded() {
        let mut stats = CleanStats::default();
        let out = Cleaner::new().clean_record(
            &record(json!({
                "id": "x",
                "tags": ["Safety ", "alignment", "safety", ""],
                "authors": ["Zo\u{eb}", "Al", "Al"],
            })),
            &mut stats,
        );
        assert_eq!(out["tags"], json!(["alignment", "safety"]));
        assert_eq!(out["authors"], json!(["Al", "Zoe"]));
        assert_eq!(stats.fields_normalized, 2);
    }

    #[test]
    fn cleaning_is_idempotent() {
        let cleaner = Cleaner::new();
        let mut stats = CleanStats::default();
        let once = cleaner.clean_batch(
            vec![record(json!({
                "id": "p1",
                "title": " \u{201c}Deceptive\u{201d} alignment\u{2026} ",
                "text": "Line\r\nnext",
                "date_published": "03/15/2022",
                "url": "https://x.org/?utm_term=a",
                "tags": ["B", "a"],
            }))],
            &mut stats,
        );
        let mut again_stats = CleanStats::default();
        let twice = cleaner.clean_batch(once.clone(), &mut again_stats);
        assert_eq!(once, twice);
        assert_eq!(again_stats.fields_normalized, 0);
        assert_eq!(once[0]["title"], "\"Deceptive\" alignment...");
        assert_eq!(once[0]["date_published"], "2022-03-15");
        assert_eq!(once[0]["url"], "https://x.org/");
    }

    #[tokio::test]
    async fn json_inputs_are_cleaned_into_jsonl_outputs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let validated = dir.path().join("validated/sff");
        std::fs::create_dir_all(&validated).expect("mkdir");
        std::fs::write(
            validated.join("papers.json"),
            r#"[{"id":"p1","title":" A "},{"id":"p1","title":"dup"},{"id":"p2","date_published":"2021-13-45"}]"#,
        )
        .expect("write");
        std::fs::write(validated.join("posts.jsonl"), "{\"id\":\"q1\"}\n").expect("write");

        let cleaned = dir.path().join("cleaned");
        let stats = clean_directory(&dir.path().join("validated"), &cleaned, RecordFormat::Jsonl, &Cleaner::new())
            .await
            .expect("clean");
        assert_eq!(stats.files.files_written, 2);
        assert_eq!((stats.total_records, stats.duplicates_removed, stats.unparsed_dates), (4, 1, 1));

        let papers = pdl_storage::load_records(&cleaned.join("sff/papers.jsonl")).expect("load").records;
        assert_eq!(papers.len(), 2);
        assert_eq!(papers[0]["title"], "A");
        assert_eq!(papers[1]["date_published"], "2021-13-45");
        assert!(cleaned.join("sff/posts.jsonl").exists());
    }

    #[test]
    fn near_duplicate_titles_are_reported_not_removed() {
        let cleaner = Cleaner::new();
        let records = vec![
            record(json!({"id": "a", "title": "Risks from Learned Optimization"})),
            record(json!({"id": "b", "title": "Risks from learned optimization."})),
            record(json!({"id": "c", "title": "Concrete Problems in AI Safety"})),
        ];
        let pairs = cleaner.near_duplicates(&records);
        assert_eq!(pairs.len(), 1);
        assert_eq!((pairs[0].id_a.as_str(), pairs[0].id_b.as_str()), ("a", "b"));
        assert!(cleaner.similarity("abc", "xyz") < DEFAULT_NEAR_DUPLICATE_THRESHOLD);
    }
}
