use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::Result;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use pdl_core::{str_field, DataLakeError, Record};
use pdl_storage::RecordFormat;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use crate::{map_directory, DirectoryRun};

pub const ENRICHMENT_VERSION: &str = "1.0.0";
/// Marker object listing the fields the enricher owns on a record.
pub const ENRICHMENT_MARKER: &str = "_enriched";
pub const MAX_TOPICS: usize = 10;
const TAGS_PER_RECORD: usize = 5;
const WORDS_PER_MINUTE: f64 = 225.0;

const TEMPORAL_FIELDS: [&str; 4] = ["year", "quarter", "month", "decade"];
const CONTENT_FIELDS: [&str; 4] = ["word_count", "reading_time_minutes", "paragraph_count", "has_code"];

const HIGH_SAFETY_KEYWORDS: [&str; 11] = [
    "alignment",
    "existential",
    "x-risk",
    "doom",
    "superintelligence",
    "mesa-optimization",
    "inner alignment",
    "outer alignment",
    "reward hacking",
    "deceptive alignment",
    "treacherous turn",
];

const MEDIUM_SAFETY_KEYWORDS: [&str; 8] = [
    "safety",
    "robustness",
    "interpretability",
    "transparency",
    "fairness",
    "bias",
    "explainability",
    "verification",
];

const RESEARCH_INDICATORS: [&str; 9] = [
    "theorem",
    "proof",
    "lemma",
    "corollary",
    "methodology",
    "experimental setup",
    "we propose",
    "our contribution",
    "novel approach",
];

const TUTORIAL_INDICATORS: [&str; 9] = [
    "introduction to",
    "beginner",
    "how to",
    "step by step",
    "tutorial",
    "getting started",
    "for example",
    "let's",
    "first, second, third",
];

const TOPIC_BUCKETS: [(&str, &[&str]); 7] = [
    ("interpretability", &["interpretability", "explainability", "transparency"]),
    ("alignment", &["alignment", "value learning", "reward modeling"]),
    ("robustness", &["robustness", "adversarial", "distribution shift"]),
    ("governance", &["governance", "policy", "regulation", "coordination"]),
    ("capabilities", &["capabilities", "scaling", "performance"]),
    ("rl", &["reinforcement learning", "rl", "reward"]),
    ("llm", &["language model", "llm", "gpt", "transformer"]),
];

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").expect("word pattern compiles"));
static PARAGRAPH_BREAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("paragraph pattern compiles"));
static CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```|`[^`]+`|def \w+\(|class \w+[:(]|import \w+|function \w+\(").expect("code pattern compiles")
});
static TOPIC_RES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    TOPIC_BUCKETS
        .iter()
        .map(|(topic, keywords)| {
            let alternatives: Vec<String> = keywords.iter().map(|kw| regex::escape(kw)).collect();
            let pattern = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
            (*topic, Regex::new(&pattern).expect("topic pattern compiles"))
        })
        .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SafetyRelevance {
    Low,
    Medium,
    High,
}

impl SafetyRelevance {
    pub fn as_str(self) -> &'static str {
        match self {
            SafetyRelevance::Low => "Low",
            SafetyRelevance::Medium => "Medium",
            SafetyRelevance::High => "High",
        }
    }
}

impl fmt::Display for SafetyRelevance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SafetyRelevance {
    type Err = DataLakeError;

    fn from_str(s: &str) -> Result<Self, DataLakeError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(SafetyRelevance::Low),
            "medium" => Ok(SafetyRelevance::Medium),
            "high" => Ok(SafetyRelevance::High),
            other => Err(DataLakeError::Validation {
                context: "safety relevance".to_string(),
                errors: vec![format!("unknown value '{other}'")],
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TechnicalLevel {
    Research,
    Tutorial,
    Overview,
}

impl TechnicalLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            TechnicalLevel::Research => "Research",
            TechnicalLevel::Tutorial => "Tutorial",
            TechnicalLevel::Overview => "Overview",
        }
    }
}

impl fmt::Display for TechnicalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TechnicalLevel {
    type Err = DataLakeError;

    fn from_str(s: &str) -> Result<Self, DataLakeError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "research" => Ok(TechnicalLevel::Research),
            "tutorial" => Ok(TechnicalLevel::Tutorial),
            "overview" => Ok(TechnicalLevel::Overview),
            other => Err(DataLakeError::Validation {
                context: "technical level".to_string(),
                errors: vec![format!("unknown value '{other}'")],
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Temporal {
    pub year: i32,
    pub quarter: String,
    pub month: u32,
    pub decade: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentMetrics {
    pub word_count: usize,
    pub reading_time_minutes: u64,
    pub paragraph_count: usize,
    pub has_code: bool,
}

/// Accepts `YYYY-MM-DD` and ISO datetimes with or without an offset.
pub fn temporal_fields(date: &str) -> Option<Temporal> {
    let date = date.trim();
    let parsed = if date.contains('T') {
        DateTime::parse_from_rfc3339(date)
            .map(|datetime| datetime.date_naive())
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(date, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|datetime| datetime.date())
            })?
    } else {
        NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?
    };
    let year = parsed.year();
    let month = parsed.month();
    Some(Temporal {
        year,
        quarter: format!("Q{}", (month - 1) / 3 + 1),
        month,
        decade: format!("{}s", year.div_euclid(10) * 10),
    })
}

pub fn content_metrics(text: &str) -> ContentMetrics {
    let word_count = WORD_RE.find_iter(text).count();
    let minutes = (word_count as f64 / WORDS_PER_MINUTE).round_ties_even() as u64;
    ContentMetrics {
        word_count,
        reading_time_minutes: minutes.max(1),
        paragraph_count: PARAGRAPH_BREAK_RE
            .split(text)
            .filter(|p| !p.trim().is_empty())
            .count(),
        has_code: CODE_RE.is_match(text),
    }
}

pub fn safety_relevance(title: &str, text: &str) -> SafetyRelevance {
    let combined = format!("{title} {text}").to_lowercase();
    let high = HIGH_SAFETY_KEYWORDS.iter().filter(|kw| combined.contains(*kw)).count();
    let medium = MEDIUM_SAFETY_KEYWORDS.iter().filter(|kw| combined.contains(*kw)).count();
    if high >= 2 {
        SafetyRelevance::High
    } else if high >= 1 || medium >= 3 {
        SafetyRelevance::Medium
    } else {
        SafetyRelevance::Low
    }
}

/// arXiv content is always research; otherwise the indicator counts decide.
pub fn technical_level(text: &str, source: &str) -> TechnicalLevel {
    if source.eq_ignore_ascii_case("arxiv") {
        return TechnicalLevel::Research;
    }
    let lower = text.to_lowercase();
    let research = RESEARCH_INDICATORS.iter().filter(|ind| lower.contains(*ind)).count();
    let tutorial = TUTORIAL_INDICATORS.iter().filter(|ind| lower.contains(*ind)).count();
    if research > tutorial && research >= 2 {
        TechnicalLevel::Research
    } else if tutorial > research && tutorial >= 2 {
        TechnicalLevel::Tutorial
    } else {
        TechnicalLevel::Overview
    }
}

/// The first few tags plus every topic bucket whose keywords occur in the
/// text, sorted and capped at [`MAX_TOPICS`].
pub fn primary_topics(text: &str, tags: &[String]) -> Vec<String> {
    let mut topics: BTreeSet<String> = tags
        .iter()
        .filter(|tag| !tag.trim().is_empty())
        .take(TAGS_PER_RECORD)
        .cloned()
        .collect();
    for (topic, re) in TOPIC_RES.iter() {
        if re.is_match(text) {
            topics.insert((*topic).to_string());
        }
    }
    topics.into_iter().take(MAX_TOPICS).collect()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichStats {
    pub total_records: usize,
    pub temporal_fields_added: usize,
    pub content_metrics_added: usize,
    pub categorizations_added: usize,
    #[serde(flatten)]
    pub files: DirectoryRun,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl EnrichStats {
    pub fn is_success(&self) -> bool {
        self.files.is_success()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Enricher;

impl Enricher {
    pub fn new() -> Self {
        Self
    }

    /// Adds derived fields. Fields listed in an existing marker are
    /// recomputed; any other field already on the record is left alone.
    pub fn enrich_record(&self, record: &Record, stats: &mut EnrichStats) -> Record {
        let mut base = record.clone();
        if let Some(JsonValue::Object(marker)) = base.remove(ENRICHMENT_MARKER) {
            if let Some(JsonValue::Array(owned)) = marker.get("fields") {
                for field in owned.iter().filter_map(JsonValue::as_str) {
                    base.remove(field);
                }
            }
        }

        let title = str_field(&base, "title");
        let text = str_field(&base, "text");
        let mut derived: Vec<(&'static str, JsonValue)> = Vec::new();

        if let Some(temporal) = base.get("date_published").and_then(JsonValue::as_str).and_then(temporal_fields) {
            derived.push(("year", json!(temporal.year)));
            derived.push(("quarter", json!(temporal.quarter)));
            derived.push(("month", json!(temporal.month)));
            derived.push(("decade", json!(temporal.decade)));
        }
        if !text.is_empty() {
            let metrics = content_metrics(text);
            derived.push(("word_count", json!(metrics.word_count)));
            derived.push(("reading_time_minutes", json!(metrics.reading_time_minutes)));
            derived.push(("paragraph_count", json!(metrics.paragraph_count)));
            derived.push(("has_code", json!(metrics.has_code)));
        }
        if !text.is_empty() || !title.is_empty() {
            derived.push(("safety_relevance", json!(safety_relevance(title, text).as_str())));
        }
        if !text.is_empty() {
            let level = technical_level(text, str_field(&base, "source"));
            derived.push(("technical_level", json!(level.as_str())));
        }
        let topics = primary_topics(text, &pdl_core::string_list(&base, "tags"));
        if !topics.is_empty() {
            derived.push(("primary_topics", json!(topics)));
        }

        let mut out = base.clone();
        let mut owned = Vec::new();
        for (field, value) in derived {
            if base.contains_key(field) {
                debug!(field, "source record already has field; not overwriting");
                continue;
            }
            if TEMPORAL_FIELDS.contains(&field) {
                stats.temporal_fields_added += 1;
            } else if CONTENT_FIELDS.contains(&field) {
                stats.content_metrics_added += 1;
            } else {
                stats.categorizations_added += 1;
            }
            out.insert(field.to_string(), value);
            owned.push(field);
        }
        owned.sort_unstable();
        out.insert(
            ENRICHMENT_MARKER.to_string(),
            json!({"enrichment_version": ENRICHMENT_VERSION, "fields": owned}),
        );
        out
    }

    pub fn enrich_batch(&self, records: Vec<Record>, stats: &mut EnrichStats) -> Vec<Record> {
        stats.total_records += records.len();
        records.iter().map(|record| self.enrich_record(record, stats)).collect()
    }
}

/// Enriches every record file under `source` into the same relative path
/// under `output`.
pub async fn enrich_directory(source: &Path, output: &Path, format: RecordFormat, enricher: &Enricher) -> Result<EnrichStats> {
    let mut stats = EnrichStats {
        started_at: Some(Utc::now()),
        ..EnrichStats::default()
    };
    let files = map_directory("enrich", source, output, format, |records| enricher.enrich_batch(records, &mut stats)).await?;
    stats.files = files;
    stats.finished_at = Some(Utc::now());
    info!(
        records = stats.total_records,
        temporal = stats.temporal_fields_added,
        metrics = stats.content_metrics_added,
        categorizations = stats.categorizations_added,
        "enrichment complete"
    );
    Ok(stats)
}
