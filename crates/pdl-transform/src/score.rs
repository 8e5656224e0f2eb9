use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pdl_core::{record_id, str_field, QualityTier, Record};
use pdl_storage::{load_records, save_json_pretty};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::text::truncate_chars;

pub const SCORE_FILE_VERSION: &str = "1.0.0";
const TITLE_PREVIEW_CHARS: usize = 80;
const TEXT_SAMPLE_CHARS: usize = 500;

const NEWSLETTER_PATTERNS: [&str; 12] = [
    r"\[AN #\d+\]",
    r"alignment newsletter",
    r"newsletter",
    r"linkpost",
    r"link post",
    r"\[linkpost\]",
    r"links for \w+",
    r"weekly.*digest",
    r"monthly.*roundup",
    r"weekly.*review",
    r"monthly.*review",
    r"^links:",
];

/// The leading patterns are specific enough to trust inside body text.
const STRONG_PATTERNS: usize = 2;

static TITLE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    NEWSLETTER_PATTERNS
        .iter()
        .map(|pattern| Regex::new(&format!("(?i){pattern}")).expect("newsletter pattern compiles"))
        .collect()
});

/// Decides whether a record is newsletter or link-roundup content.
pub trait NewsletterDetector: Send + Sync {
    fn is_newsletter(&self, title: &str, text: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegexNewsletterDetector;

impl NewsletterDetector for RegexNewsletterDetector {
    fn is_newsletter(&self, title: &str, text: &str) -> bool {
        if TITLE_PATTERNS.iter().any(|re| re.is_match(title)) {
            return true;
        }
        let sample = truncate_chars(text, TEXT_SAMPLE_CHARS);
        TITLE_PATTERNS[..STRONG_PATTERNS].iter().any(|re| re.is_match(sample))
    }
}

/// Signal weights of the scoring rubric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Source name to prestige bonus.
    pub prestige_sources: BTreeMap<String, f64>,
    pub has_authors: f64,
    pub not_newsletter: f64,
    pub long_text_chars: usize,
    pub long_text: f64,
    pub very_long_text_chars: usize,
    pub very_long_text: f64,
    /// Content published in or before this year earns `early_publication`.
    pub cutoff_year: i32,
    pub early_publication: f64,
    pub has_tags: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            prestige_sources: BTreeMap::from([("arxiv".to_string(), 3.0), ("distill".to_string(), 3.0)]),
            has_authors: 1.0,
            not_newsletter: 2.0,
            long_text_chars: 5000,
            long_text: 1.0,
            very_long_text_chars: 10000,
            very_long_text: 1.0,
            cutoff_year: 2019,
            early_publication: 1.0,
            has_tags: 0.5,
        }
    }
}

/// Minimum score per tier, checked from A downwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierThresholds {
    #[serde(rename = "A")]
    pub a: f64,
    #[serde(rename = "B")]
    pub b: f64,
    #[serde(rename = "C")]
    pub c: f64,
    #[serde(rename = "D")]
    pub d: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            a: 7.0,
            b: 4.0,
            c: 2.0,
            d: 0.0,
        }
    }
}

impl TierThresholds {
    pub fn tier_for(&self, score: f64) -> QualityTier {
        if score >= self.a {
            QualityTier::A
        } else if score >= self.b {
            QualityTier::B
        } else if score >= self.c {
            QualityTier::C
        } else {
            QualityTier::D
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signals {
    pub source: String,
    pub has_authors: bool,
    pub is_newsletter: bool,
    pub text_length: usize,
    /// Four-digit year prefix of `date_published`, empty when absent.
    pub year: String,
    pub has_tags: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub source_id: String,
    pub quality_score: f64,
    pub quality_tier: QualityTier,
    pub signals: Signals,
    pub title_preview: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreMetadata {
    pub version: String,
    pub created: DateTime<Utc>,
    pub source_file: String,
    pub source_dump: String,
    pub total_records: usize,
    #[serde(default)]
    pub skipped_records: usize,
    /// Input lines that were not JSON records.
    #[serde(default)]
    pub parse_failures: usize,
    pub scoring_config: ScoringConfig,
    pub tier_thresholds: TierThresholds,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierBucket {
    pub count: usize,
    pub ids: Vec<String>,
}

/// One scoring run over a whole batch. `tier_summary` is keyed by tier
/// letter so consumers can pull every id of a tier without a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreFile {
    #[serde(rename = "_metadata")]
    pub metadata: ScoreMetadata,
    pub records: BTreeMap<String, QualityScore>,
    pub tier_summary: BTreeMap<String, TierBucket>,
}

impl ScoreFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing score file {}", path.display()))
    }

    /// Every input record was parsed and keyed into the score file.
    pub fn is_success(&self) -> bool {
        self.metadata.skipped_records == 0 && self.metadata.parse_failures == 0
    }

    pub fn tier(&self, tier: QualityTier) -> &[String] {
        self.tier_summary
            .get(tier.as_str())
            .map(|bucket| bucket.ids.as_slice())
            .unwrap_or_default()
    }

    pub fn ids_for_tiers(&self, tiers: &[QualityTier]) -> HashSet<String> {
        tiers.iter().flat_map(|tier| self.tier(*tier).iter().cloned()).collect()
    }
}

pub struct Scorer {
    config: ScoringConfig,
    thresholds: TierThresholds,
    detector: Box<dyn NewsletterDetector>,
}

impl std::fmt::Debug for Scorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scorer")
            .field("config", &self.config)
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl Default for Scorer {
    fn default() -> Self {
        Self::new(ScoringConfig::default(), TierThresholds::default())
    }
}

impl Scorer {
    pub fn new(config: ScoringConfig, thresholds: TierThresholds) -> Self {
        Self {
            config,
            thresholds,
            detector: Box::new(RegexNewsletterDetector),
        }
    }

    pub fn with_detector(mut self, detector: Box<dyn NewsletterDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn thresholds(&self) -> &TierThresholds {
        &self.thresholds
    }

    pub fn signals(&self, record: &Record) -> Signals {
        let title = str_field(record, "title");
        let text = str_field(record, "text");
        let date = str_field(record, "date_published");
        let year = match date.get(..4) {
            Some(prefix) if prefix.bytes().all(|b| b.is_ascii_digit()) => prefix.to_string(),
            _ => String::new(),
        };
        Signals {
            source: str_field(record, "source").to_string(),
            has_authors: is_present(record.get("authors")),
            is_newsletter: self.detector.is_newsletter(title, text),
            text_length: text.chars().count(),
            year,
            has_tags: is_present(record.get("tags")),
        }
    }

    /// Weighted sum of the signals, rounded to one decimal.
    pub fn weigh(&self, signals: &Signals) -> f64 {
        let config = &self.config;
        let mut score = config
            .prestige_sources
            .get(&signals.source)
            .copied()
            .unwrap_or(0.0);
        if signals.has_authors {
            score += config.has_authors;
        }
        if !signals.is_newsletter {
            score += config.not_newsletter;
        }
        if signals.text_length > config.long_text_chars {
            score += config.long_text;
        }
        if signals.text_length > config.very_long_text_chars {
            score += config.very_long_text;
        }
        if signals.year.parse::<i32>().is_ok_and(|year| year <= config.cutoff_year) {
            score += config.early_publication;
        }
        if signals.has_tags {
            score += config.has_tags;
        }
        (score * 10.0).round() / 10.0
    }

    /// `None` for a record without an id.
    pub fn score_record(&self, record: &Record) -> Option<QualityScore> {
        let id = record_id(record)?;
        let signals = self.signals(record);
        let quality_score = self.weigh(&signals);
        Some(QualityScore {
            source_id: id.to_string(),
            quality_score,
            quality_tier: self.thresholds.tier_for(quality_score),
            signals,
            title_preview: truncate_chars(str_field(record, "title"), TITLE_PREVIEW_CHARS).to_string(),
        })
    }

    pub fn score_batch(&self, records: &[Record], source_file: &str, source_dump: &str) -> ScoreFile {
        let mut scored = BTreeMap::new();
        let mut tier_summary: BTreeMap<String, TierBucket> = QualityTier::ALL
            .iter()
            .map(|tier| (tier.as_str().to_string(), TierBucket::default()))
            .collect();
        let mut skipped = 0;

        for record in records {
            let Some(score) = self.score_record(record) else {
                warn!(title = str_field(record, "title"), "record has no id; not scored");
                skipped += 1;
                continue;
            };
            if scored.contains_key(&score.source_id) {
                warn!(id = %score.source_id, "duplicate id; keeping first score");
                skipped += 1;
                continue;
            }
            if let Some(bucket) = tier_summary.get_mut(score.quality_tier.as_str()) {
                bucket.count += 1;
                bucket.ids.push(score.source_id.clone());
            }
            scored.insert(score.source_id.clone(), score);
        }

        ScoreFile {
            metadata: ScoreMetadata {
                version: SCORE_FILE_VERSION.to_string(),
                created: Utc::now(),
                source_file: source_file.to_string(),
                source_dump: source_dump.to_string(),
                total_records: scored.len(),
                skipped_records: skipped,
                parse_failures: 0,
                scoring_config: self.config.clone(),
                tier_thresholds: self.thresholds,
            },
            records: scored,
            tier_summary,
        }
    }
}

fn is_present(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => false,
        Some(JsonValue::Array(items)) => !items.is_empty(),
        Some(JsonValue::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Scores one record file and writes the score file. `source_dump` defaults
/// to the name of the input's parent directory.
pub async fn run_scoring(scorer: &Scorer, input: &Path, output: &Path, source_dump: Option<&str>) -> Result<ScoreFile> {
    let loaded = load_records(input).with_context(|| format!("loading {}", input.display()))?;
    if !loaded.failures.is_empty() {
        warn!(file = %input.display(), failures = loaded.failures.len(), "skipped unparseable records");
    }
    let dump = match source_dump {
        Some(name) => name.to_string(),
        None => input
            .parent()
            .and_then(|dir| dir.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };

    let mut scores = scorer.score_batch(&loaded.records, &input.display().to_string(), &dump);
    scores.metadata.parse_failures = loaded.failures.len();
    save_json_pretty(output, &scores)
        .await
        .with_context(|| format!("writing {}", output.display()))?;

    let counts: Vec<String> = scores
        .tier_summary
        .iter()
        .map(|(tier, bucket)| format!("{tier}={}", bucket.count))
        .collect();
    info!(output = %output.display(), records = scores.metadata.total_records, tiers = %counts.join(" "), "scoring complete");
    Ok(scores)
}
