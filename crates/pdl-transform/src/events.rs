use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pdl_core::{
    record_id, stable_index, str_field, string_list, EventCategory, Impact, ImpactVariable, QualityTier, Rarity, Record,
    TimelineEvent, DESCRIPTION_MAX_LEN, DESCRIPTION_MIN_LEN, EVENT_ID_MAX_LEN,
};
use pdl_storage::{load_records, save_json_pretty};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, info_span, warn};

use crate::record_files;
use crate::enrich::{content_metrics, primary_topics, safety_relevance, technical_level, SafetyRelevance, TechnicalLevel};
use crate::score::ScoreFile;
use crate::text::{normalize_text, truncate_chars};

pub const DEFAULT_YEAR: i32 = 2020;
const ID_PREFIX_CHARS: usize = 16;
const TITLE_MAX_CHARS: usize = 200;
const MAX_TAGS: usize = 10;
const LONG_FORM_WORDS: usize = 3000;
const CATEGORY_TEXT_CHARS: usize = 500;

const PRESTIGE_SOURCES: [&str; 2] = ["arxiv", "distill"];
const FORUM_SOURCES: [&str; 3] = ["lesswrong", "alignmentforum", "eaforum"];
const CAPABILITY_TITLE_TERMS: [&str; 3] = ["gpt", "claude", "language model"];

fn safety_reactions(relevance: SafetyRelevance) -> &'static [&'static str] {
    match relevance {
        SafetyRelevance::High => &[
            "This is a significant contribution to alignment research",
            "Important work advancing our understanding of AI safety",
            "Critical insights for the field",
        ],
        SafetyRelevance::Medium => &[
            "Useful research for the community",
            "Interesting perspective on safety challenges",
            "Adds to our knowledge base",
        ],
        SafetyRelevance::Low => &[
            "Tangentially related to core safety concerns",
            "Provides general AI context",
            "Background research",
        ],
    }
}

fn media_reactions(source: &str) -> &'static [&'static str] {
    match source {
        "arxiv" => &[
            "Published in academic venue",
            "Academic research release",
            "Peer-reviewed publication",
        ],
        "distill" => &[
            "Featured in Distill",
            "Interactive research publication",
            "Visual machine learning research",
        ],
        "alignmentforum" => &["Discussed in AI safety community"],
        "lesswrong" => &["Shared in rationalist community"],
        "eaforum" => &["Featured in effective altruism discussions"],
        "deepmind" | "openai" | "anthropic" => &["Released by major AI lab"],
        _ => &[
            "Shared in AI safety community",
            "Published online",
            "Community discussion",
        ],
    }
}

/// `{source}_{id prefix}` reduced to `[a-z0-9_]`, underscores collapsed and
/// trimmed, at most [`EVENT_ID_MAX_LEN`] characters. Never empty.
pub fn event_id(record: &Record) -> String {
    let source = str_field(record, "source");
    let id = record_id(record).unwrap_or_default();
    let raw = format!("{source}_{}", truncate_chars(id, ID_PREFIX_CHARS)).to_lowercase();

    let mut slug = String::with_capacity(raw.len());
    for ch in raw.chars() {
        let ch = if ch.is_ascii_lowercase() || ch.is_ascii_digit() { ch } else { '_' };
        if ch == '_' && slug.ends_with('_') {
            continue;
        }
        slug.push(ch);
    }
    let slug = truncate_chars(slug.trim_matches('_'), EVENT_ID_MAX_LEN).trim_end_matches('_');
    if slug.is_empty() {
        "event".to_string()
    } else {
        slug.to_string()
    }
}

/// Categorical signals the mapping rules read. Taken from the enriched
/// fields when present, derived from the raw text otherwise.
#[derive(Debug, Clone)]
struct Signals {
    source: String,
    relevance: SafetyRelevance,
    level: Option<TechnicalLevel>,
    topics: Vec<String>,
    word_count: usize,
}

impl Signals {
    fn of(record: &Record) -> Self {
        let title = str_field(record, "title");
        let text = str_field(record, "text");
        let source = str_field(record, "source").to_lowercase();
        let relevance = str_field(record, "safety_relevance")
            .parse()
            .unwrap_or_else(|_| safety_relevance(title, text));
        let level = str_field(record, "technical_level")
            .parse()
            .ok()
            .or_else(|| (!text.is_empty()).then(|| technical_level(text, &source)));
        let mut topics = string_list(record, "primary_topics");
        if topics.is_empty() {
            topics = primary_topics(text, &string_list(record, "tags"));
        }
        let word_count = record
            .get("word_count")
            .and_then(JsonValue::as_u64)
            .map(|n| n as usize)
            .unwrap_or_else(|| content_metrics(text).word_count);
        Self {
            source,
            relevance,
            level,
            topics,
            word_count,
        }
    }

    fn prestige(&self) -> bool {
        PRESTIGE_SOURCES.contains(&self.source.as_str())
    }

    fn has_topic(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }
}

fn category(record: &Record, signals: &Signals) -> EventCategory {
    if signals.prestige() || signals.level == Some(TechnicalLevel::Research) {
        return EventCategory::TechnicalResearchBreakthrough;
    }
    let title = str_field(record, "title").to_lowercase();
    let text_head = truncate_chars(str_field(record, "text"), CATEGORY_TEXT_CHARS).to_lowercase();
    if signals.has_topic("governance")
        || title.contains("policy")
        || title.contains("governance")
        || text_head.contains("regulation")
        || text_head.contains("governance")
    {
        return EventCategory::PolicyDevelopment;
    }
    if FORUM_SOURCES.contains(&signals.source.as_str()) {
        return EventCategory::PublicAwareness;
    }
    if signals.has_topic("capabilities") || CAPABILITY_TITLE_TERMS.iter().any(|term| title.contains(term)) {
        return EventCategory::CapabilityAdvance;
    }
    EventCategory::TechnicalResearchBreakthrough
}

fn rarity(signals: &Signals) -> Rarity {
    let high = signals.relevance == SafetyRelevance::High;
    if high && signals.prestige() && signals.word_count > LONG_FORM_WORDS {
        Rarity::Legendary
    } else if high || signals.prestige() {
        Rarity::Rare
    } else {
        Rarity::Common
    }
}

fn impacts(signals: &Signals) -> Vec<Impact> {
    let research = match signals.level {
        Some(TechnicalLevel::Research) => 15,
        Some(TechnicalLevel::Tutorial) => 10,
        Some(TechnicalLevel::Overview) | None => 5,
    };
    let mut impacts = vec![Impact::unconditional(ImpactVariable::Research, research)];
    if signals.prestige() {
        impacts.push(Impact::unconditional(ImpactVariable::Papers, 10));
    }
    match signals.relevance {
        SafetyRelevance::High => impacts.push(Impact::unconditional(ImpactVariable::VibeyDoom, 5)),
        SafetyRelevance::Medium => impacts.push(Impact::unconditional(ImpactVariable::VibeyDoom, 2)),
        SafetyRelevance::Low => {}
    }
    if signals.has_topic("alignment") || signals.has_topic("interpretability") {
        impacts.push(Impact::unconditional(ImpactVariable::EthicsRisk, -5));
    }
    impacts
}

fn clamp_description(text: String) -> String {
    if text.chars().count() > DESCRIPTION_MAX_LEN {
        format!("{}...", truncate_chars(&text, DESCRIPTION_MAX_LEN - 3))
    } else {
        text
    }
}

/// Abstract, else the first paragraph of the text; ASCII, 20..=1000 chars.
pub fn description(record: &Record, title: &str) -> String {
    let abstract_text = str_field(record, "abstract").trim();
    let raw = if abstract_text.is_empty() {
        str_field(record, "text").split("\n\n").next().unwrap_or_default()
    } else {
        abstract_text
    };
    let description = clamp_description(normalize_text(raw));
    if description.chars().count() >= DESCRIPTION_MIN_LEN {
        return description;
    }
    clamp_description(format!("Research publication: {title}"))
}

fn event_year(record: &Record) -> i32 {
    if let Some(year) = record.get("year").and_then(JsonValue::as_i64) {
        if let Ok(year) = i32::try_from(year) {
            return year;
        }
    }
    str_field(record, "date_published")
        .get(..4)
        .and_then(|prefix| prefix.parse().ok())
        .unwrap_or(DEFAULT_YEAR)
}

/// Maps one enriched record to a timeline event and checks the event
/// invariants. Reaction text is picked by hashing the record id, so the
/// same record always yields the same event.
pub fn transform_record(record: &Record) -> pdl_core::Result<TimelineEvent> {
    let signals = Signals::of(record);
    let id = event_id(record);
    let selection_key = record_id(record).unwrap_or(id.as_str()).to_string();

    let folded_title = normalize_text(str_field(record, "title"));
    let title = match truncate_chars(&folded_title, TITLE_MAX_CHARS).trim() {
        "" => "Untitled".to_string(),
        title => title.to_string(),
    };

    let safety_pool = safety_reactions(signals.relevance);
    let media_pool = media_reactions(&signals.source);
    let url = str_field(record, "url");

    let event = TimelineEvent {
        id,
        description: description(record, &title),
        year: event_year(record),
        category: category(record, &signals),
        impacts: impacts(&signals),
        sources: if url.is_empty() { Vec::new() } else { vec![url.to_string()] },
        tags: string_list(record, "tags").into_iter().take(MAX_TAGS).collect(),
        rarity: rarity(&signals),
        pdoom_impact: None,
        safety_researcher_reaction: Some(
            safety_pool[stable_index(&format!("safety:{selection_key}"), safety_pool.len())].to_string(),
        ),
        media_reaction: Some(media_pool[stable_index(&format!("media:{selection_key}"), media_pool.len())].to_string()),
        source_id: record_id(record).map(str::to_string),
        extra: BTreeMap::new(),
        title,
    };
    event.check_invariants()?;
    Ok(event)
}

/// Restricts a transform run to the ids of selected tiers in a score file.
#[derive(Debug, Clone)]
pub struct TierFilter {
    pub score_file: PathBuf,
    pub tiers: Vec<QualityTier>,
}

impl TierFilter {
    pub fn new(score_file: impl Into<PathBuf>, tiers: Vec<QualityTier>) -> Self {
        Self {
            score_file: score_file.into(),
            tiers,
        }
    }

    pub fn load_ids(&self) -> Result<HashSet<String>> {
        Ok(ScoreFile::load(&self.score_file)?.ids_for_tiers(&self.tiers))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransformSummary {
    pub total_records: usize,
    pub parse_failures: usize,
    pub filtered_out: usize,
    pub events_created: usize,
    pub skipped: usize,
    pub duplicate_ids: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_rarity: BTreeMap<String, usize>,
    pub by_year: BTreeMap<i32, usize>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransformSummary {
    pub fn is_success(&self) -> bool {
        self.skipped == 0 && self.parse_failures == 0
    }
}

/// Transforms every record under `source` (a file or a directory of
/// `.jsonl`/`.json` files) and writes `all_events.json` plus one
/// `by_year/<year>.json` per year under `output`.
pub async fn run_transform(source: &Path, output: &Path, filter: Option<&TierFilter>) -> Result<TransformSummary> {
    let mut summary = TransformSummary {
        started_at: Some(Utc::now()),
        ..TransformSummary::default()
    };
    let files = if source.is_file() {
        vec![source.to_path_buf()]
    } else {
        record_files(source)?
    };
    let selected = filter.map(TierFilter::load_ids).transpose()?;
    if let (Some(filter), Some(ids)) = (filter, &selected) {
        info!(tiers = ?filter.tiers, ids = ids.len(), "restricting transform to scored tiers");
    }

    let mut events: Vec<TimelineEvent> = Vec::new();
    let mut seen = HashSet::new();
    for file in files {
        let _span = info_span!("transform_file", file = %file.display()).entered();
        let loaded = load_records(&file).with_context(|| format!("loading {}", file.display()))?;
        summary.parse_failures += loaded.failures.len();

        for record in &loaded.records {
            summary.total_records += 1;
            if let Some(ids) = &selected {
                if !record_id(record).is_some_and(|id| ids.contains(id)) {
                    summary.filtered_out += 1;
                    continue;
                }
            }
            let event = match transform_record(record) {
                Ok(event) => event,
                Err(err) => {
                    warn!(id = record_id(record).unwrap_or("unknown"), error = %err, "record did not produce a valid event");
                    summary.skipped += 1;
                    continue;
                }
            };
            if !seen.insert(event.id.clone()) {
                warn!(event_id = %event.id, "event id already produced; skipping");
                summary.duplicate_ids += 1;
                continue;
            }
            *summary.by_category.entry(event.category.to_string()).or_default() += 1;
            *summary.by_rarity.entry(event.rarity.to_string()).or_default() += 1;
            *summary.by_year.entry(event.year).or_default() += 1;
            events.push(event);
        }
    }
    summary.events_created = events.len();

    let all_path = output.join("all_events.json");
    save_json_pretty(&all_path, &events)
        .await
        .with_context(|| format!("writing {}", all_path.display()))?;

    let mut by_year: BTreeMap<i32, Vec<&TimelineEvent>> = BTreeMap::new();
    for event in &events {
        by_year.entry(event.year).or_default().push(event);
    }
    for (year, year_events) in &by_year {
        let path = output.join("by_year").join(format!("{year}.json"));
        save_json_pretty(&path, year_events)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
    }

    summary.finished_at = Some(Utc::now());
    info!(
        events = summary.events_created,
        skipped = summary.skipped,
        filtered = summary.filtered_out,
        years = by_year.len(),
        "transform complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdl_core::is_valid_event_id;
    use serde_json::json;

    fn record(value: JsonValue) -> Record {
        match value {
            JsonValue::Object(map) => map,
            _ => unreachable!("test records are objects"),
        }
    }

    #[test]
    fn event_ids_are_slugged() {
        let id = event_id(&record(json!({"source": "ArXiv", "id": "2105.01234v2--Extra-Long-Suffix"})));
        assert_eq!(id, "arxiv_2105_01234v2_ex");
        assert_eq!(event_id(&record(json!({"source": "", "id": "__"}))), "event");
        assert_eq!(event_id(&record(json!({"source": "\u{4e2d}\u{6587}", "id": "A-B"}))), "a_b");
        let long = event_id(&record(json!({"source": "s".repeat(150), "id": "x"})));
        assert!(is_valid_event_id(&long));
        assert_eq!(long.len(), EVENT_ID_MAX_LEN);
    }

    #[test]
    fn arxiv_high_relevance_long_paper_is_legendary_research() {
        let text = format!("Deceptive alignment and the treacherous turn. {}", "word ".repeat(3100));
        let event = transform_record(&record(json!({
            "id": "2105.01234",
            "source": "arxiv",
            "title": "Risks from \u{201c}Learned\u{201d} Optimization",
            "abstract": "We analyse mesa-optimization in learned models and its safety implications.",
            "text": text,
            "date_published": "2019-06-05",
            "url": "https://arxiv.org/abs/1906.01820",
            "tags": ["alignment"],
        })))
        .expect("event");

        assert_eq!(event.category, EventCategory::TechnicalResearchBreakthrough);
        assert_eq!(event.rarity, Rarity::Legendary);
        assert_eq!(event.year, 2019);
        assert_eq!(event.title, "Risks from \"Learned\" Optimization");
        assert_eq!(event.sources, vec!["https://arxiv.org/abs/1906.01820"]);
        assert_eq!(event.source_id.as_deref(), Some("2105.01234"));
        let variables: Vec<_> = event.impacts.iter().map(|i| (i.variable, i.change)).collect();
        assert_eq!(
            variables,
            vec![
                (ImpactVariable::Research, 15),
                (ImpactVariable::Papers, 10),
                (ImpactVariable::VibeyDoom, 5),
                (ImpactVariable::EthicsRisk, -5),
            ]
        );
    }

    #[test]
    fn category_cascade_for_forum_posts() {
        let policy = transform_record(&record(json!({
            "id": "p1", "source": "lesswrong", "title": "AI policy options",
            "text": "A long enough body about coordination between labs.",
        })))
        .expect("policy");
        assert_eq!(policy.category, EventCategory::PolicyDevelopment);

        let forum = transform_record(&record(json!({
            "id": "p2", "source": "alignmentforum", "title": "Musings",
            "text": "A long enough body about nothing in particular.",
        })))
        .expect("forum");
        assert_eq!(forum.category, EventCategory::PublicAwareness);
        assert_eq!(forum.media_reaction.as_deref(), Some("Discussed in AI safety community"));

        let capability = transform_record(&record(json!({
            "id": "p3", "source": "blog", "title": "What GPT-4 can do",
            "text": "A long enough body about nothing in particular.",
        })))
        .expect("capability");
        assert_eq!(capability.category, EventCategory::CapabilityAdvance);
        assert_eq!(capability.rarity, Rarity::Common);
    }

    #[test]
    fn short_descriptions_fall_back_to_the_title() {
        let event = transform_record(&record(json!({"id": "x", "source": "blog", "title": "Tiny", "text": "Short."})))
            .expect("event");
        assert_eq!(event.description, "Research publication: Tiny");
        assert_eq!(event.year, DEFAULT_YEAR);

        let long = description(&record(json!({"abstract": "a".repeat(2000)})), "t");
        assert_eq!(long.chars().count(), DESCRIPTION_MAX_LEN);
        assert!(long.ends_with("..."));
    }

    #[test]
    fn reactions_are_stable_per_record() {
        let input = record(json!({"id": "stable", "source": "distill", "title": "Feature visualization"}));
        let first = transform_record(&input).expect("first");
        for _ in 0..5 {
            let again = transform_record(&input).expect("again");
            assert_eq!(again.safety_researcher_reaction, first.safety_researcher_reaction);
            assert_eq!(again.media_reaction, first.media_reaction);
        }
    }
}
