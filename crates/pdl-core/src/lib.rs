//! Core domain model for the PDL data lake: records, zones, batch envelopes,
//! timeline events, and the shared error taxonomy.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "pdl-core";

/// One unit of source content. Keys serialize in sorted order, which keeps
/// every zone file byte-stable across re-runs.
pub type Record = serde_json::Map<String, JsonValue>;

/// Game-state snapshot keyed by impact variable name.
pub type GameState = BTreeMap<String, i64>;

pub const EVENT_ID_MAX_LEN: usize = 100;
pub const DESCRIPTION_MIN_LEN: usize = 20;
pub const DESCRIPTION_MAX_LEN: usize = 1000;

#[derive(Debug, Error)]
pub enum DataLakeError {
    #[error("not found: {0}")]
    NotFound(PathBuf),
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("insufficient space at {path}: need {required} bytes, {available} available")]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },
    #[error("{context}: {} validation error(s): {}", .errors.len(), .errors.join("; "))]
    Validation {
        context: String,
        errors: Vec<String>,
    },
    #[error("schema error: {0}")]
    Schema(String),
    #[error("parse error in {path} at line {line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = DataLakeError> = std::result::Result<T, E>;

pub fn record_id(record: &Record) -> Option<&str> {
    record
        .get("id")
        .and_then(JsonValue::as_str)
        .filter(|id| !id.is_empty())
}

/// String field accessor that treats absent, null, and non-string values alike.
pub fn str_field<'a>(record: &'a Record, key: &str) -> &'a str {
    record.get(key).and_then(JsonValue::as_str).unwrap_or_default()
}

pub fn string_list(record: &Record, key: &str) -> Vec<String> {
    match record.get(key) {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Pipeline stage directories, in flow order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    Raw,
    Validated,
    Cleaned,
    Enriched,
    Serveable,
}

impl Zone {
    pub const ALL: [Zone; 5] = [
        Zone::Raw,
        Zone::Validated,
        Zone::Cleaned,
        Zone::Enriched,
        Zone::Serveable,
    ];

    /// Conventional location of the zone relative to the data root.
    pub fn default_relative_path(self) -> PathBuf {
        match self {
            Zone::Raw => PathBuf::from("raw"),
            Zone::Validated => PathBuf::from("transformed").join("validated"),
            Zone::Cleaned => PathBuf::from("transformed").join("cleaned"),
            Zone::Enriched => PathBuf::from("transformed").join("enriched"),
            Zone::Serveable => PathBuf::from("serveable"),
        }
    }

    pub fn next(self) -> Option<Zone> {
        match self {
            Zone::Raw => Some(Zone::Validated),
            Zone::Validated => Some(Zone::Cleaned),
            Zone::Cleaned => Some(Zone::Enriched),
            Zone::Enriched => Some(Zone::Serveable),
            Zone::Serveable => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    WebScrape,
    Manual,
    Api,
}

impl ExtractionMethod {
    pub const ALLOWED: [&'static str; 3] = ["web_scrape", "manual", "api"];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Complete,
    Partial,
    Failed,
    Pending,
}

impl ExtractionStatus {
    pub const ALLOWED: [&'static str; 4] = ["complete", "partial", "failed", "pending"];
}

/// Sidecar `_metadata.json` describing one extraction batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEnvelope {
    pub extraction_date: String,
    pub source_name: String,
    pub source_url: String,
    pub extraction_method: ExtractionMethod,
    #[serde(default)]
    pub extractor_version: Option<String>,
    #[serde(default)]
    pub data_format: Option<String>,
    #[serde(default)]
    pub record_count: Option<u64>,
    pub extraction_status: ExtractionStatus,
    #[serde(default)]
    pub filters_applied: Vec<String>,
}

impl MetadataEnvelope {
    pub const FILE_NAME: &'static str = "_metadata.json";
    pub const REQUIRED_FIELDS: [&'static str; 6] = [
        "extraction_date",
        "source_name",
        "source_url",
        "extraction_method",
        "data_format",
        "extraction_status",
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QualityTier {
    A,
    B,
    C,
    D,
}

impl QualityTier {
    pub const ALL: [QualityTier; 4] = [QualityTier::A, QualityTier::B, QualityTier::C, QualityTier::D];

    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::A => "A",
            QualityTier::B => "B",
            QualityTier::C => "C",
            QualityTier::D => "D",
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityTier {
    type Err = DataLakeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(QualityTier::A),
            "B" => Ok(QualityTier::B),
            "C" => Ok(QualityTier::C),
            "D" => Ok(QualityTier::D),
            other => Err(DataLakeError::Validation {
                context: "quality tier".to_string(),
                errors: vec![format!("unknown tier '{other}'")],
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    OrganizationalCrisis,
    FundingCatastrophe,
    TechnicalFailure,
    RegulatoryPolicy,
    MediaDisaster,
    SafetyResearch,
    CorporateEthics,
    InternationalCompetition,
    AcademicCommunity,
    InstitutionalDecay,
    TechnicalResearchBreakthrough,
    Whistleblowing,
    PolicyDevelopment,
    PublicAwareness,
    CapabilityAdvance,
}

impl EventCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            EventCategory::OrganizationalCrisis => "organizational_crisis",
            EventCategory::FundingCatastrophe => "funding_catastrophe",
            EventCategory::TechnicalFailure => "technical_failure",
            EventCategory::RegulatoryPolicy => "regulatory_policy",
            EventCategory::MediaDisaster => "media_disaster",
            EventCategory::SafetyResearch => "safety_research",
            EventCategory::CorporateEthics => "corporate_ethics",
            EventCategory::InternationalCompetition => "international_competition",
            EventCategory::AcademicCommunity => "academic_community",
            EventCategory::InstitutionalDecay => "institutional_decay",
            EventCategory::TechnicalResearchBreakthrough => "technical_research_breakthrough",
            EventCategory::Whistleblowing => "whistleblowing",
            EventCategory::PolicyDevelopment => "policy_development",
            EventCategory::PublicAwareness => "public_awareness",
            EventCategory::CapabilityAdvance => "capability_advance",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rarity {
    Common,
    Uncommon,
    Rare,
    Legendary,
}

impl Rarity {
    pub fn as_str(self) -> &'static str {
        match self {
            Rarity::Common => "common",
            Rarity::Uncommon => "uncommon",
            Rarity::Rare => "rare",
            Rarity::Legendary => "legendary",
        }
    }
}

impl fmt::Display for Rarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Game-state dimensions an event can move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactVariable {
    Cash,
    Reputation,
    Research,
    Papers,
    EthicsRisk,
    Stress,
    BurnoutRisk,
    TechnicalDebt,
    MediaReputation,
    VibeyDoom,
}

impl ImpactVariable {
    pub fn as_str(self) -> &'static str {
        match self {
            ImpactVariable::Cash => "cash",
            ImpactVariable::Reputation => "reputation",
            ImpactVariable::Research => "research",
            ImpactVariable::Papers => "papers",
            ImpactVariable::EthicsRisk => "ethics_risk",
            ImpactVariable::Stress => "stress",
            ImpactVariable::BurnoutRisk => "burnout_risk",
            ImpactVariable::TechnicalDebt => "technical_debt",
            ImpactVariable::MediaReputation => "media_reputation",
            ImpactVariable::VibeyDoom => "vibey_doom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
        }
    }

    fn holds(self, lhs: i64, rhs: i64) -> bool {
        match self {
            CompareOp::Gt => lhs > rhs,
            CompareOp::Ge => lhs >= rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Le => lhs <= rhs,
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
        }
    }
}

static CONDITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:if\s+)?(?:requires_)?([A-Za-z_][A-Za-z0-9_]*)\s*(>=|<=|==|!=|>|<)\s*(-?\d+)\s*$")
        .expect("condition pattern compiles")
});

/// Impact guard, parsed once when an event is loaded. Serializes back to its
/// canonical string so the event JSON keeps the plain `"cash > 50"` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Condition {
    Comparison {
        field: String,
        operator: CompareOp,
        threshold: i64,
    },
}

impl Condition {
    /// Variables missing from the state read as 0.
    pub fn evaluate(&self, state: &GameState) -> bool {
        match self {
            Condition::Comparison {
                field,
                operator,
                threshold,
            } => operator.holds(state.get(field).copied().unwrap_or(0), *threshold),
        }
    }
}

impl FromStr for Condition {
    type Err = DataLakeError;

    fn from_str(s: &str) -> Result<Self> {
        let caps = CONDITION_RE.captures(s).ok_or_else(|| DataLakeError::Validation {
            context: "impact condition".to_string(),
            errors: vec![format!("unrecognised condition '{s}'")],
        })?;
        let operator = match &caps[2] {
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Ge,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            "==" => CompareOp::Eq,
            _ => CompareOp::Ne,
        };
        let threshold = caps[3].parse::<i64>().map_err(|err| DataLakeError::Validation {
            context: "impact condition".to_string(),
            errors: vec![format!("threshold in '{s}': {err}")],
        })?;
        Ok(Condition::Comparison {
            field: caps[1].to_string(),
            operator,
            threshold,
        })
    }
}

impl TryFrom<String> for Condition {
    type Error = DataLakeError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Condition> for String {
    fn from(value: Condition) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Comparison {
                field,
                operator,
                threshold,
            } => write!(f, "{field} {} {threshold}", operator.symbol()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Impact {
    pub variable: ImpactVariable,
    pub change: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Impact {
    pub fn unconditional(variable: ImpactVariable, change: i32) -> Self {
        Self {
            variable,
            change,
            condition: None,
        }
    }
}

/// Terminal artifact consumed by the game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: String,
    pub title: String,
    pub year: i32,
    pub category: EventCategory,
    pub description: String,
    #[serde(default)]
    pub impacts: Vec<Impact>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub rarity: Rarity,
    #[serde(default)]
    pub pdoom_impact: Option<i32>,
    #[serde(default)]
    pub safety_researcher_reaction: Option<String>,
    #[serde(default)]
    pub media_reaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// Catalog-only fields (triggers, probability modifiers, ...) carried through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl TimelineEvent {
    /// Checks the id, description, and impact invariants of the event schema.
    pub fn check_invariants(&self) -> Result<()> {
        let mut errors = Vec::new();
        if !is_valid_event_id(&self.id) {
            errors.push(format!(
                "id '{}' must match ^[a-z0-9_]+$ and be at most {EVENT_ID_MAX_LEN} characters",
                self.id
            ));
        }
        let description_len = self.description.chars().count();
        if !(DESCRIPTION_MIN_LEN..=DESCRIPTION_MAX_LEN).contains(&description_len) {
            errors.push(format!(
                "description length {description_len} outside {DESCRIPTION_MIN_LEN}..={DESCRIPTION_MAX_LEN}"
            ));
        }
        if self.title.trim().is_empty() {
            errors.push("title is empty".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DataLakeError::Validation {
                context: format!("event {}", self.id),
                errors,
            })
        }
    }

    /// Change per variable from the impacts whose condition holds. When several
    /// apply to one variable, the last one in list order wins.
    pub fn total_impact(&self, state: &GameState) -> BTreeMap<ImpactVariable, i64> {
        let mut totals = BTreeMap::new();
        for impact in &self.impacts {
            if let Some(condition) = &impact.condition {
                if !condition.evaluate(state) {
                    continue;
                }
            }
            totals.insert(impact.variable, i64::from(impact.change));
        }
        totals
    }

    /// Returns a new state with the event applied; touched variables stay within 0..=100.
    pub fn apply_to_state(&self, state: &GameState) -> GameState {
        let mut next = state.clone();
        for (variable, change) in self.total_impact(state) {
            let slot = next.entry(variable.as_str().to_string()).or_insert(0);
            *slot = (*slot + change).clamp(0, 100);
        }
        next
    }
}

pub fn is_valid_event_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= EVENT_ID_MAX_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Maps `key` onto `0..len` through SHA-256, so the same key picks the same
/// slot on every platform and in every run.
pub fn stable_index(key: &str, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % len as u64) as usize
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
