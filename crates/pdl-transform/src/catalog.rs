use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::RangeBounds;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pdl_core::{DataLakeError, EventCategory, Rarity, Record, TimelineEvent};
use pdl_storage::save_json_pretty;
use pdl_validate::{SchemaStats, SchemaValidator};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::data_files;

pub const CATALOG_VERSION: &str = "1.0.0";

/// Hand-curated events indexed by id, category, and year. Built once; all
/// reads go through the query methods.
#[derive(Debug, Clone, Default)]
pub struct EventCatalog {
    events: BTreeMap<String, TimelineEvent>,
    by_category: BTreeMap<EventCategory, Vec<String>>,
    by_year: BTreeMap<i32, Vec<String>>,
}

impl EventCatalog {
    /// Later events replace earlier ones with the same id.
    pub fn from_events(events: impl IntoIterator<Item = TimelineEvent>) -> Self {
        let events: BTreeMap<String, TimelineEvent> = events.into_iter().map(|e| (e.id.clone(), e)).collect();
        let mut by_category: BTreeMap<EventCategory, Vec<String>> = BTreeMap::new();
        let mut by_year: BTreeMap<i32, Vec<String>> = BTreeMap::new();
        for (id, event) in &events {
            by_category.entry(event.category).or_default().push(id.clone());
            by_year.entry(event.year).or_default().push(id.clone());
        }
        Self {
            events,
            by_category,
            by_year,
        }
    }

    /// Reads every `*.json` file under `dir` in path order. A file holds
    /// either an id -> event object or an array of events. Any event that
    /// does not parse fails the whole load.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut events = Vec::new();
        let mut errors = Vec::new();

        for file in data_files(dir, &["json"])? {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let document: JsonValue =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;
            let file_name = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();

            let entries: Vec<(Option<String>, JsonValue)> = match document {
                JsonValue::Object(map) => map.into_iter().map(|(id, value)| (Some(id), value)).collect(),
                JsonValue::Array(items) => items.into_iter().map(|value| (None, value)).collect(),
                _ => {
                    errors.push(format!("{file_name}: expected an object or array of events"));
                    continue;
                }
            };

            for (key, value) in entries {
                let JsonValue::Object(mut map) = value else {
                    errors.push(format!("{file_name}: {}: event is not an object", key.unwrap_or_default()));
                    continue;
                };
                if let Some(key) = &key {
                    map.entry("id").or_insert_with(|| JsonValue::String(key.clone()));
                }
                map.insert("_metadata".to_string(), json!({"source_file": file_name}));
                let label = map.get("id").and_then(JsonValue::as_str).unwrap_or("?").to_string();
                match serde_json::from_value::<TimelineEvent>(JsonValue::Object(map)) {
                    Ok(event) => events.push(event),
                    Err(err) => errors.push(format!("{file_name}: {label}: {err}")),
                }
            }
        }

        if !errors.is_empty() {
            return Err(DataLakeError::Validation {
                context: format!("event catalog {}", dir.display()),
                errors,
            }
            .into());
        }
        let catalog = Self::from_events(events);
        info!(dir = %dir.display(), events = catalog.len(), "loaded event catalog");
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&TimelineEvent> {
        self.events.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimelineEvent> {
        self.events.values()
    }

    pub fn years(&self) -> impl Iterator<Item = i32> + '_ {
        self.by_year.keys().copied()
    }

    pub fn categories(&self) -> impl Iterator<Item = EventCategory> + '_ {
        self.by_category.keys().copied()
    }

    pub fn by_category(&self, category: EventCategory) -> Vec<&TimelineEvent> {
        self.resolve(self.by_category.get(&category).into_iter().flatten())
    }

    pub fn by_year(&self, year: i32) -> Vec<&TimelineEvent> {
        self.resolve(self.by_year.get(&year).into_iter().flatten())
    }

    pub fn by_year_range(&self, years: impl RangeBounds<i32>) -> Vec<&TimelineEvent> {
        self.resolve(self.by_year.range(years).flat_map(|(_, ids)| ids))
    }

    pub fn by_rarity(&self, rarity: Rarity) -> Vec<&TimelineEvent> {
        self.events.values().filter(|e| e.rarity == rarity).collect()
    }

    fn resolve<'a>(&'a self, ids: impl Iterator<Item = &'a String>) -> Vec<&'a TimelineEvent> {
        ids.filter_map(|id| self.events.get(id)).collect()
    }

    pub fn stats(&self) -> CatalogStats {
        let mut stats = CatalogStats {
            total_events: self.len(),
            ..CatalogStats::default()
        };
        for event in self.iter() {
            *stats.by_year.entry(event.year).or_default() += 1;
            *stats.by_category.entry(event.category.to_string()).or_default() += 1;
            *stats.by_rarity.entry(event.rarity.to_string()).or_default() += 1;
            for impact in &event.impacts {
                *stats.impact_variables.entry(impact.variable.as_str().to_string()).or_default() += 1;
            }
            let bucket = &mut stats.pdoom_impact_distribution;
            match event.pdoom_impact {
                None => bucket.null += 1,
                Some(n) if n < 0 => bucket.negative += 1,
                Some(0) => bucket.zero += 1,
                Some(_) => bucket.positive += 1,
            }
        }
        stats
    }

    /// Validates, cleans, re-validates, and writes every slice of the
    /// catalog under `output`. Nothing is written if any event fails.
    pub async fn export(&self, schema: &SchemaValidator, output: &Path) -> Result<CatalogStats> {
        let mut errors = Vec::new();
        let mut cleaned = Vec::with_capacity(self.len());
        let (mut seen_raw, mut seen_clean) = (HashSet::new(), HashSet::new());
        let mut schema_stats = SchemaStats::default();

        for (id, event) in &self.events {
            let problems = schema.check_record(&schema_view(event)?, &mut seen_raw, &mut schema_stats);
            if !problems.is_empty() {
                errors.push(format!("{id}: {}", problems.join("; ")));
                continue;
            }
            let clean = clean_event(event);
            let mut problems = schema.check_record(&schema_view(&clean)?, &mut seen_clean, &mut schema_stats);
            if let Err(DataLakeError::Validation { errors: invariant, .. }) = clean.check_invariants() {
                problems.extend(invariant);
            }
            if !problems.is_empty() {
                errors.push(format!("{id} (after cleaning): {}", problems.join("; ")));
                continue;
            }
            cleaned.push(clean);
        }

        if !errors.is_empty() {
            for error in &errors {
                warn!(%error, "catalog event failed validation");
            }
            return Err(DataLakeError::Validation {
                context: "catalog export".to_string(),
                errors,
            }
            .into());
        }

        let catalog = EventCatalog::from_events(cleaned);
        write_json(&output.join("all_events.json"), &catalog.events).await?;

        for year in catalog.years() {
            let slice = id_map(catalog.by_year(year));
            write_json(&output.join("by_year").join(format!("{year}.json")), &slice).await?;
        }
        for category in catalog.categories() {
            let slice = id_map(catalog.by_category(category));
            write_json(&output.join("by_category").join(format!("{category}.json")), &slice).await?;
        }

        let index: BTreeMap<&str, IndexEntry<'_>> = catalog
            .iter()
            .map(|e| {
                (
                    e.id.as_str(),
                    IndexEntry {
                        title: &e.title,
                        year: e.year,
                        category: e.category,
                        rarity: e.rarity,
                    },
                )
            })
            .collect();
        write_json(&output.join("event_index.json"), &index).await?;

        let manifest = CatalogManifest {
            version: CATALOG_VERSION,
            schema_version: schema.version(),
            generated_at: Utc::now(),
            total_events: catalog.len(),
            years: catalog.years().collect(),
            categories: catalog.categories().map(|c| c.to_string()).collect(),
            files: ManifestFiles {
                all_events: "all_events.json",
                by_year: "by_year/{year}.json",
                by_category: "by_category/{category}.json",
                index: "event_index.json",
                stats: "stats.json",
            },
        };
        write_json(&output.join("manifest.json"), &manifest).await?;

        let stats = catalog.stats();
        write_json(&output.join("stats.json"), &stats).await?;
        info!(output = %output.display(), events = stats.total_events, "catalog exported");
        Ok(stats)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PdoomDistribution {
    pub null: usize,
    pub negative: usize,
    pub zero: usize,
    pub positive: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    pub total_events: usize,
    pub by_year: BTreeMap<i32, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub by_rarity: BTreeMap<String, usize>,
    pub impact_variables: BTreeMap<String, usize>,
    pub pdoom_impact_distribution: PdoomDistribution,
}

#[derive(Serialize)]
struct IndexEntry<'a> {
    title: &'a str,
    year: i32,
    category: EventCategory,
    rarity: Rarity,
}

#[derive(Serialize)]
struct CatalogManifest<'a> {
    version: &'static str,
    schema_version: Option<&'a str>,
    generated_at: DateTime<Utc>,
    total_events: usize,
    years: Vec<i32>,
    categories: Vec<String>,
    files: ManifestFiles,
}

#[derive(Serialize)]
struct ManifestFiles {
    all_events: &'static str,
    by_year: &'static str,
    by_category: &'static str,
    index: &'static str,
    stats: &'static str,
}

/// The event as the schema sees it: `_`-prefixed bookkeeping keys removed.
fn schema_view(event: &TimelineEvent) -> Result<Record> {
    match serde_json::to_value(event).context("serializing event")? {
        JsonValue::Object(mut map) => {
            map.retain(|key, _| !key.starts_with('_'));
            Ok(map)
        }
        _ => Err(anyhow::anyhow!("event {} did not serialize to an object", event.id)),
    }
}

fn clean_event(event: &TimelineEvent) -> TimelineEvent {
    let mut clean = event.clone();
    clean.sources = sorted_unique(event.sources.iter().map(|s| s.trim().to_string()));
    clean.tags = sorted_unique(event.tags.iter().map(|t| t.trim().to_lowercase()));
    clean.title = event.title.trim().to_string();
    clean.description = event.description.trim().to_string();
    clean.safety_researcher_reaction = event.safety_researcher_reaction.as_deref().map(|s| s.trim().to_string());
    clean.media_reaction = event.media_reaction.as_deref().map(|s| s.trim().to_string());
    clean.extra.retain(|key, _| !key.starts_with('_'));
    clean
}

fn sorted_unique(items: impl Iterator<Item = String>) -> Vec<String> {
    items
        .filter(|s| !s.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn id_map(events: Vec<&TimelineEvent>) -> BTreeMap<&str, &TimelineEvent> {
    events.into_iter().map(|e| (e.id.as_str(), e)).collect()
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    save_json_pretty(path, value)
        .await
        .with_context(|| format!("writing {}", path.display()))
}
