use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::{BooleanArray, Float64Array, Int32Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use pdl_core::{sha256_hex, TimelineEvent};
use pdl_storage::{save_json_pretty, write_atomic};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::info;

use crate::score::ScoreFile;

pub const MANIFEST_FILE: &str = "MANIFEST.json";
pub const ANALYTICS_DIR: &str = "analytics";
pub const MANIFEST_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedFile {
    pub name: String,
    /// Relative to the serveable root.
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoreDataset {
    pub records: usize,
    pub tiers: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventDataset {
    pub events: usize,
    pub years: Vec<i32>,
    pub categories: BTreeMap<String, usize>,
}

/// Contents of the serveable `MANIFEST.json`.
#[derive(Debug, Clone, Serialize)]
pub struct PublishSummary {
    pub version: &'static str,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<PublishedFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_scores: Option<ScoreDataset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeline_events: Option<EventDataset>,
}

/// Writes Parquet snapshots of a score file and/or an event file under
/// `serveable/analytics/` and describes them in `serveable/MANIFEST.json`.
pub async fn publish(serveable: &Path, scores: Option<&Path>, events: Option<&Path>) -> Result<PublishSummary> {
    if scores.is_none() && events.is_none() {
        bail!("nothing to publish: pass a score file, an event file, or both");
    }
    let mut summary = PublishSummary {
        version: MANIFEST_VERSION,
        generated_at: Utc::now(),
        files: Vec::new(),
        quality_scores: None,
        timeline_events: None,
    };

    if let Some(path) = scores {
        let score_file = ScoreFile::load(path)?;
        let bytes = parquet_bytes(&quality_scores_batch(&score_file)?)?;
        summary
            .files
            .push(publish_file(serveable, "quality_scores", "quality_scores.parquet", &bytes).await?);
        summary.quality_scores = Some(ScoreDataset {
            records: score_file.records.len(),
            tiers: score_file
                .tier_summary
                .iter()
                .map(|(tier, bucket)| (tier.clone(), bucket.count))
                .collect(),
        });
    }

    if let Some(path) = events {
        let events = load_events(path)?;
        let bytes = parquet_bytes(&timeline_events_batch(&events)?)?;
        summary
            .files
            .push(publish_file(serveable, "timeline_events", "timeline_events.parquet", &bytes).await?);
        let mut years: Vec<i32> = events.iter().map(|e| e.year).collect();
        years.sort_unstable();
        years.dedup();
        let mut categories = BTreeMap::new();
        for event in &events {
            *categories.entry(event.category.to_string()).or_default() += 1;
        }
        summary.timeline_events = Some(EventDataset {
            events: events.len(),
            years,
            categories,
        });
    }

    let manifest_path = serveable.join(MANIFEST_FILE);
    save_json_pretty(&manifest_path, &summary)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    info!(manifest = %manifest_path.display(), files = summary.files.len(), "published analytics snapshot");
    Ok(summary)
}

/// Accepts an event array, an id -> event object, or a directory holding
/// `all_events.json`.
pub fn load_events(path: &Path) -> Result<Vec<TimelineEvent>> {
    let file = if path.is_dir() {
        path.join("all_events.json")
    } else {
        path.to_path_buf()
    };
    let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
    let document: JsonValue = serde_json::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;
    let items = match document {
        JsonValue::Array(items) => items,
        JsonValue::Object(map) => map.into_iter().map(|(_, value)| value).collect(),
        _ => bail!("{}: expected an array or object of events", file.display()),
    };
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).with_context(|| format!("decoding event in {}", file.display())))
        .collect()
}

async fn publish_file(serveable: &Path, name: &str, file_name: &str, bytes: &[u8]) -> Result<PublishedFile> {
    let relative = Path::new(ANALYTICS_DIR).join(file_name);
    let path = serveable.join(&relative);
    write_atomic(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(PublishedFile {
        name: name.to_string(),
        path: relative.display().to_string(),
        sha256: sha256_hex(bytes),
        bytes: bytes.len() as u64,
    })
}

fn parquet_bytes(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None).context("opening parquet writer")?;
    writer.write(batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buffer)
}

fn quality_scores_batch(scores: &ScoreFile) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("quality_score", DataType::Float64, false),
        ArrowField::new("quality_tier", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("text_length", DataType::UInt64, false),
        ArrowField::new("is_newsletter", DataType::Boolean, false),
        ArrowField::new("has_authors", DataType::Boolean, false),
        ArrowField::new("year", DataType::Utf8, true),
        ArrowField::new("title_preview", DataType::Utf8, false),
    ]));

    let rows: Vec<_> = scores.records.values().collect();
    let source_ids = StringArray::from(rows.iter().map(|r| Some(r.source_id.as_str())).collect::<Vec<_>>());
    let quality_scores = Float64Array::from(rows.iter().map(|r| r.quality_score).collect::<Vec<_>>());
    let tiers = StringArray::from(rows.iter().map(|r| Some(r.quality_tier.as_str())).collect::<Vec<_>>());
    let sources = StringArray::from(rows.iter().map(|r| Some(r.signals.source.as_str())).collect::<Vec<_>>());
    let text_lengths = UInt64Array::from(rows.iter().map(|r| r.signals.text_length as u64).collect::<Vec<_>>());
    let newsletters = BooleanArray::from(rows.iter().map(|r| r.signals.is_newsletter).collect::<Vec<_>>());
    let authors = BooleanArray::from(rows.iter().map(|r| r.signals.has_authors).collect::<Vec<_>>());
    let years = StringArray::from(
        rows.iter()
            .map(|r| Some(r.signals.year.as_str()).filter(|y| !y.is_empty()))
            .collect::<Vec<_>>(),
    );
    let previews = StringArray::from(rows.iter().map(|r| Some(r.title_preview.as_str())).collect::<Vec<_>>());

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_ids),
            Arc::new(quality_scores),
            Arc::new(tiers),
            Arc::new(sources),
            Arc::new(text_lengths),
            Arc::new(newsletters),
            Arc::new(authors),
            Arc::new(years),
            Arc::new(previews),
        ],
    )
    .context("building quality_scores record batch")
}

fn timeline_events_batch(events: &[TimelineEvent]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("year", DataType::Int32, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("rarity", DataType::Utf8, false),
        ArrowField::new("impact_count", DataType::UInt32, false),
        ArrowField::new("pdoom_impact", DataType::Int32, true),
        ArrowField::new("source_id", DataType::Utf8, true),
    ]));

    let ids = StringArray::from(events.iter().map(|e| Some(e.id.as_str())).collect::<Vec<_>>());
    let titles = StringArray::from(events.iter().map(|e| Some(e.title.as_str())).collect::<Vec<_>>());
    let years = Int32Array::from(events.iter().map(|e| e.year).collect::<Vec<_>>());
    let categories = StringArray::from(events.iter().map(|e| Some(e.category.as_str())).collect::<Vec<_>>());
    let rarities = StringArray::from(events.iter().map(|e| Some(e.rarity.as_str())).collect::<Vec<_>>());
    let impact_counts = UInt32Array::from(
        events
            .iter()
            .map(|e| u32::try_from(e.impacts.len()).unwrap_or(u32::MAX))
            .collect::<Vec<_>>(),
    );
    let pdoom = Int32Array::from(events.iter().map(|e| e.pdoom_impact).collect::<Vec<_>>());
    let source_ids = StringArray::from(events.iter().map(|e| e.source_id.as_deref()).collect::<Vec<_>>());

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(titles),
            Arc::new(years),
            Arc::new(categories),
            Arc::new(rarities),
            Arc::new(impact_counts),
            Arc::new(pdoom),
            Arc::new(source_ids),
        ],
    )
    .context("building timeline_events record batch")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::Scorer;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use pdl_core::Record;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(value: JsonValue) -> Record {
        match value {
            JsonValue::Object(map) => map,
            _ => unreachable!("test records are objects"),
        }
    }

    fn parquet_rows(path: &Path) -> usize {
        let file = std::fs::File::open(path).expect("open parquet");
        ParquetRecordBatchReaderBuilder::try_new(file)
            .expect("reader")
            .build()
            .expect("build")
            .map(|batch| batch.expect("batch").num_rows())
            .sum()
    }

    #[tokio::test]
    async fn publishes_snapshots_with_checksummed_manifest() {
        let dir = tempdir().expect("tempdir");
        let scores_path = dir.path().join("scores.json");
        let scores = Scorer::default().score_batch(
            &[
                record(json!({"id": "a", "source": "arxiv", "authors": ["x"], "date_published": "2018-01-01"})),
                record(json!({"id": "b", "source": "blog"})),
            ],
            "data.jsonl",
            "dump",
        );
        std::fs::write(&scores_path, serde_json::to_vec(&scores).expect("json")).expect("write");

        let events_path = dir.path().join("all_events.json");
        std::fs::write(
            &events_path,
            serde_json::to_vec(&json!([{
                "id": "arxiv_a",
                "title": "A",
                "year": 2018,
                "category": "technical_research_breakthrough",
                "description": "A description that is long enough.",
                "impacts": [{"variable": "research", "change": 15}],
                "rarity": "rare",
                "pdoom_impact": null,
                "source_id": "a"
            }]))
            .expect("json"),
        )
        .expect("write");

        let serveable = dir.path().join("serveable");
        let summary = publish(&serveable, Some(&scores_path), Some(&events_path)).await.expect("publish");

        assert_eq!(summary.files.len(), 2);
        assert_eq!(parquet_rows(&serveable.join("analytics/quality_scores.parquet")), 2);
        assert_eq!(parquet_rows(&serveable.join("analytics/timeline_events.parquet")), 1);

        let on_disk = std::fs::read(serveable.join(&summary.files[0].path)).expect("read");
        assert_eq!(summary.files[0].sha256, sha256_hex(&on_disk));
        assert_eq!(summary.files[0].bytes, on_disk.len() as u64);

        let manifest: JsonValue =
            serde_json::from_str(&std::fs::read_to_string(serveable.join(MANIFEST_FILE)).expect("manifest"))
                .expect("json");
        assert_eq!(manifest["timeline_events"]["years"], json!([2018]));
        assert_eq!(manifest["quality_scores"]["tiers"]["A"], 1);
        assert_eq!(manifest["quality_scores"]["tiers"]["C"], 1);
    }

    #[tokio::test]
    async fn nothing_to_publish_is_an_error() {
        let dir = tempdir().expect("tempdir");
        assert!(publish(dir.path(), None, None).await.is_err());
    }
}
