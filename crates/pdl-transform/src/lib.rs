//! Record-level pipeline stages: clean, score, enrich, transform into
//! timeline events, curate the event catalog, publish analytics snapshots.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pdl_core::{DataLakeError, Record};
use pdl_storage::{load_records, save_json_pretty, save_jsonl, FileOps, RecordFormat};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use walkdir::WalkDir;

pub mod analytics;
pub mod catalog;
pub mod clean;
pub mod enrich;
pub mod events;
pub mod score;
pub mod text;

pub use analytics::{publish, PublishSummary};
pub use catalog::{CatalogStats, EventCatalog};
pub use clean::{clean_directory, CleanStats, Cleaner, NearDuplicate};
pub use enrich::{enrich_directory, EnrichStats, Enricher, SafetyRelevance, TechnicalLevel};
pub use events::{run_transform, transform_record, TierFilter, TransformSummary};
pub use score::{run_scoring, NewsletterDetector, QualityScore, RegexNewsletterDetector, ScoreFile, Scorer, ScoringConfig, TierThresholds};
pub use text::ascii_fold;

pub const CRATE_NAME: &str = "pdl-transform";

/// Sidecar files (`_metadata.json` and friends) ride along with a batch but
/// are never treated as record files.
pub fn is_sidecar(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('_'))
}

/// Record files under `root` whose extension is one of `extensions`, sorted
/// by path, sidecars excluded. A missing root is fatal.
pub fn data_files(root: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    walk_files(root, |path| {
        !is_sidecar(path)
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.iter().any(|want| ext.eq_ignore_ascii_case(want)))
    })
}

/// Extensions `load_records` reads, in the order a stage prefers them.
pub const RECORD_EXTENSIONS: [&str; 2] = ["jsonl", "json"];

/// Every record file under `root` that `load_records` can read.
pub fn record_files(root: &Path) -> Result<Vec<PathBuf>> {
    data_files(root, &RECORD_EXTENSIONS)
}

pub fn sidecar_files(root: &Path) -> Result<Vec<PathBuf>> {
    walk_files(root, is_sidecar)
}

fn walk_files(root: &Path, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(DataLakeError::NotFound(root.to_path_buf()).into());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if entry.file_type().is_file() && keep(entry.path()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Writes `records` in the format implied by `format`, atomically.
pub async fn write_records(path: &Path, records: &[Record], format: RecordFormat) -> Result<()> {
    match format {
        RecordFormat::Jsonl => save_jsonl(path, records).await,
        RecordFormat::Json => save_json_pretty(path, records).await,
    }
    .with_context(|| format!("writing {}", path.display()))
}

/// File-level outcome of running a record stage over a directory tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DirectoryRun {
    pub files_written: usize,
    pub failed_files: usize,
    pub parse_failures: usize,
    pub sidecars_copied: usize,
}

impl DirectoryRun {
    pub fn is_success(&self) -> bool {
        self.failed_files == 0 && self.parse_failures == 0
    }
}

/// Applies `transform` to the records of every `.jsonl`/`.json` file under
/// `source` and writes the result at the same relative path under `output`
/// with the extension of `format`, then copies sidecars across. An unreadable
/// file, or a second input mapping onto an output already written, is counted
/// and skipped; a failed write is fatal.
pub(crate) async fn map_directory<F>(
    stage: &'static str,
    source: &Path,
    output: &Path,
    format: RecordFormat,
    mut transform: F,
) -> Result<DirectoryRun>
where
    F: FnMut(Vec<Record>) -> Vec<Record>,
{
    let files = record_files(source)?;
    info!(stage, source = %source.display(), files = files.len(), "processing directory");
    let mut run = DirectoryRun::default();
    let mut written: HashSet<PathBuf> = HashSet::new();

    for file in files {
        let span = info_span!("stage_file", stage, file = %file.display());
        async {
            let dest = rebase(&file, source, output).with_extension(format.extension());
            if written.contains(&dest) {
                warn!(dest = %dest.display(), "another input already produced this output; skipping");
                run.failed_files += 1;
                return Ok(());
            }
            let loaded = match load_records(&file) {
                Ok(loaded) => loaded,
                Err(err) => {
                    warn!(error = %err, "cannot read record file; skipping");
                    run.failed_files += 1;
                    return Ok(());
                }
            };
            run.parse_failures += loaded.failures.len();

            let records = transform(loaded.records);
            write_records(&dest, &records, format).await?;
            run.files_written += 1;
            written.insert(dest.clone());
            info!(dest = %dest.display(), records = records.len(), "wrote file");
            Ok::<_, anyhow::Error>(())
        }
        .instrument(span)
        .await?;
    }

    let ops = FileOps::new();
    for sidecar in sidecar_files(source)? {
        let dest = rebase(&sidecar, source, output);
        ops.atomic_copy(&sidecar, &dest, true)
            .await
            .with_context(|| format!("copying sidecar {}", sidecar.display()))?;
        run.sidecars_copied += 1;
    }
    Ok(run)
}

/// `path` re-rooted from `from` onto `to`.
pub(crate) fn rebase(path: &Path, from: &Path, to: &Path) -> PathBuf {
    match path.strip_prefix(from) {
        Ok(relative) => to.join(relative),
        Err(_) => to.join(path.file_name().unwrap_or(path.as_os_str())),
    }
}
