//! Zone-to-zone migration: validate, back up, transfer, re-validate, record.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use pdl_core::{MetadataEnvelope, Zone};
use pdl_storage::{file_metadata, load_records, sha256_file, FileOps, MigrationState, DEFAULT_SPACE_MARGIN};
use pdl_validate::{EnvelopeValidator, FileValidator, SchemaValidator, ValidationReport};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;
use walkdir::WalkDir;

pub const CRATE_NAME: &str = "pdl-migrate";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Copy,
    Move,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Copy => "copy",
            Operation::Move => "move",
        }
    }
}

impl FromStr for Operation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "copy" => Ok(Operation::Copy),
            "move" => Ok(Operation::Move),
            other => bail!("unknown operation '{other}' (expected copy or move)"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub source_dir: PathBuf,
    pub dest_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub state_file: PathBuf,
    pub required_fields: Vec<String>,
    pub unique_fields: Vec<String>,
    pub date_fields: Vec<String>,
    pub schema_path: Option<PathBuf>,
    pub check_ascii: bool,
    pub fail_on_warning: bool,
    pub create_backups: bool,
    pub operation: Operation,
    pub extensions: Vec<String>,
    pub space_margin: f64,
    pub strict_record_count: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        let data = PathBuf::from("data");
        Self {
            source_dir: data.join(Zone::Raw.default_relative_path()).join("funding_sources"),
            dest_dir: data.join(Zone::Validated.default_relative_path()),
            backup_dir: data.join("_backups"),
            state_file: PathBuf::from("logs/migration/.migration_state.json"),
            required_fields: ["grant_id", "amount", "date", "source"].map(String::from).to_vec(),
            unique_fields: Vec::new(),
            date_fields: vec!["date".to_string()],
            schema_path: None,
            check_ascii: false,
            fail_on_warning: false,
            create_backups: true,
            operation: Operation::Copy,
            extensions: ["json", "jsonl", "csv", "txt"].map(String::from).to_vec(),
            space_margin: DEFAULT_SPACE_MARGIN,
            strict_record_count: false,
        }
    }
}

impl MigrationConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read migration config {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse migration config {}", path.display()))
    }

    /// Defaults, then the optional YAML file, then `PDL_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("PDL_SOURCE_DIR") {
            self.source_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PDL_DEST_DIR") {
            self.dest_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PDL_BACKUP_DIR") {
            self.backup_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PDL_STATE_FILE") {
            self.state_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("PDL_OPERATION") {
            self.operation = v.parse().context("invalid PDL_OPERATION")?;
        }
        Ok(())
    }

    /// Builds the record validator; an unusable schema document is fatal.
    pub fn file_validator(&self) -> Result<FileValidator> {
        let mut validator = FileValidator::new(self.required_fields.iter().cloned())
            .with_unique_fields(self.unique_fields.iter().cloned())
            .with_date_fields(self.date_fields.iter().cloned());
        if let Some(schema_path) = &self.schema_path {
            let schema = SchemaValidator::from_path(schema_path, self.check_ascii)
                .with_context(|| format!("failed to load validation schema {}", schema_path.display()))?;
            validator = validator.with_schema(Arc::new(schema));
        }
        Ok(validator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOutcome {
    Processed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub source: PathBuf,
    pub dest: Option<PathBuf>,
    pub outcome: FileOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStats {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub operation: Operation,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub files: Vec<FileReport>,
}

impl MigrationStats {
    fn new(operation: Operation) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            operation,
            processed: 0,
            skipped: 0,
            failed: 0,
            errors: Vec::new(),
            files: Vec::new(),
        }
    }

    fn record(&mut self, report: FileReport) {
        match report.outcome {
            FileOutcome::Processed => self.processed += 1,
            FileOutcome::Skipped => self.skipped += 1,
            FileOutcome::Failed => {
                self.failed += 1;
                if let Some(err) = &report.error {
                    self.errors.push(format!("{}: {err}", report.source.display()));
                }
            }
        }
        self.files.push(report);
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Per-file failure; carries the message that ends up in the run's error list.
#[derive(Debug)]
struct Failed(String);

impl<E: std::fmt::Display> From<E> for Failed {
    fn from(err: E) -> Self {
        Failed(err.to_string())
    }
}

pub struct DataMigrator {
    config: MigrationConfig,
    file_ops: FileOps,
    validator: FileValidator,
    envelope: EnvelopeValidator,
    state: MigrationState,
}

impl DataMigrator {
    pub async fn new(config: MigrationConfig) -> Result<Self> {
        let validator = config.file_validator()?;
        let state = MigrationState::load(&config.state_file).await;
        info!(
            source = %config.source_dir.display(),
            dest = %config.dest_dir.display(),
            operation = config.operation.as_str(),
            "data migrator initialized"
        );
        Ok(Self {
            file_ops: FileOps::new().with_space_margin(config.space_margin),
            envelope: EnvelopeValidator::new(config.strict_record_count),
            validator,
            state,
            config,
        })
    }

    pub fn with_file_ops(mut self, file_ops: FileOps) -> Self {
        self.file_ops = file_ops;
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn state(&self) -> &MigrationState {
        &self.state
    }

    /// Runs one migration pass. Per-file problems are counted in the returned
    /// stats; only a missing source root or an unwritable destination root
    /// aborts the run.
    pub async fn migrate(&mut self, pattern: Option<&str>, force: bool) -> Result<MigrationStats> {
        let mut stats = MigrationStats::new(self.config.operation);
        if !self.config.source_dir.is_dir() {
            bail!("source directory does not exist: {}", self.config.source_dir.display());
        }
        let source_root = std::fs::canonicalize(&self.config.source_dir)
            .with_context(|| format!("failed to resolve {}", self.config.source_dir.display()))?;
        tokio::fs::create_dir_all(&self.config.dest_dir)
            .await
            .with_context(|| format!("failed to create destination {}", self.config.dest_dir.display()))?;

        let matcher = pattern.map(file_name_matcher).transpose()?;
        let candidates = self.candidates(&source_root, matcher.as_ref())?;
        info!(
            run_id = %stats.run_id,
            files = candidates.len(),
            pattern = pattern.unwrap_or("*"),
            "starting migration"
        );

        if force {
            for path in &candidates {
                if self
                    .state
                    .remove(path)
                    .await
                    .with_context(|| format!("failed to update ledger {}", self.state.path().display()))?
                {
                    debug!(file = %path.display(), "forced reprocessing");
                }
            }
        }

        for source in candidates {
            let span = info_span!("migrate_file", run_id = %stats.run_id, file = %source.display());
            let report = self.process_file(&source_root, &source).instrument(span).await;
            stats.record(report);
        }

        stats.finished_at = Utc::now();
        info!(
            run_id = %stats.run_id,
            processed = stats.processed,
            skipped = stats.skipped,
            failed = stats.failed,
            "migration complete"
        );
        Ok(stats)
    }

    fn candidates(&self, root: &Path, matcher: Option<&GlobMatcher>) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase)
                .unwrap_or_default();
            if !self.config.extensions.iter().any(|e| e.eq_ignore_ascii_case(&extension)) {
                continue;
            }
            if matcher.is_some_and(|m| !m.is_match(entry.file_name())) {
                continue;
            }
            files.push(path.to_path_buf());
        }
        Ok(files)
    }

    async fn process_file(&mut self, source_root: &Path, source: &Path) -> FileReport {
        let mut dest = None;
        let outcome = self.transfer(source_root, source, &mut dest).await;
        match outcome {
            Ok(outcome) => FileReport {
                source: source.to_path_buf(),
                dest,
                outcome,
                error: None,
            },
            Err(Failed(message)) => {
                error!(error = %message, "file migration failed");
                FileReport {
                    source: source.to_path_buf(),
                    dest,
                    outcome: FileOutcome::Failed,
                    error: Some(message),
                }
            }
        }
    }

    async fn transfer(
        &mut self,
        source_root: &Path,
        source: &Path,
        dest_slot: &mut Option<PathBuf>,
    ) -> Result<FileOutcome, Failed> {
        let checksum = sha256_file(source)
            .await
            .map_err(|err| Failed(format!("could not calculate checksum: {err}")))?;
        if self.state.is_processed(source, &checksum) {
            debug!("already processed; skipping");
            return Ok(FileOutcome::Skipped);
        }
        info!(%checksum, "processing file");
        let metadata = file_metadata(source).await?;

        let report = self.validate(source);
        if !report.passed {
            return Err(Failed(format!("validation failed: {}", report.errors.join("; "))));
        }
        if report.has_warnings() {
            if self.config.fail_on_warning {
                return Err(Failed(format!(
                    "validation warnings treated as errors: {}",
                    report.warnings.join("; ")
                )));
            }
            warn!(warnings = ?report.warnings, "validation warnings");
        }

        let relative = source
            .strip_prefix(source_root)
            .map_err(|_| Failed(format!("{} is outside {}", source.display(), source_root.display())))?
            .to_path_buf();
        let dest = self.config.dest_dir.join(&relative);
        *dest_slot = Some(dest.clone());

        let mut backup = None;
        if self.config.create_backups && dest.exists() {
            let path = self
                .file_ops
                .backup(&dest, Some(&self.config.backup_dir), Some(&relative))
                .await
                .map_err(|err| Failed(format!("backup failed: {err}")))?;
            info!(backup = %path.display(), "backup created");
            backup = Some(path);
        }

        let transferred = match self.config.operation {
            Operation::Copy => self.file_ops.atomic_copy(source, &dest, true).await,
            Operation::Move => self.file_ops.atomic_move(source, &dest, true).await,
        };
        transferred.map_err(|err| Failed(format!("{} failed: {err}", self.config.operation.as_str())))?;

        let dest_report = self.validate(&dest);
        if !dest_report.passed {
            self.undo(source, &dest, backup.as_deref()).await;
            return Err(Failed(format!(
                "destination validation failed: {}",
                dest_report.errors.join("; ")
            )));
        }

        let info = serde_json::to_value(&report.info)?;
        self.state
            .mark_processed(source, &dest, metadata, info)
            .await
            .map_err(|err| Failed(format!("could not update ledger: {err}")))?;
        info!(dest = %dest.display(), operation = self.config.operation.as_str(), "file migrated");
        Ok(FileOutcome::Processed)
    }

    /// `_`-prefixed sidecars are envelopes; everything else holds records.
    fn validate(&self, path: &Path) -> ValidationReport {
        let is_sidecar = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('_'))
            .unwrap_or(false);
        if is_sidecar {
            self.envelope.validate_file(path, sibling_record_count(path))
        } else {
            self.validator.validate_file(path)
        }
    }

    /// Reverses a transfer whose destination failed re-validation. Copies
    /// restore the backup (or drop the new file); moves put the bytes back at
    /// the source first.
    async fn undo(&self, source: &Path, dest: &Path, backup: Option<&Path>) {
        let reverted = match self.config.operation {
            Operation::Copy => match backup {
                Some(_) => Ok(()),
                None => tokio::fs::remove_file(dest).await.map_err(pdl_core::DataLakeError::from),
            },
            Operation::Move => self.file_ops.atomic_move(dest, source, true).await.map(|_| ()),
        };
        if let Err(err) = reverted {
            error!(dest = %dest.display(), %err, "could not undo transfer");
        }
        if let Some(backup) = backup {
            match self.file_ops.restore_backup(backup, dest).await {
                Ok(_) => info!(backup = %backup.display(), "restored destination from backup"),
                Err(err) => error!(backup = %backup.display(), %err, "could not restore backup"),
            }
        }
    }
}

/// Record count of the batch a sidecar describes, if its data file is present.
fn sibling_record_count(sidecar: &Path) -> Option<usize> {
    if sidecar.file_name()?.to_str()? != MetadataEnvelope::FILE_NAME {
        return None;
    }
    let dir = sidecar.parent()?;
    ["data.jsonl", "data.json"]
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
        .and_then(|p| load_records(&p).ok())
        .map(|loaded| loaded.records.len() + loaded.failures.len())
}

/// Compiles a `--pattern` glob (`*`, `?`, `[...]`, `{a,b}`) matched against file names.
pub fn file_name_matcher(pattern: &str) -> Result<GlobMatcher> {
    Ok(Glob::new(pattern)
        .with_context(|| format!("invalid file pattern '{pattern}'"))?
        .compile_matcher())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn file_patterns() {
        let matches = |pattern: &str, name: &str| file_name_matcher(pattern).expect("pattern").is_match(name);
        assert!(matches("*", "grants.json"));
        assert!(matches("*.json", "grants.json"));
        assert!(!matches("*.json", "grants.jsonl"));
        assert!(matches("sff_??.csv", "sff_01.csv"));
        assert!(!matches("sff_?.csv", "sff_01.csv"));
        assert!(matches("grants_[ab].json", "grants_a.json"));
        assert!(!matches("grants_[ab].json", "grants_c.json"));
        assert!(matches("*.{json,csv}", "grants.csv"));
    }

    #[test]
    fn malformed_pattern_is_rejected() {
        assert!(file_name_matcher("grants_[ab.json").is_err());
    }

    #[test]
    fn env_overrides_apply_on_top_of_file_values() {
        let mut config: MigrationConfig =
            serde_yaml::from_str("source_dir: in\noperation: copy\nfail_on_warning: true\n").expect("yaml");
        let env: HashMap<&str, &str> = [("PDL_DEST_DIR", "out"), ("PDL_OPERATION", "move")].into();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .expect("env");

        assert_eq!(config.source_dir, PathBuf::from("in"));
        assert_eq!(config.dest_dir, PathBuf::from("out"));
        assert_eq!(config.operation, Operation::Move);
        assert!(config.fail_on_warning);
        assert_eq!(config.required_fields.len(), 4);
    }

    #[test]
    fn defaults_follow_zone_layout() {
        let config = MigrationConfig::default();
        assert_eq!(config.source_dir, PathBuf::from("data/raw/funding_sources"));
        assert_eq!(config.dest_dir, PathBuf::from("data/transformed/validated"));
    }

    #[test]
    fn bad_operation_is_rejected() {
        let mut config = MigrationConfig::default();
        assert!(config.apply_env(|_| Some("teleport".to_string())).is_err());
    }

    async fn migrator_in(root: &Path, operation: Operation) -> DataMigrator {
        let config = MigrationConfig {
            source_dir: root.join("raw"),
            dest_dir: root.join("validated"),
            backup_dir: root.join("_backups"),
            state_file: root.join("state.json"),
            operation,
            ..MigrationConfig::default()
        };
        DataMigrator::new(config).await.expect("migrator")
    }

    #[tokio::test]
    async fn undo_after_copy_restores_backup() {
        let dir = tempdir().expect("tempdir");
        let migrator = migrator_in(dir.path(), Operation::Copy).await;
        let source = dir.path().join("raw/a.json");
        let dest = dir.path().join("validated/a.json");
        let backup = dir.path().join("_backups/a.json");
        for (path, body) in [(&source, "new"), (&dest, "new"), (&backup, "old")] {
            std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            std::fs::write(path, body).expect("write");
        }

        migrator.undo(&source, &dest, Some(&backup)).await;

        assert_eq!(std::fs::read_to_string(&dest).expect("dest"), "old");
        assert!(source.exists());
    }

    #[tokio::test]
    async fn undo_after_move_returns_bytes_to_source() {
        let dir = tempdir().expect("tempdir");
        let migrator = migrator_in(dir.path(), Operation::Move).await;
        let source = dir.path().join("raw/a.json");
        let dest = dir.path().join("validated/a.json");
        std::fs::create_dir_all(dest.parent().expect("parent")).expect("mkdir");
        std::fs::write(&dest, "moved").expect("write");

        migrator.undo(&source, &dest, None).await;

        assert_eq!(std::fs::read_to_string(&source).expect("source"), "moved");
        assert!(!dest.exists());
    }
}
