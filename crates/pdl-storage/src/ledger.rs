use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pdl_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::{write_atomic, FileMetadata};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationEntry {
    pub checksum: String,
    pub processed_at: DateTime<Utc>,
    pub dest_path: String,
    pub metadata: FileMetadata,
    #[serde(default)]
    pub validation_info: JsonValue,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    processed_files: BTreeMap<String, MigrationEntry>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

/// Persistent record of which source files have been migrated and at which
/// checksum. A file is considered done only while its bytes still hash to the
/// recorded value.
#[derive(Debug)]
pub struct MigrationState {
    path: PathBuf,
    entries: BTreeMap<String, MigrationEntry>,
}

impl MigrationState {
    /// A missing or unreadable ledger starts empty rather than failing the run.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<LedgerFile>(&bytes) {
                Ok(ledger) => ledger.processed_files,
                Err(err) => {
                    warn!(path = %path.display(), %err, "migration ledger is corrupt; starting empty");
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                warn!(path = %path.display(), %err, "migration ledger unreadable; starting empty");
                BTreeMap::new()
            }
        };
        info!(path = %path.display(), entries = entries.len(), "loaded migration ledger");
        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, source: &Path) -> Option<&MigrationEntry> {
        self.entries.get(&ledger_key(source))
    }

    pub fn is_processed(&self, source: &Path, current_checksum: &str) -> bool {
        self.get(source)
            .is_some_and(|entry| entry.checksum == current_checksum)
    }

    /// Records a successful migration and persists the ledger before returning.
    pub async fn mark_processed(
        &mut self,
        source: &Path,
        dest: &Path,
        metadata: FileMetadata,
        validation_info: JsonValue,
    ) -> Result<()> {
        let entry = MigrationEntry {
            checksum: metadata.checksum.clone(),
            processed_at: Utc::now(),
            dest_path: dest.display().to_string(),
            metadata,
            validation_info,
        };
        self.entries.insert(ledger_key(source), entry);
        self.persist().await
    }

    pub async fn remove(&mut self, source: &Path) -> Result<bool> {
        let removed = self.entries.remove(&ledger_key(source)).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn persist(&self) -> Result<()> {
        let ledger = LedgerFile {
            processed_files: self.entries.clone(),
            last_updated: Some(Utc::now()),
        };
        let bytes = serde_json::to_vec_pretty(&ledger)?;
        write_atomic(&self.path, &bytes).await
    }
}

fn ledger_key(source: &Path) -> String {
    std::fs::canonicalize(source)
        .or_else(|_| std::path::absolute(source))
        .unwrap_or_else(|_| source.to_path_buf())
        .display()
        .to_string()
}
