//! Checksummed, atomic file operations plus the migration ledger and record I/O
//! shared by every pipeline zone.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use pdl_core::{DataLakeError, Result};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

mod ledger;
mod records;

pub use ledger::{MigrationEntry, MigrationState};
pub use records::{load_records, save_json_pretty, save_jsonl, LoadedRecords, RecordFormat};

pub const CRATE_NAME: &str = "pdl-storage";

/// Extra headroom demanded on top of the file size before a transfer starts.
pub const DEFAULT_SPACE_MARGIN: f64 = 0.10;

const CHUNK_SIZE: usize = 8192;

/// Streams a file through SHA-256 in fixed-size chunks.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).await.map_err(|err| not_found_or(path, err))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FileMetadata {
    pub size_bytes: u64,
    pub modified_timestamp: f64,
    pub checksum: String,
}

pub async fn file_metadata(path: &Path) -> Result<FileMetadata> {
    let meta = fs::metadata(path).await.map_err(|err| not_found_or(path, err))?;
    let modified_timestamp = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    Ok(FileMetadata {
        size_bytes: meta.len(),
        modified_timestamp,
        checksum: sha256_file(path).await?,
    })
}

/// Reports free bytes for the filesystem holding `dir`.
pub trait SpaceProbe: Send + Sync {
    fn available_bytes(&self, dir: &Path) -> std::io::Result<u64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn available_bytes(&self, dir: &Path) -> std::io::Result<u64> {
        fs2::available_space(dir)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub destination: PathBuf,
    pub checksum: String,
    pub bytes: u64,
}

/// Copy / move / backup primitives. Every write lands in a temp file next to
/// the destination and is renamed into place, so a destination is either
/// absent or complete.
#[derive(Clone)]
pub struct FileOps {
    space_margin: f64,
    probe: Arc<dyn SpaceProbe>,
}

impl Default for FileOps {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FileOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileOps")
            .field("space_margin", &self.space_margin)
            .finish_non_exhaustive()
    }
}

impl FileOps {
    pub fn new() -> Self {
        Self {
            space_margin: DEFAULT_SPACE_MARGIN,
            probe: Arc::new(FsSpaceProbe),
        }
    }

    pub fn with_space_margin(mut self, margin: f64) -> Self {
        self.space_margin = margin.max(0.0);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    fn ensure_space(&self, dir: &Path, bytes: u64) -> Result<()> {
        let required = bytes + (bytes as f64 * self.space_margin).ceil() as u64;
        match self.probe.available_bytes(dir) {
            Ok(available) if available < required => Err(DataLakeError::InsufficientSpace {
                path: dir.to_path_buf(),
                required,
                available,
            }),
            Ok(_) => Ok(()),
            Err(err) => {
                debug!(dir = %dir.display(), %err, "free-space probe failed; assuming enough space");
                Ok(())
            }
        }
    }

    pub async fn atomic_copy(&self, source: &Path, dest: &Path, verify: bool) -> Result<TransferOutcome> {
        let meta = fs::metadata(source).await.map_err(|err| not_found_or(source, err))?;
        let parent = ensure_parent(dest).await?;
        self.ensure_space(&parent, meta.len())?;

        let source_checksum = sha256_file(source).await?;
        let temp_path = temp_path_for(&parent);

        if let Err(err) = fs::copy(source, &temp_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(not_found_or(source, err));
        }

        if verify {
            let temp_checksum = match sha256_file(&temp_path).await {
                Ok(sum) => sum,
                Err(err) => {
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(err);
                }
            };
            if temp_checksum != source_checksum {
                let _ = fs::remove_file(&temp_path).await;
                return Err(DataLakeError::Integrity {
                    path: dest.to_path_buf(),
                    expected: source_checksum,
                    actual: temp_checksum,
                });
            }
        }

        if let Err(err) = rename_into_place(&temp_path, dest).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        Ok(TransferOutcome {
            destination: dest.to_path_buf(),
            checksum: source_checksum,
            bytes: meta.len(),
        })
    }

    /// Same-volume moves are a single rename; anything else falls back to a
    /// verified copy followed by removing the source.
    pub async fn atomic_move(&self, source: &Path, dest: &Path, verify: bool) -> Result<TransferOutcome> {
        let meta = fs::metadata(source).await.map_err(|err| not_found_or(source, err))?;
        ensure_parent(dest).await?;
        let source_checksum = sha256_file(source).await?;

        match rename_into_place(source, dest).await {
            Ok(()) => {
                if verify {
                    let dest_checksum = sha256_file(dest).await?;
                    if dest_checksum != source_checksum {
                        return Err(DataLakeError::Integrity {
                            path: dest.to_path_buf(),
                            expected: source_checksum,
                            actual: dest_checksum,
                        });
                    }
                }
                Ok(TransferOutcome {
                    destination: dest.to_path_buf(),
                    checksum: source_checksum,
                    bytes: meta.len(),
                })
            }
            Err(err) => {
                debug!(source = %source.display(), %err, "rename failed; falling back to copy + delete");
                let outcome = self.atomic_copy(source, dest, verify).await?;
                fs::remove_file(source).await?;
                Ok(outcome)
            }
        }
    }

    /// Copies an existing file aside before it gets overwritten. With a backup
    /// root the copy keeps `relative` (or the bare file name) under that root;
    /// without one it becomes a sibling with a `.bak` suffix.
    pub async fn backup(&self, file: &Path, backup_root: Option<&Path>, relative: Option<&Path>) -> Result<PathBuf> {
        if fs::metadata(file).await.is_err() {
            return Err(DataLakeError::NotFound(file.to_path_buf()));
        }
        let backup_path = match backup_root {
            Some(root) => match relative {
                Some(rel) => root.join(rel),
                None => root.join(file.file_name().unwrap_or_default()),
            },
            None => {
                let mut name = file.file_name().unwrap_or_default().to_os_string();
                name.push(".bak");
                file.with_file_name(name)
            }
        };
        self.atomic_copy(file, &backup_path, true).await?;
        Ok(backup_path)
    }

    pub async fn restore_backup(&self, backup: &Path, original: &Path) -> Result<TransferOutcome> {
        if fs::metadata(backup).await.is_err() {
            return Err(DataLakeError::NotFound(backup.to_path_buf()));
        }
        self.atomic_copy(backup, original, true).await
    }
}

/// Writes `bytes` to `path` through a temp file and rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = ensure_parent(path).await?;
    let temp_path = temp_path_for(&parent);

    let write = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok::<(), std::io::Error>(())
    };
    if let Err(err) = write.await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err.into());
    }

    if let Err(err) = rename_into_place(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

async fn ensure_parent(path: &Path) -> Result<PathBuf> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent).await?;
    Ok(parent)
}

fn temp_path_for(dir: &Path) -> PathBuf {
    dir.join(format!(".{}.tmp", Uuid::new_v4()))
}

async fn rename_into_place(from: &Path, to: &Path) -> Result<()> {
    // Windows refuses to rename over an existing file.
    if cfg!(windows) && fs::try_exists(to).await.unwrap_or(false) {
        fs::remove_file(to).await?;
    }
    fs::rename(from, to).await.map_err(|err| {
        warn!(from = %from.display(), to = %to.display(), %err, "rename failed");
        DataLakeError::Io(err)
    })
}

fn not_found_or(path: &Path, err: std::io::Error) -> DataLakeError {
    if err.kind() == std::io::ErrorKind::NotFound {
        DataLakeError::NotFound(path.to_path_buf())
    } else {
        DataLakeError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct FixedProbe(u64);

    impl SpaceProbe for FixedProbe {
        fn available_bytes(&self, _dir: &Path) -> std::io::Result<u64> {
            Ok(self.0)
        }
    }

    fn leftover_temp_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count()
    }

    #[tokio::test]
    async fn file_hashing_is_stable() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello world").expect("write");
        assert_eq!(
            sha256_file(&path).await.expect("hash"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn copy_preserves_checksum_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("src.json");
        std::fs::write(&src, br#"[{"id":"a"}]"#).expect("write");
        let dest = dir.path().join("out/nested/dest.json");

        let outcome = FileOps::new().atomic_copy(&src, &dest, true).await.expect("copy");

        assert_eq!(outcome.checksum, sha256_file(&dest).await.expect("hash dest"));
        assert_eq!(outcome.checksum, sha256_file(&src).await.expect("hash src"));
        assert_eq!(leftover_temp_files(dest.parent().expect("parent")), 0);
    }

    #[tokio::test]
    async fn verified_move_removes_source() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("a.json");
        std::fs::write(&src, b"{}").expect("write");
        let dest = dir.path().join("zone/a.json");

        let outcome = FileOps::new().atomic_move(&src, &dest, true).await.expect("move");

        assert!(!src.exists());
        assert_eq!(outcome.checksum, sha256_file(&dest).await.expect("hash"));
    }

    #[tokio::test]
    async fn missing_source_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let err = FileOps::new()
            .atomic_copy(&dir.path().join("nope"), &dir.path().join("dest"), true)
            .await
            .expect_err("missing source");
        assert!(matches!(err, DataLakeError::NotFound(_)));
    }

    #[tokio::test]
    async fn space_check_includes_margin() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("big.bin");
        std::fs::write(&src, vec![0u8; 1000]).expect("write");
        let dest = dir.path().join("out/big.bin");

        let tight = FileOps::new().with_probe(Arc::new(FixedProbe(1050)));
        let err = tight.atomic_copy(&src, &dest, true).await.expect_err("no room");
        assert!(matches!(err, DataLakeError::InsufficientSpace { required: 1100, .. }));
        assert!(!dest.exists());

        let roomy = FileOps::new().with_probe(Arc::new(FixedProbe(1100)));
        roomy.atomic_copy(&src, &dest, true).await.expect("fits");
    }

    #[tokio::test]
    async fn backup_keeps_relative_layout_or_uses_bak_suffix() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("validated/sff/data.json");
        std::fs::create_dir_all(file.parent().expect("parent")).expect("mkdir");
        std::fs::write(&file, b"[1]").expect("write");
        let ops = FileOps::new();

        let root = dir.path().join("_backups");
        let rel = Path::new("sff/data.json");
        let in_root = ops.backup(&file, Some(&root), Some(rel)).await.expect("backup");
        assert_eq!(in_root, root.join("sff/data.json"));

        let sibling = ops.backup(&file, None, None).await.expect("sibling");
        assert_eq!(sibling, dir.path().join("validated/sff/data.json.bak"));

        std::fs::write(&file, b"[2]").expect("overwrite");
        ops.restore_backup(&sibling, &file).await.expect("restore");
        assert_eq!(std::fs::read(&file).expect("read"), b"[1]");
    }

    #[tokio::test]
    async fn write_atomic_replaces_existing_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        write_atomic(&path, b"first").await.expect("first");
        write_atomic(&path, b"second").await.expect("second");
        assert_eq!(std::fs::read(&path).expect("read"), b"second");
        assert_eq!(leftover_temp_files(dir.path()), 0);
    }
}
