use std::path::Path;

use pdl_migrate::{DataMigrator, FileOutcome, MigrationConfig, Operation};
use tempfile::tempdir;

const VALID: &str = r#"[{"grant_id":"G1","amount":"$10,000","date":"2024-01-15","source":"SFF"}]"#;
const MISSING_SOURCE: &str = r#"[{"grant_id":"G2","amount":500,"date":"2024-02-01"}]"#;

fn config_for(root: &Path) -> MigrationConfig {
    MigrationConfig {
        source_dir: root.join("raw/funding_sources"),
        dest_dir: root.join("transformed/validated"),
        backup_dir: root.join("_backups"),
        state_file: root.join("logs/.migration_state.json"),
        ..MigrationConfig::default()
    }
}

fn write(root: &Path, rel: &str, body: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(path, body).expect("write");
}

#[tokio::test]
async fn valid_file_migrates_and_invalid_file_never_lands() {
    let dir = tempdir().expect("tempdir");
    write(dir.path(), "raw/funding_sources/sff/good.json", VALID);
    write(dir.path(), "raw/funding_sources/sff/bad.json", MISSING_SOURCE);

    let mut migrator = DataMigrator::new(config_for(dir.path())).await.expect("migrator");
    let stats = migrator.migrate(None, false).await.expect("run");

    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 1);
    assert!(!stats.is_success());
    assert!(dir.path().join("transformed/validated/sff/good.json").exists());
    assert!(!dir.path().join("transformed/validated/sff/bad.json").exists());
    assert!(stats.errors[0].contains("grant_id") || stats.errors[0].contains("source"));
}

#[tokio::test]
async fn unchanged_files_are_skipped_and_changed_files_reprocessed() {
    let dir = tempdir().expect("tempdir");
    write(dir.path(), "raw/funding_sources/grants.json", VALID);

    let mut first = DataMigrator::new(config_for(dir.path())).await.expect("migrator");
    assert_eq!(first.migrate(None, false).await.expect("run").processed, 1);

    let mut second = DataMigrator::new(config_for(dir.path())).await.expect("migrator");
    let stats = second.migrate(None, false).await.expect("rerun");
    assert_eq!((stats.processed, stats.skipped), (0, 1));

    write(
        dir.path(),
        "raw/funding_sources/grants.json",
        &VALID.replace("G1", "G9"),
    );
    let mut third = DataMigrator::new(config_for(dir.path())).await.expect("migrator");
    let stats = third.migrate(None, false).await.expect("changed");
    assert_eq!((stats.processed, stats.skipped), (1, 0));

    // Overwriting the previous destination leaves a backup at the same relative path.
    let backup = std::fs::read_to_string(dir.path().join("_backups/grants.json")).expect("backup");
    assert!(backup.contains("G1"));
}

#[tokio::test]
async fn force_reprocesses_matching_files_only() {
    let dir = tempdir().expect("tempdir");
    write(dir.path(), "raw/funding_sources/a.json", VALID);
    write(dir.path(), "raw/funding_sources/b.csv", "grant_id,amount,date,source\nG1,10,2024-01-01,SFF\n");

    let mut migrator = DataMigrator::new(config_for(dir.path())).await.expect("migrator");
    assert_eq!(migrator.migrate(None, false).await.expect("run").processed, 2);

    let stats = migrator.migrate(Some("*.csv"), true).await.expect("forced");
    assert_eq!(stats.files.len(), 1);
    assert_eq!(stats.files[0].outcome, FileOutcome::Processed);
}

#[tokio::test]
async fn move_removes_source_and_sidecar_travels_with_batch() {
    let dir = tempdir().expect("tempdir");
    write(
        dir.path(),
        "raw/funding_sources/dump/data.json",
        VALID,
    );
    write(
        dir.path(),
        "raw/funding_sources/dump/_metadata.json",
        r#"{"extraction_date":"2025-01-01","source_name":"sff","source_url":"https://survivalandflourishing.fund","extraction_method":"web_scrape","data_format":"json","record_count":1,"extraction_status":"complete"}"#,
    );

    let config = MigrationConfig {
        operation: Operation::Move,
        ..config_for(dir.path())
    };
    let mut migrator = DataMigrator::new(config).await.expect("migrator");
    let stats = migrator.migrate(None, false).await.expect("run");

    assert!(stats.is_success(), "{:?}", stats.errors);
    assert_eq!(stats.processed, 2);
    assert!(!dir.path().join("raw/funding_sources/dump/data.json").exists());
    assert!(dir.path().join("transformed/validated/dump/_metadata.json").exists());
}

#[tokio::test]
async fn warnings_fail_only_when_configured() {
    let dir = tempdir().expect("tempdir");
    write(
        dir.path(),
        "raw/funding_sources/odd_date.json",
        r#"[{"grant_id":"G1","amount":1,"date":"sometime in 2024","source":"SFF"}]"#,
    );

    let strict = MigrationConfig {
        fail_on_warning: true,
        ..config_for(dir.path())
    };
    let stats = DataMigrator::new(strict)
        .await
        .expect("migrator")
        .migrate(None, false)
        .await
        .expect("run");
    assert_eq!(stats.failed, 1);

    let stats = DataMigrator::new(config_for(dir.path()))
        .await
        .expect("migrator")
        .migrate(None, false)
        .await
        .expect("run");
    assert_eq!(stats.processed, 1);
}

#[tokio::test]
async fn missing_source_root_is_fatal() {
    let dir = tempdir().expect("tempdir");
    let mut migrator = DataMigrator::new(config_for(dir.path())).await.expect("migrator");
    assert!(migrator.migrate(None, false).await.is_err());
}

#[tokio::test]
async fn pattern_classes_select_files_and_malformed_pattern_fails_the_run() {
    let dir = tempdir().expect("tempdir");
    for name in ["grants_a.json", "grants_b.json", "grants_c.json"] {
        write(dir.path(), &format!("raw/funding_sources/{name}"), VALID);
    }

    let mut migrator = DataMigrator::new(config_for(dir.path())).await.expect("migrator");
    let stats = migrator.migrate(Some("grants_[ab].json"), false).await.expect("run");
    assert_eq!(stats.processed, 2);
    assert!(!dir.path().join("transformed/validated/grants_c.json").exists());

    assert!(migrator.migrate(Some("grants_[ab.json"), false).await.is_err());
}
