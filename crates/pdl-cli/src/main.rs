use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pdl_core::{QualityTier, Zone};
use pdl_migrate::{DataMigrator, MigrationConfig, Operation};
use pdl_storage::RecordFormat;
use pdl_transform::{
    clean_directory, enrich_directory, publish, run_scoring, run_transform, Cleaner, Enricher, EventCatalog, Scorer,
    TierFilter,
};
use pdl_validate::{validate_dump, EnvelopeValidator, FileValidator, SchemaValidator, ValidationReport};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pdl")]
#[command(about = "PDoom data lake pipeline")]
struct Cli {
    /// Root that zone directories resolve against when a stage path is omitted.
    #[arg(long, global = true, default_value = "data")]
    data_root: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate and move raw files into the validated zone.
    Migrate {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        source: Option<PathBuf>,
        #[arg(long)]
        dest: Option<PathBuf>,
        #[arg(long)]
        operation: Option<Operation>,
        #[arg(long)]
        pattern: Option<String>,
        /// Reprocess files the ledger already marks as migrated.
        #[arg(long)]
        force: bool,
    },
    /// Validate a record file, a sidecar envelope, or a dump directory.
    Validate {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        schema: Option<PathBuf>,
        #[arg(long, value_delimiter = ',')]
        required: Vec<String>,
        #[arg(long)]
        no_ascii_check: bool,
        #[arg(long)]
        strict_record_count: bool,
    },
    Clean {
        #[arg(long)]
        source: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, default_value = "jsonl")]
        format: RecordFormat,
    },
    Enrich {
        #[arg(long)]
        source: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, default_value = "jsonl")]
        format: RecordFormat,
    },
    Score {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        source_dump: Option<String>,
    },
    Transform {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Score file used to restrict the run to `--tiers`.
        #[arg(long)]
        scores: Option<PathBuf>,
        #[arg(long, value_delimiter = ',', default_value = "A", requires = "scores")]
        tiers: Vec<QualityTier>,
    },
    /// Export the curated event catalog.
    Catalog {
        #[arg(long)]
        events: PathBuf,
        #[arg(long)]
        schema: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Write Parquet snapshots and the serveable manifest.
    Publish {
        #[arg(long)]
        serveable: Option<PathBuf>,
        #[arg(long)]
        scores: Option<PathBuf>,
        #[arg(long)]
        events: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_summary<T: Serialize>(label: &str, summary: &T) -> Result<()> {
    println!("{label}:\n{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

fn zone_dir(root: &Path, zone: Zone) -> PathBuf {
    root.join(zone.default_relative_path())
}

/// Explicit paths win; otherwise the stage reads `from` and writes the zone after it.
fn stage_dirs(root: &Path, from: Zone, source: Option<PathBuf>, output: Option<PathBuf>) -> Result<(PathBuf, PathBuf)> {
    let source = source.unwrap_or_else(|| zone_dir(root, from));
    let output = match output {
        Some(output) => output,
        None => match from.next() {
            Some(next) => zone_dir(root, next),
            None => bail!("{from:?} zone has no successor; pass --output"),
        },
    };
    Ok((source, output))
}

fn validate_input(
    input: &Path,
    schema: Option<&Path>,
    required: Vec<String>,
    check_ascii: bool,
    strict_record_count: bool,
) -> Result<ValidationReport> {
    let schema = schema
        .map(|path| SchemaValidator::from_path(path, check_ascii))
        .transpose()
        .context("failed to load validation schema")?;
    let envelope = EnvelopeValidator::new(strict_record_count);

    if input.is_dir() {
        let (report, _) = validate_dump(input, envelope, schema.as_ref())
            .with_context(|| format!("validating dump {}", input.display()))?;
        return Ok(report);
    }
    if pdl_transform::is_sidecar(input) {
        return Ok(envelope.validate_file(input, None));
    }
    match schema {
        Some(schema) => {
            let (report, stats) = schema
                .validate_file(input)
                .with_context(|| format!("validating {}", input.display()))?;
            info!(
                total = stats.total_records,
                valid = stats.valid_records,
                invalid = stats.invalid_records,
                "schema validation stats"
            );
            Ok(report)
        }
        None => Ok(FileValidator::new(required).validate_file(input)),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let root = cli.data_root;

    let succeeded = match cli.command {
        Commands::Migrate {
            config,
            source,
            dest,
            operation,
            pattern,
            force,
        } => {
            let mut config = MigrationConfig::load(config.as_deref())?;
            if let Some(source) = source {
                config.source_dir = source;
            }
            if let Some(dest) = dest {
                config.dest_dir = dest;
            }
            if let Some(operation) = operation {
                config.operation = operation;
            }
            let mut migrator = DataMigrator::new(config).await?;
            let stats = migrator.migrate(pattern.as_deref(), force).await?;
            print_summary("migration", &stats)?;
            stats.is_success()
        }
        Commands::Validate {
            input,
            schema,
            required,
            no_ascii_check,
            strict_record_count,
        } => {
            let required = if required.is_empty() {
                MigrationConfig::default().required_fields
            } else {
                required
            };
            let report = validate_input(&input, schema.as_deref(), required, !no_ascii_check, strict_record_count)?;
            print!("{report}");
            report.passed
        }
        Commands::Clean { source, output, format } => {
            let (source, output) = stage_dirs(&root, Zone::Validated, source, output)?;
            let stats = clean_directory(&source, &output, format, &Cleaner::default()).await?;
            print_summary("clean", &stats)?;
            stats.is_success()
        }
        Commands::Enrich { source, output, format } => {
            let (source, output) = stage_dirs(&root, Zone::Cleaned, source, output)?;
            let stats = enrich_directory(&source, &output, format, &Enricher::new()).await?;
            print_summary("enrich", &stats)?;
            stats.is_success()
        }
        Commands::Score {
            input,
            output,
            source_dump,
        } => {
            let scores = run_scoring(&Scorer::default(), &input, &output, source_dump.as_deref()).await?;
            let tiers: Vec<String> = scores
                .tier_summary
                .iter()
                .map(|(tier, bucket)| format!("{tier}={}", bucket.count))
                .collect();
            println!(
                "scoring complete: records={} skipped={} parse_failures={} tiers: {} output={}",
                scores.records.len(),
                scores.metadata.skipped_records,
                scores.metadata.parse_failures,
                tiers.join(" "),
                output.display()
            );
            scores.is_success()
        }
        Commands::Transform {
            source,
            output,
            scores,
            tiers,
        } => {
            let filter = scores.map(|path| TierFilter::new(path, tiers));
            let summary = run_transform(&source, &output, filter.as_ref()).await?;
            print_summary("transform", &summary)?;
            summary.is_success()
        }
        Commands::Catalog { events, schema, output } => {
            let catalog = EventCatalog::load_dir(&events)?;
            let schema = SchemaValidator::from_path(&schema, false)
                .with_context(|| format!("failed to load event schema {}", schema.display()))?;
            // Export either writes every slice or returns the validation error.
            let stats = catalog.export(&schema, &output).await?;
            print_summary("catalog", &stats)?;
            true
        }
        Commands::Publish {
            serveable,
            scores,
            events,
        } => {
            let serveable = serveable.unwrap_or_else(|| zone_dir(&root, Zone::Serveable));
            let summary = publish(&serveable, scores.as_deref(), events.as_deref()).await?;
            print_summary("publish", &summary)?;
            true
        }
    };

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
