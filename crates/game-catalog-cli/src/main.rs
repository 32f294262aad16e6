use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use game_catalog_api::{
    database_integrity, database_version, run_import, run_merge, run_verify, ImportConfig,
    MergeConfig, DEFAULT_ARCHIVE_ROOT, DEFAULT_CATALOG_PATH, DEFAULT_TARGET_DB,
};
use game_catalog_core::CatalogError;
use serde_json::Value;
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "gcat")]
#[command(about = "TurboStage game catalog merge tool")]
struct Cli {
    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Submission {
        #[command(subcommand)]
        command: SubmissionCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Copy new games from another catalog database.
    Import(DbImportArgs),
    Version(DbPathArgs),
    IntegrityCheck(DbPathArgs),
}

#[derive(Debug, Args)]
struct DbImportArgs {
    /// Database to read games from.
    source: PathBuf,

    /// Database to import into; created when missing.
    #[arg(short, long, default_value = DEFAULT_TARGET_DB)]
    out: PathBuf,

    /// Write a backup of the existing target here before importing.
    #[arg(long)]
    backup: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DbPathArgs {
    #[arg(long, default_value = DEFAULT_TARGET_DB)]
    db: PathBuf,
}

#[derive(Debug, Subcommand)]
enum SubmissionCommand {
    /// Merge a submission into the JSON catalog.
    Merge(SubmissionMergeArgs),
    /// Check a submission's hashes against legal archives without merging.
    Verify(SubmissionVerifyArgs),
}

#[derive(Debug, Args)]
struct SubmissionMergeArgs {
    submission: PathBuf,

    /// Folder with legal .zip archives.
    #[arg(default_value = DEFAULT_ARCHIVE_ROOT)]
    archives: PathBuf,

    #[arg(long, default_value = DEFAULT_CATALOG_PATH)]
    catalog: PathBuf,

    /// Verify hashes against the archives before merging.
    #[arg(long)]
    validate: bool,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct SubmissionVerifyArgs {
    submission: PathBuf,

    #[arg(default_value = DEFAULT_ARCHIVE_ROOT)]
    archives: PathBuf,
}

fn init_tracing(verbose: bool) -> Result<()> {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    match cli.command {
        Command::Db { command } => run_db(command),
        Command::Submission { command } => run_submission(command),
    }
}

fn run_db(command: DbCommand) -> Result<()> {
    match command {
        DbCommand::Import(args) => run_db_import(args),
        DbCommand::Version(args) => {
            let version = database_version(&args.db)?;
            emit_json(serde_json::json!({
                "db": args.db,
                "db_version": version
            }))
        }
        DbCommand::IntegrityCheck(args) => {
            let report = database_integrity(&args.db)?;
            let clean = report.is_clean();
            let mut value = serde_json::to_value(report)?;
            if let Value::Object(object) = &mut value {
                object.insert("clean".to_string(), Value::Bool(clean));
            }
            emit_json(value)
        }
    }
}

fn run_db_import(args: DbImportArgs) -> Result<()> {
    let config = ImportConfig { source_db: args.source, target_db: args.out, backup_to: args.backup };
    let report = run_import(&config)?;
    emit_json(serde_json::to_value(report)?)
}

fn run_submission(command: SubmissionCommand) -> Result<()> {
    match command {
        SubmissionCommand::Merge(args) => run_submission_merge(args),
        SubmissionCommand::Verify(args) => {
            let report = run_verify(&args.submission, &args.archives)?;
            let ok = report.is_success();
            emit_json(serde_json::json!({
                "ok": ok,
                "verification": report
            }))?;
            if ok {
                Ok(())
            } else {
                Err(CatalogError::VerificationFailed { issues: report.issues }.into())
            }
        }
    }
}

fn run_submission_merge(args: SubmissionMergeArgs) -> Result<()> {
    let config = MergeConfig {
        submission: args.submission,
        catalog: args.catalog,
        archive_root: args.archives,
        verify: args.validate,
        dry_run: args.dry_run,
    };

    match run_merge(&config) {
        Ok(report) => emit_json(serde_json::to_value(report)?),
        Err(err) => {
            if let Some(CatalogError::VerificationFailed { issues }) = err.downcast_ref::<CatalogError>() {
                emit_json(serde_json::json!({
                    "ok": false,
                    "merged": false,
                    "issues": issues
                }))?;
            }
            Err(err)
        }
    }
}
