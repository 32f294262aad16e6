use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use game_catalog_archive::ZipArchiveLocator;
use game_catalog_core::{
    merge_submission, verify_submission, Catalog, CatalogError, MergeSummary, VerificationReport,
};
use game_catalog_store_sqlite::{ImportSummary, IntegrityReport, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const DEFAULT_TARGET_DB: &str = "turbostage.db";
pub const DEFAULT_CATALOG_PATH: &str = "archive/database.json";
pub const DEFAULT_ARCHIVE_ROOT: &str = "archives";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportConfig {
    pub source_db: PathBuf,
    pub target_db: PathBuf,
    pub backup_to: Option<PathBuf>,
}

impl ImportConfig {
    #[must_use]
    pub fn new(source_db: PathBuf) -> Self {
        Self { source_db, target_db: PathBuf::from(DEFAULT_TARGET_DB), backup_to: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeConfig {
    pub submission: PathBuf,
    pub catalog: PathBuf,
    pub archive_root: PathBuf,
    pub verify: bool,
    pub dry_run: bool,
}

impl MergeConfig {
    #[must_use]
    pub fn new(submission: PathBuf) -> Self {
        Self {
            submission,
            catalog: PathBuf::from(DEFAULT_CATALOG_PATH),
            archive_root: PathBuf::from(DEFAULT_ARCHIVE_ROOT),
            verify: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportReport {
    pub source_db: PathBuf,
    pub target_db: PathBuf,
    pub created_target: bool,
    pub backup: Option<PathBuf>,
    pub summary: ImportSummary,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MergeReport {
    pub submission: PathBuf,
    pub catalog: PathBuf,
    pub dry_run: bool,
    pub created_catalog: bool,
    pub verification: Option<VerificationReport>,
    pub summary: MergeSummary,
    pub generated_at: Option<String>,
    pub total_games: usize,
    pub total_versions: usize,
}

/// Copy new games and their dependent rows from `config.source_db` into `config.target_db`.
///
/// A missing target is created and bootstrapped first, unless the source records a schema
/// version other than the one a new target would get. When `backup_to` is set and the
/// target already existed, a `SQLite` backup is written before anything is copied.
///
/// # Errors
/// Returns [`CatalogError::MissingInput`] when the source does not exist,
/// [`CatalogError::VersionConflict`] when the stores disagree on schema version, and any
/// store error raised while copying.
pub fn run_import(config: &ImportConfig) -> Result<ImportReport> {
    tracing::info!(source = %config.source_db.display(), "opening input database");
    let source = SqliteStore::open_read_only(&config.source_db)?;
    let (mut target, created_target) = SqliteStore::open_import_target(&config.target_db, &source)
        .with_context(|| format!("failed to open import target {}", config.target_db.display()))?;

    let backup = match &config.backup_to {
        Some(path) if !created_target => {
            target.backup_database(path)?;
            tracing::info!(backup = %path.display(), "wrote target backup");
            Some(path.clone())
        }
        Some(path) => {
            tracing::info!(backup = %path.display(), "target was just created; skipping backup");
            None
        }
        None => None,
    };

    let summary = target.import_from(&source).with_context(|| {
        format!(
            "failed to import {} into {}",
            config.source_db.display(),
            config.target_db.display()
        )
    })?;
    tracing::info!(
        games = summary.games.inserted,
        versions = summary.versions.inserted,
        hashes = summary.hashes.inserted,
        config_files = summary.config_files.inserted,
        "import complete"
    );

    Ok(ImportReport {
        source_db: config.source_db.clone(),
        target_db: config.target_db.clone(),
        created_target,
        backup,
        summary,
    })
}

/// # Errors
/// Returns an error when the store cannot be opened or has no readable `db_version`.
pub fn database_version(db: &Path) -> Result<String> {
    SqliteStore::open_read_only(db)?.db_version()
}

/// # Errors
/// Returns an error when the store cannot be opened or any probe fails.
pub fn database_integrity(db: &Path) -> Result<IntegrityReport> {
    SqliteStore::open_read_only(db)?.integrity_report()
}

/// Load a submission and check its hashes against the archives under `archive_root`.
///
/// Issues are logged and returned in the report; they are not an error here.
///
/// # Errors
/// Returns an error when the submission cannot be loaded or an archive cannot be read.
pub fn run_verify(submission: &Path, archive_root: &Path) -> Result<VerificationReport> {
    let submission = load_catalog(submission)?;
    verify_catalog(&submission, archive_root)
}

/// Merge a submission into the canonical catalog, optionally verifying it first.
///
/// # Errors
/// Returns [`CatalogError::VerificationFailed`] when verification is enabled and finds any
/// issue (the catalog is left untouched), and an error when loading or saving fails.
pub fn run_merge(config: &MergeConfig) -> Result<MergeReport> {
    tracing::info!(submission = %config.submission.display(), "loading submission");
    let submission = load_catalog(&config.submission)?;

    let verification = if config.verify {
        let report = verify_catalog(&submission, &config.archive_root)?;
        if !report.is_success() {
            return Err(CatalogError::VerificationFailed { issues: report.issues }.into());
        }
        Some(report)
    } else {
        None
    };

    let created_catalog = !config.catalog.exists();
    let mut catalog = if created_catalog {
        tracing::info!(catalog = %config.catalog.display(), "catalog not found; starting empty");
        Catalog::default()
    } else {
        load_catalog(&config.catalog)?
    };

    let summary = merge_submission(&mut catalog, &submission);
    tracing::info!(
        new_games = summary.new_games,
        new_versions = summary.new_versions,
        merged_versions = summary.merged_versions,
        changed_hashes = summary.changed_hashes,
        "merged submission"
    );

    if !config.dry_run {
        catalog.generated_at = Some(now_rfc3339()?);
        save_catalog(&config.catalog, &catalog)?;
        tracing::info!(catalog = %config.catalog.display(), "saved catalog");
    }

    Ok(MergeReport {
        submission: config.submission.clone(),
        catalog: config.catalog.clone(),
        dry_run: config.dry_run,
        created_catalog,
        verification,
        summary,
        generated_at: catalog.generated_at.clone(),
        total_games: catalog.games.len(),
        total_versions: catalog.version_count(),
    })
}

/// Read a JSON catalog or submission.
///
/// # Errors
/// Returns [`CatalogError::MissingInput`] when the file does not exist and
/// [`CatalogError::InvalidCatalog`] when it does not parse.
pub fn load_catalog(path: &Path) -> Result<Catalog> {
    if !path.is_file() {
        return Err(CatalogError::MissingInput { path: path.to_path_buf() }.into());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog {}", path.display()))?;
    serde_json::from_str::<Catalog>(&raw).map_err(|err| {
        anyhow::Error::from(CatalogError::InvalidCatalog {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    })
}

/// Write a catalog as two-space-indented JSON followed by a newline.
///
/// # Errors
/// Returns an error when the parent directory or the file cannot be written.
pub fn save_catalog(path: &Path, catalog: &Catalog) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create parent directory for catalog {}", path.display())
        })?;
    }

    let mut encoded = serde_json::to_string_pretty(catalog).context("failed to encode catalog")?;
    encoded.push('\n');
    fs::write(path, encoded).with_context(|| format!("failed to write catalog {}", path.display()))
}

fn verify_catalog(submission: &Catalog, archive_root: &Path) -> Result<VerificationReport> {
    tracing::info!(archives = %archive_root.display(), "verifying hashes against legal copies");
    let report = verify_submission(submission, &ZipArchiveLocator::new(archive_root))?;

    for issue in &report.issues {
        tracing::warn!(%issue, "verification issue");
    }
    tracing::info!(
        checked = report.checked_files,
        verified = report.verified_files,
        issues = report.issues.len(),
        "verification finished"
    );
    Ok(report)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
