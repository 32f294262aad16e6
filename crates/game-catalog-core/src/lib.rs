use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Schema version written into `db_version` by stores created with this tool.
pub const SCHEMA_VERSION: &str = "0.5.0";

/// Hint used when an executable path has no directory component.
pub const CURRENT_DIR_HINT: &str = ".";

const EXECUTABLE_FIELD: &str = "executable";
const HASHES_FIELD: &str = "hashes";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CatalogError {
    #[error("input not found: {}", .path.display())]
    MissingInput { path: PathBuf },
    #[error("invalid catalog {}: {message}", .path.display())]
    InvalidCatalog { path: PathBuf, message: String },
    #[error("database is missing the `{table}` table")]
    MissingTable { table: String },
    #[error("input database `{table}` table does not have a `{column}` column")]
    MissingColumn { table: String, column: String },
    #[error("{table}.{column} references id {parent_id}, which has no copied parent row")]
    UnmappedParent { table: String, column: String, parent_id: i64 },
    #[error("database version mismatch: {source_version} != {target_version}")]
    VersionConflict { source_version: String, target_version: String },
    #[error("hash verification failed with {} issue(s)", .issues.len())]
    VerificationFailed { issues: Vec<VerificationIssue> },
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("entry `{inner_path}` not found in archive {}", .archive.display())]
    EntryNotFound { archive: PathBuf, inner_path: String },
    #[error("failed to read {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },
}

/// Stable identifier from an outside catalog (IGDB), used to deduplicate games.
///
/// Serialized as a plain integer, and as a decimal string when used as a JSON
/// object key. String keys must be in canonical form (`"7"`, not `"007"` or `" 7"`)
/// so that a saved catalog keeps the keys it was loaded with.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ExternalId(pub i64);

impl Display for ExternalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for ExternalId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ExternalIdVisitor;

        impl Visitor<'_> for ExternalIdVisitor {
            type Value = ExternalId;

            fn expecting(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str("an integer external id or its decimal string form")
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<ExternalId, E> {
                Ok(ExternalId(value))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<ExternalId, E> {
                i64::try_from(value)
                    .map(ExternalId)
                    .map_err(|_| E::custom(format!("external id out of range: {value}")))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<ExternalId, E> {
                match value.parse::<i64>() {
                    Ok(id) if id.to_string() == value => Ok(ExternalId(id)),
                    _ => Err(E::custom(format!("invalid external id: {value:?}"))),
                }
            }
        }

        deserializer.deserialize_any(ExternalIdVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameRow {
    pub id: i64,
    pub title: String,
    pub release_date: Option<i64>,
    pub genre: Option<String>,
    pub summary: Option<String>,
    pub publisher: Option<String>,
    pub external_id: Option<ExternalId>,
    pub cover_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionRow {
    pub id: i64,
    pub game_id: i64,
    pub version: Option<String>,
    pub executable: Option<String>,
    pub archive: Option<String>,
    pub config: Option<String>,
    pub cycles: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashRow {
    pub id: i64,
    pub version_id: i64,
    pub file_name: Option<String>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigFileRow {
    pub id: i64,
    pub version_id: i64,
    pub kind: i64,
    pub path: Option<String>,
    pub content: Option<Vec<u8>>,
}

/// Source-store id to target-store id mapping, filled as parent rows are inserted.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct IdRemap {
    entries: BTreeMap<i64, i64>,
}

impl IdRemap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the target id assigned to a source row, returning any previous mapping.
    pub fn record(&mut self, source_id: i64, target_id: i64) -> Option<i64> {
        self.entries.insert(source_id, target_id)
    }

    #[must_use]
    pub fn get(&self, source_id: i64) -> Option<i64> {
        self.entries.get(&source_id).copied()
    }

    #[must_use]
    pub fn contains(&self, source_id: i64) -> bool {
        self.entries.contains_key(&source_id)
    }

    /// Map a parent id that is required to have been copied.
    ///
    /// # Errors
    /// Returns [`CatalogError::UnmappedParent`] when `parent_id` was never recorded.
    pub fn resolve(&self, table: &str, column: &str, parent_id: i64) -> Result<i64, CatalogError> {
        self.get(parent_id).ok_or_else(|| CatalogError::UnmappedParent {
            table: table.to_string(),
            column: column.to_string(),
            parent_id,
        })
    }

    pub fn source_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.entries.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(i64, i64)> for IdRemap {
    fn from_iter<T: IntoIterator<Item = (i64, i64)>>(iter: T) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

/// The canonical JSON game database, and also the shape of a submission.
///
/// Games and versions keep the order they were loaded or inserted in.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Catalog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    #[serde(default)]
    pub games: IndexMap<ExternalId, CatalogGame>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogGame {
    #[serde(default)]
    pub versions: IndexMap<String, CatalogVersion>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One version record, held as the raw JSON object it was read from.
///
/// Merging only ever touches the `hashes` object; every other field, null or
/// not, is written back exactly as it came in.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct CatalogVersion(Map<String, Value>);

impl CatalogVersion {
    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    #[must_use]
    pub fn executable(&self) -> Option<&str> {
        self.0.get(EXECUTABLE_FIELD).and_then(Value::as_str)
    }

    /// File name to expected digest, when the record carries a `hashes` object.
    #[must_use]
    pub fn hashes(&self) -> Option<&Map<String, Value>> {
        self.0.get(HASHES_FIELD).and_then(Value::as_object)
    }

    /// The `hashes` object, created (or replacing a non-object value) when needed.
    fn hashes_mut(&mut self) -> Option<&mut Map<String, Value>> {
        if !self.0.get(HASHES_FIELD).is_some_and(Value::is_object) {
            self.0.insert(HASHES_FIELD.to_string(), Value::Object(Map::new()));
        }
        self.0.get_mut(HASHES_FIELD).and_then(Value::as_object_mut)
    }
}

impl From<Map<String, Value>> for CatalogVersion {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

impl Catalog {
    #[must_use]
    pub fn version_count(&self) -> usize {
        self.games.values().map(|game| game.versions.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeSummary {
    pub new_games: usize,
    pub new_versions: usize,
    pub merged_versions: usize,
    pub changed_hashes: usize,
}

/// Fold `submission` into `target`.
///
/// Missing games are created empty, missing versions are inserted verbatim, and
/// versions that already exist only receive the submission's hash entries
/// (submitted values win per key). Everything else on an existing version is
/// left untouched, so applying the same submission twice changes nothing.
/// New games and versions are appended after the existing ones.
pub fn merge_submission(target: &mut Catalog, submission: &Catalog) -> MergeSummary {
    let mut summary = MergeSummary::default();

    for (external_id, submitted_game) in &submission.games {
        let game = target.games.entry(*external_id).or_insert_with(|| {
            summary.new_games += 1;
            CatalogGame::default()
        });

        for (version_name, submitted_version) in &submitted_game.versions {
            let Some(existing) = game.versions.get_mut(version_name) else {
                game.versions.insert(version_name.clone(), submitted_version.clone());
                summary.new_versions += 1;
                continue;
            };

            summary.merged_versions += 1;
            let Some(submitted_hashes) = submitted_version.hashes().filter(|h| !h.is_empty()) else {
                continue;
            };
            let Some(hashes) = existing.hashes_mut() else {
                continue;
            };
            for (file_name, digest) in submitted_hashes {
                let previous = hashes.insert(file_name.clone(), digest.clone());
                if previous.as_ref() != Some(digest) {
                    summary.changed_hashes += 1;
                }
            }
        }
    }

    summary
}

/// Lookup interface over the collection of legal archive copies.
pub trait ArchiveLookup {
    /// Find the first archive whose file name contains `hint`, ignoring case.
    ///
    /// # Errors
    /// Returns [`ArchiveError::Io`] when the archive root cannot be traversed.
    fn locate(&self, hint: &str) -> Result<Option<PathBuf>, ArchiveError>;

    /// Digest (lowercase hex MD5) of one entry inside `archive`.
    ///
    /// # Errors
    /// Returns [`ArchiveError::EntryNotFound`] when the entry is absent and
    /// [`ArchiveError::Io`] for any other read failure.
    fn hash_of(&self, archive: &Path, inner_path: &str) -> Result<String, ArchiveError>;
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerificationIssue {
    ArchiveNotFound { external_id: ExternalId, version: String, executable: String, hint: String },
    Mismatch {
        external_id: ExternalId,
        version: String,
        archive: PathBuf,
        file: String,
        expected: String,
        actual: String,
    },
    MissingEntry { external_id: ExternalId, version: String, archive: PathBuf, file: String },
}

impl Display for VerificationIssue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArchiveNotFound { external_id, version, executable, hint } => write!(
                f,
                "no legal archive found for '{executable}' (IGDB {external_id}, version {version}, hint {hint:?})"
            ),
            Self::Mismatch { external_id, version, archive, file, expected, actual } => write!(
                f,
                "mismatch: {file} -> {actual} (expected {expected}) in {} (IGDB {external_id}, version {version})",
                archive.display()
            ),
            Self::MissingEntry { external_id, version, archive, file } => write!(
                f,
                "missing in archive {}: {file} (IGDB {external_id}, version {version})",
                archive.display()
            ),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct VerificationReport {
    pub checked_files: usize,
    pub verified_files: usize,
    pub issues: Vec<VerificationIssue>,
}

impl VerificationReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Derive the archive search hint from a version's executable path.
///
/// DOS-style separators are normalized first; the hint is the directory part of
/// the path. A bare file name (or an empty path) has the current directory
/// [`CURRENT_DIR_HINT`] as its parent, and a file at the root has `/`.
#[must_use]
pub fn archive_hint_for_executable(executable: &str) -> String {
    let normalized = executable.replace('\\', "/");
    let trimmed = normalized.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, _)) => match parent.trim_end_matches('/') {
            "" => "/".to_string(),
            parent => parent.to_string(),
        },
        None if normalized.starts_with('/') => "/".to_string(),
        None => CURRENT_DIR_HINT.to_string(),
    }
}

/// Check every submitted hash against the legal archive copy of its version.
///
/// Missing archives, missing entries and digest mismatches are collected into
/// the report; verification passes only when none occurred.
///
/// # Errors
/// Returns [`ArchiveError::Io`] when an archive cannot be traversed or read.
pub fn verify_submission<L>(
    submission: &Catalog,
    lookup: &L,
) -> Result<VerificationReport, ArchiveError>
where
    L: ArchiveLookup + ?Sized,
{
    let mut report = VerificationReport::default();

    for (external_id, game) in &submission.games {
        for (version_name, version) in &game.versions {
            let executable = version.executable().unwrap_or_default();
            let hint = archive_hint_for_executable(executable);

            let Some(archive) = lookup.locate(&hint)? else {
                report.issues.push(VerificationIssue::ArchiveNotFound {
                    external_id: *external_id,
                    version: version_name.clone(),
                    executable: executable.to_string(),
                    hint,
                });
                continue;
            };

            let Some(hashes) = version.hashes() else {
                continue;
            };
            for (file_name, expected) in hashes {
                let expected = expected.as_str().map_or_else(|| expected.to_string(), str::to_string);
                report.checked_files += 1;
                match lookup.hash_of(&archive, file_name) {
                    Ok(actual) if actual == expected => report.verified_files += 1,
                    Ok(actual) => report.issues.push(VerificationIssue::Mismatch {
                        external_id: *external_id,
                        version: version_name.clone(),
                        archive: archive.clone(),
                        file: file_name.clone(),
                        expected,
                        actual,
                    }),
                    Err(ArchiveError::EntryNotFound { .. }) => {
                        report.issues.push(VerificationIssue::MissingEntry {
                            external_id: *external_id,
                            version: version_name.clone(),
                            archive: archive.clone(),
                            file: file_name.clone(),
                        });
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }

    Ok(report)
}
