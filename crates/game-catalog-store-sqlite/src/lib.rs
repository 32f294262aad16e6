use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use game_catalog_core::{
    CatalogError, ConfigFileRow, ExternalId, GameRow, HashRow, IdRemap, VersionRow, SCHEMA_VERSION,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, DatabaseName, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Physical column holding the external (IGDB) identifier of a game.
pub const EXTERNAL_ID_COLUMN: &str = "igdb_id";

const REMAP_CHUNK_SIZE: usize = 500;

const BOOTSTRAP_SQL: &str = r"
CREATE TABLE IF NOT EXISTS games (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  title TEXT NOT NULL,
  release_date INTEGER,
  genre TEXT,
  summary TEXT,
  publisher TEXT,
  igdb_id INTEGER,
  cover_url TEXT
);

CREATE TABLE IF NOT EXISTS versions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  game_id INTEGER NOT NULL,
  version TEXT,
  executable TEXT,
  archive TEXT,
  config TEXT,
  cycles INTEGER DEFAULT 0
);

CREATE TABLE IF NOT EXISTS hashes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  version_id INTEGER NOT NULL,
  file_name TEXT,
  hash TEXT
);

CREATE TABLE IF NOT EXISTS local_versions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  version_id INTEGER NOT NULL,
  archive TEXT
);

CREATE TABLE IF NOT EXISTS config_files (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  version_id INTEGER NOT NULL,
  type INTEGER NOT NULL,
  path TEXT,
  content BLOB
);

CREATE TABLE IF NOT EXISTS db_version (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  version TEXT NOT NULL
);
";

/// Static column layout of one copied table.
///
/// Copies never carry the `id` column; the target assigns a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub parent_column: Option<&'static str>,
    pub value_columns: &'static [&'static str],
}

pub const GAMES: TableSpec = TableSpec {
    name: "games",
    parent_column: None,
    value_columns: &[
        "title",
        "release_date",
        "genre",
        "summary",
        "publisher",
        EXTERNAL_ID_COLUMN,
        "cover_url",
    ],
};

pub const VERSIONS: TableSpec = TableSpec {
    name: "versions",
    parent_column: Some("game_id"),
    value_columns: &["version", "executable", "archive", "config", "cycles"],
};

pub const HASHES: TableSpec = TableSpec {
    name: "hashes",
    parent_column: Some("version_id"),
    value_columns: &["file_name", "hash"],
};

pub const CONFIG_FILES: TableSpec = TableSpec {
    name: "config_files",
    parent_column: Some("version_id"),
    value_columns: &["type", "path", "content"],
};

impl TableSpec {
    fn insert_columns(&self) -> Vec<&'static str> {
        self.parent_column.into_iter().chain(self.value_columns.iter().copied()).collect()
    }

    fn select_sql(&self) -> String {
        let columns = std::iter::once("id").chain(self.insert_columns()).collect::<Vec<_>>();
        format!("SELECT {} FROM {}", columns.join(", "), self.name)
    }

    fn insert_sql(&self) -> String {
        let columns = self.insert_columns();
        let placeholders = (1..=columns.len()).map(|idx| format!("?{idx}")).collect::<Vec<_>>();
        format!(
            "INSERT INTO {}({}) VALUES ({})",
            self.name,
            columns.join(", "),
            placeholders.join(", ")
        )
    }

    fn value_index(&self, column: &str) -> Option<usize> {
        self.value_columns.iter().position(|name| *name == column)
    }
}

/// One row read from a source table, split into id, parent reference and values.
#[derive(Debug, Clone)]
struct SourceRow {
    id: i64,
    parent_id: Option<i64>,
    values: Vec<Value>,
}

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CopyStats {
    pub table: String,
    pub considered: usize,
    pub inserted: usize,
}

impl CopyStats {
    fn new(spec: &TableSpec) -> Self {
        Self { table: spec.name.to_string(), considered: 0, inserted: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub schema_version: String,
    pub games: CopyStats,
    pub versions: CopyStats,
    pub hashes: CopyStats,
    pub config_files: CopyStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicateExternalId {
    pub external_id: ExternalId,
    pub games: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub db_version: Option<String>,
    pub orphan_versions: i64,
    pub orphan_hashes: i64,
    pub orphan_config_files: i64,
    pub duplicate_external_ids: Vec<DuplicateExternalId>,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.quick_check_ok
            && self.orphan_versions == 0
            && self.orphan_hashes == 0
            && self.orphan_config_files == 0
            && self.duplicate_external_ids.is_empty()
    }
}

impl SqliteStore {
    /// Open a SQLite-backed catalog store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn)
    }

    /// Open an existing store without write access.
    ///
    /// # Errors
    /// Returns [`CatalogError::MissingInput`] when `path` is not an existing file, or an
    /// error when the database cannot be opened.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(CatalogError::MissingInput { path: path.to_path_buf() }.into());
        }

        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn)
    }

    /// Open a store, bootstrapping the schema first when the file does not exist yet.
    ///
    /// Returns the store and whether it was created.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or initialized.
    pub fn open_or_initialize(path: &Path) -> Result<(Self, bool)> {
        let created = !path.exists();
        let mut store = Self::open(path)?;
        if created {
            tracing::info!(path = %path.display(), "initializing new catalog database");
            store.initialize()?;
        }
        Ok((store, created))
    }

    /// Open the target of an import of `source`, bootstrapping it when missing.
    ///
    /// A missing target would be created at [`SCHEMA_VERSION`], so a source recording any
    /// other version is rejected before the file is created.
    ///
    /// # Errors
    /// Returns [`CatalogError::VersionConflict`] when the target is missing and `source` is
    /// not at [`SCHEMA_VERSION`], or any error from [`Self::open_or_initialize`].
    pub fn open_import_target(path: &Path, source: &SqliteStore) -> Result<(Self, bool)> {
        if !path.exists() {
            let source_version = source.db_version().context("failed to read source db_version")?;
            if source_version != SCHEMA_VERSION {
                return Err(CatalogError::VersionConflict {
                    source_version,
                    target_version: SCHEMA_VERSION.to_string(),
                }
                .into());
            }
        }
        Self::open_or_initialize(path)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn })
    }

    /// Create every catalog table and record [`SCHEMA_VERSION`] if no version is recorded.
    ///
    /// # Errors
    /// Returns an error when the schema cannot be created or the version cannot be written.
    pub fn initialize(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start bootstrap transaction")?;
        tx.execute_batch(BOOTSTRAP_SQL).context("failed to create catalog tables")?;

        let recorded: i64 = tx
            .query_row("SELECT COUNT(*) FROM db_version", [], |row| row.get(0))
            .context("failed to read db_version row count")?;
        if recorded == 0 {
            tx.execute("INSERT INTO db_version(version) VALUES (?1)", params![SCHEMA_VERSION])
                .context("failed to record schema version")?;
        }

        tx.commit().context("failed to commit bootstrap transaction")?;
        Ok(())
    }

    /// Read the schema version recorded in `db_version`.
    ///
    /// # Errors
    /// Returns [`CatalogError::MissingTable`] when the store has no `db_version` table, or an
    /// error when the table is empty or unreadable.
    pub fn db_version(&self) -> Result<String> {
        if !table_exists(&self.conn, "db_version")? {
            return Err(CatalogError::MissingTable { table: "db_version".to_string() }.into());
        }

        self.conn
            .query_row("SELECT version FROM db_version ORDER BY id ASC LIMIT 1", [], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .context("failed to read db_version")?
            .ok_or_else(|| anyhow!("db_version table is empty"))
    }

    /// External identifiers already present in `games`, including `NULL` when any game lacks one.
    ///
    /// # Errors
    /// Returns an error when the `games` table cannot be read.
    pub fn existing_external_ids(&self) -> Result<HashSet<Option<ExternalId>>> {
        let query = format!("SELECT {EXTERNAL_ID_COLUMN} FROM games");
        let mut stmt = self.conn.prepare(&query).context("failed to prepare external id query")?;
        let rows = stmt.query_map([], |row| row.get::<_, Option<i64>>(0))?;

        let mut ids = HashSet::new();
        for row in rows {
            ids.insert(row?.map(ExternalId));
        }
        Ok(ids)
    }

    /// Insert every source game whose external id is not yet known to this store.
    ///
    /// # Errors
    /// Returns [`CatalogError::MissingColumn`] when the source `games` table has no external
    /// id column, or an error when reading or inserting fails.
    pub fn copy_new_games(&mut self, source: &SqliteStore) -> Result<(CopyStats, IdRemap)> {
        if !table_has_column(&source.conn, GAMES.name, EXTERNAL_ID_COLUMN)? {
            return Err(CatalogError::MissingColumn {
                table: GAMES.name.to_string(),
                column: EXTERNAL_ID_COLUMN.to_string(),
            }
            .into());
        }

        let external_id_idx = GAMES
            .value_index(EXTERNAL_ID_COLUMN)
            .ok_or_else(|| anyhow!("games layout does not declare {EXTERNAL_ID_COLUMN}"))?;
        let mut known = self.existing_external_ids()?;
        let rows = read_all_rows(&source.conn, &GAMES)?;

        let mut stats = CopyStats::new(&GAMES);
        let mut remap = IdRemap::new();
        let insert = GAMES.insert_sql();

        let tx = self.conn.transaction().context("failed to start games transaction")?;
        for row in rows {
            stats.considered += 1;
            let external_id = external_id_of(&row, external_id_idx)?;
            if known.contains(&external_id) {
                continue;
            }

            tx.execute(&insert, params_from_iter(row.values.iter()))
                .with_context(|| format!("failed to copy games row {}", row.id))?;
            remap.record(row.id, tx.last_insert_rowid());
            known.insert(external_id);
            stats.inserted += 1;
        }
        tx.commit().context("failed to commit games transaction")?;

        tracing::info!(
            table = GAMES.name,
            considered = stats.considered,
            inserted = stats.inserted,
            "copied new games"
        );
        Ok((stats, remap))
    }

    /// Copy the versions of every remapped game and build the version id remap.
    ///
    /// # Errors
    /// Returns [`CatalogError::UnmappedParent`] when a selected version references a game
    /// missing from `games`, or an error when reading or inserting fails.
    pub fn copy_versions(
        &mut self,
        source: &SqliteStore,
        games: &IdRemap,
    ) -> Result<(CopyStats, IdRemap)> {
        let parent_column = parent_column_of(&VERSIONS)?;
        let rows = read_rows_with_parents(&source.conn, &VERSIONS, games)?;

        let mut stats = CopyStats::new(&VERSIONS);
        let mut remap = IdRemap::new();
        let insert = VERSIONS.insert_sql();

        let tx = self.conn.transaction().context("failed to start versions transaction")?;
        for row in rows {
            stats.considered += 1;
            let parent_id = row.parent_id.unwrap_or_default();
            let game_id = games.resolve(VERSIONS.name, parent_column, parent_id)?;

            let values = std::iter::once(Value::Integer(game_id)).chain(row.values);
            tx.execute(&insert, params_from_iter(values))
                .with_context(|| format!("failed to copy versions row {}", row.id))?;
            remap.record(row.id, tx.last_insert_rowid());
            stats.inserted += 1;
        }
        tx.commit().context("failed to commit versions transaction")?;

        tracing::info!(
            table = VERSIONS.name,
            considered = stats.considered,
            inserted = stats.inserted,
            "copied versions"
        );
        Ok((stats, remap))
    }

    /// Copy rows of a child table whose parent was copied, relinking them through `parents`.
    ///
    /// Rows whose parent is absent from `parents` are skipped and not counted as inserted.
    ///
    /// # Errors
    /// Returns an error when `spec` has no parent column or reading or inserting fails.
    pub fn copy_child_rows(
        &mut self,
        spec: &TableSpec,
        source: &SqliteStore,
        parents: &IdRemap,
    ) -> Result<CopyStats> {
        let rows = read_rows_with_parents(&source.conn, spec, parents)?;

        let mut stats = CopyStats::new(spec);
        let insert = spec.insert_sql();

        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start {} transaction", spec.name))?;
        for row in rows {
            stats.considered += 1;
            let Some(parent_id) = row.parent_id.and_then(|id| parents.get(id)) else {
                tracing::debug!(table = spec.name, row = row.id, "skipping row with uncopied parent");
                continue;
            };

            let values = std::iter::once(Value::Integer(parent_id)).chain(row.values);
            tx.execute(&insert, params_from_iter(values))
                .with_context(|| format!("failed to copy {} row {}", spec.name, row.id))?;
            stats.inserted += 1;
        }
        tx.commit().with_context(|| format!("failed to commit {} transaction", spec.name))?;

        tracing::info!(
            table = spec.name,
            considered = stats.considered,
            inserted = stats.inserted,
            "copied child rows"
        );
        Ok(stats)
    }

    /// Import every new game of `source`, with its versions, hashes and config files.
    ///
    /// Each table is copied and committed in its own transaction.
    ///
    /// # Errors
    /// Returns [`CatalogError::VersionConflict`] before any write when the two stores record
    /// different schema versions, and propagates any copy error.
    pub fn import_from(&mut self, source: &SqliteStore) -> Result<ImportSummary> {
        let source_version = source.db_version().context("failed to read source db_version")?;
        let target_version = self.db_version().context("failed to read target db_version")?;
        if source_version != target_version {
            return Err(CatalogError::VersionConflict { source_version, target_version }.into());
        }

        let (games, game_remap) = self.copy_new_games(source)?;
        let (versions, version_remap) = self.copy_versions(source, &game_remap)?;
        let hashes = self.copy_child_rows(&HASHES, source, &version_remap)?;
        let config_files = self.copy_child_rows(&CONFIG_FILES, source, &version_remap)?;

        Ok(ImportSummary { schema_version: target_version, games, versions, hashes, config_files })
    }

    /// Count rows whose parent is missing and external ids shared by several games.
    ///
    /// # Errors
    /// Returns an error when any probe query fails.
    pub fn integrity_report(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let db_version = match self.db_version() {
            Ok(version) => Some(version),
            Err(err) if err.downcast_ref::<CatalogError>().is_some() => None,
            Err(err) => return Err(err),
        };

        let orphan_versions = self.count_orphans(&VERSIONS, GAMES.name)?;
        let orphan_hashes = self.count_orphans(&HASHES, VERSIONS.name)?;
        let orphan_config_files = self.count_orphans(&CONFIG_FILES, VERSIONS.name)?;

        let query = format!(
            "SELECT {EXTERNAL_ID_COLUMN}, COUNT(*) FROM games
             WHERE {EXTERNAL_ID_COLUMN} IS NOT NULL
             GROUP BY {EXTERNAL_ID_COLUMN}
             HAVING COUNT(*) > 1
             ORDER BY {EXTERNAL_ID_COLUMN} ASC"
        );
        let mut stmt = self.conn.prepare(&query).context("failed to prepare duplicate id query")?;
        let rows = stmt.query_map([], |row| {
            Ok(DuplicateExternalId {
                external_id: ExternalId(row.get(0)?),
                games: row.get(1)?,
            })
        })?;
        let mut duplicate_external_ids = Vec::new();
        for row in rows {
            duplicate_external_ids.push(row?);
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            db_version,
            orphan_versions,
            orphan_hashes,
            orphan_config_files,
            duplicate_external_ids,
        })
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// # Errors
    /// Returns an error when the `games` table cannot be read.
    pub fn list_games(&self) -> Result<Vec<GameRow>> {
        let query = format!(
            "SELECT id, title, release_date, genre, summary, publisher, {EXTERNAL_ID_COLUMN}, cover_url
             FROM games ORDER BY id ASC"
        );
        let mut stmt = self.conn.prepare(&query).context("failed to prepare games listing")?;
        let rows = stmt.query_map([], |row| {
            Ok(GameRow {
                id: row.get(0)?,
                title: row.get(1)?,
                release_date: row.get(2)?,
                genre: row.get(3)?,
                summary: row.get(4)?,
                publisher: row.get(5)?,
                external_id: row.get::<_, Option<i64>>(6)?.map(ExternalId),
                cover_url: row.get(7)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to list games")
    }

    /// # Errors
    /// Returns an error when the `versions` table cannot be read.
    pub fn list_versions(&self) -> Result<Vec<VersionRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, game_id, version, executable, archive, config, cycles
                 FROM versions ORDER BY id ASC",
            )
            .context("failed to prepare versions listing")?;
        let rows = stmt.query_map([], |row| {
            Ok(VersionRow {
                id: row.get(0)?,
                game_id: row.get(1)?,
                version: row.get(2)?,
                executable: row.get(3)?,
                archive: row.get(4)?,
                config: row.get(5)?,
                cycles: row.get(6)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to list versions")
    }

    /// # Errors
    /// Returns an error when the `hashes` table cannot be read.
    pub fn list_hashes(&self) -> Result<Vec<HashRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, version_id, file_name, hash FROM hashes ORDER BY id ASC")
            .context("failed to prepare hashes listing")?;
        let rows = stmt.query_map([], |row| {
            Ok(HashRow {
                id: row.get(0)?,
                version_id: row.get(1)?,
                file_name: row.get(2)?,
                hash: row.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to list hashes")
    }

    /// # Errors
    /// Returns an error when the `config_files` table cannot be read.
    pub fn list_config_files(&self) -> Result<Vec<ConfigFileRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, version_id, type, path, content FROM config_files ORDER BY id ASC")
            .context("failed to prepare config_files listing")?;
        let rows = stmt.query_map([], |row| {
            Ok(ConfigFileRow {
                id: row.get(0)?,
                version_id: row.get(1)?,
                kind: row.get(2)?,
                path: row.get(3)?,
                content: row.get(4)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to list config_files")
    }

    fn count_orphans(&self, spec: &TableSpec, parent_table: &str) -> Result<i64> {
        let parent_column = parent_column_of(spec)?;
        let query = format!(
            "SELECT COUNT(*) FROM {} WHERE {parent_column} NOT IN (SELECT id FROM {parent_table})",
            spec.name
        );
        self.conn
            .query_row(&query, [], |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed to count orphaned {} rows", spec.name))
    }
}

fn parent_column_of(spec: &TableSpec) -> Result<&'static str> {
    spec.parent_column.ok_or_else(|| anyhow!("table {} has no parent column", spec.name))
}

fn external_id_of(row: &SourceRow, idx: usize) -> Result<Option<ExternalId>> {
    match row.values.get(idx) {
        Some(Value::Integer(id)) => Ok(Some(ExternalId(*id))),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(anyhow!(
            "games row {} holds a non-integer {EXTERNAL_ID_COLUMN}: {other:?}",
            row.id
        )),
    }
}

fn read_source_row(row: &rusqlite::Row<'_>, spec: &TableSpec) -> rusqlite::Result<SourceRow> {
    let id = row.get::<_, i64>(0)?;
    let mut idx = 1;
    let parent_id = if spec.parent_column.is_some() {
        idx += 1;
        Some(row.get::<_, i64>(1)?)
    } else {
        None
    };

    let mut values = Vec::with_capacity(spec.value_columns.len());
    for offset in 0..spec.value_columns.len() {
        values.push(row.get::<_, Value>(idx + offset)?);
    }

    Ok(SourceRow { id, parent_id, values })
}

fn read_all_rows(conn: &Connection, spec: &TableSpec) -> Result<Vec<SourceRow>> {
    let query = format!("{} ORDER BY id ASC", spec.select_sql());
    let mut stmt =
        conn.prepare(&query).with_context(|| format!("failed to read source {}", spec.name))?;
    let rows = stmt.query_map([], |row| read_source_row(row, spec))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to read source {} rows", spec.name))
}

fn read_rows_with_parents(
    conn: &Connection,
    spec: &TableSpec,
    parents: &IdRemap,
) -> Result<Vec<SourceRow>> {
    let parent_column = parent_column_of(spec)?;
    let parent_ids = parents.source_ids().collect::<Vec<_>>();

    let mut collected = Vec::new();
    for chunk in parent_ids.chunks(REMAP_CHUNK_SIZE) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let query = format!("{} WHERE {parent_column} IN ({placeholders})", spec.select_sql());
        let mut stmt = conn
            .prepare(&query)
            .with_context(|| format!("failed to read source {}", spec.name))?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| read_source_row(row, spec))?;
        for row in rows {
            collected.push(row.with_context(|| format!("failed to read source {} row", spec.name))?);
        }
    }

    collected.sort_by_key(|row| row.id);
    Ok(collected)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> Result<SqliteStore> {
        let (store, created) = SqliteStore::open_or_initialize(Path::new(":memory:"))?;
        assert!(created);
        Ok(store)
    }

    fn seed_game(store: &SqliteStore, title: &str, igdb_id: Option<i64>) -> Result<i64> {
        store.conn.execute(
            "INSERT INTO games(title, release_date, genre, igdb_id) VALUES (?1, 1993, 'Shooter', ?2)",
            params![title, igdb_id],
        )?;
        Ok(store.conn.last_insert_rowid())
    }

    fn seed_version(store: &SqliteStore, game_id: i64, version: &str, executable: &str) -> Result<i64> {
        store.conn.execute(
            "INSERT INTO versions(game_id, version, executable, archive, cycles)
             VALUES (?1, ?2, ?3, 'legal.zip', 3000)",
            params![game_id, version, executable],
        )?;
        Ok(store.conn.last_insert_rowid())
    }

    fn seed_hash(store: &SqliteStore, version_id: i64, file_name: &str, hash: &str) -> Result<i64> {
        store.conn.execute(
            "INSERT INTO hashes(version_id, file_name, hash) VALUES (?1, ?2, ?3)",
            params![version_id, file_name, hash],
        )?;
        Ok(store.conn.last_insert_rowid())
    }

    fn seed_config_file(store: &SqliteStore, version_id: i64, path: &str) -> Result<i64> {
        store.conn.execute(
            "INSERT INTO config_files(version_id, type, path, content) VALUES (?1, 1, ?2, ?3)",
            params![version_id, path, b"[cpu]\ncycles=3000\n".to_vec()],
        )?;
        Ok(store.conn.last_insert_rowid())
    }

    fn title_of_game(store: &SqliteStore, game_id: i64) -> Result<String> {
        store
            .list_games()?
            .into_iter()
            .find(|game| game.id == game_id)
            .map(|game| game.title)
            .ok_or_else(|| anyhow!("game {game_id} not found"))
    }

    fn seed_doom_and_keen(source: &SqliteStore) -> Result<()> {
        let doom = seed_game(source, "Doom", Some(100))?;
        let keen = seed_game(source, "Commander Keen 4", Some(200))?;
        let doom_v = seed_version(source, doom, "1.9", "DOOM/DOOM.EXE")?;
        let keen_v = seed_version(source, keen, "1.4", "KEEN4/KEEN4E.EXE")?;
        seed_hash(source, doom_v, "DOOM.EXE", "aa")?;
        seed_hash(source, doom_v, "DOOM1.WAD", "bb")?;
        seed_hash(source, keen_v, "KEEN4E.EXE", "cc")?;
        seed_config_file(source, keen_v, "dosbox.conf")?;
        Ok(())
    }

    // Test IDs: TDB-001
    #[test]
    fn initialize_creates_tables_and_records_schema_version() -> Result<()> {
        let mut store = memory_store()?;

        for table in ["games", "versions", "hashes", "local_versions", "config_files", "db_version"] {
            assert!(table_exists(&store.conn, table)?, "missing table {table}");
        }
        assert_eq!(store.db_version()?, SCHEMA_VERSION);

        store.initialize()?;
        let rows: i64 = store.conn.query_row("SELECT COUNT(*) FROM db_version", [], |row| row.get(0))?;
        assert_eq!(rows, 1);

        Ok(())
    }

    // Test IDs: TIMP-001
    #[test]
    fn import_remaps_children_onto_new_parent_ids() -> Result<()> {
        let source = memory_store()?;
        seed_doom_and_keen(&source)?;

        let mut target = memory_store()?;
        let existing = seed_game(&target, "Wolfenstein 3D", Some(300))?;
        seed_version(&target, existing, "1.4", "WOLF3D/WOLF3D.EXE")?;

        let summary = target.import_from(&source)?;
        assert_eq!(summary.schema_version, SCHEMA_VERSION);
        assert_eq!((summary.games.considered, summary.games.inserted), (2, 2));
        assert_eq!((summary.versions.considered, summary.versions.inserted), (2, 2));
        assert_eq!((summary.hashes.considered, summary.hashes.inserted), (3, 3));
        assert_eq!((summary.config_files.considered, summary.config_files.inserted), (1, 1));

        let versions = target.list_versions()?;
        assert_eq!(versions.len(), 3);
        for version in &versions {
            let title = title_of_game(&target, version.game_id)?;
            match version.executable.as_deref() {
                Some("DOOM/DOOM.EXE") => assert_eq!(title, "Doom"),
                Some("KEEN4/KEEN4E.EXE") => assert_eq!(title, "Commander Keen 4"),
                Some("WOLF3D/WOLF3D.EXE") => assert_eq!(title, "Wolfenstein 3D"),
                other => panic!("unexpected version executable {other:?}"),
            }
            assert_eq!(version.cycles, Some(3000));
        }

        for hash in target.list_hashes()? {
            let owner = versions
                .iter()
                .find(|version| version.id == hash.version_id)
                .ok_or_else(|| anyhow!("hash {} lost its version", hash.id))?;
            let expected_owner = match hash.file_name.as_deref() {
                Some("DOOM.EXE" | "DOOM1.WAD") => "DOOM/DOOM.EXE",
                _ => "KEEN4/KEEN4E.EXE",
            };
            assert_eq!(owner.executable.as_deref(), Some(expected_owner));
        }

        let config_files = target.list_config_files()?;
        assert_eq!(config_files.len(), 1);
        assert_eq!(config_files[0].kind, 1);
        assert_eq!(config_files[0].content.as_deref(), Some(b"[cpu]\ncycles=3000\n".as_slice()));

        assert!(target.integrity_report()?.is_clean());
        Ok(())
    }

    // Test IDs: TIMP-002
    #[test]
    fn import_skips_games_whose_external_id_is_known() -> Result<()> {
        let source = memory_store()?;
        seed_doom_and_keen(&source)?;

        let mut target = memory_store()?;
        let doom = seed_game(&target, "Doom (local)", Some(100))?;
        seed_version(&target, doom, "1.9", "DOOM/DOOM.EXE")?;

        let summary = target.import_from(&source)?;
        assert_eq!((summary.games.considered, summary.games.inserted), (2, 1));
        assert_eq!((summary.versions.considered, summary.versions.inserted), (1, 1));
        assert_eq!(summary.hashes.inserted, 1);

        let games = target.list_games()?;
        let doom_rows = games.iter().filter(|game| game.external_id == Some(ExternalId(100))).count();
        assert_eq!(doom_rows, 1);
        assert_eq!(title_of_game(&target, doom)?, "Doom (local)");
        assert_eq!(target.list_versions()?.len(), 2);

        Ok(())
    }

    // Test IDs: TIMP-003
    #[test]
    fn repeated_import_inserts_nothing() -> Result<()> {
        let source = memory_store()?;
        seed_doom_and_keen(&source)?;
        let mut target = memory_store()?;

        target.import_from(&source)?;
        let second = target.import_from(&source)?;

        assert_eq!(second.games.inserted, 0);
        assert_eq!(second.versions.considered, 0);
        assert_eq!(second.hashes.inserted, 0);
        assert_eq!(second.config_files.inserted, 0);
        assert_eq!(target.list_games()?.len(), 2);
        assert_eq!(target.list_hashes()?.len(), 3);

        Ok(())
    }

    // Test IDs: TIMP-004
    #[test]
    fn duplicate_external_id_in_source_yields_one_game() -> Result<()> {
        let source = memory_store()?;
        seed_game(&source, "Doom", Some(100))?;
        seed_game(&source, "Doom (again)", Some(100))?;
        let mut target = memory_store()?;

        let (stats, remap) = target.copy_new_games(&source)?;

        assert_eq!((stats.considered, stats.inserted), (2, 1));
        assert_eq!(remap.len(), 1);
        let games = target.list_games()?;
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].title, "Doom");

        Ok(())
    }

    // Test IDs: TIMP-005
    #[test]
    fn child_rows_with_uncopied_parent_are_skipped() -> Result<()> {
        let source = memory_store()?;
        let game = seed_game(&source, "Doom", Some(100))?;
        let copied = seed_version(&source, game, "1.9", "DOOM/DOOM.EXE")?;
        let skipped = seed_version(&source, game, "1.666", "DOOM/DOOM.EXE")?;
        seed_hash(&source, copied, "DOOM.EXE", "aa")?;
        seed_hash(&source, skipped, "DOOM.EXE", "ff")?;

        let mut target = memory_store()?;
        let remap: IdRemap = [(copied, 41)].into_iter().collect();
        let stats = target.copy_child_rows(&HASHES, &source, &remap)?;

        assert_eq!(stats, CopyStats { table: "hashes".to_string(), considered: 1, inserted: 1 });
        let hashes = target.list_hashes()?;
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes[0].version_id, 41);
        assert_eq!(hashes[0].hash.as_deref(), Some("aa"));

        Ok(())
    }

    // Test IDs: TIMP-006
    #[test]
    fn schema_version_mismatch_aborts_before_writing() -> Result<()> {
        let source = memory_store()?;
        seed_doom_and_keen(&source)?;
        source.conn.execute("UPDATE db_version SET version = '0.6.0'", [])?;
        let mut target = memory_store()?;

        let err = match target.import_from(&source) {
            Ok(summary) => return Err(anyhow!("expected version conflict, got {summary:?}")),
            Err(err) => err,
        };
        assert_eq!(
            err.downcast_ref::<CatalogError>(),
            Some(&CatalogError::VersionConflict {
                source_version: "0.6.0".to_string(),
                target_version: SCHEMA_VERSION.to_string(),
            })
        );
        assert!(target.list_games()?.is_empty());
        assert!(target.list_versions()?.is_empty());

        Ok(())
    }

    // Test IDs: TIMP-006b
    #[test]
    fn missing_target_is_not_created_for_a_newer_source() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = memory_store()?;
        seed_doom_and_keen(&source)?;
        source.conn.execute("UPDATE db_version SET version = '0.6.0'", [])?;
        let target_path = dir.path().join("target.db");

        let err = match SqliteStore::open_import_target(&target_path, &source) {
            Ok((_, created)) => return Err(anyhow!("expected version conflict, created={created}")),
            Err(err) => err,
        };
        assert_eq!(
            err.downcast_ref::<CatalogError>(),
            Some(&CatalogError::VersionConflict {
                source_version: "0.6.0".to_string(),
                target_version: SCHEMA_VERSION.to_string(),
            })
        );
        assert!(!target_path.exists());

        source.conn.execute("UPDATE db_version SET version = ?1", params![SCHEMA_VERSION])?;
        let (target, created) = SqliteStore::open_import_target(&target_path, &source)?;
        assert!(created);
        assert_eq!(target.db_version()?, SCHEMA_VERSION);
        Ok(())
    }

    // Test IDs: TIMP-007
    #[test]
    fn source_without_external_id_column_is_rejected() -> Result<()> {
        let source = SqliteStore::open(Path::new(":memory:"))?;
        source.conn.execute_batch(
            "CREATE TABLE games (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT NOT NULL);
             INSERT INTO games(title) VALUES ('Doom');",
        )?;
        let mut target = memory_store()?;

        let err = match target.copy_new_games(&source) {
            Ok(_) => return Err(anyhow!("expected missing column error")),
            Err(err) => err,
        };
        assert_eq!(
            err.downcast_ref::<CatalogError>(),
            Some(&CatalogError::MissingColumn {
                table: "games".to_string(),
                column: EXTERNAL_ID_COLUMN.to_string(),
            })
        );
        assert!(target.list_games()?.is_empty());

        Ok(())
    }

    // Test IDs: TIMP-008
    #[test]
    fn large_remaps_are_bound_in_chunks() -> Result<()> {
        let source = memory_store()?;
        let total = 1_203_i64;
        for igdb in 0..total {
            let game = seed_game(&source, &format!("Game {igdb}"), Some(igdb))?;
            let version = seed_version(&source, game, "1.0", "GAME/GAME.EXE")?;
            seed_hash(&source, version, "GAME.EXE", "00")?;
        }
        let mut target = memory_store()?;

        let summary = target.import_from(&source)?;

        let expected = usize::try_from(total)?;
        assert_eq!(summary.versions.inserted, expected);
        assert_eq!(summary.hashes.inserted, expected);
        assert!(target.integrity_report()?.is_clean());

        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn integrity_report_flags_orphans_and_duplicate_external_ids() -> Result<()> {
        let store = memory_store()?;
        let game = seed_game(&store, "Doom", Some(100))?;
        seed_game(&store, "Doom copy", Some(100))?;
        seed_game(&store, "Untitled", None)?;
        seed_game(&store, "Untitled 2", None)?;
        let version = seed_version(&store, game, "1.9", "DOOM/DOOM.EXE")?;
        seed_version(&store, 999, "ghost", "GHOST/GHOST.EXE")?;
        seed_hash(&store, version, "DOOM.EXE", "aa")?;
        seed_hash(&store, 888, "GHOST.EXE", "bb")?;
        seed_config_file(&store, 777, "dosbox.conf")?;

        let report = store.integrity_report()?;

        assert!(report.quick_check_ok);
        assert_eq!(report.db_version.as_deref(), Some(SCHEMA_VERSION));
        assert_eq!(report.orphan_versions, 1);
        assert_eq!(report.orphan_hashes, 1);
        assert_eq!(report.orphan_config_files, 1);
        assert_eq!(
            report.duplicate_external_ids,
            vec![DuplicateExternalId { external_id: ExternalId(100), games: 2 }]
        );
        assert!(!report.is_clean());

        Ok(())
    }

    // Test IDs: TDB-003
    #[test]
    fn backup_database_round_trip() -> Result<()> {
        let store = memory_store()?;
        seed_doom_and_keen(&store)?;

        let dir = tempfile::tempdir()?;
        let backup_file = dir.path().join("nested").join("backup.db");
        store.backup_database(&backup_file)?;

        let restored = SqliteStore::open_read_only(&backup_file)?;
        assert_eq!(restored.list_games()?, store.list_games()?);
        assert_eq!(restored.list_hashes()?, store.list_hashes()?);
        assert_eq!(restored.db_version()?, SCHEMA_VERSION);

        Ok(())
    }

    // Test IDs: TDB-004
    #[test]
    fn read_only_open_requires_an_existing_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("missing.db");

        let err = match SqliteStore::open_read_only(&missing) {
            Ok(_) => return Err(anyhow!("expected missing input error")),
            Err(err) => err,
        };
        assert_eq!(
            err.downcast_ref::<CatalogError>(),
            Some(&CatalogError::MissingInput { path: missing.clone() })
        );
        assert!(!missing.exists());

        Ok(())
    }

    // Test IDs: TDB-005
    #[test]
    fn db_version_requires_version_table() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;

        let err = match store.db_version() {
            Ok(version) => return Err(anyhow!("expected missing table, got {version}")),
            Err(err) => err,
        };
        assert_eq!(
            err.downcast_ref::<CatalogError>(),
            Some(&CatalogError::MissingTable { table: "db_version".to_string() })
        );

        Ok(())
    }
}
