use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use game_catalog_core::{ArchiveError, ArchiveLookup};
use md5::{Digest, Md5};
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::ZipArchive;

const ARCHIVE_EXTENSION: &str = "zip";

/// Finds legal archive copies under a root directory and hashes their entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipArchiveLocator {
    root: PathBuf,
}

impl ZipArchiveLocator {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArchiveLookup for ZipArchiveLocator {
    fn locate(&self, hint: &str) -> Result<Option<PathBuf>, ArchiveError> {
        if !self.root.is_dir() {
            tracing::warn!(root = %self.root.display(), "archive root is not a directory");
            return Ok(None);
        }

        let hint = hint.to_lowercase();
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|err| ArchiveError::Io {
                path: err.path().map_or_else(|| self.root.clone(), Path::to_path_buf),
                message: err.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == ARCHIVE_EXTENSION) {
                continue;
            }
            if entry.file_name().to_string_lossy().to_lowercase().contains(&hint) {
                tracing::info!(archive = %path.display(), "verifying against archive");
                return Ok(Some(path.to_path_buf()));
            }
        }

        tracing::debug!(hint = %hint, root = %self.root.display(), "no archive matched hint");
        Ok(None)
    }

    fn hash_of(&self, archive: &Path, inner_path: &str) -> Result<String, ArchiveError> {
        let io_error = |message: String| ArchiveError::Io { path: archive.to_path_buf(), message };

        let file = File::open(archive).map_err(|err| io_error(err.to_string()))?;
        let mut zip = ZipArchive::new(file).map_err(|err| io_error(err.to_string()))?;
        let mut entry = match zip.by_name(inner_path) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => {
                tracing::warn!(archive = %archive.display(), file = inner_path, "entry missing in archive");
                return Err(ArchiveError::EntryNotFound {
                    archive: archive.to_path_buf(),
                    inner_path: inner_path.to_string(),
                });
            }
            Err(err) => return Err(io_error(format!("failed to open entry {inner_path}: {err}"))),
        };

        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|err| io_error(format!("failed to read entry {inner_path}: {err}")))?;

        let digest = hex::encode(Md5::digest(&contents));
        tracing::debug!(archive = %archive.display(), file = inner_path, digest = %digest, "hashed entry");
        Ok(digest)
    }
}
