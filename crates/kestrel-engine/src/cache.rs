//! Resume records kept under `<download_root>/.cachedTorrents`.
//!
//! # Design
//! - One file per identity: `<id>.magnet` holds the raw magnet URI,
//!   `<id>.torrent` holds the raw manifest bytes.
//! - Writes go to a temporary sibling and are renamed into place.
//! - Promoting a record writes the complete variant before removing the
//!   minimal one, so a crash in between leaves both and the complete one wins.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use kestrel_torrent_core::{TaskId, TaskKind, TaskSource};
use tracing::debug;

use crate::error::{EngineError, EngineResult};

const MINIMAL_EXT: &str = "magnet";
const COMPLETE_EXT: &str = "torrent";
const TEMP_SUFFIX: &str = ".tmp";

/// Persisted descriptor for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheRecord {
    /// Reference-only descriptor written on add.
    Minimal {
        /// Task identity.
        id: TaskId,
        /// Magnet URI.
        uri: String,
    },
    /// Complete manifest written once metadata is known.
    Complete {
        /// Task identity.
        id: TaskId,
        /// Encoded manifest.
        bytes: Vec<u8>,
    },
}

impl CacheRecord {
    /// Identity the record belongs to.
    #[must_use]
    pub const fn id(&self) -> &TaskId {
        match self {
            Self::Minimal { id, .. } | Self::Complete { id, .. } => id,
        }
    }

    /// Descriptor kind stored in the record.
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        match self {
            Self::Minimal { .. } => TaskKind::Magnet,
            Self::Complete { .. } => TaskKind::Manifest,
        }
    }

    /// Convert back into a submit-able source.
    #[must_use]
    pub fn into_source(self) -> TaskSource {
        match self {
            Self::Minimal { uri, .. } => TaskSource::Magnet { uri },
            Self::Complete { bytes, .. } => TaskSource::Manifest { bytes },
        }
    }
}

/// Filesystem-backed resume cache.
#[derive(Debug, Clone)]
pub struct ResumeCache {
    dir: PathBuf,
}

impl ResumeCache {
    /// Cache rooted at `dir`. Nothing is created until [`Self::ensure_dir`].
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the records.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] when the directory cannot be created.
    pub fn ensure_dir(&self) -> EngineResult<()> {
        fs::create_dir_all(&self.dir).map_err(|err| EngineError::io("create_dir", &self.dir, err))
    }

    /// Persist the minimal record for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] when the record cannot be written.
    pub fn store_minimal(&self, id: &TaskId, uri: &str) -> EngineResult<()> {
        self.write_atomic(&self.path_for(id, MINIMAL_EXT), uri.as_bytes())
    }

    /// Persist the complete record for `id`, replacing any minimal record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] when the record cannot be written or the
    /// minimal record cannot be removed.
    pub fn store_complete(&self, id: &TaskId, bytes: &[u8]) -> EngineResult<()> {
        self.write_atomic(&self.path_for(id, COMPLETE_EXT), bytes)?;
        remove_if_present(&self.path_for(id, MINIMAL_EXT))
    }

    /// Remove both record variants for `id`. Absent files are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] when an existing file cannot be removed.
    pub fn remove(&self, id: &TaskId) -> EngineResult<()> {
        remove_if_present(&self.path_for(id, MINIMAL_EXT))?;
        remove_if_present(&self.path_for(id, COMPLETE_EXT))
    }

    /// Load the record for `id`, preferring the complete variant.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] when an existing file cannot be read.
    pub fn load(&self, id: &TaskId) -> EngineResult<Option<CacheRecord>> {
        if let Some(bytes) = read_if_present(&self.path_for(id, COMPLETE_EXT))? {
            return Ok(Some(CacheRecord::Complete {
                id: id.clone(),
                bytes,
            }));
        }
        let Some(bytes) = read_if_present(&self.path_for(id, MINIMAL_EXT))? else {
            return Ok(None);
        };
        Ok(Some(CacheRecord::Minimal {
            id: id.clone(),
            uri: String::from_utf8_lossy(&bytes).trim().to_string(),
        }))
    }

    /// Load every record in identity order. A missing directory yields nothing.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] when the directory or a record cannot be read.
    pub fn load_all(&self) -> EngineResult<Vec<CacheRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(EngineError::io("read_dir", &self.dir, err)),
        };

        let mut ids = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|err| EngineError::io("read_dir", &self.dir, err))?;
            let path = entry.path();
            let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
                continue;
            };
            if ext != MINIMAL_EXT && ext != COMPLETE_EXT {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.insert(TaskId::new(stem));
            }
        }

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.load(&id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn path_for(&self, id: &TaskId, ext: &str) -> PathBuf {
        self.dir.join(format!("{id}.{ext}"))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> EngineResult<()> {
        self.ensure_dir()?;
        let mut temp = path.as_os_str().to_owned();
        temp.push(TEMP_SUFFIX);
        let temp = PathBuf::from(temp);
        fs::write(&temp, bytes).map_err(|err| EngineError::io("write", &temp, err))?;
        fs::rename(&temp, path).map_err(|err| EngineError::io("rename", path, err))?;
        debug!(path = %path.display(), "resume record written");
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> EngineResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(EngineError::io("remove", path, err)),
    }
}

fn read_if_present(path: &Path) -> EngineResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(EngineError::io("read", path, err)),
    }
}
