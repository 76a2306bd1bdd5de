//! Block Store Manifest
//!
//! The manifest is the block store's root pointer: the list of current
//! containers and their chunk counts, stored as a JSON document named
//! `manifest` in the store directory. Every mutation writes the full spec
//! list back — there is no partial update — through a compare-and-set on a
//! monotonically increasing version counter, staged via temp file + rename
//! so readers never observe a torn manifest.

use std::io::Write;
use std::path::{Path, PathBuf};

use chunkhouse_core::{Address, Error};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::Result;

/// File name of the manifest inside a block store directory.
pub const MANIFEST_FILE_NAME: &str = "manifest";

/// One container entry: its address and the chunk count as seen by the
/// manifest at swap time (an archive's count may be lower than its source's
/// if the archive deduplicated).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: Address,
    pub chunk_count: u32,
}

/// A parsed manifest: version counter plus the full spec list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestContents {
    pub version: u64,
    pub specs: Vec<TableSpec>,
}

/// Outcome of a compare-and-set attempt.
#[derive(Debug)]
pub enum CasResult {
    Committed(ManifestContents),
    /// Someone else updated the manifest first; here is what is current.
    Conflict(ManifestContents),
}

/// Handle to the manifest file of one block store directory.
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
}

impl Manifest {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(MANIFEST_FILE_NAME),
        }
    }

    /// Read the current contents. A missing file reads as version 0 with no
    /// specs (a freshly initialized store).
    pub fn load(&self) -> Result<ManifestContents> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::InvalidContainer(format!("corrupt manifest: {}", e)).into()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(ManifestContents::default())
            }
            Err(e) => Err(Error::Io(e).into()),
        }
    }

    /// Compare-and-set: install `specs` if the on-disk version still equals
    /// `expected_version`. On conflict nothing is written and the current
    /// contents are returned for the caller to retry against.
    pub fn try_update(&self, expected_version: u64, specs: Vec<TableSpec>) -> Result<CasResult> {
        let current = self.load()?;
        if current.version != expected_version {
            return Ok(CasResult::Conflict(current));
        }

        let next = ManifestContents {
            version: expected_version + 1,
            specs,
        };
        let dir = self.path.parent().ok_or_else(|| {
            crate::error::StorageError::from(Error::InvalidContainer(
                "manifest has no parent directory".to_string(),
            ))
        })?;
        let mut temp = NamedTempFile::new_in(dir).map_err(Error::Io)?;
        let json = serde_json::to_vec_pretty(&next)
            .map_err(|e| Error::InvalidContainer(format!("manifest encode: {}", e)))?;
        temp.write_all(&json).map_err(Error::Io)?;
        temp.as_file().sync_all().map_err(Error::Io)?;
        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(CasResult::Committed(next))
    }
}
