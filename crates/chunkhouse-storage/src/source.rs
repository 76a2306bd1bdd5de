//! Chunk Sources
//!
//! One trait covers the read surface every container format shares —
//! `get`, `has`, `addresses`, `iterate`, `count` — and a tagged
//! [`ContainerHandle`] tells call sites which concrete format they are
//! holding. Format detection is by file presence: `<addr>` is a classic
//! table, `<addr>.darc` is an archive.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use chunkhouse_core::{Address, Chunk};

use crate::archive::{ArchiveReader, ARCHIVE_FILE_SUFFIX};
use crate::error::Result;
use crate::table::TableReader;

/// Read access to an immutable chunk container.
pub trait ChunkSource: Send + Sync {
    /// The container's address.
    fn address(&self) -> Address;

    /// Number of chunks in the container.
    fn count(&self) -> u32;

    fn has(&self, address: Address) -> bool;

    /// Fetch and decompress one chunk; `None` if absent.
    fn get(&self, address: Address) -> Result<Option<Bytes>>;

    /// All chunk addresses in index order.
    fn addresses(&self) -> Vec<Address>;

    /// Visit every chunk in index order.
    fn iterate(&self, cb: &mut dyn FnMut(Chunk) -> Result<()>) -> Result<()>;
}

impl ChunkSource for TableReader {
    fn address(&self) -> Address {
        self.name()
    }

    fn count(&self) -> u32 {
        TableReader::count(self)
    }

    fn has(&self, address: Address) -> bool {
        TableReader::has(self, address)
    }

    fn get(&self, address: Address) -> Result<Option<Bytes>> {
        TableReader::get(self, address)
    }

    fn addresses(&self) -> Vec<Address> {
        TableReader::addresses(self)
    }

    fn iterate(&self, cb: &mut dyn FnMut(Chunk) -> Result<()>) -> Result<()> {
        TableReader::iterate(self, cb)
    }
}

impl ChunkSource for ArchiveReader {
    fn address(&self) -> Address {
        self.name()
    }

    fn count(&self) -> u32 {
        ArchiveReader::count(self)
    }

    fn has(&self, address: Address) -> bool {
        ArchiveReader::has(self, address)
    }

    fn get(&self, address: Address) -> Result<Option<Bytes>> {
        ArchiveReader::get(self, address)
    }

    fn addresses(&self) -> Vec<Address> {
        ArchiveReader::addresses(self)
    }

    fn iterate(&self, cb: &mut dyn FnMut(Chunk) -> Result<()>) -> Result<()> {
        ArchiveReader::iterate(self, cb)
    }
}

/// A container opened from a block store directory, tagged by format.
pub enum ContainerHandle {
    Table(TableReader),
    Archive(ArchiveReader),
}

impl ContainerHandle {
    /// Path a classic table with this address would live at under `dir`.
    pub fn table_path(dir: &Path, address: Address) -> PathBuf {
        dir.join(address.to_string())
    }

    /// Path an archive with this address would live at under `dir`.
    pub fn archive_path(dir: &Path, address: Address) -> PathBuf {
        dir.join(format!("{}{}", address, ARCHIVE_FILE_SUFFIX))
    }

    /// Open the container for `address` under `dir`, auto-detecting the
    /// format. Returns `None` if neither file exists.
    pub fn open(dir: &Path, address: Address) -> Result<Option<Self>> {
        let table = Self::table_path(dir, address);
        if table.is_file() {
            return Ok(Some(ContainerHandle::Table(TableReader::open(&table)?)));
        }
        let archive = Self::archive_path(dir, address);
        if archive.is_file() {
            return Ok(Some(ContainerHandle::Archive(ArchiveReader::open(
                &archive,
            )?)));
        }
        Ok(None)
    }

    pub fn is_archive(&self) -> bool {
        matches!(self, ContainerHandle::Archive(_))
    }

    pub fn format_name(&self) -> &'static str {
        match self {
            ContainerHandle::Table(_) => "table",
            ContainerHandle::Archive(_) => "archive",
        }
    }

    pub fn source(&self) -> &dyn ChunkSource {
        match self {
            ContainerHandle::Table(t) => t,
            ContainerHandle::Archive(a) => a,
        }
    }
}

impl ChunkSource for ContainerHandle {
    fn address(&self) -> Address {
        self.source().address()
    }

    fn count(&self) -> u32 {
        self.source().count()
    }

    fn has(&self, address: Address) -> bool {
        self.source().has(address)
    }

    fn get(&self, address: Address) -> Result<Option<Bytes>> {
        self.source().get(address)
    }

    fn addresses(&self) -> Vec<Address> {
        self.source().addresses()
    }

    fn iterate(&self, cb: &mut dyn FnMut(Chunk) -> Result<()>) -> Result<()> {
        self.source().iterate(cb)
    }
}
