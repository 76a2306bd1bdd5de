//! Classic Table Format
//!
//! The pre-archive container format: every chunk is compressed on its own
//! (no shared dictionary) and the file carries a flat index plus a checksum
//! footer. Archival consumes these files; un-archival produces them.
//!
//! ## Table File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Payload: per-chunk zstd-compressed bodies, concatenated     │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Index, sorted by hash, one entry per chunk:                 │
//! │ - Chunk hash (20 bytes)                                     │
//! │ - Payload offset (8 bytes)                                  │
//! │ - Compressed length (4 bytes)                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Footer (24 bytes)                                           │
//! │ - Format version (4 bytes)                                  │
//! │ - Chunk count (4 bytes)                                     │
//! │ - Index length (8 bytes)                                    │
//! │ - CRC32 of payload + index (4 bytes)                        │
//! │ - Magic bytes: "CTBL" (4 bytes)                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A table file's address is the digest of its entire contents, computed
//! incrementally while writing. Classic files have no extension; the base
//! name is the address.

use std::collections::HashSet;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chunkhouse_core::{Address, Chunk, Error};
use sha2::{Digest, Sha512};
use tempfile::NamedTempFile;

use crate::dictionary::COMPRESSION_LEVEL;
use crate::error::Result;

/// Magic bytes terminating a classic table footer: "CTBL"
pub const TABLE_MAGIC: [u8; 4] = [0x43, 0x54, 0x42, 0x4C];

/// Current classic table format version.
pub const TABLE_FORMAT_VERSION: u32 = 1;

/// Table footer size (24 bytes).
pub const TABLE_FOOTER_SIZE: usize = 24;

/// Bytes per index entry: 20-byte hash + u64 offset + u32 length.
pub const TABLE_INDEX_ENTRY_SIZE: usize = 32;

struct TableIndexEntry {
    address: Address,
    offset: u64,
    length: u32,
}

/// Streaming writer for classic table files.
pub struct TableWriter {
    out: BufWriter<NamedTempFile>,
    entries: Vec<TableIndexEntry>,
    seen: HashSet<Address>,
    payload_len: u64,
    crc: crc32fast::Hasher,
    name_hasher: Sha512,
    name: Option<Address>,
}

impl TableWriter {
    /// Create a writer staging its output in `dir`.
    pub fn stage_in(dir: &Path) -> Result<Self> {
        let temp = NamedTempFile::new_in(dir).map_err(Error::Io)?;
        Ok(Self {
            out: BufWriter::new(temp),
            entries: Vec::new(),
            seen: HashSet::new(),
            payload_len: 0,
            crc: crc32fast::Hasher::new(),
            name_hasher: Sha512::new(),
            name: None,
        })
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes).map_err(Error::Io)?;
        self.crc.update(bytes);
        self.name_hasher.update(bytes);
        Ok(())
    }

    /// Compress and append one chunk. Duplicate addresses are dropped;
    /// returns whether the chunk was actually added.
    pub fn add_chunk(&mut self, chunk: &Chunk) -> Result<bool> {
        if self.name.is_some() {
            return Err(
                Error::InvalidContainer("table writer already finished".to_string()).into(),
            );
        }
        if !self.seen.insert(chunk.address()) {
            return Ok(false);
        }

        let compressed = zstd::bulk::compress(chunk.data(), COMPRESSION_LEVEL)?;
        let offset = self.payload_len;
        self.write_all(&compressed)?;
        self.payload_len += compressed.len() as u64;
        self.entries.push(TableIndexEntry {
            address: chunk.address(),
            offset,
            length: compressed.len() as u32,
        });
        Ok(true)
    }

    pub fn chunk_count(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Write the index and footer, computing the table's address. Returns
    /// the address; call `flush_to_file` to land the file.
    pub fn finish(&mut self) -> Result<Address> {
        if self.name.is_some() {
            return Err(
                Error::InvalidContainer("table writer already finished".to_string()).into(),
            );
        }

        self.entries.sort_by(|a, b| a.address.cmp(&b.address));

        let mut index = BytesMut::with_capacity(self.entries.len() * TABLE_INDEX_ENTRY_SIZE);
        for entry in &self.entries {
            index.put_slice(entry.address.as_bytes());
            index.put_u64(entry.offset);
            index.put_u32(entry.length);
        }
        self.write_all(&index.freeze())?;

        let mut footer = BytesMut::with_capacity(TABLE_FOOTER_SIZE);
        footer.put_u32(TABLE_FORMAT_VERSION);
        footer.put_u32(self.entries.len() as u32);
        footer.put_u64(self.entries.len() as u64 * TABLE_INDEX_ENTRY_SIZE as u64);
        footer.put_u32(self.crc.clone().finalize());
        footer.put_slice(&TABLE_MAGIC);

        self.out.write_all(&footer).map_err(Error::Io)?;
        self.name_hasher.update(&footer);

        let digest = std::mem::take(&mut self.name_hasher).finalize();
        let name = Address::from_slice(&digest[..chunkhouse_core::address::ADDRESS_LEN])?;
        self.name = Some(name);
        Ok(name)
    }

    /// Final path for this table under `dir` (classic files have no
    /// extension).
    pub fn gen_file_name(&self, dir: &Path) -> Result<PathBuf> {
        let name = self.name.ok_or_else(|| {
            crate::error::StorageError::from(Error::InvalidContainer(
                "table name requested before finish".to_string(),
            ))
        })?;
        Ok(dir.join(name.to_string()))
    }

    /// Atomically move the buffered file to `path`.
    pub fn flush_to_file(self, path: &Path) -> Result<()> {
        if self.name.is_none() {
            return Err(Error::InvalidContainer("table writer not finished".to_string()).into());
        }
        let temp = self
            .out
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        temp.as_file().sync_all().map_err(Error::Io)?;
        temp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

/// Random-access reader over a classic table file.
pub struct TableReader {
    data: Bytes,
    name: Address,
    entries: Vec<TableIndexEntry>,
}

impl TableReader {
    pub fn open(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(Error::Io)?;
        Self::from_bytes(Bytes::from(data))
    }

    pub fn from_bytes(data: Bytes) -> Result<Self> {
        if data.len() < TABLE_FOOTER_SIZE {
            return Err(Error::InvalidContainer("table file too small".to_string()).into());
        }

        let footer_start = data.len() - TABLE_FOOTER_SIZE;
        let mut cursor = &data[footer_start..];
        let version = cursor.get_u32();
        if version != TABLE_FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(version).into());
        }
        let chunk_count = cursor.get_u32() as usize;
        let index_len = cursor.get_u64() as usize;
        let stored_crc = cursor.get_u32();

        let mut magic = [0u8; 4];
        cursor.copy_to_slice(&mut magic);
        if magic != TABLE_MAGIC {
            return Err(Error::InvalidMagic.into());
        }

        if index_len != chunk_count * TABLE_INDEX_ENTRY_SIZE || footer_start < index_len {
            return Err(Error::InvalidContainer("truncated table file".to_string()).into());
        }

        if crc32fast::hash(&data[..footer_start]) != stored_crc {
            return Err(Error::CrcMismatch.into());
        }

        let index_start = footer_start - index_len;
        let payload_len = index_start as u64;
        let mut idx = &data[index_start..footer_start];
        let mut entries = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            let mut hash = [0u8; chunkhouse_core::address::ADDRESS_LEN];
            idx.copy_to_slice(&mut hash);
            let offset = idx.get_u64();
            let length = idx.get_u32();
            if offset + length as u64 > payload_len {
                return Err(Error::InvalidContainer("index entry out of bounds".to_string()).into());
            }
            entries.push(TableIndexEntry {
                address: Address(hash),
                offset,
                length,
            });
        }

        let name = Address::of(&data);
        Ok(Self {
            data,
            name,
            entries,
        })
    }

    /// The table's address: the digest of its full contents.
    pub fn name(&self) -> Address {
        self.name
    }

    pub fn count(&self) -> u32 {
        self.entries.len() as u32
    }

    fn find(&self, address: Address) -> Option<&TableIndexEntry> {
        self.entries
            .binary_search_by(|entry| entry.address.cmp(&address))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn has(&self, address: Address) -> bool {
        self.find(address).is_some()
    }

    /// All chunk addresses, in index (hash) order.
    pub fn addresses(&self) -> Vec<Address> {
        self.entries.iter().map(|e| e.address).collect()
    }

    pub fn get(&self, address: Address) -> Result<Option<Bytes>> {
        let entry = match self.find(address) {
            Some(e) => e,
            None => return Ok(None),
        };
        let start = entry.offset as usize;
        let end = start + entry.length as usize;
        let raw = zstd::stream::decode_all(&self.data[start..end])
            .map_err(|e| Error::Decompression(format!("chunk {}: {}", address, e)))?;
        debug_assert_eq!(Address::of(&raw), address);
        Ok(Some(Bytes::from(raw)))
    }

    /// Visit every chunk in index order.
    pub fn iterate<F>(&self, mut cb: F) -> Result<()>
    where
        F: FnMut(Chunk) -> Result<()>,
    {
        for entry in &self.entries {
            let bytes = self.get(entry.address)?.ok_or_else(|| {
                crate::error::StorageError::SourceRead(format!(
                    "indexed chunk {} missing from table",
                    entry.address
                ))
            })?;
            cb(Chunk::with_address(entry.address, bytes))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_table(dir: &Path, bodies: &[&[u8]]) -> (PathBuf, Address, u32) {
        let mut w = TableWriter::stage_in(dir).unwrap();
        for body in bodies {
            w.add_chunk(&Chunk::new(Bytes::from(body.to_vec()))).unwrap();
        }
        let name = w.finish().unwrap();
        let path = w.gen_file_name(dir).unwrap();
        let count = w.chunk_count();
        w.flush_to_file(&path).unwrap();
        (path, name, count)
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let (path, name, count) = write_table(dir.path(), &[b"red", b"green", b"blue"]);
        assert_eq!(count, 3);

        let reader = TableReader::open(&path).unwrap();
        assert_eq!(reader.name(), name);
        assert_eq!(reader.count(), 3);
        for body in [b"red".as_slice(), b"green", b"blue"] {
            let addr = Address::of(body);
            assert!(reader.has(addr));
            assert_eq!(
                reader.get(addr).unwrap().unwrap(),
                Bytes::from(body.to_vec())
            );
        }
        assert!(reader.get(Address::of(b"yellow")).unwrap().is_none());
    }

    #[test]
    fn test_duplicates_dropped() {
        let dir = TempDir::new().unwrap();
        let mut w = TableWriter::stage_in(dir.path()).unwrap();
        let chunk = Chunk::new(Bytes::from("twice"));
        assert!(w.add_chunk(&chunk).unwrap());
        assert!(!w.add_chunk(&chunk).unwrap());
        assert_eq!(w.chunk_count(), 1);
    }

    #[test]
    fn test_name_is_content_digest() {
        let dir = TempDir::new().unwrap();
        let (path, name, _) = write_table(dir.path(), &[b"content"]);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(Address::of(&bytes), name);
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), name.to_string());
    }

    #[test]
    fn test_crc_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let (path, _, _) = write_table(dir.path(), &[b"fragile"]);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xFF;
        assert!(TableReader::from_bytes(Bytes::from(bytes)).is_err());
    }

    #[test]
    fn test_iterate_in_hash_order() {
        let dir = TempDir::new().unwrap();
        let (path, _, _) = write_table(dir.path(), &[b"w", b"x", b"y", b"z"]);
        let reader = TableReader::open(&path).unwrap();
        let mut visited = Vec::new();
        reader
            .iterate(|chunk| {
                visited.push(chunk.address());
                Ok(())
            })
            .unwrap();
        let mut sorted = visited.clone();
        sorted.sort();
        assert_eq!(visited, sorted);
    }

    #[test]
    fn test_add_after_finish_fails() {
        let dir = TempDir::new().unwrap();
        let mut w = TableWriter::stage_in(dir.path()).unwrap();
        w.add_chunk(&Chunk::new(Bytes::from("a"))).unwrap();
        w.finish().unwrap();
        assert!(w.add_chunk(&Chunk::new(Bytes::from("b"))).is_err());
    }
}
