//! Archive Reader
//!
//! Opens an archive container, validates the footer, and serves chunk
//! lookups. The chunks table is sorted by hash, so `has`/`get` are binary
//! searches; decoded group dictionaries are cached per reader so chunks
//! sharing a dictionary pay its decode cost once.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes};
use chunkhouse_core::{Address, Chunk, Error};
use sha2::{Digest, Sha512};
use zstd::dict::DecoderDictionary;

use super::{
    ARCHIVE_CHUNK_ENTRY_SIZE, ARCHIVE_FOOTER_PREFIX_SIZE, ARCHIVE_FOOTER_SIZE,
    ARCHIVE_FORMAT_VERSION, ARCHIVE_MAGIC, ARCHIVE_NAME_STAMP_SIZE, NO_DICTIONARY,
};
use crate::error::Result;

#[derive(Debug)]
struct ChunkEntry {
    address: Address,
    dict_span: u32,
    data_span: u32,
}

/// Random-access reader over an archive container.
pub struct ArchiveReader {
    data: Bytes,
    name: Address,
    span_ends: Vec<u64>,
    chunks: Vec<ChunkEntry>,
    /// Dictionary span id -> decoded dictionary, populated lazily.
    dictionaries: Mutex<HashMap<u32, Arc<DecoderDictionary<'static>>>>,
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("name", &self.name)
            .field("span_ends", &self.span_ends)
            .field("chunks", &self.chunks)
            .finish()
    }
}

impl ArchiveReader {
    /// Open an archive file from disk.
    pub fn open(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(Error::Io)?;
        Self::from_bytes(Bytes::from(data))
    }

    /// Parse an archive from its full byte contents.
    pub fn from_bytes(data: Bytes) -> Result<Self> {
        if data.len() < ARCHIVE_FOOTER_SIZE {
            return Err(Error::InvalidContainer("archive too small".to_string()).into());
        }

        let footer_start = data.len() - ARCHIVE_FOOTER_SIZE;
        let mut cursor = &data[footer_start..];

        let version = cursor.get_u32();
        if version != ARCHIVE_FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(version).into());
        }
        let chunk_count = cursor.get_u32() as usize;
        let span_count = cursor.get_u32() as usize;
        let index_len = cursor.get_u64() as usize;
        let metadata_len = cursor.get_u64() as usize;

        let mut stamp = [0u8; ARCHIVE_NAME_STAMP_SIZE];
        cursor.copy_to_slice(&mut stamp);

        let mut magic = [0u8; 4];
        cursor.copy_to_slice(&mut magic);
        if magic != ARCHIVE_MAGIC {
            return Err(Error::InvalidMagic.into());
        }

        if index_len != span_count * 8 + chunk_count * ARCHIVE_CHUNK_ENTRY_SIZE {
            return Err(
                Error::InvalidContainer("index length disagrees with counts".to_string()).into(),
            );
        }
        if footer_start < index_len + metadata_len {
            return Err(Error::InvalidContainer("truncated archive".to_string()).into());
        }

        let metadata_start = footer_start - metadata_len;
        let index_start = metadata_start - index_len;

        // Recompute the address over index + metadata + footer prefix and
        // check it against the stored stamp.
        let mut hasher = Sha512::new();
        hasher.update(&data[index_start..footer_start]);
        hasher.update(&data[footer_start..footer_start + ARCHIVE_FOOTER_PREFIX_SIZE]);
        let digest = hasher.finalize();
        let name = Address::from_slice(&digest[..chunkhouse_core::address::ADDRESS_LEN])?;
        if name.as_bytes()[..ARCHIVE_NAME_STAMP_SIZE] != stamp {
            return Err(
                Error::InvalidContainer("footer name stamp mismatch".to_string()).into(),
            );
        }

        let mut idx = &data[index_start..metadata_start];
        let mut span_ends = Vec::with_capacity(span_count);
        for _ in 0..span_count {
            span_ends.push(idx.get_u64());
        }

        let mut chunks = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            let mut hash = [0u8; chunkhouse_core::address::ADDRESS_LEN];
            idx.copy_to_slice(&mut hash);
            chunks.push(ChunkEntry {
                address: Address(hash),
                dict_span: idx.get_u32(),
                data_span: idx.get_u32(),
            });
        }

        // Span ends must be monotonic and fit inside the payload region.
        let payload_len = index_start as u64;
        let mut prev = 0u64;
        for end in &span_ends {
            if *end < prev || *end > payload_len {
                return Err(Error::InvalidContainer("corrupt span table".to_string()).into());
            }
            prev = *end;
        }

        Ok(Self {
            data,
            name,
            span_ends,
            chunks,
            dictionaries: Mutex::new(HashMap::new()),
        })
    }

    /// The archive's self-address.
    pub fn name(&self) -> Address {
        self.name
    }

    /// Number of chunks in the archive.
    pub fn count(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn has(&self, address: Address) -> bool {
        self.find(address).is_some()
    }

    /// All chunk addresses, in index (hash) order.
    pub fn addresses(&self) -> Vec<Address> {
        self.chunks.iter().map(|c| c.address).collect()
    }

    fn find(&self, address: Address) -> Option<&ChunkEntry> {
        self.chunks
            .binary_search_by(|entry| entry.address.cmp(&address))
            .ok()
            .map(|i| &self.chunks[i])
    }

    fn span_bytes(&self, span_id: u32) -> Result<&[u8]> {
        let i = span_id as usize;
        if i == 0 || i > self.span_ends.len() {
            return Err(Error::InvalidContainer(format!("invalid span id {}", span_id)).into());
        }
        let start = if i == 1 { 0 } else { self.span_ends[i - 2] } as usize;
        let end = self.span_ends[i - 1] as usize;
        Ok(&self.data[start..end])
    }

    fn dictionary(&self, span_id: u32) -> Result<Arc<DecoderDictionary<'static>>> {
        // The map is only ever inserted into; a poisoned lock still holds
        // usable state.
        let mut cache = self
            .dictionaries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(dict) = cache.get(&span_id) {
            return Ok(dict.clone());
        }
        // The dictionary span holds a zstd-compressed dictionary blob.
        let compressed = self.span_bytes(span_id)?;
        let raw = zstd::stream::decode_all(compressed)
            .map_err(|e| Error::Decompression(format!("dictionary span {}: {}", span_id, e)))?;
        let dict = Arc::new(DecoderDictionary::copy(&raw));
        cache.insert(span_id, dict.clone());
        Ok(dict)
    }

    /// Fetch and decompress a chunk. Returns `None` if the archive does not
    /// contain it. Hash equality is checked in debug builds; use
    /// `get_verified` when verification must be unconditional.
    pub fn get(&self, address: Address) -> Result<Option<Bytes>> {
        let entry = match self.find(address) {
            Some(e) => e,
            None => return Ok(None),
        };

        let compressed = self.span_bytes(entry.data_span)?;
        let raw = if entry.dict_span == NO_DICTIONARY {
            zstd::stream::decode_all(compressed)
                .map_err(|e| Error::Decompression(format!("chunk {}: {}", address, e)))?
        } else {
            let dict = self.dictionary(entry.dict_span)?;
            let mut decoder = zstd::stream::Decoder::with_prepared_dictionary(compressed, &*dict)
                .map_err(|e| Error::Decompression(format!("chunk {}: {}", address, e)))?;
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::Decompression(format!("chunk {}: {}", address, e)))?;
            out
        };

        debug_assert_eq!(Address::of(&raw), address);
        Ok(Some(Bytes::from(raw)))
    }

    /// Fetch a chunk and verify its hash unconditionally.
    pub fn get_verified(&self, address: Address) -> Result<Option<Bytes>> {
        match self.get(address)? {
            Some(bytes) if Address::of(&bytes) != address => {
                Err(Error::HashMismatch(address).into())
            }
            other => Ok(other),
        }
    }

    /// Visit every chunk in index order.
    pub fn iterate<F>(&self, mut cb: F) -> Result<()>
    where
        F: FnMut(Chunk) -> Result<()>,
    {
        for entry in &self.chunks {
            let bytes = self.get(entry.address)?.ok_or_else(|| {
                crate::error::StorageError::SourceRead(format!(
                    "indexed chunk {} missing from archive",
                    entry.address
                ))
            })?;
            cb(Chunk::with_address(entry.address, bytes))?;
        }
        Ok(())
    }
}
