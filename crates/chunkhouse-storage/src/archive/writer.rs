//! Archive Writer
//!
//! Builds an archive container through a strict sequence of operations:
//!
//! 1. `write_byte_span` — append compressed payloads, get back span ids
//! 2. `stage_chunk` — record (hash, dict span, data span) index entries
//! 3. `finalize_byte_spans` — freeze the span table
//! 4. `write_index` — emit the spans + chunks tables
//! 5. `write_metadata` — emit the opaque metadata region
//! 6. `write_footer` — compute the archive's address and emit the footer
//! 7. `gen_file_name` / `flush_to_file` — atomically land the file
//!
//! The payload streams into an unnamed temp file in the destination
//! directory; nothing appears at a final path until `flush_to_file`
//! persists it. Dropping the writer at any earlier point discards the
//! partial output.

use std::collections::HashSet;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use chunkhouse_core::{Address, Error};
use sha2::{Digest, Sha512};
use tempfile::NamedTempFile;

use super::{
    ARCHIVE_CHUNK_ENTRY_SIZE, ARCHIVE_FILE_SUFFIX, ARCHIVE_FORMAT_VERSION, ARCHIVE_MAGIC,
    ARCHIVE_NAME_STAMP_SIZE,
};
use crate::error::Result;

/// Writer construction order is enforced with an explicit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterStage {
    Spans,
    SpansFinalized,
    IndexWritten,
    MetadataWritten,
    FooterWritten,
}

struct StagedChunk {
    address: Address,
    dict_span: u32,
    data_span: u32,
}

/// Streaming writer for the archive container format.
pub struct ArchiveWriter {
    out: BufWriter<NamedTempFile>,
    stage: WriterStage,

    /// End offset of each span, 1-indexed (entry 0 is span 1).
    span_ends: Vec<u64>,
    payload_len: u64,

    staged: Vec<StagedChunk>,
    seen: HashSet<Address>,

    index_bytes: BytesMut,
    metadata_len: u64,
    /// Digest over index + metadata + footer prefix, fed incrementally.
    name_hasher: Sha512,
    name: Option<Address>,
}

impl ArchiveWriter {
    /// Create a writer staging its output in `dir`. The temp file lives in
    /// the destination directory so the final persist is a same-filesystem
    /// rename.
    pub fn stage_in(dir: &Path) -> Result<Self> {
        let temp = NamedTempFile::new_in(dir).map_err(Error::Io)?;
        Ok(Self {
            out: BufWriter::new(temp),
            stage: WriterStage::Spans,
            span_ends: Vec::new(),
            payload_len: 0,
            staged: Vec::new(),
            seen: HashSet::new(),
            index_bytes: BytesMut::new(),
            metadata_len: 0,
            name_hasher: Sha512::new(),
            name: None,
        })
    }

    fn expect_stage(&self, want: WriterStage) -> Result<()> {
        if self.stage != want {
            return Err(Error::InvalidContainer(format!(
                "archive writer operation out of order (at {:?}, wanted {:?})",
                self.stage, want
            ))
            .into());
        }
        Ok(())
    }

    /// Append a byte span to the payload and return its id (ids start at 1;
    /// 0 is reserved for "no dictionary").
    pub fn write_byte_span(&mut self, bytes: &[u8]) -> Result<u32> {
        self.expect_stage(WriterStage::Spans)?;
        self.out.write_all(bytes).map_err(Error::Io)?;
        self.payload_len += bytes.len() as u64;
        self.span_ends.push(self.payload_len);
        Ok(self.span_ends.len() as u32)
    }

    /// True if a chunk with this address has already been staged. Callers
    /// use this to drop duplicate chunks from the source container.
    pub fn chunk_seen(&self, address: Address) -> bool {
        self.seen.contains(&address)
    }

    /// Record an index entry. Both span ids must refer to already-written
    /// spans; the dict span may be 0 for "no dictionary".
    pub fn stage_chunk(&mut self, address: Address, dict_span: u32, data_span: u32) -> Result<()> {
        self.expect_stage(WriterStage::Spans)?;
        let span_count = self.span_ends.len() as u32;
        if data_span == 0 || data_span > span_count || dict_span > span_count {
            return Err(Error::InvalidContainer(format!(
                "staged chunk {} references invalid span (dict {}, data {}, have {})",
                address, dict_span, data_span, span_count
            ))
            .into());
        }
        if !self.seen.insert(address) {
            return Err(Error::InvalidContainer(format!(
                "chunk {} staged twice",
                address
            ))
            .into());
        }
        self.staged.push(StagedChunk {
            address,
            dict_span,
            data_span,
        });
        Ok(())
    }

    /// Freeze the span table. No more spans or chunks can be added.
    pub fn finalize_byte_spans(&mut self) -> Result<()> {
        self.expect_stage(WriterStage::Spans)?;
        self.stage = WriterStage::SpansFinalized;
        Ok(())
    }

    /// Emit the spans table and the hash-sorted chunks table.
    pub fn write_index(&mut self) -> Result<()> {
        self.expect_stage(WriterStage::SpansFinalized)?;

        self.staged.sort_by(|a, b| a.address.cmp(&b.address));

        let cap = self.span_ends.len() * 8 + self.staged.len() * ARCHIVE_CHUNK_ENTRY_SIZE;
        self.index_bytes.reserve(cap);
        for end in &self.span_ends {
            self.index_bytes.put_u64(*end);
        }
        for chunk in &self.staged {
            self.index_bytes.put_slice(chunk.address.as_bytes());
            self.index_bytes.put_u32(chunk.dict_span);
            self.index_bytes.put_u32(chunk.data_span);
        }

        self.out.write_all(&self.index_bytes).map_err(Error::Io)?;
        self.name_hasher.update(&self.index_bytes);
        self.stage = WriterStage::IndexWritten;
        Ok(())
    }

    /// Emit the opaque metadata region.
    pub fn write_metadata(&mut self, metadata: &[u8]) -> Result<()> {
        self.expect_stage(WriterStage::IndexWritten)?;
        self.out.write_all(metadata).map_err(Error::Io)?;
        self.name_hasher.update(metadata);
        self.metadata_len = metadata.len() as u64;
        self.stage = WriterStage::MetadataWritten;
        Ok(())
    }

    /// Compute the archive's address and emit the footer.
    pub fn write_footer(&mut self) -> Result<()> {
        self.expect_stage(WriterStage::MetadataWritten)?;

        let mut prefix = BytesMut::with_capacity(super::ARCHIVE_FOOTER_PREFIX_SIZE);
        prefix.put_u32(ARCHIVE_FORMAT_VERSION);
        prefix.put_u32(self.staged.len() as u32);
        prefix.put_u32(self.span_ends.len() as u32);
        prefix.put_u64(self.index_bytes.len() as u64);
        prefix.put_u64(self.metadata_len);

        self.name_hasher.update(&prefix);
        let digest = std::mem::take(&mut self.name_hasher).finalize();
        let name = Address::from_slice(&digest[..chunkhouse_core::address::ADDRESS_LEN])?;
        self.name = Some(name);

        self.out.write_all(&prefix).map_err(Error::Io)?;
        self.out
            .write_all(&name.as_bytes()[..ARCHIVE_NAME_STAMP_SIZE])
            .map_err(Error::Io)?;
        self.out.write_all(&ARCHIVE_MAGIC).map_err(Error::Io)?;
        self.stage = WriterStage::FooterWritten;
        Ok(())
    }

    /// The archive's address. Only available after `write_footer`.
    pub fn name(&self) -> Result<Address> {
        self.name.ok_or_else(|| {
            Error::InvalidContainer("archive name requested before footer".to_string()).into()
        })
    }

    /// Number of chunks staged so far.
    pub fn chunk_count(&self) -> u32 {
        self.staged.len() as u32
    }

    /// Final path for this archive under `dir`.
    pub fn gen_file_name(&self, dir: &Path) -> Result<PathBuf> {
        let name = self.name()?;
        Ok(dir.join(format!("{}{}", name, ARCHIVE_FILE_SUFFIX)))
    }

    /// Atomically move the buffered file to `path`. Consumes the writer; on
    /// any earlier error the temp file is dropped and cleaned up.
    pub fn flush_to_file(self, path: &Path) -> Result<()> {
        self.expect_stage(WriterStage::FooterWritten)?;
        let temp = self
            .out
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        temp.as_file().sync_all().map_err(Error::Io)?;
        temp.persist(path)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}
