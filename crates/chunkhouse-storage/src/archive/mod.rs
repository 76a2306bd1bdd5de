//! Archive Container Format
//!
//! This module implements the binary file format for dictionary-compressed
//! chunk archives (`.darc` files).
//!
//! ## Archive File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Payload                                                     │
//! │ - Concatenated byte spans, no separators                    │
//! │ - A span is either a compressed chunk body or a             │
//! │   compressed zstd dictionary                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Index                                                       │
//! │ - Spans table: for span 1..=N, u64 end offset into payload  │
//! │ - Chunks table, sorted by hash, one entry per chunk:        │
//! │   * Chunk hash (20 bytes)                                   │
//! │   * Dictionary span id (4 bytes, 0 = no dictionary)         │
//! │   * Data span id (4 bytes, always > 0)                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Metadata                                                    │
//! │ - Opaque bytes (JSON in practice); length in the footer     │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Footer (48 bytes)                                           │
//! │ - Format version (4 bytes)                                  │
//! │ - Chunk count (4 bytes)                                     │
//! │ - Span count (4 bytes)                                      │
//! │ - Index length (8 bytes)                                    │
//! │ - Metadata length (8 bytes)                                 │
//! │ - Name stamp (16 bytes)                                     │
//! │ - Magic bytes: "DARC" (4 bytes)                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Self-Addressing
//!
//! The archive's address is the 20-byte digest of the index region, the
//! metadata region, and the footer prefix (everything before the name
//! stamp). Two builds that produce the same index, metadata, and counts
//! therefore produce the same address regardless of when they ran. The
//! footer's 16-byte stamp is the digest's prefix and is checked on open;
//! the full address is recomputed from the regions themselves.
//!
//! ## Why Spans?
//!
//! Chunk bodies and dictionaries share one append-only address space, so an
//! index entry is just two span ids: the dictionary to decode with (or 0
//! for none) and the compressed body. Many chunks point at the same
//! dictionary span, which is the entire point of grouping.
//!
//! ## Read Path
//!
//! `get(h)` binary-searches the chunks table, reads the data span, reads
//! and caches the dictionary span if one is referenced, and decompresses.
//! Decoded dictionaries are cached per reader, so a thousand chunks sharing
//! one group dictionary decode it once.

mod reader;
mod writer;

pub use reader::ArchiveReader;
pub use writer::ArchiveWriter;

/// Magic bytes terminating an archive footer: "DARC"
pub const ARCHIVE_MAGIC: [u8; 4] = [0x44, 0x41, 0x52, 0x43];

/// Current archive format version. Bumped on any incompatible change;
/// readers refuse versions they don't know.
pub const ARCHIVE_FORMAT_VERSION: u32 = 1;

/// File extension for archive containers.
pub const ARCHIVE_FILE_SUFFIX: &str = ".darc";

/// Archive footer size (48 bytes).
pub const ARCHIVE_FOOTER_SIZE: usize = 48;

/// Length of the footer prefix covered by the address digest.
pub const ARCHIVE_FOOTER_PREFIX_SIZE: usize = 28;

/// Length of the truncated name stamp stored in the footer.
pub const ARCHIVE_NAME_STAMP_SIZE: usize = 16;

/// Bytes per chunks-table entry: 20-byte hash + two u32 span ids.
pub const ARCHIVE_CHUNK_ENTRY_SIZE: usize = 28;

/// Span id meaning "no dictionary".
pub const NO_DICTIONARY: u32 = 0;
