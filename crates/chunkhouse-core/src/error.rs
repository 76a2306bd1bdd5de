//! Core Error Types
//!
//! Format- and integrity-level errors shared by every container reader and
//! writer: bad magic bytes, unsupported format versions, truncated files,
//! checksum failures, and hash mismatches. Higher-level build and swap
//! errors live in `chunkhouse-storage`.

use thiserror::Error;

use crate::address::Address;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid container: {0}")]
    InvalidContainer(String),

    #[error("CRC mismatch")]
    CrcMismatch,

    #[error("Hash mismatch for chunk: {0}")]
    HashMismatch(Address),

    #[error("Decompression error: {0}")]
    Decompression(String),
}
