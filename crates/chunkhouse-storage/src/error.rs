//! Storage Engine Error Types
//!
//! Errors surfaced by the archive build, un-archive, and manifest swap
//! paths. Format-level corruption errors come from `chunkhouse_core::Error`
//! and convert via `#[from]`.
//!
//! Failure discipline:
//! - `NotEnoughChunks` skips a single container; other containers continue.
//! - Purge failures after a successful swap are *not* errors — they are
//!   reported as `BuildProgress::Warning` events.
//! - Everything else is fatal to the container (or the whole run) and no
//!   partial output is ever left at a final path.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Core(#[from] chunkhouse_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not enough chunks to build default dictionary")]
    NotEnoughChunks,

    #[error("Dictionary training failed: {0}")]
    DictionaryTraining(String),

    #[error("Chunk source read failed: {0}")]
    SourceRead(String),

    #[error("Archive verification failed: {0}")]
    Verification(String),

    #[error("Manifest swap failed: {0}")]
    SwapFailed(String),

    #[error("Generational block store expected")]
    GenerationalStoreExpected,

    #[error("Unsupported GC mode for manifest swap")]
    UnsupportedGcMode,

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl StorageError {
    pub fn cancelled() -> Self {
        StorageError::Cancelled("build cancelled".to_string())
    }
}
