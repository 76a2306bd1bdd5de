//! ChunkHouse Core Types
//!
//! This crate holds the primitives shared by every ChunkHouse component:
//!
//! - **Address**: 20-byte content hash identifying a chunk or a container file
//! - **Chunk**: an immutable byte string paired with its address
//! - **BuildProgress**: typed progress events emitted by long-running
//!   storage operations (archival, un-archival, verification)
//! - **Error**: format- and integrity-level error conditions
//!
//! Everything here is deliberately small and dependency-light; the heavy
//! machinery (container formats, caches, the archive pipeline) lives in
//! `chunkhouse-storage`.

pub mod address;
pub mod chunk;
pub mod error;
pub mod progress;

pub use address::{Address, AddressSet};
pub use chunk::Chunk;
pub use error::{Error, Result};
pub use progress::BuildProgress;
