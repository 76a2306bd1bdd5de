//! ChunkHouse Storage Engine
//!
//! The archive storage engine for a content-addressed, version-controlled
//! chunk store. It rewrites classic table files — containers holding
//! thousands to millions of individually compressed chunks — into archive
//! files whose chunks share Zstandard dictionaries trained on groups of
//! structurally related chunks, and performs the inverse conversion.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────┐
//! │ classic table    │  per-chunk compression, no dictionaries
//! └────────┬─────────┘
//!          │ sample → default dictionary
//!          │ relations → chunk groups → group dictionaries
//!          │ parallel compression workers
//!          ▼
//! ┌──────────────────┐
//! │ archive (.darc)  │  byte spans + shared dictionaries + self-address
//! └────────┬─────────┘
//!          │ verify every chunk (read back + hash check)
//!          ▼
//! ┌──────────────────┐
//! │ manifest swap    │  CAS replace (old spec → new spec)
//! └──────────────────┘
//! ```
//!
//! ## Main Components
//!
//! - [`archive`]: the `.darc` container format (writer + reader)
//! - [`table`]: the classic container format
//! - [`dictionary`]: zstd dictionary training and prepared dictionaries
//! - [`cache`]: bounded 2Q chunk cache over a [`source::ChunkSource`]
//! - [`relations`]: union-find over chunk addresses, seeded externally
//! - [`group`]: per-group dictionary training and savings scoring
//! - [`build`]: the archive pipeline (sample → group → compress → verify)
//! - [`unarchive`]: the inverse conversion
//! - [`store`] / [`manifest`]: block store directories and the swap protocol

pub mod archive;
pub mod build;
pub mod cache;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod group;
pub mod manifest;
pub mod relations;
pub mod source;
pub mod store;
pub mod table;
pub mod unarchive;
pub mod verify;

pub use build::{archive_block_store, build_archive, convert_container, BuiltArchive};
pub use cache::ChunkCache;
pub use config::BuildConfig;
pub use error::{Result, StorageError};
pub use group::{ChunkGroup, ChunkScore};
pub use manifest::{Manifest, ManifestContents, TableSpec};
pub use relations::ChunkRelations;
pub use source::{ChunkSource, ContainerHandle};
pub use store::{BlockStore, GcMode, GenerationalBlockStore};
pub use unarchive::unarchive;
pub use verify::verify_archive;
