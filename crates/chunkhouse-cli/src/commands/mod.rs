//! Command handlers for chunkctl
//!
//! - `archive`: the archive / unarchive conversions
//! - `admin`: manifest surgery and container diffing

pub mod admin;
pub mod archive;
