//! Build Configuration
//!
//! Tunables for the archive pipeline. The writer version and conversion
//! timestamp are injected here (rather than read from package globals or the
//! wall clock inside the writer) so tests can pin both and assert that two
//! builds of the same source produce the same archive address.

use serde::{Deserialize, Serialize};

/// Configuration for one archive build run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Version string recorded in the archive metadata.
    pub writer_version: String,
    /// UTC RFC 3339 conversion timestamp. `None` means "now".
    pub conversion_time: Option<String>,
    /// Workers compressing ungrouped chunks against the default dictionary.
    pub compression_workers: usize,
    /// Workers training chunk-group dictionaries.
    pub group_workers: usize,
    /// Chunk cache capacity in entries. 3M entries is roughly 12 GiB at the
    /// 4 KiB average chunk size.
    pub cache_capacity: usize,
    /// Cap on chunks sampled for the default dictionary.
    pub max_default_samples: u32,
    /// Containers with fewer chunks than this are skipped.
    pub min_chunks: u32,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            writer_version: env!("CARGO_PKG_VERSION").to_string(),
            conversion_time: None,
            compression_workers: 32,
            group_workers: 4,
            cache_capacity: 3_000_000,
            max_default_samples: 1000,
            min_chunks: 25,
        }
    }
}

impl BuildConfig {
    /// Resolve the conversion timestamp: the pinned value if set, otherwise
    /// the current UTC time in RFC 3339.
    pub fn conversion_time(&self) -> String {
        match &self.conversion_time {
            Some(t) => t.clone(),
            None => chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        }
    }
}
