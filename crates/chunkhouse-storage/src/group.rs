//! Chunk Groups
//!
//! A chunk group is a set of related chunks that may earn a dedicated
//! compression dictionary. Building one trains a dictionary over the
//! members, then scores every chunk twice: once compressed with the group
//! dictionary and once with the default dictionary. The group is worth
//! materializing only if the bytes it saves — *including the cost of
//! storing its compressed dictionary* — beat what the default dictionary
//! would have saved anyway.
//!
//! Relation sets can name chunks that are not present in the container
//! being archived (relations are seeded repo-wide); absent members are
//! skipped during the fetch and never scored.

use bytes::Bytes;
use chunkhouse_core::{Address, Chunk};

use crate::cache::ChunkCache;
use crate::dictionary::{self, TrainedDictionary};
use crate::error::Result;

/// Per-chunk compression score within a group. The score is the fraction of
/// the raw size removed by the group dictionary — higher is better — and
/// only has meaning relative to other members of the same group.
#[derive(Debug, Clone)]
pub struct ChunkScore {
    pub address: Address,
    pub score: f64,
    /// Compressed size using the group's dictionary.
    pub group_compressed_len: usize,
    /// Compressed size using the default dictionary. When this is smaller,
    /// the chunk gains nothing from group membership.
    pub default_compressed_len: usize,
}

/// A set of chunks scored against a dictionary trained on them.
pub struct ChunkGroup {
    dict: TrainedDictionary,
    /// Member scores, best first (ties broken by address).
    pub scores: Vec<ChunkScore>,
    /// Savings with the group dictionary, including the stored dictionary's
    /// compressed size. Negative when the dictionary costs more than it
    /// saves.
    pub total_bytes_saved_group_dict: i64,
    /// Savings the default dictionary would achieve on the same chunks.
    pub total_bytes_saved_default_dict: i64,
    pub total_ratio_group_dict: f64,
    pub total_ratio_default_dict: f64,
    pub avg_raw_chunk_size: usize,
}

impl ChunkGroup {
    /// Build a group from a relation set. Members absent from the cache's
    /// source are skipped; returns `None` if nothing was present.
    pub async fn build(
        cache: &ChunkCache,
        members: &[Address],
        default_dict: &TrainedDictionary,
    ) -> Result<Option<ChunkGroup>> {
        let mut chunks = Vec::with_capacity(members.len());
        for address in members {
            if let Some(bytes) = cache.get(*address).await? {
                chunks.push(Chunk::with_address(*address, bytes));
            }
        }
        if chunks.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::rebuild(&chunks, default_dict)?))
    }

    /// Train a dictionary over `chunks` and score each of them with it and
    /// with the default dictionary.
    fn rebuild(chunks: &[Chunk], default_dict: &TrainedDictionary) -> Result<ChunkGroup> {
        let bodies: Vec<Bytes> = chunks.iter().map(|c| c.data().clone()).collect();
        let dict = dictionary::train(&bodies)?;
        let stored_dict_len = dict.compressed()?.len();

        let mut raw_total = 0usize;
        let mut group_total = stored_dict_len;
        let mut default_total = 0usize;
        let mut scores = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let raw = chunk.len();
            let with_group = dict.compress(chunk.data())?;
            let with_default = default_dict.compress(chunk.data())?;

            scores.push(ChunkScore {
                address: chunk.address(),
                score: (raw as f64 - with_group.len() as f64) / raw as f64,
                group_compressed_len: with_group.len(),
                default_compressed_len: with_default.len(),
            });

            raw_total += raw;
            group_total += with_group.len();
            default_total += with_default.len();
        }

        scores.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.address.cmp(&b.address))
        });

        Ok(ChunkGroup {
            dict,
            scores,
            total_bytes_saved_group_dict: raw_total as i64 - group_total as i64,
            total_bytes_saved_default_dict: raw_total as i64 - default_total as i64,
            total_ratio_group_dict: (raw_total as f64 - group_total as f64) / raw_total as f64,
            total_ratio_default_dict: (raw_total as f64 - default_total as f64) / raw_total as f64,
            avg_raw_chunk_size: raw_total / chunks.len(),
        })
    }

    /// Add a chunk and rebuild the group's dictionary and statistics.
    pub async fn add_chunk(
        &mut self,
        cache: &ChunkCache,
        chunk: Chunk,
        default_dict: &TrainedDictionary,
    ) -> Result<()> {
        let mut chunks = Vec::with_capacity(self.scores.len() + 1);
        for score in &self.scores {
            if let Some(bytes) = cache.get(score.address).await? {
                chunks.push(Chunk::with_address(score.address, bytes));
            }
        }
        chunks.push(chunk);
        *self = Self::rebuild(&chunks, default_dict)?;
        Ok(())
    }

    /// Whether materializing this group beats routing its chunks through
    /// the default dictionary.
    pub fn pays_rent(&self) -> bool {
        self.total_bytes_saved_group_dict > self.total_bytes_saved_default_dict
    }

    pub fn dictionary(&self) -> &TrainedDictionary {
        &self.dict
    }

    /// The smallest member address; used as a deterministic tie-break when
    /// ordering groups with equal savings.
    pub fn min_address(&self) -> Address {
        self.scores
            .iter()
            .map(|s| s.address)
            .min()
            .unwrap_or(Address::EMPTY)
    }

    /// Z-score of the worst-scoring member: how many standard deviations
    /// below the group mean it sits. Always non-positive; NaN for a group
    /// whose members all score identically.
    pub fn worst_z_score(&self) -> f64 {
        let n = self.scores.len() as f64;
        let mean = self.scores.iter().map(|s| s.score).sum::<f64>() / n;
        let variance = self
            .scores
            .iter()
            .map(|s| (s.score - mean) * (s.score - mean))
            .sum::<f64>()
            / n;
        let std_dev = variance.sqrt();
        (self.scores.last().map(|s| s.score).unwrap_or(mean) - mean) / std_dev
    }

    /// Whether a candidate chunk compresses better with this group's
    /// dictionary than the group's current worst member does. An admission
    /// probe for future use; the archival path does not consult it.
    pub fn test_chunk(&self, chunk: &Chunk) -> Result<bool> {
        let compressed = self.dict.compress(chunk.data())?;
        let ratio = (chunk.len() as f64 - compressed.len() as f64) / chunk.len() as f64;
        Ok(ratio > self.scores.last().map(|s| s.score).unwrap_or(f64::MIN))
    }
}
