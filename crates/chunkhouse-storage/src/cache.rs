//! Chunk Cache
//!
//! A bounded in-memory cache of decompressed chunks layered over a
//! [`ChunkSource`], used for the lifetime of one archive build. A chunk may
//! be fetched several times during a build — once for dictionary scoring,
//! once for materialization — and decompressing it each time is the cost
//! being avoided.
//!
//! ## Why 2Q?
//!
//! The build's access pattern mixes one-shot scans (sampling, the ungrouped
//! pass) with repeated hits on grouped chunks. Plain LRU lets the scans
//! flush the valuable entries; 2Q admits new keys into a small probationary
//! queue and only promotes keys seen again (tracked via a ghost queue of
//! recently evicted addresses) into the main queue. Capacity defaults to
//! 3M entries, roughly 12 GiB at the 4 KiB average chunk size.
//!
//! A miss reads through to the source. An absent chunk is a legal result:
//! `None` is returned and nothing is cached.

use std::sync::Arc;

use bytes::Bytes;
use chunkhouse_core::Address;
use lru::LruCache;
use std::num::NonZeroUsize;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::source::ChunkSource;

/// 2Q admission policy built from three LRU queues.
struct TwoQueue {
    /// Probationary queue for first-time keys (~25% of capacity).
    recent: LruCache<Address, Bytes>,
    /// Main queue for keys seen more than once (~75% of capacity).
    frequent: LruCache<Address, Bytes>,
    /// Ghost queue of addresses recently evicted from `recent` (~50% of
    /// capacity, keys only). A hit here signals re-use and admits the key
    /// into `frequent`.
    ghost: LruCache<Address, ()>,
}

impl TwoQueue {
    fn new(capacity: usize) -> Self {
        let recent = capacity / 4;
        let frequent = capacity - recent;
        let ghost = capacity / 2;
        Self {
            recent: LruCache::new(NonZeroUsize::new(recent.max(1)).unwrap()),
            frequent: LruCache::new(NonZeroUsize::new(frequent.max(1)).unwrap()),
            ghost: LruCache::new(NonZeroUsize::new(ghost.max(1)).unwrap()),
        }
    }

    fn get(&mut self, address: &Address) -> Option<Bytes> {
        if let Some(v) = self.frequent.get(address) {
            return Some(v.clone());
        }
        self.recent.peek(address).cloned()
    }

    fn put(&mut self, address: Address, value: Bytes) {
        if self.frequent.contains(&address) {
            self.frequent.put(address, value);
            return;
        }
        if self.ghost.pop(&address).is_some() {
            self.frequent.push(address, value);
            return;
        }
        if let Some((evicted, _)) = self.recent.push(address, value) {
            if evicted != address {
                self.ghost.push(evicted, ());
            }
        }
    }

    fn len(&self) -> usize {
        self.recent.len() + self.frequent.len()
    }
}

/// Bounded cache of decompressed chunks over a shared chunk source.
pub struct ChunkCache {
    queues: Mutex<TwoQueue>,
    source: Arc<dyn ChunkSource>,
}

impl ChunkCache {
    pub fn new(source: Arc<dyn ChunkSource>, capacity: usize) -> Self {
        Self {
            queues: Mutex::new(TwoQueue::new(capacity)),
            source,
        }
    }

    /// Fetch a chunk, reading through to the source on a miss. An absent
    /// chunk returns `None` and is not inserted.
    pub async fn get(&self, address: Address) -> Result<Option<Bytes>> {
        if let Some(hit) = self.queues.lock().await.get(&address) {
            return Ok(Some(hit));
        }

        let fetched = self.source.get(address)?;
        if let Some(bytes) = &fetched {
            self.queues.lock().await.put(address, bytes.clone());
        }
        Ok(fetched)
    }

    /// Whether the *source* holds this chunk (unrelated to cache contents).
    pub fn has(&self, address: Address) -> bool {
        self.source.has(address)
    }

    /// All chunk addresses of the source, in index order.
    pub fn addresses(&self) -> Vec<Address> {
        self.source.addresses()
    }

    /// Chunk count of the source.
    pub fn source_count(&self) -> u32 {
        self.source.count()
    }

    /// The source container's address.
    pub fn source_address(&self) -> Address {
        self.source.address()
    }

    /// Number of entries currently cached.
    pub async fn len(&self) -> usize {
        self.queues.lock().await.len()
    }
}
