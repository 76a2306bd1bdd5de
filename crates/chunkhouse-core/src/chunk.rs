//! Chunks
//!
//! A chunk is the fundamental unit of storage in ChunkHouse: an immutable
//! byte string addressed by the hash of its content. Chunks are produced by
//! the tree layers above the block store and never mutated; a container file
//! holds many of them plus an index.
//!
//! Uses `bytes::Bytes` so readers, caches, and compression workers can share
//! chunk bodies without copying.

use bytes::Bytes;

use crate::address::Address;

/// An immutable, content-addressed byte string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    address: Address,
    data: Bytes,
}

impl Chunk {
    /// Create a chunk from raw bytes, computing its address.
    pub fn new(data: Bytes) -> Self {
        let address = Address::of(&data);
        Self { address, data }
    }

    /// Create a chunk with a caller-supplied address. Read paths that verify
    /// hashes separately use this to avoid re-hashing every chunk.
    pub fn with_address(address: Address, data: Bytes) -> Self {
        Self { address, data }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
