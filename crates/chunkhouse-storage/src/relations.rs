//! Chunk Relations
//!
//! An equivalence over chunk addresses indicating structural similarity.
//! The engine does not compute relatedness itself: an external caller walks
//! tree modifications — it knows which chunks are edits of which — and
//! seeds the relation with `add(a, b)` pairs. Relationships are fully
//! transitive: if A relates to B and B to C, then A, B, C share one group.
//!
//! Implemented as a disjoint-set forest with union by rank and path
//! compression, so group membership is unambiguous across any sequence of
//! merges. Construction happens before the parallel build phase; the
//! structure is not synchronized.

use std::collections::HashMap;

use chunkhouse_core::Address;

/// Union-find over chunk addresses.
#[derive(Debug, Default)]
pub struct ChunkRelations {
    index: HashMap<Address, usize>,
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl ChunkRelations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of addresses participating in any relation.
    pub fn count(&self) -> usize {
        self.index.len()
    }

    pub fn contains(&self, address: Address) -> bool {
        self.index.contains_key(&address)
    }

    fn intern(&mut self, address: Address) -> usize {
        if let Some(&i) = self.index.get(&address) {
            return i;
        }
        let i = self.parent.len();
        self.parent.push(i);
        self.rank.push(0);
        self.index.insert(address, i);
        i
    }

    fn find_mut(&mut self, mut i: usize) -> usize {
        // Path compression: point every node on the walk at the root.
        let mut root = i;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        while self.parent[i] != root {
            let next = self.parent[i];
            self.parent[i] = root;
            i = next;
        }
        root
    }

    fn find(&self, mut i: usize) -> usize {
        while self.parent[i] != i {
            i = self.parent[i];
        }
        i
    }

    /// Relate two chunks. Creates a new group if both are new, extends an
    /// existing group if one is known, merges two groups otherwise.
    pub fn add(&mut self, a: Address, b: Address) {
        let ia = self.intern(a);
        let ib = self.intern(b);
        let ra = self.find_mut(ia);
        let rb = self.find_mut(ib);
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }

    /// Enumerate the groups. Members within a group are sorted by address
    /// and groups are ordered by their smallest member, so enumeration is
    /// deterministic regardless of insertion order.
    pub fn groups(&self) -> Vec<Vec<Address>> {
        let mut by_root: HashMap<usize, Vec<Address>> = HashMap::new();
        for (&address, &i) in &self.index {
            by_root.entry(self.find(i)).or_default().push(address);
        }
        let mut groups: Vec<Vec<Address>> = by_root.into_values().collect();
        for group in &mut groups {
            group.sort();
        }
        groups.sort_by_key(|g| g[0]);
        groups
    }
}
