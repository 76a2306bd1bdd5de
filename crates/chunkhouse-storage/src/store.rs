//! Block Stores
//!
//! A [`BlockStore`] is one directory of container files plus its manifest.
//! A [`GenerationalBlockStore`] is the pair the repository actually runs
//! on: `.dolt/noms` (new generation) and `.dolt/noms/oldgen` (old
//! generation). The archive engine is defined over the generational layout
//! only; opening anything else fails with `GenerationalStoreExpected`.
//!
//! The only mutation a block store performs here is the **swap**: replacing
//! one container's spec with another in the manifest. Container files are
//! written and verified first, the manifest is updated second, and the
//! obsolete file is (optionally) removed last — so a crash at any point
//! leaves either the old view or the new view, never a broken one. An
//! orphaned container file is reclaimed by the next GC.

use std::path::{Path, PathBuf};

use chunkhouse_core::Address;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::manifest::{CasResult, Manifest, TableSpec};
use crate::source::ContainerHandle;

/// GC coordination mode for manifest swaps. Archival always runs in
/// `Default`; swaps during a collection are owned by the GC machinery and
/// refused here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    Default,
    GarbageCollection,
}

/// How many CAS attempts a swap makes before giving up.
const SWAP_RETRIES: usize = 16;

/// One directory of containers plus its manifest.
pub struct BlockStore {
    dir: PathBuf,
    manifest: Manifest,
    /// Serializes swaps from concurrent builds in this process; the
    /// manifest version CAS covers everything else.
    swap_lock: Mutex<()>,
}

impl BlockStore {
    /// Open an existing block store directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(StorageError::SourceRead(format!(
                "block store directory not found: {}",
                dir.display()
            )));
        }
        let manifest = Manifest::new(&dir);
        Ok(Self {
            dir,
            manifest,
            swap_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Current manifest specs.
    pub fn specs(&self) -> Result<Vec<TableSpec>> {
        Ok(self.manifest.load()?.specs)
    }

    /// Open the container a spec points at, auto-detecting its format.
    pub fn open_container(&self, address: Address) -> Result<Option<ContainerHandle>> {
        ContainerHandle::open(&self.dir, address)
    }

    /// Register a new container spec in the manifest (append). Used when
    /// populating a store; the commit machinery does this in production.
    pub async fn register_container(&self, spec: TableSpec) -> Result<()> {
        let _guard = self.swap_lock.lock().await;
        for _ in 0..SWAP_RETRIES {
            let current = self.manifest.load()?;
            let mut specs = current.specs.clone();
            specs.push(spec);
            match self.manifest.try_update(current.version, specs)? {
                CasResult::Committed(_) => return Ok(()),
                CasResult::Conflict(_) => continue,
            }
        }
        Err(StorageError::SwapFailed(
            "manifest contention while registering container".to_string(),
        ))
    }

    /// Replace the spec for `old` with `new_spec`, leaving all other specs
    /// intact. Retries the CAS until it wins or the retry budget runs out.
    pub async fn swap_tables(
        &self,
        old: Address,
        new_spec: TableSpec,
        mode: GcMode,
    ) -> Result<()> {
        if mode != GcMode::Default {
            return Err(StorageError::UnsupportedGcMode);
        }

        let _guard = self.swap_lock.lock().await;
        for attempt in 0..SWAP_RETRIES {
            let current = self.manifest.load()?;
            if !current.specs.iter().any(|s| s.name == old) {
                return Err(StorageError::SwapFailed(format!(
                    "no manifest spec for container {}",
                    old
                )));
            }
            let specs: Vec<TableSpec> = current
                .specs
                .iter()
                .map(|s| if s.name == old { new_spec } else { *s })
                .collect();
            match self.manifest.try_update(current.version, specs)? {
                CasResult::Committed(next) => {
                    debug!(
                        old = %old,
                        new = %new_spec.name,
                        version = next.version,
                        "swapped container spec"
                    );
                    return Ok(());
                }
                CasResult::Conflict(_) => {
                    debug!(attempt, old = %old, "manifest CAS conflict, retrying");
                }
            }
        }
        Err(StorageError::SwapFailed(format!(
            "manifest contention while swapping {}",
            old
        )))
    }
}

/// The new-gen / old-gen pair the repository stores chunks in.
pub struct GenerationalBlockStore {
    new_gen: BlockStore,
    old_gen: BlockStore,
}

impl GenerationalBlockStore {
    /// Open the generational store under a repository root. The layout must
    /// contain both `.dolt/noms` and `.dolt/noms/oldgen`.
    pub fn open(repo_root: &Path) -> Result<Self> {
        let noms = repo_root.join(".dolt").join("noms");
        let oldgen = noms.join("oldgen");
        if !noms.is_dir() || !oldgen.is_dir() {
            return Err(StorageError::GenerationalStoreExpected);
        }
        Ok(Self {
            new_gen: BlockStore::open(noms)?,
            old_gen: BlockStore::open(oldgen)?,
        })
    }

    /// Create the generational layout (used by fixtures and repo init).
    pub fn create(repo_root: &Path) -> Result<Self> {
        let noms = repo_root.join(".dolt").join("noms");
        std::fs::create_dir_all(noms.join("oldgen")).map_err(chunkhouse_core::Error::Io)?;
        Self::open(repo_root)
    }

    pub fn new_gen(&self) -> &BlockStore {
        &self.new_gen
    }

    pub fn old_gen(&self) -> &BlockStore {
        &self.old_gen
    }

    /// Both generations, new-gen first — the order archival walks them.
    pub fn generations(&self) -> [&BlockStore; 2] {
        [&self.new_gen, &self.old_gen]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(n: u8, count: u32) -> TableSpec {
        TableSpec {
            name: Address::of(&[n]),
            chunk_count: count,
        }
    }

    #[test]
    fn test_open_missing_dir_fails() {
        let dir = TempDir::new().unwrap();
        assert!(BlockStore::open(dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_generational_layout_required() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            GenerationalBlockStore::open(dir.path()),
            Err(StorageError::GenerationalStoreExpected)
        ));
        // Only the new-gen dir is not enough.
        std::fs::create_dir_all(dir.path().join(".dolt").join("noms")).unwrap();
        assert!(matches!(
            GenerationalBlockStore::open(dir.path()),
            Err(StorageError::GenerationalStoreExpected)
        ));
    }

    #[test]
    fn test_create_then_open() {
        let dir = TempDir::new().unwrap();
        GenerationalBlockStore::create(dir.path()).unwrap();
        let store = GenerationalBlockStore::open(dir.path()).unwrap();
        assert!(store.new_gen().path().ends_with("noms"));
        assert!(store.old_gen().path().ends_with("oldgen"));
    }

    #[tokio::test]
    async fn test_register_and_swap() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        store.register_container(spec(1, 100)).await.unwrap();
        store.register_container(spec(2, 200)).await.unwrap();

        store
            .swap_tables(spec(1, 100).name, spec(3, 90), GcMode::Default)
            .await
            .unwrap();

        let specs = store.specs().unwrap();
        assert_eq!(specs, vec![spec(3, 90), spec(2, 200)]);
    }

    #[tokio::test]
    async fn test_swap_unknown_container_fails() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        store.register_container(spec(1, 1)).await.unwrap();
        let err = store
            .swap_tables(Address::of(b"stranger"), spec(2, 2), GcMode::Default)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SwapFailed(_)));
    }

    #[tokio::test]
    async fn test_swap_refuses_gc_mode() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        store.register_container(spec(1, 1)).await.unwrap();
        let err = store
            .swap_tables(spec(1, 1).name, spec(2, 2), GcMode::GarbageCollection)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedGcMode));
    }

    #[tokio::test]
    async fn test_swap_preserves_other_specs_and_order() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        for i in 1..=5u8 {
            store.register_container(spec(i, i as u32)).await.unwrap();
        }
        store
            .swap_tables(spec(3, 3).name, spec(9, 33), GcMode::Default)
            .await
            .unwrap();
        let specs = store.specs().unwrap();
        assert_eq!(
            specs,
            vec![spec(1, 1), spec(2, 2), spec(9, 33), spec(4, 4), spec(5, 5)]
        );
    }
}
