//! Archive Pipeline Integration Tests
//!
//! End-to-end scenarios over real block store directories: minimum viable
//! archival, grouping that pays and grouping that doesn't, duplicate
//! handling, cancellation, determinism, and the not-enough-chunks skip.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chunkhouse_core::{Address, BuildProgress, Chunk};
use chunkhouse_storage::source::ChunkSource;
use chunkhouse_storage::table::TableWriter;
use chunkhouse_storage::{
    build_archive, convert_container, BuildConfig, ChunkRelations, ContainerHandle,
    GenerationalBlockStore, StorageError, TableSpec,
};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------

/// Pinned config: fixed clock and version so archive addresses are
/// reproducible, small worker counts so tests stay light.
fn test_config() -> BuildConfig {
    BuildConfig {
        writer_version: "test-0.1.0".to_string(),
        conversion_time: Some("2024-06-01T00:00:00Z".to_string()),
        compression_workers: 4,
        group_workers: 2,
        cache_capacity: 10_000,
        ..Default::default()
    }
}

/// Progress channel with a spawned collector, so bounded sends from the
/// engine never block on the test body.
fn progress_collector() -> (
    mpsc::Sender<BuildProgress>,
    JoinHandle<Vec<BuildProgress>>,
) {
    let (tx, mut rx) = mpsc::channel(64);
    let handle = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });
    (tx, handle)
}

/// Chunks that share loose structure, so the default dictionary has
/// something to learn. `seed` varies the noise.
fn structured_chunks(count: usize, seed: u64) -> Vec<Bytes> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let mut body = Vec::with_capacity(4096);
            while body.len() < 4096 {
                body.extend_from_slice(
                    format!(
                        "row={:08} status={} region=us-east-{} payload={:016x}\n",
                        i,
                        if rng.gen_bool(0.5) { "active" } else { "closed" },
                        rng.gen_range(1..4),
                        rng.next_u64()
                    )
                    .as_bytes(),
                );
            }
            body.truncate(4096);
            Bytes::from(body)
        })
        .collect()
}

/// Ten structural variants of one template, ~95% identical bodies.
fn templated_variants(count: usize) -> Vec<Bytes> {
    let template: Vec<u8> = b"schema widgets v2: id bigint, name varchar(255), price \
                              decimal(10,2), stock int, vendor varchar(64); "
        .repeat(60);
    (0..count)
        .map(|i| {
            let mut body = template.clone();
            let tag = format!("variant {:04} ", i);
            // Overwrite a small slice so each variant differs slightly.
            body[..tag.len()].copy_from_slice(tag.as_bytes());
            body.truncate(4096);
            Bytes::from(body)
        })
        .collect()
}

fn incompressible_chunks(count: usize, seed: u64) -> Vec<Bytes> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let mut body = vec![0u8; 4096];
            rng.fill_bytes(&mut body);
            Bytes::from(body)
        })
        .collect()
}

/// Write the bodies into a classic table file in the store's new-gen
/// directory and register it in the manifest.
async fn populate_new_gen(
    store: &GenerationalBlockStore,
    bodies: &[Bytes],
) -> (Address, u32) {
    let dir = store.new_gen().path().to_path_buf();
    let mut writer = TableWriter::stage_in(&dir).unwrap();
    for body in bodies {
        writer.add_chunk(&Chunk::new(body.clone())).unwrap();
    }
    let name = writer.finish().unwrap();
    let count = writer.chunk_count();
    let path = writer.gen_file_name(&dir).unwrap();
    writer.flush_to_file(&path).unwrap();
    store
        .new_gen()
        .register_container(TableSpec {
            name,
            chunk_count: count,
        })
        .await
        .unwrap();
    (name, count)
}

/// The single archive spec in the new generation, if any.
fn archived_spec(store: &GenerationalBlockStore) -> Option<TableSpec> {
    store
        .new_gen()
        .specs()
        .unwrap()
        .into_iter()
        .find(|s| {
            ContainerHandle::archive_path(store.new_gen().path(), s.name).is_file()
        })
}

fn darc_files(dir: &Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| {
            let path = e.unwrap().path();
            (path.extension().map(|x| x == "darc")).unwrap_or(false).then_some(path)
        })
        .collect()
}

async fn run_build(
    store: &GenerationalBlockStore,
    relations: &ChunkRelations,
    purge: bool,
) -> (Result<(), StorageError>, Vec<BuildProgress>) {
    let (tx, collector) = progress_collector();
    let result = build_archive(
        store,
        relations,
        &test_config(),
        purge,
        tx,
        CancellationToken::new(),
    )
    .await;
    (result, collector.await.unwrap())
}

// ---------------------------------------------------------------
// S1: minimum viable archive
// ---------------------------------------------------------------

#[tokio::test]
async fn test_minimum_viable_archive() {
    let root = TempDir::new().unwrap();
    let store = GenerationalBlockStore::create(root.path()).unwrap();
    let bodies = structured_chunks(30, 11);
    let (source_name, _) = populate_new_gen(&store, &bodies).await;
    let source_size = std::fs::metadata(
        ContainerHandle::table_path(store.new_gen().path(), source_name),
    )
    .unwrap()
    .len();

    let (result, _) = run_build(&store, &ChunkRelations::new(), false).await;
    result.unwrap();

    let spec = archived_spec(&store).expect("an archive spec should be in the manifest");
    let archive_path = ContainerHandle::archive_path(store.new_gen().path(), spec.name);
    let archive_size = std::fs::metadata(&archive_path).unwrap().len();
    assert!(
        archive_size < source_size,
        "archive ({archive_size}) should be smaller than source ({source_size})"
    );

    // Round trip: every source chunk must read back with a matching hash.
    let handle = store.new_gen().open_container(spec.name).unwrap().unwrap();
    assert_eq!(handle.count(), 30);
    for body in &bodies {
        let addr = Address::of(body);
        let got = handle.get(addr).unwrap().unwrap();
        assert_eq!(got, *body);
    }

    // Source file not purged without --purge.
    assert!(ContainerHandle::table_path(store.new_gen().path(), source_name).is_file());
}

// ---------------------------------------------------------------
// S2: grouping pays
// ---------------------------------------------------------------

#[tokio::test]
async fn test_grouping_pays_rent() {
    let root = TempDir::new().unwrap();
    let store = GenerationalBlockStore::create(root.path()).unwrap();

    let mut bodies = templated_variants(10);
    bodies.extend(incompressible_chunks(90, 22));
    populate_new_gen(&store, &bodies).await;

    let mut relations = ChunkRelations::new();
    for pair in bodies[..10].windows(2) {
        relations.add(Address::of(&pair[0]), Address::of(&pair[1]));
    }

    let (result, events) = run_build(&store, &relations, false).await;
    result.unwrap();

    // Exactly one relation set, so the materialize stage totals one group.
    assert!(events.iter().any(|e| matches!(
        e,
        BuildProgress::Stage { name, total: 1, .. } if name == "Materializing Chunk Groups"
    )));

    let spec = archived_spec(&store).unwrap();
    assert_eq!(spec.chunk_count, 100);
    let handle = store.new_gen().open_container(spec.name).unwrap().unwrap();
    assert_eq!(handle.count(), 100);
    for body in &bodies {
        assert!(handle.has(Address::of(body)));
    }
}

#[tokio::test]
async fn test_grouping_beats_no_grouping_on_size() {
    let bodies = {
        let mut b = templated_variants(10);
        b.extend(incompressible_chunks(90, 22));
        b
    };

    let build = |with_relations: bool| {
        let bodies = bodies.clone();
        async move {
            let root = TempDir::new().unwrap();
            let store = GenerationalBlockStore::create(root.path()).unwrap();
            populate_new_gen(&store, &bodies).await;
            let mut relations = ChunkRelations::new();
            if with_relations {
                for pair in bodies[..10].windows(2) {
                    relations.add(Address::of(&pair[0]), Address::of(&pair[1]));
                }
            }
            let (result, _) = run_build(&store, &relations, false).await;
            result.unwrap();
            let spec = archived_spec(&store).unwrap();
            let path = ContainerHandle::archive_path(store.new_gen().path(), spec.name);
            std::fs::metadata(path).unwrap().len()
        }
    };

    let grouped_size = build(true).await;
    let ungrouped_size = build(false).await;
    assert!(
        grouped_size < ungrouped_size,
        "grouped archive ({grouped_size}) should beat ungrouped ({ungrouped_size})"
    );
}

// ---------------------------------------------------------------
// S3: grouping doesn't pay
// ---------------------------------------------------------------

#[tokio::test]
async fn test_unprofitable_group_is_abandoned() {
    let bodies = incompressible_chunks(100, 33);

    let build = |with_relations: bool| {
        let bodies = bodies.clone();
        async move {
            let root = TempDir::new().unwrap();
            let store = GenerationalBlockStore::create(root.path()).unwrap();
            populate_new_gen(&store, &bodies).await;
            let mut relations = ChunkRelations::new();
            if with_relations {
                relations.add(Address::of(&bodies[0]), Address::of(&bodies[1]));
                relations.add(Address::of(&bodies[1]), Address::of(&bodies[2]));
            }
            let (result, _) = run_build(&store, &relations, false).await;
            result.unwrap();
            archived_spec(&store).unwrap()
        }
    };

    let with_group = build(true).await;
    let without_group = build(false).await;

    // A group of random chunks can't out-save the default dictionary, so
    // nothing group-related reaches the file: the two builds are
    // byte-identical and share an address.
    assert_eq!(with_group.chunk_count, 100);
    assert_eq!(with_group.name, without_group.name);
}

// ---------------------------------------------------------------
// S4: duplicate chunks
// ---------------------------------------------------------------

/// A chunk source whose index lists one address twice, the way some legacy
/// table files do.
struct DuplicatingSource {
    chunks: Vec<(Address, Bytes)>,
}

impl ChunkSource for DuplicatingSource {
    fn address(&self) -> Address {
        Address::of(b"duplicating source")
    }
    fn count(&self) -> u32 {
        self.chunks.len() as u32
    }
    fn has(&self, address: Address) -> bool {
        self.chunks.iter().any(|(a, _)| *a == address)
    }
    fn get(&self, address: Address) -> chunkhouse_storage::Result<Option<Bytes>> {
        Ok(self
            .chunks
            .iter()
            .find(|(a, _)| *a == address)
            .map(|(_, b)| b.clone()))
    }
    fn addresses(&self) -> Vec<Address> {
        self.chunks.iter().map(|(a, _)| *a).collect()
    }
    fn iterate(
        &self,
        cb: &mut dyn FnMut(Chunk) -> chunkhouse_storage::Result<()>,
    ) -> chunkhouse_storage::Result<()> {
        for (addr, bytes) in &self.chunks {
            cb(Chunk::with_address(*addr, bytes.clone()))?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_duplicate_chunks_deduped() {
    let out = TempDir::new().unwrap();
    let bodies = structured_chunks(30, 44);
    let mut chunks: Vec<(Address, Bytes)> = bodies
        .iter()
        .map(|b| (Address::of(b), b.clone()))
        .collect();
    // The same chunk listed twice.
    chunks.push(chunks[0].clone());
    let source = Arc::new(DuplicatingSource { chunks });

    let (tx, collector) = progress_collector();
    let built = convert_container(
        source,
        &ChunkRelations::new(),
        out.path(),
        &test_config(),
        &tx,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    drop(tx);
    let events = collector.await.unwrap();

    assert_eq!(built.chunk_count, 30, "archive stores unique chunks only");
    assert_eq!(built.dedup_count, 1);
    assert!(events.iter().any(|e| matches!(
        e,
        BuildProgress::Info(msg) if msg.contains("Duplicate chunks: 1")
    )));
}

// ---------------------------------------------------------------
// S5 / property 7: cancellation
// ---------------------------------------------------------------

/// Wraps a source with a per-get delay so a build reliably outlives the
/// test's cancellation window.
struct SlowSource {
    inner: DuplicatingSource,
    delay: std::time::Duration,
}

impl ChunkSource for SlowSource {
    fn address(&self) -> Address {
        self.inner.address()
    }
    fn count(&self) -> u32 {
        self.inner.count()
    }
    fn has(&self, address: Address) -> bool {
        self.inner.has(address)
    }
    fn get(&self, address: Address) -> chunkhouse_storage::Result<Option<Bytes>> {
        std::thread::sleep(self.delay);
        self.inner.get(address)
    }
    fn addresses(&self) -> Vec<Address> {
        self.inner.addresses()
    }
    fn iterate(
        &self,
        cb: &mut dyn FnMut(Chunk) -> chunkhouse_storage::Result<()>,
    ) -> chunkhouse_storage::Result<()> {
        self.inner.iterate(cb)
    }
}

#[tokio::test]
async fn test_cancellation_leaves_no_archive() {
    let out = TempDir::new().unwrap();
    let bodies = structured_chunks(10_000, 55);
    let chunks: Vec<(Address, Bytes)> =
        bodies.iter().map(|b| (Address::of(b), b.clone())).collect();
    let source = Arc::new(SlowSource {
        inner: DuplicatingSource { chunks },
        delay: std::time::Duration::from_millis(1),
    });

    let (tx, collector) = progress_collector();
    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            cancel.cancel();
        })
    };

    let started = std::time::Instant::now();
    let result = convert_container(
        source,
        &ChunkRelations::new(),
        out.path(),
        &test_config(),
        &tx,
        &cancel,
    )
    .await;
    drop(tx);
    canceller.await.unwrap();
    collector.await.unwrap();

    assert!(matches!(result, Err(StorageError::Cancelled(_))));
    assert!(
        started.elapsed() < std::time::Duration::from_secs(10),
        "cancellation must terminate the build promptly"
    );
    assert!(
        darc_files(out.path()).is_empty(),
        "no archive may appear at a final path after cancellation"
    );
}

// ---------------------------------------------------------------
// Property 4: deterministic address
// ---------------------------------------------------------------

#[tokio::test]
async fn test_deterministic_archive_address() {
    let bodies = {
        let mut b = templated_variants(10);
        b.extend(structured_chunks(90, 66));
        b
    };

    let build = || {
        let bodies = bodies.clone();
        async move {
            let root = TempDir::new().unwrap();
            let store = GenerationalBlockStore::create(root.path()).unwrap();
            populate_new_gen(&store, &bodies).await;
            let mut relations = ChunkRelations::new();
            for pair in bodies[..10].windows(2) {
                relations.add(Address::of(&pair[0]), Address::of(&pair[1]));
            }
            let (result, _) = run_build(&store, &relations, false).await;
            result.unwrap();
            archived_spec(&store).unwrap().name
        }
    };

    // Same source, same relations, pinned clock and version: the worker
    // pools must not leak scheduling into the file layout.
    assert_eq!(build().await, build().await);
}

// ---------------------------------------------------------------
// Property 2: dedup-preserving counts, purge behavior
// ---------------------------------------------------------------

#[tokio::test]
async fn test_purge_removes_source_after_swap() {
    let root = TempDir::new().unwrap();
    let store = GenerationalBlockStore::create(root.path()).unwrap();
    let bodies = structured_chunks(40, 77);
    let (source_name, _) = populate_new_gen(&store, &bodies).await;

    let (result, _) = run_build(&store, &ChunkRelations::new(), true).await;
    result.unwrap();

    assert!(
        !ContainerHandle::table_path(store.new_gen().path(), source_name).is_file(),
        "--purge removes the classic file after a successful swap"
    );
    let spec = archived_spec(&store).unwrap();
    assert_eq!(spec.chunk_count, 40);
}

// ---------------------------------------------------------------
// Property 8: not enough chunks
// ---------------------------------------------------------------

#[tokio::test]
async fn test_small_container_skipped_with_diagnostic() {
    let root = TempDir::new().unwrap();
    let store = GenerationalBlockStore::create(root.path()).unwrap();
    let bodies = structured_chunks(10, 88);
    let (source_name, _) = populate_new_gen(&store, &bodies).await;
    let specs_before = store.new_gen().specs().unwrap();

    let (result, events) = run_build(&store, &ChunkRelations::new(), false).await;
    // Skipping is not an error.
    result.unwrap();

    assert!(events.iter().any(|e| matches!(
        e,
        BuildProgress::Info(msg) if msg.contains("Not enough chunks")
    )));
    assert_eq!(store.new_gen().specs().unwrap(), specs_before);
    assert!(ContainerHandle::table_path(store.new_gen().path(), source_name).is_file());
    assert!(darc_files(store.new_gen().path()).is_empty());
}

// ---------------------------------------------------------------
// Property 5: swap atomicity under a simulated crash
// ---------------------------------------------------------------

#[tokio::test]
async fn test_crash_before_swap_leaves_manifest_unchanged() {
    let root = TempDir::new().unwrap();
    let store = GenerationalBlockStore::create(root.path()).unwrap();
    let bodies = structured_chunks(30, 99);
    let (source_name, _) = populate_new_gen(&store, &bodies).await;
    let specs_before = store.new_gen().specs().unwrap();

    // Simulate the crash window: the archive is fully written and flushed,
    // but the process dies before the manifest swap.
    let handle = store
        .new_gen()
        .open_container(source_name)
        .unwrap()
        .unwrap();
    let source: Arc<dyn ChunkSource> = match handle {
        ContainerHandle::Table(t) => Arc::new(t),
        ContainerHandle::Archive(_) => unreachable!(),
    };
    let (tx, collector) = progress_collector();
    let built = convert_container(
        source,
        &ChunkRelations::new(),
        store.new_gen().path(),
        &test_config(),
        &tx,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    drop(tx);
    collector.await.unwrap();
    assert!(built.path.is_file());

    // Reopen the store: the manifest still names the classic container and
    // nothing references the orphan archive.
    let reopened = GenerationalBlockStore::open(root.path()).unwrap();
    let specs = reopened.new_gen().specs().unwrap();
    assert_eq!(specs, specs_before);
    assert!(specs.iter().all(|s| s.name != built.name));
    let handle = reopened
        .new_gen()
        .open_container(source_name)
        .unwrap()
        .unwrap();
    assert!(!handle.is_archive());

    // The orphan is GC fodder, not manifest state.
    assert_eq!(darc_files(reopened.new_gen().path()).len(), 1);
}

// ---------------------------------------------------------------
// Journal container is never archived
// ---------------------------------------------------------------

#[tokio::test]
async fn test_journal_spec_skipped() {
    let root = TempDir::new().unwrap();
    let store = GenerationalBlockStore::create(root.path()).unwrap();
    store
        .new_gen()
        .register_container(TableSpec {
            name: Address::JOURNAL,
            chunk_count: 0,
        })
        .await
        .unwrap();

    // No container file exists for the journal sentinel; the build must
    // skip it rather than fail on the missing file.
    let (result, _) = run_build(&store, &ChunkRelations::new(), false).await;
    result.unwrap();
}

// ---------------------------------------------------------------
// Round trip across every chunk (property 1, larger source)
// ---------------------------------------------------------------

#[tokio::test]
async fn test_round_trip_all_chunks() {
    let root = TempDir::new().unwrap();
    let store = GenerationalBlockStore::create(root.path()).unwrap();
    let bodies = structured_chunks(500, 123);
    populate_new_gen(&store, &bodies).await;

    let (result, _) = run_build(&store, &ChunkRelations::new(), false).await;
    result.unwrap();

    let spec = archived_spec(&store).unwrap();
    let handle = store.new_gen().open_container(spec.name).unwrap().unwrap();
    let mut expected: HashSet<Address> = bodies.iter().map(|b| Address::of(b)).collect();
    handle
        .iterate(&mut |chunk| {
            assert_eq!(Address::of(chunk.data()), chunk.address());
            assert!(expected.remove(&chunk.address()));
            Ok(())
        })
        .unwrap();
    assert!(expected.is_empty(), "every source chunk appears in the archive");
}
