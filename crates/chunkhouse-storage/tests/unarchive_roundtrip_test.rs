//! Un-Archive Round-Trip Tests
//!
//! Archive a populated store, un-archive the result, and check that the
//! chunk set survives both conversions intact — plus the swap and purge
//! bookkeeping on the way.

use std::collections::HashSet;

use bytes::Bytes;
use chunkhouse_core::{Address, BuildProgress, Chunk};
use chunkhouse_storage::source::ChunkSource;
use chunkhouse_storage::table::TableWriter;
use chunkhouse_storage::{
    build_archive, unarchive, BuildConfig, ChunkRelations, ContainerHandle,
    GenerationalBlockStore, TableSpec,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

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

/// Ten near-identical template variants plus unique filler, the S2 shape.
fn mixed_bodies() -> Vec<Bytes> {
    let template: Vec<u8> = b"orders ledger row: account, sku, quantity, unit price, \
                              currency, settled flag, region tag; "
        .repeat(48);
    let mut bodies: Vec<Bytes> = (0..10)
        .map(|i| {
            let mut body = template.clone();
            let tag = format!("variant {:04} ", i);
            body[..tag.len()].copy_from_slice(tag.as_bytes());
            body.truncate(4096);
            Bytes::from(body)
        })
        .collect();
    let mut rng = StdRng::seed_from_u64(7);
    bodies.extend((0..90).map(|_| {
        let mut body = vec![0u8; 4096];
        rng.fill_bytes(&mut body);
        Bytes::from(body)
    }));
    bodies
}

async fn populate_new_gen(store: &GenerationalBlockStore, bodies: &[Bytes]) -> Address {
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
    name
}

fn chunk_set(store: &GenerationalBlockStore, spec: TableSpec) -> HashSet<Address> {
    let handle = store
        .new_gen()
        .open_container(spec.name)
        .unwrap()
        .unwrap();
    let mut set = HashSet::new();
    handle
        .iterate(&mut |chunk| {
            set.insert(chunk.address());
            Ok(())
        })
        .unwrap();
    set
}

#[tokio::test]
async fn test_archive_then_unarchive_preserves_chunk_set() {
    let root = TempDir::new().unwrap();
    let store = GenerationalBlockStore::create(root.path()).unwrap();
    let bodies = mixed_bodies();
    populate_new_gen(&store, &bodies).await;
    let original: HashSet<Address> = bodies.iter().map(|b| Address::of(b)).collect();

    let mut relations = ChunkRelations::new();
    for pair in bodies[..10].windows(2) {
        relations.add(Address::of(&pair[0]), Address::of(&pair[1]));
    }

    // Archive with purge so only the archive remains.
    let (tx, collector) = progress_collector();
    build_archive(
        &store,
        &relations,
        &test_config(),
        true,
        tx,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    collector.await.unwrap();

    let archive_spec = store.new_gen().specs().unwrap()[0];
    let archive_path = ContainerHandle::archive_path(store.new_gen().path(), archive_spec.name);
    assert!(archive_path.is_file());
    assert_eq!(chunk_set(&store, archive_spec), original);

    // Un-archive: back to a classic container with the same chunk set.
    let (tx, collector) = progress_collector();
    unarchive(&store, tx, CancellationToken::new()).await.unwrap();
    collector.await.unwrap();

    let table_spec = store.new_gen().specs().unwrap()[0];
    assert_ne!(table_spec.name, archive_spec.name);
    let handle = store
        .new_gen()
        .open_container(table_spec.name)
        .unwrap()
        .unwrap();
    assert!(!handle.is_archive());
    assert_eq!(table_spec.chunk_count, 100);
    assert_eq!(chunk_set(&store, table_spec), original);

    // The .darc was purged after its swap.
    assert!(!archive_path.is_file());
}

#[tokio::test]
async fn test_unarchive_skips_classic_containers() {
    let root = TempDir::new().unwrap();
    let store = GenerationalBlockStore::create(root.path()).unwrap();
    let bodies = mixed_bodies();
    let name = populate_new_gen(&store, &bodies).await;
    let specs_before = store.new_gen().specs().unwrap();

    let (tx, collector) = progress_collector();
    unarchive(&store, tx, CancellationToken::new()).await.unwrap();
    collector.await.unwrap();

    // Nothing to convert: manifest and file layout untouched.
    assert_eq!(store.new_gen().specs().unwrap(), specs_before);
    assert!(ContainerHandle::table_path(store.new_gen().path(), name).is_file());
}

#[tokio::test]
async fn test_unarchive_cancellation() {
    let root = TempDir::new().unwrap();
    let store = GenerationalBlockStore::create(root.path()).unwrap();
    populate_new_gen(&store, &mixed_bodies()).await;

    let (tx, collector) = progress_collector();
    build_archive(
        &store,
        &ChunkRelations::new(),
        &test_config(),
        true,
        tx,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    collector.await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let (tx, collector) = progress_collector();
    let result = unarchive(&store, tx, cancel).await;
    collector.await.unwrap();
    assert!(result.is_err());

    // The archive spec is still in place; the cancelled conversion left
    // nothing half-swapped.
    let spec = store.new_gen().specs().unwrap()[0];
    assert!(ContainerHandle::archive_path(store.new_gen().path(), spec.name).is_file());
}

#[tokio::test]
async fn test_both_generations_are_archived() {
    let root = TempDir::new().unwrap();
    let store = GenerationalBlockStore::create(root.path()).unwrap();

    // Populate the old generation too.
    let bodies = mixed_bodies();
    populate_new_gen(&store, &bodies).await;

    let old_dir = store.old_gen().path().to_path_buf();
    let mut writer = TableWriter::stage_in(&old_dir).unwrap();
    let old_bodies: Vec<Bytes> = bodies.iter().rev().cloned().collect();
    for body in &old_bodies[..40] {
        writer.add_chunk(&Chunk::new(body.clone())).unwrap();
    }
    let old_name = writer.finish().unwrap();
    let old_count = writer.chunk_count();
    let path = writer.gen_file_name(&old_dir).unwrap();
    writer.flush_to_file(&path).unwrap();
    store
        .old_gen()
        .register_container(TableSpec {
            name: old_name,
            chunk_count: old_count,
        })
        .await
        .unwrap();

    let (tx, collector) = progress_collector();
    build_archive(
        &store,
        &ChunkRelations::new(),
        &test_config(),
        false,
        tx,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    collector.await.unwrap();

    for gen in store.generations() {
        let spec = gen.specs().unwrap()[0];
        let handle = gen.open_container(spec.name).unwrap().unwrap();
        assert!(handle.is_archive(), "{} should hold an archive", gen.path().display());
    }
}
