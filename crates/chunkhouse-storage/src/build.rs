//! Archive Build Pipeline
//!
//! Converts classic table files into dictionary-compressed archives. For
//! each classic container in each generation:
//!
//! 1. **Sample & cache** — read the first `min(count, 1000)` chunks as
//!    default-dictionary samples and stand up the chunk cache.
//! 2. **Default dictionary** — train it, or skip the container with
//!    `NotEnoughChunks` when the source is too small to bother.
//! 3. **Group construction** — build a [`ChunkGroup`] for every relation
//!    set of size > 1, on a small worker pool.
//! 4. **Default-dict span** — the compressed default dictionary is span 1.
//! 5. **Materialize groups** — best savings first; each group that pays
//!    rent writes its dictionary and its members' compressed bodies.
//! 6. **Ungrouped pass** — a pool of compression workers drains the
//!    remaining chunks through the default dictionary; a single drain task
//!    assigns span ids.
//! 7. **Finalize** — index, metadata, footer, atomic move into place.
//! 8. **Verify** — every chunk read back and hash-checked.
//! 9. **Swap** — the manifest spec flips from the classic file to the
//!    archive; the classic file is purged only if requested.
//!
//! ## Determinism
//!
//! The archive's address is a digest over its index, so two builds of the
//! same source with the same relations must lay spans out identically.
//! Groups are ordered by savings (ties by smallest member address), chunks
//! within a group by score, and the ungrouped pass dispatches work in
//! sorted-hash order with the drain re-sequencing results back into
//! dispatch order before assigning span ids. Worker scheduling therefore
//! never leaks into the file layout.
//!
//! ## Cancellation
//!
//! The shared [`CancellationToken`] is observed at every channel operation
//! and progress send. A cancelled build abandons its temp file; nothing
//! appears at a final path.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use chunkhouse_core::{Address, BuildProgress};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::archive::ArchiveWriter;
use crate::cache::ChunkCache;
use crate::config::BuildConfig;
use crate::dictionary::{self, TrainedDictionary};
use crate::error::{Result, StorageError};
use crate::group::ChunkGroup;
use crate::manifest::TableSpec;
use crate::relations::ChunkRelations;
use crate::source::{ChunkSource, ContainerHandle};
use crate::store::{BlockStore, GcMode, GenerationalBlockStore};
use crate::verify;

const STAGE_GROUP_DICTS: &str = "Building Chunk Group Dictionaries";
const STAGE_GROUPING_SKIPPED: &str = "Chunk Grouping Skipped";
const STAGE_MATERIALIZE: &str = "Materializing Chunk Groups";
const STAGE_UNGROUPED: &str = "Writing Ungrouped Chunks";

/// Metadata keys embedded in every archive.
pub const META_WRITER_VERSION: &str = "writer_version";
pub const META_CONVERTED_AT: &str = "converted_at";
pub const META_ORIGIN_TABLE_FILE: &str = "origin_table_file";

/// Result of converting one container.
pub struct BuiltArchive {
    pub path: PathBuf,
    pub name: Address,
    pub chunk_count: u32,
    /// Duplicate chunks dropped from the source during conversion.
    pub dedup_count: u32,
}

/// Send a progress event, honoring cancellation and tolerating a consumer
/// that has gone away.
pub(crate) async fn send_progress(
    progress: &mpsc::Sender<BuildProgress>,
    msg: BuildProgress,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StorageError::cancelled()),
        res = progress.send(msg) => {
            // A dropped receiver is not the build's problem.
            let _ = res;
            Ok(())
        }
    }
}

/// Archive every classic container in both generations of the store.
pub async fn build_archive(
    store: &GenerationalBlockStore,
    relations: &ChunkRelations,
    config: &BuildConfig,
    purge: bool,
    progress: mpsc::Sender<BuildProgress>,
    cancel: CancellationToken,
) -> Result<()> {
    for gen in store.generations() {
        archive_block_store(gen, relations, config, purge, &progress, &cancel).await?;
    }
    Ok(())
}

/// Archive every classic container in one block store.
pub async fn archive_block_store(
    store: &BlockStore,
    relations: &ChunkRelations,
    config: &BuildConfig,
    purge: bool,
    progress: &mpsc::Sender<BuildProgress>,
    cancel: &CancellationToken,
) -> Result<()> {
    // Snapshot the spec list; swaps mutate the manifest as we go, but the
    // container names we iterate stay meaningful.
    let specs = store.specs()?;

    for spec in specs {
        if spec.name.is_journal() {
            continue;
        }
        let handle = store.open_container(spec.name)?.ok_or_else(|| {
            StorageError::SourceRead(format!("container {} missing from store", spec.name))
        })?;
        if handle.is_archive() {
            continue;
        }

        send_progress(
            progress,
            BuildProgress::info(format!("Archiving table file {}", spec.name)),
            cancel,
        )
        .await?;

        let table_path = ContainerHandle::table_path(store.path(), spec.name);
        let original_size = std::fs::metadata(&table_path)
            .map_err(chunkhouse_core::Error::Io)?
            .len();

        let source: Arc<dyn ChunkSource> = match handle {
            ContainerHandle::Table(t) => Arc::new(t),
            ContainerHandle::Archive(_) => unreachable!("archives are skipped above"),
        };

        let built = match convert_container(
            source.clone(),
            relations,
            store.path(),
            config,
            progress,
            cancel,
        )
        .await
        {
            Ok(built) => built,
            Err(StorageError::NotEnoughChunks) => {
                send_progress(
                    progress,
                    BuildProgress::info(format!(
                        "Not enough chunks to build archive for {}. Skipping.",
                        spec.name
                    )),
                    cancel,
                )
                .await?;
                continue;
            }
            Err(e) => return Err(e),
        };

        if let Err(e) =
            verify::verify_archive(&built.path, &source.addresses(), progress, cancel).await
        {
            // A bad archive never reaches the manifest.
            let _ = std::fs::remove_file(&built.path);
            return Err(e);
        }

        let archive_size = std::fs::metadata(&built.path)
            .map_err(chunkhouse_core::Error::Io)?
            .len();
        let reduction = -100.0 * (archive_size as f64 / original_size as f64 - 1.0);
        send_progress(
            progress,
            BuildProgress::info(format!(
                "Archived {} ({} -> {} bytes, {:.2}% reduction)",
                built.name, original_size, archive_size, reduction
            )),
            cancel,
        )
        .await?;

        store
            .swap_tables(
                spec.name,
                TableSpec {
                    name: built.name,
                    chunk_count: built.chunk_count,
                },
                GcMode::Default,
            )
            .await?;

        if purge {
            if let Err(e) = std::fs::remove_file(&table_path) {
                send_progress(
                    progress,
                    BuildProgress::warning(format!(
                        "Failed to purge {}: {}",
                        table_path.display(),
                        e
                    )),
                    cancel,
                )
                .await?;
            }
        }

        info!(
            container = %spec.name,
            archive = %built.name,
            chunks = built.chunk_count,
            "archived container"
        );
    }

    Ok(())
}

/// Convert one chunk source into an archive file in `dir`. Returns the
/// flushed archive's path, name, and counts; the caller verifies and swaps.
pub async fn convert_container(
    source: Arc<dyn ChunkSource>,
    relations: &ChunkRelations,
    dir: &std::path::Path,
    config: &BuildConfig,
    progress: &mpsc::Sender<BuildProgress>,
    cancel: &CancellationToken,
) -> Result<BuiltArchive> {
    // Sample & cache. Samples are the first N chunks in index order.
    let index_addresses = source.addresses();
    let source_count = index_addresses.len() as u32;
    if source_count < config.min_chunks {
        return Err(StorageError::NotEnoughChunks);
    }

    let cache = Arc::new(ChunkCache::new(source, config.cache_capacity));
    let sample_count = source_count.min(config.max_default_samples) as usize;
    let mut samples = Vec::with_capacity(sample_count);
    for address in index_addresses.iter().take(sample_count) {
        if cancel.is_cancelled() {
            return Err(StorageError::cancelled());
        }
        let bytes = cache.get(*address).await?.ok_or_else(|| {
            StorageError::SourceRead(format!("indexed chunk {} missing from source", address))
        })?;
        samples.push(bytes);
    }

    let default_dict = Arc::new(dictionary::train(&samples)?);
    drop(samples);

    let groups = build_chunk_groups(&cache, relations, &default_dict, config, progress, cancel)
        .await?;

    let mut writer = ArchiveWriter::stage_in(dir)?;
    let default_span = writer.write_byte_span(&default_dict.compressed()?)?;

    // Materialize groups, best savings first. Chunks landed here leave the
    // ungrouped set; abandoned groups leave theirs in it.
    let mut ungrouped: BTreeSet<Address> = index_addresses.iter().copied().collect();
    let mut grouped_count = 0u32;
    let total_groups = groups.len() as u32;
    let mut groups_completed = 0u32;

    for group in &groups {
        if cancel.is_cancelled() {
            return Err(StorageError::cancelled());
        }
        if group.pays_rent() {
            let dict_span = writer.write_byte_span(&group.dictionary().compressed()?)?;
            for score in &group.scores {
                let bytes = cache.get(score.address).await?.ok_or_else(|| {
                    StorageError::SourceRead(format!(
                        "grouped chunk {} missing from source",
                        score.address
                    ))
                })?;
                if !writer.chunk_seen(score.address) {
                    let compressed = group.dictionary().compress(&bytes)?;
                    let data_span = writer.write_byte_span(&compressed)?;
                    writer.stage_chunk(score.address, dict_span, data_span)?;
                    grouped_count += 1;
                }
                ungrouped.remove(&score.address);
            }
        }
        groups_completed += 1;
        send_progress(
            progress,
            BuildProgress::stage(STAGE_MATERIALIZE, total_groups, groups_completed),
            cancel,
        )
        .await?;
    }

    let ungrouped: Vec<Address> = ungrouped.into_iter().collect();
    let singles = compress_ungrouped(
        cache.clone(),
        ungrouped,
        &mut writer,
        default_dict,
        default_span,
        config,
        progress,
        cancel,
    )
    .await?;

    writer.finalize_byte_spans()?;
    writer.write_index()?;

    let mut metadata = BTreeMap::new();
    metadata.insert(META_WRITER_VERSION, config.writer_version.clone());
    metadata.insert(META_CONVERTED_AT, config.conversion_time());
    let origin = cache.source_address();
    if !origin.is_empty() {
        metadata.insert(META_ORIGIN_TABLE_FILE, origin.to_string());
    }
    let metadata_bytes = serde_json::to_vec(&metadata).map_err(|e| {
        chunkhouse_core::Error::InvalidContainer(format!("metadata encode: {}", e))
    })?;
    writer.write_metadata(&metadata_bytes)?;
    writer.write_footer()?;

    let name = writer.name()?;
    let path = writer.gen_file_name(dir)?;
    let chunk_count = writer.chunk_count();
    writer.flush_to_file(&path)?;

    // Sources can list the same chunk more than once; the archive stores it
    // once, so the counts diverge by the number of duplicates.
    debug_assert_eq!(chunk_count, grouped_count + singles);
    let dedup_count = source_count - chunk_count;
    if dedup_count > 0 {
        send_progress(
            progress,
            BuildProgress::info(format!(
                "Chunk count mismatch. Duplicate chunks: {}",
                dedup_count
            )),
            cancel,
        )
        .await?;
    }

    debug!(
        archive = %name,
        grouped = grouped_count,
        singles,
        dedup = dedup_count,
        "converted container"
    );

    Ok(BuiltArchive {
        path,
        name,
        chunk_count,
        dedup_count,
    })
}

/// Build a scored [`ChunkGroup`] for every relation set with more than one
/// member, then order them by savings (descending, ties by smallest member
/// address) for materialization.
async fn build_chunk_groups(
    cache: &Arc<ChunkCache>,
    relations: &ChunkRelations,
    default_dict: &Arc<TrainedDictionary>,
    config: &BuildConfig,
    progress: &mpsc::Sender<BuildProgress>,
    cancel: &CancellationToken,
) -> Result<Vec<ChunkGroup>> {
    let member_sets: Vec<Vec<Address>> = relations
        .groups()
        .into_iter()
        .filter(|g| g.len() > 1)
        .collect();

    if member_sets.is_empty() {
        send_progress(
            progress,
            BuildProgress::stage(STAGE_GROUPING_SKIPPED, 0, 0),
            cancel,
        )
        .await?;
        return Ok(Vec::new());
    }

    let total = member_sets.len() as u32;
    let mut completed = 0u32;
    let mut groups = Vec::with_capacity(member_sets.len());

    let mut stream = futures::stream::iter(member_sets.into_iter().map(|members| {
        let cache = cache.clone();
        let default_dict = default_dict.clone();
        async move { ChunkGroup::build(&cache, &members, &default_dict).await }
    }))
    .buffer_unordered(config.group_workers.max(1));

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(StorageError::cancelled()),
            next = stream.next() => next,
        };
        let Some(result) = next else { break };
        completed += 1;
        // Relation sets whose members are all absent from this container
        // produce no group.
        if let Some(group) = result? {
            groups.push(group);
        }
        send_progress(
            progress,
            BuildProgress::stage(STAGE_GROUP_DICTS, total, completed),
            cancel,
        )
        .await?;
    }

    groups.sort_by(|a, b| {
        b.total_bytes_saved_group_dict
            .cmp(&a.total_bytes_saved_group_dict)
            .then_with(|| a.min_address().cmp(&b.min_address()))
    });
    Ok(groups)
}

/// Compress the remaining chunks with the default dictionary on a fixed
/// worker pool. Work is dispatched in sorted-hash order; the drain
/// re-sequences results by dispatch order before assigning span ids, so the
/// payload layout is independent of worker scheduling.
#[allow(clippy::too_many_arguments)]
async fn compress_ungrouped(
    cache: Arc<ChunkCache>,
    addresses: Vec<Address>,
    writer: &mut ArchiveWriter,
    default_dict: Arc<TrainedDictionary>,
    default_span: u32,
    config: &BuildConfig,
    progress: &mpsc::Sender<BuildProgress>,
    cancel: &CancellationToken,
) -> Result<u32> {
    let total = addresses.len() as u32;
    if total == 0 {
        return Ok(0);
    }
    let workers = config.compression_workers.max(1);

    let (work_tx, work_rx) = mpsc::channel::<(u64, Address)>(workers);
    let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<(u64, Address, Vec<u8>)>(workers);

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    // Distribution task.
    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            for (seq, address) in addresses.into_iter().enumerate() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(StorageError::cancelled()),
                    sent = work_tx.send((seq as u64, address)) => {
                        if sent.is_err() {
                            // Workers are gone; their error surfaces at join.
                            return Ok(());
                        }
                    }
                }
            }
            Ok(())
        });
    }

    // Compression workers.
    for _ in 0..workers {
        let work_rx = work_rx.clone();
        let result_tx = result_tx.clone();
        let cache = cache.clone();
        let default_dict = default_dict.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            loop {
                let item = {
                    let mut rx = work_rx.lock().await;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(StorageError::cancelled()),
                        item = rx.recv() => item,
                    }
                };
                let Some((seq, address)) = item else {
                    return Ok(());
                };
                let bytes = cache.get(address).await?.ok_or_else(|| {
                    StorageError::SourceRead(format!(
                        "ungrouped chunk {} missing from source",
                        address
                    ))
                })?;
                let compressed = default_dict.compress(&bytes)?;
                tokio::select! {
                    _ = cancel.cancelled() => return Err(StorageError::cancelled()),
                    sent = result_tx.send((seq, address, compressed)) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        });
    }
    // Drop this scope's handles: the work receiver must die with the
    // workers (so an erroring pool unblocks the distributor) and the
    // result channel must close when the last worker exits.
    drop(work_rx);
    drop(result_tx);

    // Single drain: the only writer during the parallel pass. Results are
    // buffered until their dispatch order comes up; the buffer stays small
    // because the bounded channels cap how far ahead any worker can run.
    let mut pending: BTreeMap<u64, (Address, Vec<u8>)> = BTreeMap::new();
    let mut next_seq = 0u64;
    let mut completed = 0u32;
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => {
                tasks.abort_all();
                return Err(StorageError::cancelled());
            }
            item = result_rx.recv() => item,
        };
        let Some((seq, address, compressed)) = item else {
            break;
        };
        pending.insert(seq, (address, compressed));
        while let Some((address, compressed)) = pending.remove(&next_seq) {
            let data_span = writer.write_byte_span(&compressed)?;
            writer.stage_chunk(address, default_span, data_span)?;
            next_seq += 1;
            completed += 1;
            send_progress(
                progress,
                BuildProgress::stage(STAGE_UNGROUPED, total, completed),
                cancel,
            )
            .await?;
        }
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => {
                return Err(StorageError::SourceRead(format!(
                    "compression worker failed: {}",
                    e
                )))
            }
        }
    }

    if completed != total {
        return Err(StorageError::SourceRead(format!(
            "ungrouped pass wrote {} of {} chunks",
            completed, total
        )));
    }
    Ok(total)
}
