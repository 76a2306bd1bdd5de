//! Un-Archiver
//!
//! The inverse conversion: every archive container in the store is rewritten
//! as a classic table file — each chunk compressed on its own, no shared
//! dictionaries — then swapped into the manifest and the `.darc` purged.
//! Classic containers and the journal sentinel are skipped. A failed purge
//! after a successful swap is reported as a warning, not an error.

use chunkhouse_core::BuildProgress;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::build::send_progress;
use crate::error::{Result, StorageError};
use crate::manifest::TableSpec;
use crate::source::ContainerHandle;
use crate::store::{BlockStore, GcMode, GenerationalBlockStore};
use crate::table::TableWriter;

/// Convert every archive in both generations back to classic table files.
pub async fn unarchive(
    store: &GenerationalBlockStore,
    progress: mpsc::Sender<BuildProgress>,
    cancel: CancellationToken,
) -> Result<()> {
    for gen in store.generations() {
        unarchive_block_store(gen, &progress, &cancel).await?;
    }
    Ok(())
}

/// Convert every archive in one block store back to a classic table file.
pub async fn unarchive_block_store(
    store: &BlockStore,
    progress: &mpsc::Sender<BuildProgress>,
    cancel: &CancellationToken,
) -> Result<()> {
    let specs = store.specs()?;

    for spec in specs {
        if spec.name.is_journal() {
            continue;
        }
        if cancel.is_cancelled() {
            return Err(StorageError::cancelled());
        }

        let handle = store.open_container(spec.name)?.ok_or_else(|| {
            StorageError::SourceRead(format!("container {} missing from store", spec.name))
        })?;
        let archive = match handle {
            ContainerHandle::Archive(a) => a,
            ContainerHandle::Table(_) => continue,
        };

        send_progress(
            progress,
            BuildProgress::info(format!("Un-archiving {}", spec.name)),
            cancel,
        )
        .await?;

        let mut table = TableWriter::stage_in(store.path())?;
        archive.iterate(|chunk| {
            if cancel.is_cancelled() {
                return Err(StorageError::cancelled());
            }
            table.add_chunk(&chunk)?;
            Ok(())
        })?;

        let name = table.finish()?;
        let chunk_count = table.chunk_count();
        let path = table.gen_file_name(store.path())?;
        table.flush_to_file(&path)?;

        store
            .swap_tables(spec.name, TableSpec { name, chunk_count }, GcMode::Default)
            .await?;

        let purge_path = ContainerHandle::archive_path(store.path(), spec.name);
        if let Err(e) = std::fs::remove_file(&purge_path) {
            send_progress(
                progress,
                BuildProgress::warning(format!(
                    "Failed to purge {}: {}",
                    purge_path.display(),
                    e
                )),
                cancel,
            )
            .await?;
        }

        info!(
            archive = %spec.name,
            table = %name,
            chunks = chunk_count,
            "un-archived container"
        );
    }

    Ok(())
}
