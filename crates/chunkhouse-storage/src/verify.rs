//! Archive Verification
//!
//! After an archive is flushed, every chunk the source container indexed is
//! read back from it and hash-checked before the manifest swap. The hash
//! list is shuffled first: reading in a fresh random order exposes bugs
//! that an index-order sweep would mask (span bookkeeping that only works
//! sequentially, dictionary wiring keyed to arrival order). Any failure is
//! fatal — the archive never reaches the manifest.

use std::path::Path;

use chunkhouse_core::{Address, BuildProgress};
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::archive::ArchiveReader;
use crate::build::send_progress;
use crate::error::{Result, StorageError};

const STAGE_VERIFY: &str = "Verifying Chunks";

/// Re-open the archive at `path` and verify every expected chunk is
/// present, non-nil, and hashes to its address.
pub async fn verify_archive(
    path: &Path,
    expected: &[Address],
    progress: &mpsc::Sender<BuildProgress>,
    cancel: &CancellationToken,
) -> Result<()> {
    let reader = ArchiveReader::open(path)
        .map_err(|e| StorageError::Verification(format!("failed to reopen archive: {}", e)))?;

    let mut hashes: Vec<Address> = expected.to_vec();
    hashes.shuffle(&mut rand::thread_rng());

    let total = hashes.len() as u32;
    let mut completed = 0u32;

    for address in hashes {
        if cancel.is_cancelled() {
            return Err(StorageError::cancelled());
        }
        if !reader.has(address) {
            return Err(StorageError::Verification(format!(
                "chunk not found in archive: {}",
                address
            )));
        }
        match reader.get_verified(address) {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(StorageError::Verification(format!(
                    "nil data returned from archive for expected chunk: {}",
                    address
                )));
            }
            Err(e) => {
                return Err(StorageError::Verification(format!(
                    "error reading chunk {}: {}",
                    address, e
                )));
            }
        }
        completed += 1;
        send_progress(
            progress,
            BuildProgress::stage(STAGE_VERIFY, total, completed),
            cancel,
        )
        .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveWriter;
    use tempfile::TempDir;

    fn drain() -> (mpsc::Sender<BuildProgress>, mpsc::Receiver<BuildProgress>) {
        mpsc::channel(1024)
    }

    fn write_archive(dir: &Path, bodies: &[&[u8]]) -> (std::path::PathBuf, Vec<Address>) {
        let mut w = ArchiveWriter::stage_in(dir).unwrap();
        let mut addrs = Vec::new();
        for body in bodies {
            let compressed = zstd::bulk::compress(body, 3).unwrap();
            let span = w.write_byte_span(&compressed).unwrap();
            let addr = Address::of(body);
            w.stage_chunk(addr, 0, span).unwrap();
            addrs.push(addr);
        }
        w.finalize_byte_spans().unwrap();
        w.write_index().unwrap();
        w.write_metadata(b"{}").unwrap();
        w.write_footer().unwrap();
        let path = w.gen_file_name(dir).unwrap();
        w.flush_to_file(&path).unwrap();
        (path, addrs)
    }

    #[tokio::test]
    async fn test_verify_passes_on_good_archive() {
        let dir = TempDir::new().unwrap();
        let (path, addrs) = write_archive(dir.path(), &[b"a", b"b", b"c"]);
        let (tx, mut rx) = drain();
        let cancel = CancellationToken::new();
        verify_archive(&path, &addrs, &tx, &cancel).await.unwrap();
        drop(tx);

        let mut stage_events = 0;
        while let Some(msg) = rx.recv().await {
            if matches!(msg, BuildProgress::Stage { .. }) {
                stage_events += 1;
            }
        }
        assert_eq!(stage_events, 3);
    }

    #[tokio::test]
    async fn test_verify_fails_on_missing_chunk() {
        let dir = TempDir::new().unwrap();
        let (path, mut addrs) = write_archive(dir.path(), &[b"a", b"b"]);
        addrs.push(Address::of(b"never written"));
        let (tx, _rx) = drain();
        let cancel = CancellationToken::new();
        let err = verify_archive(&path, &addrs, &tx, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Verification(_)));
    }

    #[tokio::test]
    async fn test_verify_respects_cancellation() {
        let dir = TempDir::new().unwrap();
        let (path, addrs) = write_archive(dir.path(), &[b"a", b"b", b"c"]);
        let (tx, _rx) = drain();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = verify_archive(&path, &addrs, &tx, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Cancelled(_)));
    }
}
