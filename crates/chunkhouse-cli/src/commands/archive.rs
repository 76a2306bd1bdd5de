//! Archive / Un-archive Commands
//!
//! Opens the generational block store under the repository root, wires up
//! the progress printer and a ctrl-c cancellation token, and drives the
//! storage engine. Chunk relations are seeded from an optional pairs file;
//! with no file the build still archives everything through the default
//! dictionary.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chunkhouse_core::Address;
use chunkhouse_storage::{
    build_archive, unarchive, BuildConfig, ChunkRelations, GenerationalBlockStore,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::progress::spawn_printer;

/// Parse a relations file: one whitespace-separated address pair per line.
/// Blank lines and `#` comments are ignored.
fn load_relations(path: &Path) -> Result<ChunkRelations> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read relations file {}", path.display()))?;
    let mut relations = ChunkRelations::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(a), Some(b), None) = (parts.next(), parts.next(), parts.next()) else {
            bail!(
                "{}:{}: expected two addresses per line",
                path.display(),
                line_no + 1
            );
        };
        let a = Address::parse(a)
            .with_context(|| format!("{}:{}: invalid address", path.display(), line_no + 1))?;
        let b = Address::parse(b)
            .with_context(|| format!("{}:{}: invalid address", path.display(), line_no + 1))?;
        relations.add(a, b);
    }
    Ok(relations)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let child = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            child.cancel();
        }
    });
    cancel
}

pub async fn run_archive(repo: &Path, purge: bool, relations: Option<&Path>) -> Result<()> {
    let store = GenerationalBlockStore::open(repo)
        .with_context(|| format!("failed to open block store under {}", repo.display()))?;

    let relations = match relations {
        Some(path) => load_relations(path)?,
        None => ChunkRelations::new(),
    };

    let (tx, rx) = mpsc::channel(256);
    let printer = spawn_printer(rx);
    let cancel = cancel_on_ctrl_c();

    let result = build_archive(
        &store,
        &relations,
        &BuildConfig::default(),
        purge,
        tx,
        cancel,
    )
    .await;

    let _ = printer.await;
    result.context("archive failed")
}

pub async fn run_unarchive(repo: &Path) -> Result<()> {
    let store = GenerationalBlockStore::open(repo)
        .with_context(|| format!("failed to open block store under {}", repo.display()))?;

    let (tx, rx) = mpsc::channel(256);
    let printer = spawn_printer(rx);
    let cancel = cancel_on_ctrl_c();

    let result = unarchive(&store, tx, cancel).await;

    let _ = printer.await;
    result.context("unarchive failed")
}
