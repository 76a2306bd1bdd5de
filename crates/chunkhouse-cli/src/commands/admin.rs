//! Admin Commands
//!
//! Manifest surgery and container diffing. Both commands auto-detect the
//! container format by file presence (`<addr>` classic, `<addr>.darc`
//! archive) and search the old generation before the new one.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chunkhouse_core::Address;
use chunkhouse_storage::{
    BlockStore, ChunkSource, ContainerHandle, GcMode, GenerationalBlockStore, TableSpec,
};

fn parse_address(s: &str, what: &str) -> Result<Address> {
    Address::parse(s).with_context(|| format!("invalid {} address: {}", what, s))
}

/// Search order for containers: old generation first, then new.
fn search_dirs(store: &GenerationalBlockStore) -> [&BlockStore; 2] {
    [store.old_gen(), store.new_gen()]
}

/// Replace the manifest spec for `from` with `to`, provided both container
/// files are present in the same generation directory.
pub async fn compare_and_swap_storage(repo: &Path, from: &str, to: &str) -> Result<()> {
    let from = parse_address(from, "from")?;
    let to = parse_address(to, "to")?;

    let store = GenerationalBlockStore::open(repo)
        .with_context(|| format!("failed to open block store under {}", repo.display()))?;

    for gen in search_dirs(&store) {
        let from_present = gen.open_container(from)?.is_some();
        let to_handle = gen.open_container(to)?;
        let (Some(to_handle), true) = (to_handle, from_present) else {
            continue;
        };
        if !gen.specs()?.iter().any(|s| s.name == from) {
            bail!("container {} is on disk but not in the manifest", from);
        }

        let chunk_count = to_handle.count();
        gen.swap_tables(
            from,
            TableSpec {
                name: to,
                chunk_count,
            },
            GcMode::Default,
        )
        .await
        .context("manifest swap failed")?;

        println!(
            "Swapped {} -> {} ({} chunks) in {}",
            from,
            to,
            chunk_count,
            gen.path().display()
        );
        return Ok(());
    }

    bail!("containers {} and {} not found together in any generation", from, to)
}

fn load_container(
    store: &GenerationalBlockStore,
    address: Address,
) -> Result<(ContainerHandle, String)> {
    for gen in search_dirs(store) {
        if let Some(handle) = gen.open_container(address)? {
            let dir = gen.path().display().to_string();
            return Ok((handle, dir));
        }
    }
    bail!("no container file found for {}", address)
}

fn collect_hashes(handle: &ContainerHandle) -> Result<HashSet<Address>> {
    let mut hashes = HashSet::with_capacity(handle.count() as usize);
    handle
        .iterate(&mut |chunk| {
            hashes.insert(chunk.address());
            Ok(())
        })
        .context("failed to iterate container")?;
    Ok(hashes)
}

fn print_sample(label: &str, only: &[Address]) {
    if only.is_empty() {
        return;
    }
    println!("\nSample chunks only in {}:", label);
    for addr in only.iter().take(5) {
        println!("  {}", addr);
    }
    if only.len() > 5 {
        println!("  ... and {} more", only.len() - 5);
    }
}

/// Load two containers, iterate every chunk in each, and report the
/// hash-set difference and counts.
pub fn debug_compare(repo: &Path, addr1: &str, addr2: &str) -> Result<()> {
    let a1 = parse_address(addr1, "first")?;
    let a2 = parse_address(addr2, "second")?;

    let store = GenerationalBlockStore::open(repo)
        .with_context(|| format!("failed to open block store under {}", repo.display()))?;

    let (h1, dir1) = load_container(&store, a1)?;
    let (h2, dir2) = load_container(&store, a2)?;
    println!(
        "Loaded {} file for {} with {} chunks from {}",
        h1.format_name(),
        a1,
        h1.count(),
        dir1
    );
    println!(
        "Loaded {} file for {} with {} chunks from {}",
        h2.format_name(),
        a2,
        h2.count(),
        dir2
    );

    let hashes1 = collect_hashes(&h1)?;
    let hashes2 = collect_hashes(&h2)?;

    let mut only_in_1: Vec<Address> = hashes1.difference(&hashes2).copied().collect();
    let mut only_in_2: Vec<Address> = hashes2.difference(&hashes1).copied().collect();
    only_in_1.sort();
    only_in_2.sort();
    let common = hashes1.intersection(&hashes2).count();

    println!("\nHash comparison results:");
    println!("  Common chunks: {}", common);
    println!("  Only in {}: {}", a1, only_in_1.len());
    println!("  Only in {}: {}", a2, only_in_2.len());

    print_sample(&a1.to_string(), &only_in_1);
    print_sample(&a2.to_string(), &only_in_2);

    if only_in_1.is_empty() && only_in_2.is_empty() {
        println!("\nAll chunks match between the two containers.");
    }

    Ok(())
}
