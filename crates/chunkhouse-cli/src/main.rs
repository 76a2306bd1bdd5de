//! ChunkHouse CLI (chunkctl)
//!
//! Command-line tool for archiving and administering ChunkHouse block
//! stores.
//!
//! ## Commands
//!
//! ```bash
//! # Rewrite every classic container as a dictionary-compressed archive
//! chunkctl archive
//!
//! # Same, deleting the classic files after each successful swap
//! chunkctl archive --purge
//!
//! # Inverse: rewrite archives back to classic table files
//! chunkctl unarchive
//!
//! # Replace one container spec with another in the manifest
//! chunkctl admin compare-and-swap-storage --from <addr> --to <addr>
//!
//! # Diff the chunk sets of two containers (classic or archive)
//! chunkctl admin debug-compare <addr1> <addr2>
//! ```
//!
//! The repository root defaults to the current directory and can be set
//! with `--repo` or `CHUNKHOUSE_REPO`. Containers live under `.dolt/noms`
//! (new generation) and `.dolt/noms/oldgen` (old generation).
//!
//! Progress events stream to stdout; warnings and log output go to stderr.
//! Exit code is 0 on success and 1 on any failure.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod progress;

use commands::admin;
use commands::archive;

#[derive(Parser)]
#[command(name = "chunkctl")]
#[command(about = "ChunkHouse storage tool", long_about = None)]
struct Cli {
    /// Repository root (the directory containing .dolt)
    #[arg(short, long, env = "CHUNKHOUSE_REPO", default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive every classic container in the block store
    Archive {
        /// Delete source table files after a successful swap
        #[arg(long)]
        purge: bool,
        /// Optional relations file: one "addr addr" pair per line, seeding
        /// the chunk grouping heuristic from a tree-diff walk
        #[arg(long)]
        relations: Option<PathBuf>,
    },
    /// Convert archives back to classic table files
    Unarchive,
    /// Administrative commands
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Replace one container spec with another in the manifest
    CompareAndSwapStorage {
        /// Address of the container to replace
        #[arg(long)]
        from: String,
        /// Address of the replacement container
        #[arg(long)]
        to: String,
    },
    /// Compare the chunk sets of two containers
    DebugCompare {
        /// First container address
        addr1: String,
        /// Second container address
        addr2: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Archive { purge, relations } => {
            archive::run_archive(&cli.repo, purge, relations.as_deref()).await
        }
        Commands::Unarchive => archive::run_unarchive(&cli.repo).await,
        Commands::Admin { command } => match command {
            AdminCommands::CompareAndSwapStorage { from, to } => {
                admin::compare_and_swap_storage(&cli.repo, &from, &to).await
            }
            AdminCommands::DebugCompare { addr1, addr2 } => {
                admin::debug_compare(&cli.repo, &addr1, &addr2)
            }
        },
    }
}
