//! Progress Rendering
//!
//! The storage engine streams [`BuildProgress`] events over a bounded
//! channel; this module owns the single consumer. Stage counters overwrite
//! one line on stdout, informational lines get their own row, and warnings
//! go to stderr. Keeping the consumer on a dedicated task means the
//! engine's bounded sends never deadlock against terminal IO.

use std::io::Write;

use chunkhouse_core::BuildProgress;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Spawn the progress printer. The handle resolves when the channel closes.
pub fn spawn_printer(mut rx: mpsc::Receiver<BuildProgress>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut on_stage_line = false;
        let mut last_stage = String::new();
        while let Some(event) = rx.recv().await {
            match event {
                BuildProgress::Stage {
                    name,
                    total,
                    completed,
                } => {
                    if name != last_stage && on_stage_line {
                        println!();
                    }
                    print!("\r{}: {}/{}", name, completed, total);
                    let _ = std::io::stdout().flush();
                    on_stage_line = true;
                    last_stage = name;
                }
                BuildProgress::Info(msg) => {
                    if on_stage_line {
                        println!();
                        on_stage_line = false;
                    }
                    println!("{}", msg);
                }
                BuildProgress::Warning(msg) => {
                    if on_stage_line {
                        println!();
                        on_stage_line = false;
                    }
                    eprintln!("warning: {}", msg);
                }
            }
        }
        if on_stage_line {
            println!();
        }
    })
}
