//! Build Progress Events
//!
//! Long-running storage operations (archival, un-archival, verification)
//! report progress over a bounded `tokio::sync::mpsc` channel. The payload
//! is a typed enum rather than free-form values so consumers can render
//! stage counters, informational lines, and warnings differently — and so
//! tests can assert on exactly what was emitted.

use serde::Serialize;

/// A progress event from a storage build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BuildProgress {
    /// Counter update for a named pipeline stage.
    Stage {
        name: String,
        total: u32,
        completed: u32,
    },
    /// Informational message (normal operation).
    Info(String),
    /// Non-fatal problem the operator should see.
    Warning(String),
}

impl BuildProgress {
    pub fn stage(name: impl Into<String>, total: u32, completed: u32) -> Self {
        BuildProgress::Stage {
            name: name.into(),
            total,
            completed,
        }
    }

    pub fn info(msg: impl Into<String>) -> Self {
        BuildProgress::Info(msg.into())
    }

    pub fn warning(msg: impl Into<String>) -> Self {
        BuildProgress::Warning(msg.into())
    }
}
