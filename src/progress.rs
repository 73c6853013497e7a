//! Phase tracking, progress reporting and cooperative abort.
//!
//! A run advances through a fixed sequence of [`Phase`]s. Before each phase
//! the orchestrator checks the [`AbortSignal`] and reports a percentage and a
//! log line through a [`Reporter`]. A front end can poll those from another
//! thread; nothing here is shared mutable state beyond the abort flag.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::layout::PartitionRole;

/// A step of an extract or repack run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    CopyBase,
    Attach,
    Resolve(PartitionRole),
    Replace(PartitionRole),
    Extract(PartitionRole),
    Sync,
    Release,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::CopyBase => f.write_str("copy base image"),
            Phase::Attach => f.write_str("attach image"),
            Phase::Resolve(role) => write!(f, "resolve {role}"),
            Phase::Replace(role) => write!(f, "replace {role}"),
            Phase::Extract(role) => write!(f, "extract {role}"),
            Phase::Sync => f.write_str("sync"),
            Phase::Release => f.write_str("release"),
        }
    }
}

/// Receives progress from a running operation.
pub trait Reporter {
    /// Overall completion, 0-100.
    fn progress(&self, percent: u8);

    /// A human-readable log line.
    fn log(&self, line: &str);

    /// A non-fatal problem (e.g. an optional subtree is missing).
    fn warn(&self, line: &str) {
        self.log(&format!("WARNING: {line}"));
    }
}

/// Reporter that forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn progress(&self, percent: u8) {
        tracing::debug!(percent, "progress");
    }

    fn log(&self, line: &str) {
        tracing::info!("{line}");
    }

    fn warn(&self, line: &str) {
        tracing::warn!("{line}");
    }
}

/// Shared flag a front end sets to stop a run at the next step boundary.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an abort. Safe to call from a signal handler.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
