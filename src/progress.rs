//! Ingestion progress reporting.
//!
//! The pipeline reports `{current, total}` after each persisted chunk
//! through a [`ProgressSink`]. Background jobs forward the counters to
//! their polled status; the CLI prints them on stderr so stdout stays
//! parseable for scripts.

use std::io::Write;

use crate::jobs::ProgressHandle;

/// Receives chunk-level progress from the ingestion pipeline.
pub trait ProgressSink: Send + Sync {
    fn report(&self, current: u64, total: u64);
}

/// No-op sink when progress is not observed.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _current: u64, _total: u64) {}
}

/// Human-friendly progress on stderr: "ingest  2 / 5 chunks".
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn report(&self, current: u64, total: u64) {
        let line = format!("ingest  {} / {} chunks\n", current, total);
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Background jobs surface pipeline progress through their status slot.
impl ProgressSink for ProgressHandle {
    fn report(&self, current: u64, total: u64) {
        self.update(current, total);
    }
}
