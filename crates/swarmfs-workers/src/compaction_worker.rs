//! Periodic compaction of the configured memory segments.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use swarmfs_core::{Config, StopSignal};
use swarmfs_storage::{CompactionOutcome, MemoryCompactor};
use tracing::{info, warn};

use crate::worker::{WorkerHandle, spawn_periodic};

/// Totals for one pass over every segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionSummary {
    pub segments: usize,
    pub compacted: usize,
    pub entries_removed: usize,
    pub missing: usize,
    pub skipped_malformed: usize,
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct CompactionWorker {
    compactor: MemoryCompactor,
    segments: Vec<PathBuf>,
    interval: Duration,
}

impl CompactionWorker {
    #[must_use]
    pub const fn new(compactor: MemoryCompactor, segments: Vec<PathBuf>, interval: Duration) -> Self {
        Self {
            compactor,
            segments,
            interval,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            MemoryCompactor::from_config(config),
            config.compaction_segments.clone(),
            config.compaction_interval,
        )
    }

    #[must_use]
    pub fn segments(&self) -> &[PathBuf] {
        &self.segments
    }

    /// Compact every segment once. A failing segment does not stop the rest.
    pub fn run_once(&self) -> CompactionSummary {
        let mut summary = CompactionSummary {
            segments: self.segments.len(),
            ..CompactionSummary::default()
        };
        for path in &self.segments {
            match self.compactor.compact(path) {
                Ok(outcome @ CompactionOutcome::Compacted { .. }) => {
                    let removed = outcome.removed();
                    if removed > 0 {
                        summary.compacted += 1;
                        summary.entries_removed += removed;
                    }
                }
                Ok(CompactionOutcome::NotTriggered) => {}
                Ok(CompactionOutcome::Missing) => summary.missing += 1,
                Ok(CompactionOutcome::SkippedMalformed) => summary.skipped_malformed += 1,
                Err(e) => {
                    summary.errors += 1;
                    warn!(path = %path.display(), error = %e, "segment compaction failed");
                }
            }
        }
        if summary.compacted > 0 || summary.errors > 0 {
            info!(
                event = "compaction_cycle",
                segments = summary.segments,
                compacted = summary.compacted,
                entries_removed = summary.entries_removed,
                errors = summary.errors,
                "compaction cycle completed"
            );
        }
        summary
    }

    /// Run [`run_once`](Self::run_once) every interval until `stop` is raised.
    pub fn spawn(self, stop: StopSignal) -> io::Result<WorkerHandle> {
        let interval = self.interval;
        spawn_periodic("memory-compactor", interval, stop, move || {
            self.run_once();
        })
    }
}
