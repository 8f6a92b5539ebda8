//! Background maintenance workers for swarmfs
//!
//! - `StallMonitor`: periodic stall detection over the task ledger
//! - `CompactionWorker`: periodic compaction of memory segments
//!
//! Workers run on dedicated OS threads and stop through a shared
//! [`StopSignal`](swarmfs_core::StopSignal); there is no global worker state.

#![forbid(unsafe_code)]

pub mod compaction_worker;
pub mod stall_monitor;
pub mod worker;

pub use compaction_worker::{CompactionSummary, CompactionWorker};
pub use stall_monitor::{StallMonitor, StallMonitorConfig, SweepReport};
pub use worker::{WorkerHandle, spawn_periodic};
