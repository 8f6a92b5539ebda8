//! Filesystem coordination primitives for swarmfs
//!
//! This crate provides:
//! - Cross-process advisory file locks with bounded wait (`FileLock`)
//! - Atomic read/modify/write of JSON documents (`DocumentStore`)
//! - Directory-based mailboxes with exactly-once claiming (`Mailbox`)
//! - The shared task ledger (`TaskLedger`)
//! - The agent registry and swarm state table (`AgentRegistry`, `SwarmStateSync`)
//! - Segment compaction (`MemoryCompactor`)
//!
//! Correctness never depends on in-process synchronization: every shared
//! document is guarded by its companion lock file, so the same guarantees
//! hold across threads and across processes.

#![forbid(unsafe_code)]

pub mod compactor;
pub mod document;
pub mod ledger;
pub mod lock;
pub mod mailbox;
pub mod registry;
pub mod swarm_state;

pub use compactor::{CompactionConfig, CompactionOutcome, MemoryCompactor};
pub use document::{DocumentStore, atomic_write_bytes, write_json_unlocked};
pub use ledger::{
    ClaimFilter, ESCALATION_TAG, ReassignOutcome, STALLED_TASK_TAG, Staleness, TaskLedger,
    staleness,
};
pub use lock::{FileLock, LockGuard, LockOptions, lock_path_for, with_lock};
pub use mailbox::{
    Mailbox, MessageState, PollStats, QueueDirs, claim, list_messages, poll_and_process,
    process_pending, refresh_claim,
};
pub use registry::AgentRegistry;
pub use swarm_state::{AgentStateUpdate, SwarmStateSync, SwarmSyncOptions};

pub use swarmfs_core::{Error, Result};
