//! Stall detection for the task ledger.
//!
//! A sweep reads one snapshot of the ledger, picks out active tasks that
//! have been idle longer than the pending timeout, and applies exactly one
//! policy to each. Every mutation goes through a ledger operation that
//! re-checks staleness under the ledger lock, so a task that moved on
//! between the snapshot and the mutation is left alone, and a second sweep
//! over the same state is a no-op.
//!
//! Per-task failures are logged and counted; they never abort the sweep.
//! Whatever failed is picked up again on the next tick.

use std::io;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use swarmfs_core::{Config, Result, StallPolicy, StopSignal, Task};
use swarmfs_storage::{ESCALATION_TAG, ReassignOutcome, Staleness, TaskLedger, staleness};
use tracing::{debug, info, warn};

use crate::worker::{WorkerHandle, spawn_periodic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallMonitorConfig {
    pub interval: Duration,
    pub pending_timeout: Duration,
    pub policy: StallPolicy,
    /// Reassignments allowed per task before it is marked stalled instead.
    /// 0 = unlimited.
    pub max_reassignments: u32,
}

impl Default for StallMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            pending_timeout: Duration::from_secs(3600),
            policy: StallPolicy::LogOnly,
            max_reassignments: 3,
        }
    }
}

impl StallMonitorConfig {
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            interval: config.stall_interval,
            pending_timeout: config.stall_pending_timeout,
            policy: config.stall_policy,
            max_reassignments: config.stall_max_reassignments,
        }
    }
}

/// Counters for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Active tasks examined.
    pub scanned: usize,
    /// Active tasks idle past the timeout.
    pub stale: usize,
    /// Tasks whose status the policy changed.
    pub mutated: usize,
    /// Escalation tasks created.
    pub escalated: usize,
    /// Active tasks with no parseable activity timestamp.
    pub skipped_malformed: usize,
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct StallMonitor {
    ledger: TaskLedger,
    config: StallMonitorConfig,
}

impl StallMonitor {
    #[must_use]
    pub const fn new(ledger: TaskLedger, config: StallMonitorConfig) -> Self {
        Self { ledger, config }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            TaskLedger::from_config(config),
            StallMonitorConfig::from_config(config),
        )
    }

    #[must_use]
    pub const fn config(&self) -> &StallMonitorConfig {
        &self.config
    }

    pub fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now())
    }

    /// Sweep as of `now`. Fails only if the ledger itself cannot be read.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for task in self.ledger.list(None)? {
            if !task.status.is_active() {
                continue;
            }
            report.scanned += 1;
            match staleness(&task, now, self.config.pending_timeout) {
                Staleness::Fresh => {}
                Staleness::Unknown => {
                    report.skipped_malformed += 1;
                    debug!(
                        task_id = %task.task_id,
                        "task has no parseable timestamp, not treating as stalled"
                    );
                }
                Staleness::Stale { idle } => {
                    report.stale += 1;
                    self.apply_policy(&task, idle, now, &mut report);
                }
            }
        }
        if report.stale > 0 || report.errors > 0 {
            info!(
                event = "stall_sweep",
                policy = self.config.policy.as_str(),
                scanned = report.scanned,
                stale = report.stale,
                mutated = report.mutated,
                escalated = report.escalated,
                errors = report.errors,
                "stall sweep completed"
            );
        }
        Ok(report)
    }

    fn apply_policy(&self, task: &Task, idle: Duration, now: DateTime<Utc>, report: &mut SweepReport) {
        let timeout = self.config.pending_timeout;
        let task_id = task.task_id.as_str();
        match self.config.policy {
            StallPolicy::LogOnly => {
                warn!(
                    event = "task_stalled",
                    task_id,
                    status = %task.status,
                    claimed_by = ?task.claimed_by,
                    idle_secs = idle.as_secs(),
                    "task idle past timeout"
                );
            }
            StallPolicy::MarkStalled => match self.ledger.mark_stalled_if_stale(task_id, now, timeout) {
                Ok(true) => {
                    report.mutated += 1;
                    warn!(event = "task_marked_stalled", task_id, idle_secs = idle.as_secs(), "task marked stalled");
                }
                Ok(false) => debug!(task_id, "task changed before it could be marked stalled"),
                Err(e) => {
                    report.errors += 1;
                    warn!(task_id, error = %e, "failed to mark task stalled");
                }
            },
            StallPolicy::Reassign => {
                match self.ledger.reassign_if_stale(task_id, now, timeout, self.config.max_reassignments) {
                    Ok(ReassignOutcome::Reassigned) => {
                        report.mutated += 1;
                        info!(
                            event = "task_reassigned",
                            task_id,
                            previous_owner = ?task.claimed_by,
                            "stalled task returned to pending"
                        );
                    }
                    Ok(ReassignOutcome::CapReached) => {
                        report.mutated += 1;
                        warn!(
                            event = "task_reassign_cap",
                            task_id,
                            max_reassignments = self.config.max_reassignments,
                            "reassignment cap reached, task marked stalled"
                        );
                    }
                    Ok(ReassignOutcome::Unclaimed) => {
                        info!(
                            event = "task_idle_unclaimed",
                            task_id,
                            idle_secs = idle.as_secs(),
                            "task idle in pending with no claim to release"
                        );
                    }
                    Ok(ReassignOutcome::Unchanged) => {
                        debug!(task_id, "task changed before it could be reassigned");
                    }
                    Err(e) => {
                        report.errors += 1;
                        warn!(task_id, error = %e, "failed to reassign task");
                    }
                }
            }
            StallPolicy::Escalate => {
                if task.has_tag(ESCALATION_TAG) {
                    debug!(task_id, "not escalating an escalation task");
                    return;
                }
                match self.ledger.add_escalation(task, idle) {
                    Ok(Some(escalation)) => {
                        report.escalated += 1;
                        warn!(
                            event = "task_escalated",
                            task_id,
                            escalation_id = %escalation.task_id,
                            idle_secs = idle.as_secs(),
                            "escalation task created"
                        );
                    }
                    Ok(None) => debug!(task_id, "open escalation already exists"),
                    Err(e) => {
                        report.errors += 1;
                        warn!(task_id, error = %e, "failed to create escalation task");
                    }
                }
            }
        }
    }

    /// Run sweeps on a dedicated thread every `interval` until `stop` is raised.
    pub fn spawn(self, stop: StopSignal) -> io::Result<WorkerHandle> {
        let interval = self.config.interval;
        spawn_periodic("stall-monitor", interval, stop, move || {
            if let Err(e) = self.sweep() {
                warn!(error = %e, error_type = e.error_type(), "stall sweep failed");
            }
        })
    }
}
