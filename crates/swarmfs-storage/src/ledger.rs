//! Task ledger: a JSON array of tasks with claim and lifecycle operations.
//!
//! Every mutation is one lock / read / modify / write cycle on the ledger
//! document, so two agents calling [`TaskLedger::claim_next`] at the same
//! moment can never both receive the same task.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use swarmfs_core::ids::unique_suffix;
use swarmfs_core::{
    Config, Error, Priority, Result, Task, TaskStatus, to_iso, validate_identifier,
};
use tracing::{debug, info};

use crate::document::DocumentStore;

/// Tag carried by every escalation task.
pub const ESCALATION_TAG: &str = "escalation";
/// Second tag carried by escalation tasks created for stalled work.
pub const STALLED_TASK_TAG: &str = "stalled_task";

/// Which pending tasks an agent is willing to take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimFilter {
    /// Every listed tag must be present on the task.
    pub tags: Vec<String>,
    /// Skip tasks whose dependencies are not all `completed`.
    pub respect_dependencies: bool,
}

impl Default for ClaimFilter {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            respect_dependencies: true,
        }
    }
}

impl ClaimFilter {
    #[must_use]
    pub fn with_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    fn matches(&self, task: &Task, completed: &HashSet<&str>) -> bool {
        if task.status != TaskStatus::Pending {
            return false;
        }
        if !self.tags.iter().all(|t| task.has_tag(t)) {
            return false;
        }
        !self.respect_dependencies
            || task
                .dependencies
                .iter()
                .all(|d| completed.contains(d.as_str()))
    }
}

/// How long a task has gone without activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    Stale { idle: Duration },
    /// Neither `updated_at` nor `created_at` parses.
    Unknown,
}

/// Classify `task` against `timeout` as of `now`. Only active tasks (pending,
/// claimed, in progress) can be stale.
#[must_use]
pub fn staleness(task: &Task, now: DateTime<Utc>, timeout: Duration) -> Staleness {
    if !task.status.is_active() {
        return Staleness::Fresh;
    }
    let Some(last) = task.last_activity() else {
        return Staleness::Unknown;
    };
    let idle = (now - last).to_std().unwrap_or(Duration::ZERO);
    if idle > timeout {
        Staleness::Stale { idle }
    } else {
        Staleness::Fresh
    }
}

/// Result of a stall-driven reassignment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassignOutcome {
    /// Back to `pending` with the claim cleared.
    Reassigned,
    /// Reassignment cap reached; the task was marked `stalled` instead.
    CapReached,
    /// Stale but still pending and unclaimed; nothing to release.
    Unclaimed,
    /// Unknown id, or no longer stale once the lock was held.
    Unchanged,
}

/// A task list document guarded by its file lock.
#[derive(Debug, Clone)]
pub struct TaskLedger {
    path: PathBuf,
    store: DocumentStore,
    max_retries: u32,
}

impl TaskLedger {
    pub fn new(path: impl Into<PathBuf>, store: DocumentStore) -> Self {
        Self {
            path: path.into(),
            store,
            max_retries: 3,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.ledger_path.clone(), DocumentStore::from_config(config))
            .with_max_retries(config.task_max_retries)
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Vec<Task>) -> Result<R>,
    {
        self.store.update_as(&self.path, f)
    }

    fn snapshot(&self) -> Result<Vec<Task>> {
        Ok(self.store.read_as(&self.path)?.unwrap_or_default())
    }

    /// Append a validated task. Missing timestamps are stamped; a pending
    /// task never carries a claim.
    pub fn add(&self, mut task: Task) -> Result<Task> {
        task.validate()?;
        let now = to_iso(Utc::now());
        if task.created_at.trim().is_empty() {
            task.created_at.clone_from(&now);
        }
        if task.updated_at.trim().is_empty() {
            task.updated_at = now;
        }
        if task.status == TaskStatus::Pending {
            task.claimed_by = None;
        }
        self.mutate(|tasks| {
            if tasks.iter().any(|t| t.task_id == task.task_id) {
                return Err(Error::Validation(format!(
                    "task_id already exists: {}",
                    task.task_id
                )));
            }
            tasks.push(task.clone());
            Ok(())
        })?;
        debug!(task_id = %task.task_id, ledger = %self.path.display(), "task added");
        Ok(task)
    }

    /// Validate and append a task submitted as raw JSON.
    pub fn add_json(&self, value: Value) -> Result<Task> {
        self.add(Task::from_json(value)?)
    }

    /// Claim the first pending task (in stored order) that `filter` accepts.
    ///
    /// `Ok(None)` means nothing is available, which is not an error.
    pub fn claim_next(&self, agent_id: &str, filter: &ClaimFilter) -> Result<Option<Task>> {
        validate_identifier("agent_id", agent_id)?;
        let now = Utc::now();
        let claimed = self.mutate(|tasks| {
            let completed: HashSet<&str> = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .map(|t| t.task_id.as_str())
                .collect();
            let Some(idx) = tasks.iter().position(|t| filter.matches(t, &completed)) else {
                return Ok(None);
            };
            let task = &mut tasks[idx];
            task.status = TaskStatus::Claimed;
            task.claimed_by = Some(agent_id.to_string());
            task.touch(now);
            Ok(Some(task.clone()))
        })?;
        if let Some(task) = &claimed {
            info!(task_id = %task.task_id, agent_id, "task claimed");
        }
        Ok(claimed)
    }

    /// Move a claimed task to `in_progress`. Only the claimant may start it.
    pub fn start(&self, task_id: &str, agent_id: &str) -> Result<bool> {
        let now = Utc::now();
        self.mutate(|tasks| {
            let Some(task) = tasks.iter_mut().find(|t| t.task_id == task_id) else {
                return Ok(false);
            };
            if task.status != TaskStatus::Claimed || task.claimed_by.as_deref() != Some(agent_id) {
                return Ok(false);
            }
            task.status = TaskStatus::InProgress;
            task.touch(now);
            Ok(true)
        })
    }

    /// Set a task's status (and optionally its result).
    ///
    /// Returns `false` for an unknown `task_id`. Only lifecycle moves allowed
    /// by [`TaskStatus::can_transition_to`] are applied; anything else is a
    /// `Validation` error and the ledger is left untouched. Claims go through
    /// [`claim_next`](Self::claim_next) and retries through
    /// [`retry_failed`](Self::retry_failed). Terminal statuses and `pending`
    /// clear `claimed_by`.
    pub fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<Value>,
    ) -> Result<bool> {
        let now = Utc::now();
        let updated = self.mutate(|tasks| {
            let Some(task) = tasks.iter_mut().find(|t| t.task_id == task_id) else {
                return Ok(false);
            };
            if !task.status.can_transition_to(status) {
                return Err(Error::Validation(format!(
                    "illegal status transition for {task_id}: {} -> {status}",
                    task.status
                )));
            }
            task.status = status;
            if let Some(result) = result {
                task.result = Some(result);
            }
            if status.is_terminal() || status == TaskStatus::Pending {
                task.claimed_by = None;
            }
            task.touch(now);
            Ok(true)
        })?;
        if updated {
            debug!(task_id, status = %status, "task status updated");
        }
        Ok(updated)
    }

    /// Apply the retry budget to a failed task: back to `pending` while
    /// `retry_count < max_retries`, otherwise `permanently_failed`.
    ///
    /// Returns the new status, or `None` if the task is unknown or not failed.
    pub fn retry_failed(&self, task_id: &str) -> Result<Option<TaskStatus>> {
        let now = Utc::now();
        let max_retries = self.max_retries;
        self.mutate(|tasks| {
            let Some(task) = tasks
                .iter_mut()
                .find(|t| t.task_id == task_id && t.status == TaskStatus::Failed)
            else {
                return Ok(None);
            };
            if task.retry_count < max_retries {
                task.retry_count += 1;
                task.status = TaskStatus::Pending;
            } else {
                task.status = TaskStatus::PermanentlyFailed;
            }
            task.claimed_by = None;
            task.touch(now);
            info!(
                task_id,
                status = %task.status,
                retry_count = task.retry_count,
                "failed task retried"
            );
            Ok(Some(task.status))
        })
    }

    /// One task by id (a copy).
    pub fn get(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.snapshot()?.into_iter().find(|t| t.task_id == task_id))
    }

    /// Copies of all tasks, optionally filtered by status.
    pub fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let mut tasks = self.snapshot()?;
        if let Some(status) = status {
            tasks.retain(|t| t.status == status);
        }
        Ok(tasks)
    }

    /// Force an idle active task to `stalled`, re-checking staleness under the
    /// lock. Returns whether it changed.
    pub fn mark_stalled_if_stale(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<bool> {
        self.mutate(|tasks| {
            let Some(task) = tasks.iter_mut().find(|t| t.task_id == task_id) else {
                return Ok(false);
            };
            if !matches!(staleness(task, now, timeout), Staleness::Stale { .. }) {
                return Ok(false);
            }
            task.status = TaskStatus::Stalled;
            task.touch(now);
            Ok(true)
        })
    }

    /// Hand an idle claimed or in-progress task back to `pending`, clearing
    /// the claim.
    ///
    /// A pending task nobody has claimed has no claim to release and is left
    /// alone. With `max_reassignments > 0`, a task already reassigned that
    /// many times is marked `stalled` instead so it cannot cycle forever.
    pub fn reassign_if_stale(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
        timeout: Duration,
        max_reassignments: u32,
    ) -> Result<ReassignOutcome> {
        self.mutate(|tasks| {
            let Some(task) = tasks.iter_mut().find(|t| t.task_id == task_id) else {
                return Ok(ReassignOutcome::Unchanged);
            };
            if !matches!(staleness(task, now, timeout), Staleness::Stale { .. }) {
                return Ok(ReassignOutcome::Unchanged);
            }
            if task.status == TaskStatus::Pending && task.claimed_by.is_none() {
                return Ok(ReassignOutcome::Unclaimed);
            }
            task.touch(now);
            if max_reassignments > 0 && task.reassign_count >= max_reassignments {
                task.status = TaskStatus::Stalled;
                return Ok(ReassignOutcome::CapReached);
            }
            task.reassign_count += 1;
            task.status = TaskStatus::Pending;
            task.claimed_by = None;
            Ok(ReassignOutcome::Reassigned)
        })
    }

    /// Append a high-priority investigation task for `original`, unless an
    /// open escalation for it already exists. The original is not modified.
    pub fn add_escalation(&self, original: &Task, idle: Duration) -> Result<Option<Task>> {
        let mut escalation = Task::new(
            format!("escalation-{}", unique_suffix()),
            format!(
                "Investigate stalled task {}: {}",
                original.task_id, original.description
            ),
        )
        .with_priority(Priority::High)
        .with_tags([ESCALATION_TAG, STALLED_TASK_TAG]);
        escalation.related_task_id = Some(original.task_id.clone());
        escalation
            .extra
            .insert("idle_seconds".to_string(), Value::from(idle.as_secs()));
        if let Some(owner) = &original.claimed_by {
            escalation
                .extra
                .insert("stalled_owner".to_string(), Value::from(owner.clone()));
        }
        escalation.validate()?;

        self.mutate(|tasks| {
            let open = tasks.iter().any(|t| {
                t.has_tag(ESCALATION_TAG)
                    && t.related_task_id.as_deref() == Some(original.task_id.as_str())
                    && !t.status.is_terminal()
            });
            if open {
                return Ok(None);
            }
            tasks.push(escalation.clone());
            Ok(Some(escalation))
        })
    }
}
