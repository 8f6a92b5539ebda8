//! Records shared through the filesystem.
//!
//! Tasks, mailbox messages, and swarm state entries are validated on
//! construction so malformed input is rejected before any file is touched.
//! Unknown fields on tasks and agent identities are carried through rewrites
//! untouched, since other tooling reads and annotates the same documents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::time::{monotonic_iso, now_iso, parse_timestamp};

/// Longest accepted agent / task identifier.
pub const MAX_ID_LEN: usize = 128;

/// Validate an identifier that is used as a path component or document key.
///
/// Must be 1..=128 chars of `[A-Za-z0-9._-]`, not starting with `.`.
pub fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Validation(format!("{kind} must not be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(Error::Validation(format!(
            "{kind} exceeds {MAX_ID_LEN} characters"
        )));
    }
    if value.starts_with('.') {
        return Err(Error::Validation(format!(
            "{kind} must not start with '.': {value}"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(Error::Validation(format!(
            "{kind} contains invalid characters: {value}"
        )));
    }
    Ok(())
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("missing required field: {field}")));
    }
    Ok(())
}

// =============================================================================
// Priority
// =============================================================================

/// Priority shared by tasks and mailbox messages.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    #[serde(alias = "medium")]
    Normal,
    High,
    #[serde(alias = "urgent")]
    Critical,
}

impl Priority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

// =============================================================================
// Task
// =============================================================================

/// Lifecycle state of a task.
///
/// `pending → claimed → in_progress → completed | failed`; `failed` may go
/// back to `pending` within the retry budget, after which it becomes
/// `permanently_failed`. Any active state may be forced to `stalled`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Claimed,
    InProgress,
    Completed,
    Failed,
    Stalled,
    PermanentlyFailed,
}

impl TaskStatus {
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Claimed,
        Self::InProgress,
        Self::Completed,
        Self::Failed,
        Self::Stalled,
        Self::PermanentlyFailed,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stalled => "stalled",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// Outcome states: the current attempt is over and nobody owns the task.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::PermanentlyFailed)
    }

    /// States the stall monitor watches.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Claimed | Self::InProgress)
    }

    /// Whether a direct status update from `self` to `next` is legal.
    ///
    /// `pending -> claimed` only happens through a claim, and
    /// `failed -> pending` only through the retry budget, so neither is
    /// listed here.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Claimed, Self::InProgress)
                | (Self::InProgress, Self::Completed | Self::Failed)
                | (Self::Pending | Self::Claimed | Self::InProgress, Self::Stalled)
                | (Self::Stalled, Self::Pending)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// A unit of work in the task ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// Times the stall monitor handed this task back to the pool.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub reassign_count: u32,
    /// For escalation tasks: the task being investigated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_task_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    /// New pending task stamped with the current time.
    #[must_use]
    pub fn new(task_id: impl Into<String>, description: impl Into<String>) -> Self {
        let now = now_iso();
        Self {
            task_id: task_id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            priority: Priority::Normal,
            created_at: now.clone(),
            updated_at: now,
            claimed_by: None,
            result: None,
            tags: Vec::new(),
            dependencies: Vec::new(),
            retry_count: 0,
            reassign_count: 0,
            related_task_id: None,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Parse and validate a task submitted as raw JSON.
    pub fn from_json(value: Value) -> Result<Self> {
        let task: Self = serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("malformed task: {e}")))?;
        task.validate()?;
        Ok(task)
    }

    /// Required fields are present and well formed.
    pub fn validate(&self) -> Result<()> {
        require_text("task_id", &self.task_id)?;
        require_text("description", &self.description)?;
        validate_identifier("task_id", &self.task_id)
    }

    /// Move `updated_at` forward to `now` (never backwards).
    pub fn touch(&mut self, now: chrono::DateTime<chrono::Utc>) {
        self.updated_at = monotonic_iso(&self.updated_at, now);
    }

    /// Reference instant for staleness: `updated_at`, else `created_at`.
    /// `None` when neither parses.
    #[must_use]
    pub fn last_activity(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        parse_timestamp(&self.updated_at).or_else(|| parse_timestamp(&self.created_at))
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

// =============================================================================
// Mailbox message
// =============================================================================

/// Content of a message before it is addressed and stamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub sender_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub body: Value,
}

impl MessageDraft {
    #[must_use]
    pub fn new(sender_id: impl Into<String>, kind: impl Into<String>, body: Value) -> Self {
        Self {
            sender_id: sender_id.into(),
            kind: kind.into(),
            priority: Priority::Normal,
            body,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Address the draft to `recipient_id`, assigning a fresh id and timestamp.
    pub fn address(&self, recipient_id: &str) -> Result<MailboxMessage> {
        let message = MailboxMessage {
            message_id: crate::ids::new_message_id(),
            sender_id: self.sender_id.clone(),
            recipient_id: recipient_id.to_string(),
            kind: self.kind.clone(),
            priority: self.priority,
            body: self.body.clone(),
            created_at: now_iso(),
        };
        message.validate()?;
        Ok(message)
    }
}

/// One message file in a mailbox directory. Its directory is its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxMessage {
    pub message_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub body: Value,
    pub created_at: String,
}

impl MailboxMessage {
    pub fn validate(&self) -> Result<()> {
        validate_identifier("message_id", &self.message_id)?;
        validate_identifier("sender_id", &self.sender_id)?;
        validate_identifier("recipient_id", &self.recipient_id)?;
        require_text("type", &self.kind)
    }
}

// =============================================================================
// Swarm state
// =============================================================================

/// One agent's row in the shared swarm state document. Always replaced
/// wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmStateEntry {
    pub agent_id: String,
    pub status: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub last_updated_utc: String,
}

impl SwarmStateEntry {
    pub fn validate(&self) -> Result<()> {
        validate_identifier("agent_id", &self.agent_id)?;
        require_text("status", &self.status)
    }
}

// =============================================================================
// Agent identity
// =============================================================================

/// A registered agent. Only registered agents may publish swarm state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub registered_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentIdentity {
    #[must_use]
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities: Vec::new(),
            registered_at: now_iso(),
            extra: Map::new(),
        }
    }
}
