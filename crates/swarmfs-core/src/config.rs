//! Configuration management for swarmfs
//!
//! Configuration is loaded from `SWARMFS_*` environment variables on top of
//! built-in defaults. Components never read the environment themselves; they
//! receive the values they need at construction.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Escalation policy applied to stalled tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StallPolicy {
    /// Observe and log only.
    #[default]
    LogOnly,
    /// Force the task to `stalled`.
    MarkStalled,
    /// Hand the task back to `pending`, clearing the claim.
    Reassign,
    /// Create a high-priority investigation task; leave the original alone.
    Escalate,
}

impl StallPolicy {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "log_only" | "log" => Some(Self::LogOnly),
            "mark_stalled" | "stalled" => Some(Self::MarkStalled),
            "reassign" => Some(Self::Reassign),
            "escalate" | "escalation" => Some(Self::Escalate),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LogOnly => "log_only",
            Self::MarkStalled => "mark_stalled",
            Self::Reassign => "reassign",
            Self::Escalate => "escalate",
        }
    }
}

/// Retention policy used by the memory compactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionPolicy {
    /// Drop entries older than `max_age`; undated entries are kept.
    TimeBased { max_age: Duration },
    /// Keep the last `n` entries in document order.
    KeepN { n: usize },
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self::TimeBased {
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Main configuration struct for swarmfs
#[derive(Debug, Clone)]
pub struct Config {
    // Layout
    pub root: PathBuf,
    pub ledger_path: PathBuf,
    pub mailbox_root: PathBuf,
    pub swarm_state_path: PathBuf,
    pub registry_path: PathBuf,

    // Locking
    pub lock_timeout: Duration,
    pub lock_poll_interval: Duration,

    // Mailbox
    pub mailbox_poll_interval: Duration,

    // Task ledger
    pub task_max_retries: u32,

    // Stall monitor
    pub stall_monitor_enabled: bool,
    pub stall_interval: Duration,
    pub stall_pending_timeout: Duration,
    pub stall_policy: StallPolicy,
    /// 0 = unlimited.
    pub stall_max_reassignments: u32,

    // Swarm state
    pub swarm_max_attempts: u32,
    pub swarm_jitter_min: Duration,
    pub swarm_jitter_max: Duration,

    // Compaction
    pub compaction_enabled: bool,
    pub compaction_interval: Duration,
    pub compaction_max_bytes: u64,
    pub compaction_max_entries: usize,
    pub compaction_policy: CompactionPolicy,
    pub compaction_segments: Vec<PathBuf>,

    // Logging
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_root(PathBuf::from(".swarmfs"))
    }
}

impl Config {
    /// Defaults with every document placed under `root`.
    #[must_use]
    pub fn with_root(root: PathBuf) -> Self {
        Self {
            ledger_path: root.join("tasks.json"),
            mailbox_root: root.join("mailbox"),
            swarm_state_path: root.join("swarm_state.json"),
            registry_path: root.join("agents.json"),
            root,
            lock_timeout: Duration::from_secs(10),
            lock_poll_interval: Duration::from_millis(50),
            mailbox_poll_interval: Duration::from_secs(1),
            task_max_retries: 3,
            stall_monitor_enabled: true,
            stall_interval: Duration::from_secs(60),
            stall_pending_timeout: Duration::from_secs(3600),
            stall_policy: StallPolicy::LogOnly,
            stall_max_reassignments: 3,
            swarm_max_attempts: 5,
            swarm_jitter_min: Duration::from_millis(50),
            swarm_jitter_max: Duration::from_millis(250),
            compaction_enabled: false,
            compaction_interval: Duration::from_secs(3600),
            compaction_max_bytes: 1024 * 1024,
            compaction_max_entries: 1000,
            compaction_policy: CompactionPolicy::default(),
            compaction_segments: Vec::new(),
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup (environment,
    /// test map, ...).
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let bool_or = |key: &str, default: bool| get(key).map_or(default, |v| parse_bool(&v, default));
        let u64_or = |key: &str, default: u64| get(key).and_then(|v| v.parse().ok()).unwrap_or(default);

        let root = get("SWARMFS_ROOT").map_or_else(|| PathBuf::from(".swarmfs"), PathBuf::from);
        let mut config = Self::with_root(root);

        // Layout
        if let Some(v) = get("SWARMFS_LEDGER_PATH") {
            config.ledger_path = PathBuf::from(v);
        }
        if let Some(v) = get("SWARMFS_MAILBOX_ROOT") {
            config.mailbox_root = PathBuf::from(v);
        }
        if let Some(v) = get("SWARMFS_SWARM_STATE_PATH") {
            config.swarm_state_path = PathBuf::from(v);
        }
        if let Some(v) = get("SWARMFS_REGISTRY_PATH") {
            config.registry_path = PathBuf::from(v);
        }

        // Locking
        config.lock_timeout = Duration::from_millis(u64_or("SWARMFS_LOCK_TIMEOUT_MS", 10_000));
        config.lock_poll_interval =
            Duration::from_millis(u64_or("SWARMFS_LOCK_POLL_MS", 50).max(1));

        // Mailbox
        config.mailbox_poll_interval =
            Duration::from_millis(u64_or("SWARMFS_MAILBOX_POLL_MS", 1000).max(1));

        // Task ledger
        config.task_max_retries = get("SWARMFS_TASK_MAX_RETRIES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.task_max_retries);

        // Stall monitor
        config.stall_monitor_enabled = bool_or("SWARMFS_STALL_ENABLED", config.stall_monitor_enabled);
        config.stall_interval =
            Duration::from_secs(u64_or("SWARMFS_STALL_INTERVAL_SECONDS", 60).max(1));
        config.stall_pending_timeout =
            Duration::from_secs(u64_or("SWARMFS_STALL_TIMEOUT_SECONDS", 3600));
        if let Some(v) = get("SWARMFS_STALL_POLICY") {
            match StallPolicy::parse(&v) {
                Some(policy) => config.stall_policy = policy,
                None => tracing::warn!(value = %v, "unknown SWARMFS_STALL_POLICY, keeping log_only"),
            }
        }
        config.stall_max_reassignments = get("SWARMFS_STALL_MAX_REASSIGNMENTS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.stall_max_reassignments);

        // Swarm state
        config.swarm_max_attempts = get("SWARMFS_SWARM_MAX_ATTEMPTS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.swarm_max_attempts)
            .max(1);
        config.swarm_jitter_min = Duration::from_millis(u64_or("SWARMFS_SWARM_JITTER_MIN_MS", 50));
        config.swarm_jitter_max = Duration::from_millis(u64_or("SWARMFS_SWARM_JITTER_MAX_MS", 250));

        // Compaction
        config.compaction_enabled = bool_or("SWARMFS_COMPACTION_ENABLED", config.compaction_enabled);
        config.compaction_interval =
            Duration::from_secs(u64_or("SWARMFS_COMPACTION_INTERVAL_SECONDS", 3600).max(1));
        config.compaction_max_bytes = u64_or("SWARMFS_COMPACTION_MAX_BYTES", config.compaction_max_bytes);
        config.compaction_max_entries = get("SWARMFS_COMPACTION_MAX_ENTRIES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.compaction_max_entries);
        let max_age_days = u64_or("SWARMFS_COMPACTION_MAX_AGE_DAYS", 30);
        let keep_n = get("SWARMFS_COMPACTION_KEEP_N")
            .and_then(|v| v.parse().ok())
            .unwrap_or(500);
        config.compaction_policy = match get("SWARMFS_COMPACTION_POLICY").as_deref() {
            Some("keep_n" | "keep-n") => CompactionPolicy::KeepN { n: keep_n },
            _ => CompactionPolicy::TimeBased {
                max_age: Duration::from_secs(max_age_days.saturating_mul(24 * 60 * 60)),
            },
        };
        if let Some(v) = get("SWARMFS_COMPACTION_SEGMENTS") {
            config.compaction_segments = parse_csv(&v).into_iter().map(PathBuf::from).collect();
        }

        // Logging
        if let Some(v) = get("SWARMFS_LOG_LEVEL") {
            config.log_level = v;
        }

        config
    }
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => true,
        "0" | "false" | "f" | "no" | "n" | "off" => false,
        _ => default,
    }
}

fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
