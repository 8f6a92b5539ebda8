//! Shared swarm state: one JSON object keyed by `agent_id`.
//!
//! Each update replaces one agent's entry wholesale inside a single held
//! lock (read whole document, replace entry, atomic rewrite). Contention and
//! transient I/O are retried with uniform random jitter so agents that woke
//! on the same tick do not keep colliding.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use swarmfs_core::ids::jitter_between;
use swarmfs_core::{AgentIdentity, Config, Error, Result, SwarmStateEntry, now_iso};
use tracing::{debug, error, warn};

use crate::document::DocumentStore;
use crate::registry::AgentRegistry;

/// Retry budget for swarm state updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwarmSyncOptions {
    pub max_attempts: u32,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl Default for SwarmSyncOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            jitter_min: Duration::from_millis(50),
            jitter_max: Duration::from_millis(250),
        }
    }
}

impl SwarmSyncOptions {
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.swarm_max_attempts,
            jitter_min: config.swarm_jitter_min,
            jitter_max: config.swarm_jitter_max,
        }
    }
}

/// Optional parts of an agent state update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentStateUpdate {
    /// `None` falls back to the capabilities recorded in the registry.
    pub capabilities: Option<Vec<String>>,
    pub current_task_id: Option<String>,
    pub last_error: Option<String>,
}

/// Writer/reader for the swarm state document.
#[derive(Debug, Clone)]
pub struct SwarmStateSync {
    path: PathBuf,
    store: DocumentStore,
    registry: Arc<AgentRegistry>,
    options: SwarmSyncOptions,
}

impl SwarmStateSync {
    pub fn new(
        path: impl Into<PathBuf>,
        store: DocumentStore,
        registry: Arc<AgentRegistry>,
        options: SwarmSyncOptions,
    ) -> Self {
        Self {
            path: path.into(),
            store,
            registry,
            options,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config, registry: Arc<AgentRegistry>) -> Self {
        Self::new(
            config.swarm_state_path.clone(),
            DocumentStore::from_config(config),
            registry,
            SwarmSyncOptions::from_config(config),
        )
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `agent_id`'s state. Returns `false` when the state was not
    /// recorded this cycle (unknown agent, invalid input, or retries
    /// exhausted); callers should treat that as non-fatal.
    pub fn update_agent_state(&self, agent_id: &str, status: &str, update: AgentStateUpdate) -> bool {
        match self.try_update_agent_state(agent_id, status, update) {
            Ok(_) => true,
            Err(Error::UnknownAgent(id)) => {
                warn!(agent_id = %id, "swarm state update rejected: unknown agent");
                false
            }
            Err(e) => {
                error!(
                    agent_id,
                    error = %e,
                    error_type = e.error_type(),
                    "swarm state not recorded"
                );
                false
            }
        }
    }

    /// Like [`update_agent_state`](Self::update_agent_state), returning the
    /// written entry or the final error.
    pub fn try_update_agent_state(
        &self,
        agent_id: &str,
        status: &str,
        update: AgentStateUpdate,
    ) -> Result<SwarmStateEntry> {
        let Some(identity) = self.lookup_agent(agent_id) else {
            return Err(Error::UnknownAgent(agent_id.to_string()));
        };
        let entry = SwarmStateEntry {
            agent_id: agent_id.to_string(),
            status: status.to_string(),
            capabilities: update.capabilities.unwrap_or(identity.capabilities),
            current_task_id: update.current_task_id,
            last_error: update.last_error,
            last_updated_utc: now_iso(),
        };
        entry.validate()?;
        let value = serde_json::to_value(&entry)?;

        let max_attempts = self.options.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.replace_entry(agent_id, &value) {
                Ok(()) => {
                    debug!(agent_id, status, attempt, "swarm state updated");
                    return Ok(entry);
                }
                Err(e) if e.is_recoverable() && attempt < max_attempts => {
                    let delay = jitter_between(self.options.jitter_min, self.options.jitter_max);
                    warn!(
                        agent_id,
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "swarm state update failed, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Registry lookup that rereads the registry document once on a miss, so
    /// agents registered by other processes are picked up.
    fn lookup_agent(&self, agent_id: &str) -> Option<AgentIdentity> {
        if let Some(identity) = self.registry.get(agent_id) {
            return Some(identity);
        }
        if let Err(e) = self.registry.reload() {
            warn!(agent_id, error = %e, "agent registry reload failed");
            return None;
        }
        self.registry.get(agent_id)
    }

    fn replace_entry(&self, agent_id: &str, value: &Value) -> Result<()> {
        self.store
            .update_as(&self.path, |doc: &mut Map<String, Value>| {
                doc.insert(agent_id.to_string(), value.clone());
                Ok(())
            })
    }

    /// Drop an agent's entry. Returns whether it was present.
    pub fn remove_agent(&self, agent_id: &str) -> Result<bool> {
        self.store
            .update_as(&self.path, |doc: &mut Map<String, Value>| {
                Ok(doc.shift_remove(agent_id).is_some())
            })
    }

    /// Snapshot of the whole document. Absent, unreadable, or non-object
    /// documents yield an empty map.
    #[must_use]
    pub fn read_swarm_state(&self) -> Map<String, Value> {
        match self.store.read(&self.path) {
            Ok(Some(Value::Object(map))) => map,
            Ok(Some(_)) => {
                warn!(path = %self.path.display(), "swarm state is not a JSON object");
                Map::new()
            }
            Ok(None) => Map::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "swarm state unreadable");
                Map::new()
            }
        }
    }

    /// Typed snapshot; entries that do not parse are skipped.
    #[must_use]
    pub fn read_swarm_state_entries(&self) -> BTreeMap<String, SwarmStateEntry> {
        self.read_swarm_state()
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_value(value) {
                Ok(entry) => Some((key, entry)),
                Err(e) => {
                    debug!(agent_id = %key, error = %e, "skipping malformed swarm state entry");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{FileLock, LockOptions};
    use std::fs;
    use tempfile::TempDir;

    fn sync_for(tmp: &TempDir, agents: &[&str]) -> SwarmStateSync {
        let registry = Arc::new(AgentRegistry::in_memory(agents.iter().copied()).unwrap());
        SwarmStateSync::new(
            tmp.path().join("swarm_state.json"),
            DocumentStore::new(LockOptions::new(
                Duration::from_millis(30),
                Duration::from_millis(5),
            )),
            registry,
            SwarmSyncOptions {
                max_attempts: 3,
                jitter_min: Duration::from_millis(1),
                jitter_max: Duration::from_millis(5),
            },
        )
    }

    #[test]
    fn test_agent_registered_elsewhere_is_picked_up() {
        let tmp = TempDir::new().unwrap();
        let registry_path = tmp.path().join("agents.json");
        let ours = Arc::new(AgentRegistry::load(&registry_path, DocumentStore::default()).unwrap());
        let sync = SwarmStateSync::new(
            tmp.path().join("swarm_state.json"),
            DocumentStore::default(),
            Arc::clone(&ours),
            SwarmSyncOptions::default(),
        );
        assert!(!sync.update_agent_state("late-agent", "Active", AgentStateUpdate::default()));

        let theirs = AgentRegistry::load(&registry_path, DocumentStore::default()).unwrap();
        theirs.register(AgentIdentity::new("late-agent")).unwrap();

        assert!(sync.update_agent_state("late-agent", "Active", AgentStateUpdate::default()));
        assert!(ours.contains("late-agent"));
        assert!(sync.read_swarm_state().contains_key("late-agent"));
    }

    #[test]
    fn test_update_and_read() {
        let tmp = TempDir::new().unwrap();
        let sync = sync_for(&tmp, &["agent-1"]);
        assert!(sync.update_agent_state(
            "agent-1",
            "Active",
            AgentStateUpdate {
                capabilities: Some(vec!["rust".into()]),
                current_task_id: Some("t1".into()),
                last_error: None,
            },
        ));
        let entries = sync.read_swarm_state_entries();
        let entry = &entries["agent-1"];
        assert_eq!(entry.status, "Active");
        assert_eq!(entry.current_task_id.as_deref(), Some("t1"));
        assert_eq!(entry.capabilities, vec!["rust".to_string()]);
    }

    #[test]
    fn test_update_replaces_entry_wholesale() {
        let tmp = TempDir::new().unwrap();
        let sync = sync_for(&tmp, &["agent-1"]);
        let first = AgentStateUpdate {
            current_task_id: Some("t1".into()),
            last_error: Some("oops".into()),
            ..AgentStateUpdate::default()
        };
        assert!(sync.update_agent_state("agent-1", "Busy", first));
        assert!(sync.update_agent_state("agent-1", "Idle", AgentStateUpdate::default()));
        let entry = &sync.read_swarm_state_entries()["agent-1"];
        assert_eq!(entry.status, "Idle");
        assert_eq!(entry.current_task_id, None);
        assert_eq!(entry.last_error, None);
    }

    #[test]
    fn test_unknown_agent_rejected_without_write() {
        let tmp = TempDir::new().unwrap();
        let sync = sync_for(&tmp, &["agent-1"]);
        assert!(sync.update_agent_state("agent-1", "Active", AgentStateUpdate::default()));
        let before = fs::read(sync.path()).unwrap();

        assert!(!sync.update_agent_state("ghost-agent", "Active", AgentStateUpdate::default()));
        assert!(matches!(
            sync.try_update_agent_state("ghost-agent", "Active", AgentStateUpdate::default()),
            Err(Error::UnknownAgent(_))
        ));
        assert_eq!(fs::read(sync.path()).unwrap(), before);
    }

    #[test]
    fn test_gives_up_after_max_attempts_under_contention() {
        let tmp = TempDir::new().unwrap();
        let sync = sync_for(&tmp, &["agent-1"]);
        let held = FileLock::new(sync.path()).acquire().unwrap();
        let err = sync
            .try_update_agent_state("agent-1", "Active", AgentStateUpdate::default())
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
        assert!(!sync.update_agent_state("agent-1", "Active", AgentStateUpdate::default()));
        drop(held);
        assert!(sync.update_agent_state("agent-1", "Active", AgentStateUpdate::default()));
    }

    #[test]
    fn test_read_tolerates_missing_and_malformed() {
        let tmp = TempDir::new().unwrap();
        let sync = sync_for(&tmp, &["agent-1"]);
        assert!(sync.read_swarm_state().is_empty());
        fs::write(sync.path(), "[1, 2, 3]").unwrap();
        assert!(sync.read_swarm_state().is_empty());
        fs::write(sync.path(), "{ broken").unwrap();
        assert!(sync.read_swarm_state().is_empty());
    }

    #[test]
    fn test_corrupt_state_is_not_retried_or_overwritten() {
        let tmp = TempDir::new().unwrap();
        let sync = sync_for(&tmp, &["agent-1"]);
        fs::write(sync.path(), "{ broken").unwrap();
        let err = sync
            .try_update_agent_state("agent-1", "Active", AgentStateUpdate::default())
            .unwrap_err();
        assert!(matches!(err, Error::CorruptDocument { .. }));
        assert_eq!(fs::read(sync.path()).unwrap(), b"{ broken");
    }

    #[test]
    fn test_remove_agent() {
        let tmp = TempDir::new().unwrap();
        let sync = sync_for(&tmp, &["agent-1", "agent-2"]);
        sync.update_agent_state("agent-1", "Active", AgentStateUpdate::default());
        sync.update_agent_state("agent-2", "Active", AgentStateUpdate::default());
        assert!(sync.remove_agent("agent-1").unwrap());
        assert!(!sync.remove_agent("agent-1").unwrap());
        let keys: Vec<String> = sync.read_swarm_state().keys().cloned().collect();
        assert_eq!(keys, vec!["agent-2".to_string()]);
    }
}
