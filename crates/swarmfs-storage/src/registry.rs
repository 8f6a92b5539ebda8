//! Known-agents registry.
//!
//! An explicitly constructed object with a `load` / `close` lifecycle, passed
//! to the components that need it. Registrations are written through to the
//! registry document immediately, under its lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde_json::{Map, Value};
use swarmfs_core::{AgentIdentity, Config, Result, validate_identifier};
use tracing::{debug, info, warn};

use crate::document::DocumentStore;

type AgentMap = BTreeMap<String, AgentIdentity>;

/// Registry of agents allowed to publish swarm state.
#[derive(Debug)]
pub struct AgentRegistry {
    path: Option<PathBuf>,
    store: DocumentStore,
    agents: RwLock<AgentMap>,
}

fn parse_agents(path: &Path, doc: Map<String, Value>) -> AgentMap {
    let mut agents = AgentMap::new();
    for (key, value) in doc {
        match serde_json::from_value::<AgentIdentity>(value) {
            Ok(identity) if identity.agent_id == key => {
                agents.insert(key, identity);
            }
            Ok(identity) => warn!(
                registry = %path.display(),
                key = %key,
                agent_id = %identity.agent_id,
                "registry entry key does not match agent_id, skipping"
            ),
            Err(e) => warn!(
                registry = %path.display(),
                key = %key,
                error = %e,
                "malformed registry entry, skipping"
            ),
        }
    }
    agents
}

impl AgentRegistry {
    /// Load the registry document at `path`. A missing document is an empty
    /// registry; a corrupt one is an error.
    pub fn load(path: impl Into<PathBuf>, store: DocumentStore) -> Result<Self> {
        let path = path.into();
        let doc: Map<String, Value> = store.read_as(&path)?.unwrap_or_default();
        let agents = parse_agents(&path, doc);
        info!(registry = %path.display(), agents = agents.len(), "agent registry loaded");
        Ok(Self {
            path: Some(path),
            store,
            agents: RwLock::new(agents),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::load(config.registry_path.clone(), DocumentStore::from_config(config))
    }

    /// Registry that lives only in memory (nothing is persisted).
    pub fn in_memory<I, S>(agent_ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut agents = AgentMap::new();
        for id in agent_ids {
            let identity = AgentIdentity::new(id);
            validate_identifier("agent_id", &identity.agent_id)?;
            agents.insert(identity.agent_id.clone(), identity);
        }
        Ok(Self {
            path: None,
            store: DocumentStore::default(),
            agents: RwLock::new(agents),
        })
    }

    /// Re-read the registry document, picking up agents registered by other
    /// processes. Returns the number of known agents.
    pub fn reload(&self) -> Result<usize> {
        let Some(path) = &self.path else {
            return Ok(self.len());
        };
        let doc: Map<String, Value> = self.store.read_as(path)?.unwrap_or_default();
        let fresh = parse_agents(path, doc);
        let count = fresh.len();
        *self.agents.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(count)
    }

    #[must_use]
    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(agent_id)
    }

    #[must_use]
    pub fn get(&self, agent_id: &str) -> Option<AgentIdentity> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
    }

    #[must_use]
    pub fn agent_ids(&self) -> Vec<String> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register (or replace) an agent. This is the only way an agent becomes
    /// known; swarm state never self-registers.
    pub fn register(&self, identity: AgentIdentity) -> Result<()> {
        validate_identifier("agent_id", &identity.agent_id)?;
        if let Some(path) = &self.path {
            let value = serde_json::to_value(&identity)?;
            self.store.update_as(path, |doc: &mut Map<String, Value>| {
                doc.insert(identity.agent_id.clone(), value);
                Ok(())
            })?;
        }
        info!(agent_id = %identity.agent_id, "agent registered");
        self.agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity.agent_id.clone(), identity);
        Ok(())
    }

    /// End the registry's lifecycle. Registrations are already persisted, so
    /// this only releases the in-memory table.
    pub fn close(self) {
        let count = self.len();
        debug!(
            registry = ?self.path.as_ref().map(|p| p.display().to_string()),
            agents = count,
            "agent registry closed"
        );
    }
}
