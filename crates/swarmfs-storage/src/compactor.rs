//! Bounded-growth compaction for append-heavy JSON segments.
//!
//! A segment is either a JSON array (ordered entries) or a JSON object
//! (keyed entries in insertion order). Compaction runs under the segment's
//! lock and republishes through the same temp + rename path as every other
//! document, so external readers never observe a half-compacted segment.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use swarmfs_core::time::timestamp_from_value;
use swarmfs_core::{CompactionPolicy, Config, Result};
use tracing::{debug, info, warn};

use crate::document::{DocumentStore, read_bytes, write_json_unlocked};

/// Entry fields consulted, in order, for an entry's timestamp.
pub const DEFAULT_TIMESTAMP_KEYS: [&str; 3] = ["timestamp", "created_at", "ts"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionConfig {
    /// Compact when the serialized segment is larger than this.
    pub max_bytes: u64,
    /// Compact when the segment holds more entries than this.
    pub max_entries: usize,
    pub policy: CompactionPolicy,
    pub timestamp_keys: Vec<String>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            max_entries: 1000,
            policy: CompactionPolicy::default(),
            timestamp_keys: DEFAULT_TIMESTAMP_KEYS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl CompactionConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_bytes: config.compaction_max_bytes,
            max_entries: config.compaction_max_entries,
            policy: config.compaction_policy,
            ..Self::default()
        }
    }
}

/// What a compaction pass did to one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// Thresholds crossed; `after` entries retained out of `before`.
    /// `before == after` means the policy found nothing to evict and the
    /// file was left as is.
    Compacted { before: usize, after: usize },
    /// Below every threshold.
    NotTriggered,
    /// No segment file.
    Missing,
    /// Unparseable, or neither an array nor an object; left untouched.
    SkippedMalformed,
}

impl CompactionOutcome {
    #[must_use]
    pub const fn removed(&self) -> usize {
        match self {
            Self::Compacted { before, after } => before.saturating_sub(*after),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCompactor {
    config: CompactionConfig,
    store: DocumentStore,
}

impl MemoryCompactor {
    #[must_use]
    pub const fn new(config: CompactionConfig, store: DocumentStore) -> Self {
        Self { config, store }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            CompactionConfig::from_config(config),
            DocumentStore::from_config(config),
        )
    }

    #[must_use]
    pub const fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn compact(&self, path: &Path) -> Result<CompactionOutcome> {
        self.compact_at(path, Utc::now())
    }

    /// Compact `path` as of `now` (the reference point for age-based eviction).
    pub fn compact_at(&self, path: &Path, now: DateTime<Utc>) -> Result<CompactionOutcome> {
        let mut guard = self.store.lock_for(path).acquire()?;
        let result = self.compact_locked(path, now);
        guard.release();
        let outcome = result?;
        match outcome {
            CompactionOutcome::Compacted { before, after } => info!(
                event = "segment_compacted",
                path = %path.display(),
                before,
                after,
                "compaction pass complete"
            ),
            CompactionOutcome::SkippedMalformed => warn!(
                event = "segment_malformed",
                path = %path.display(),
                "segment is not a JSON array or object, skipping compaction"
            ),
            CompactionOutcome::NotTriggered | CompactionOutcome::Missing => {
                debug!(path = %path.display(), outcome = ?outcome, "compaction not needed");
            }
        }
        Ok(outcome)
    }

    fn compact_locked(&self, path: &Path, now: DateTime<Utc>) -> Result<CompactionOutcome> {
        let Some(raw) = read_bytes(path)? else {
            return Ok(CompactionOutcome::Missing);
        };
        let Ok(doc) = serde_json::from_slice::<Value>(&raw) else {
            return Ok(CompactionOutcome::SkippedMalformed);
        };
        let before = match &doc {
            Value::Array(items) => items.len(),
            Value::Object(map) => map.len(),
            _ => return Ok(CompactionOutcome::SkippedMalformed),
        };

        let size = u64::try_from(raw.len()).unwrap_or(u64::MAX);
        if size <= self.config.max_bytes && before <= self.config.max_entries {
            return Ok(CompactionOutcome::NotTriggered);
        }

        let compacted = match doc {
            Value::Array(items) => Value::Array(self.retain(items, now)),
            Value::Object(map) => Value::Object(self.retain_keyed(map, now)),
            _ => return Ok(CompactionOutcome::SkippedMalformed),
        };
        let after = match &compacted {
            Value::Array(items) => items.len(),
            Value::Object(map) => map.len(),
            _ => before,
        };
        if after < before {
            write_json_unlocked(path, &compacted)?;
        }
        Ok(CompactionOutcome::Compacted { before, after })
    }

    fn retain(&self, items: Vec<Value>, now: DateTime<Utc>) -> Vec<Value> {
        match self.config.policy {
            CompactionPolicy::KeepN { n } => {
                let skip = items.len().saturating_sub(n);
                items.into_iter().skip(skip).collect()
            }
            CompactionPolicy::TimeBased { max_age } => items
                .into_iter()
                .filter(|entry| !self.is_expired(entry, now, max_age))
                .collect(),
        }
    }

    fn retain_keyed(&self, map: Map<String, Value>, now: DateTime<Utc>) -> Map<String, Value> {
        match self.config.policy {
            CompactionPolicy::KeepN { n } => {
                let skip = map.len().saturating_sub(n);
                map.into_iter().skip(skip).collect()
            }
            CompactionPolicy::TimeBased { max_age } => map
                .into_iter()
                .filter(|(_, entry)| !self.is_expired(entry, now, max_age))
                .collect(),
        }
    }

    /// Entries without a recognizable timestamp never expire.
    fn is_expired(&self, entry: &Value, now: DateTime<Utc>, max_age: Duration) -> bool {
        let Some(ts) = self.entry_timestamp(entry) else {
            return false;
        };
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return false;
        };
        now.checked_sub_signed(max_age)
            .is_some_and(|cutoff| ts < cutoff)
    }

    fn entry_timestamp(&self, entry: &Value) -> Option<DateTime<Utc>> {
        let obj = entry.as_object()?;
        self.config
            .timestamp_keys
            .iter()
            .find_map(|key| obj.get(key).and_then(timestamp_from_value))
    }
}
