//! Core types, configuration, and records for swarmfs
//!
//! This crate provides:
//! - Configuration management (`Config`, environment parsing)
//! - Records shared through the filesystem (`Task`, `MailboxMessage`,
//!   `SwarmStateEntry`, `AgentIdentity`)
//! - The error taxonomy used by every component
//! - Cooperative cancellation (`StopSignal`, `Ticker`)

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod ids;
pub mod models;
pub mod stop;
pub mod time;

// Re-export key types for convenience
pub use config::{CompactionPolicy, Config, StallPolicy};
pub use error::{Error, Result};
pub use models::{
    AgentIdentity, MailboxMessage, MessageDraft, Priority, SwarmStateEntry, Task, TaskStatus,
    validate_identifier,
};
pub use stop::{StopSignal, Ticker};
pub use time::{now_iso, parse_timestamp, to_iso};
