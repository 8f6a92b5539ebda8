//! swarmfs - maintenance commands for a shared-filesystem agent swarm
//!
//! Every command is a one-shot operation against the documents under
//! `SWARMFS_ROOT`; results are printed to stdout as JSON and logs go to
//! stderr.

#![forbid(unsafe_code)]

use std::io::{self, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use swarmfs_core::{AgentIdentity, Config, Result, StallPolicy, StopSignal, TaskStatus};
use swarmfs_storage::{
    AgentRegistry, CompactionOutcome, Mailbox, MemoryCompactor, SwarmStateSync, TaskLedger,
};
use swarmfs_workers::{CompactionWorker, StallMonitor, StallMonitorConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "swarmfs")]
#[command(version, about = "Maintenance commands for a swarmfs coordination directory")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log the resolved configuration before running
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one stall sweep over the task ledger
    Sweep {
        /// Policy override (log_only, mark_stalled, reassign, escalate)
        #[arg(long, value_parser = parse_policy)]
        policy: Option<StallPolicy>,

        /// Pending-timeout override in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Compact memory segments (defaults to SWARMFS_COMPACTION_SEGMENTS)
    Compact {
        paths: Vec<PathBuf>,
    },

    /// Print the swarm state document
    State,

    /// List tasks in the ledger
    Tasks {
        /// Only tasks with this status
        #[arg(long, value_parser = parse_status)]
        status: Option<TaskStatus>,
    },

    /// Return messages orphaned in an agent's processing/ to pending/
    Recover {
        agent: String,

        /// Only messages claimed at least this long ago
        #[arg(long, default_value_t = 300)]
        older_than_secs: u64,
    },

    /// Run the enabled background workers (stall monitor, compaction)
    Watch {
        /// Stop after this many seconds instead of running until killed
        #[arg(long)]
        for_secs: Option<u64>,
    },

    /// Add an agent to the registry so it may publish swarm state
    Register {
        agent: String,

        /// Capability advertised by the agent (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
}

fn parse_policy(raw: &str) -> std::result::Result<StallPolicy, String> {
    StallPolicy::parse(raw).ok_or_else(|| {
        format!("unknown policy {raw:?} (expected log_only, mark_stalled, reassign, escalate)")
    })
}

fn parse_status(raw: &str) -> std::result::Result<TaskStatus, String> {
    TaskStatus::parse(raw).ok_or_else(|| {
        let known: Vec<&str> = TaskStatus::ALL.iter().map(|s| s.as_str()).collect();
        format!("unknown status {raw:?} (expected one of {})", known.join(", "))
    })
}

fn print_json(value: &Value) -> Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

fn outcome_json(path: &std::path::Path, outcome: Result<CompactionOutcome>) -> Value {
    let path = path.display().to_string();
    match outcome {
        Ok(CompactionOutcome::Compacted { before, after }) => {
            json!({"path": path, "outcome": "compacted", "before": before, "after": after})
        }
        Ok(CompactionOutcome::NotTriggered) => json!({"path": path, "outcome": "not_triggered"}),
        Ok(CompactionOutcome::Missing) => json!({"path": path, "outcome": "missing"}),
        Ok(CompactionOutcome::SkippedMalformed) => {
            json!({"path": path, "outcome": "skipped_malformed"})
        }
        Err(e) => json!({"path": path, "outcome": "error", "error_type": e.error_type(), "error": e.to_string()}),
    }
}

fn watch(config: &Config, for_secs: Option<u64>) -> Result<()> {
    let stop = StopSignal::new();
    let mut workers = Vec::new();
    if config.stall_monitor_enabled {
        workers.push(StallMonitor::from_config(config).spawn(stop.clone())?);
    }
    if config.compaction_enabled && !config.compaction_segments.is_empty() {
        workers.push(CompactionWorker::from_config(config).spawn(stop.clone())?);
    }
    if workers.is_empty() {
        tracing::warn!("no workers enabled (SWARMFS_STALL_ENABLED / SWARMFS_COMPACTION_ENABLED)");
        return Ok(());
    }
    tracing::info!(workers = workers.len(), "watching");
    match for_secs {
        Some(secs) => {
            let _ = stop.wait_timeout(Duration::from_secs(secs));
        }
        // Locks are released by the OS when the process is killed.
        None => while !stop.wait_timeout(Duration::from_secs(3600)) {},
    }
    for worker in workers {
        worker.join();
    }
    Ok(())
}

fn run(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Sweep {
            policy,
            timeout_secs,
        } => {
            let mut monitor_config = StallMonitorConfig::from_config(config);
            if let Some(policy) = policy {
                monitor_config.policy = policy;
            }
            if let Some(secs) = timeout_secs {
                monitor_config.pending_timeout = Duration::from_secs(secs);
            }
            let monitor = StallMonitor::new(TaskLedger::from_config(config), monitor_config);
            let report = monitor.sweep()?;
            print_json(&serde_json::to_value(report)?)
        }
        Commands::Compact { paths } => {
            let paths = if paths.is_empty() {
                config.compaction_segments.clone()
            } else {
                paths
            };
            let compactor = MemoryCompactor::from_config(config);
            let results: Vec<Value> = paths
                .iter()
                .map(|path| outcome_json(path, compactor.compact(path)))
                .collect();
            print_json(&Value::Array(results))
        }
        Commands::State => {
            let registry = Arc::new(AgentRegistry::from_config(config)?);
            let sync = SwarmStateSync::from_config(config, registry);
            print_json(&Value::Object(sync.read_swarm_state()))
        }
        Commands::Tasks { status } => {
            let tasks = TaskLedger::from_config(config).list(status)?;
            print_json(&serde_json::to_value(tasks)?)
        }
        Commands::Recover {
            agent,
            older_than_secs,
        } => {
            let recovered = Mailbox::from_config(config)
                .recover_processing(&agent, Duration::from_secs(older_than_secs))?;
            print_json(&json!({"agent_id": agent, "recovered": recovered}))
        }
        Commands::Watch { for_secs } => watch(config, for_secs),
        Commands::Register {
            agent,
            capabilities,
        } => {
            let registry = AgentRegistry::from_config(config)?;
            let mut identity = AgentIdentity::new(agent);
            identity.capabilities = capabilities;
            let value = serde_json::to_value(&identity)?;
            registry.register(identity)?;
            registry.close();
            print_json(&value)
        }
    }
}

fn main() {
    let config = Config::from_env();

    // RUST_LOG wins; otherwise SWARMFS_LOG_LEVEL.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.verbose {
        tracing::info!("Configuration loaded: {:?}", config);
    }

    if let Err(e) = run(cli.command, &config) {
        tracing::error!(error_type = e.error_type(), "{e}");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
