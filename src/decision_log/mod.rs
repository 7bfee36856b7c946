use crate::command::{Command, RejectionRecord, ValidatedCommand};
use crate::context::ContextSummary;
use crate::state::SnapshotSummary;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::info;
use uuid::Uuid;


/// Decision log configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionLogConfig {
    /// JSON-lines file to append cycle records to; unset logs via tracing
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// What started a decision cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    /// An unconsumed HIGH/CRITICAL event cut the batching delay short
    Urgent,
    /// The batch interval elapsed
    Interval,
    /// Too many events queued up during the interval
    QueueFull,
}

/// What the provider gave back this cycle
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProviderOutcome {
    Decided {
        commands: Vec<Command>,
        diagnostic: String,
    },
    Failed {
        error: String,
    },
}

/// A validated command the actuation boundary refused
#[derive(Clone, Debug, Serialize)]
pub struct ActuationFailure {
    pub command: Command,
    pub reason: String,
}

/// Everything needed to reconstruct why a cycle did what it did
#[derive(Clone, Debug, Serialize)]
pub struct CycleRecord {
    pub cycle_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub trigger: CycleTrigger,
    pub snapshot: SnapshotSummary,
    /// Context descriptions shown to the provider, chronological
    pub context: Vec<String>,
    pub context_summary: ContextSummary,
    pub provider: ProviderOutcome,
    pub accepted: Vec<ValidatedCommand>,
    pub rejected: Vec<RejectionRecord>,
    pub fallback_used: bool,
    pub actuation_failures: Vec<ActuationFailure>,
}

/// Destination for cycle records.
///
/// A failing sink is logged by the dispatch loop and never stops it.
pub trait DecisionLogSink: Send + Sync {
    fn record(&self, record: &CycleRecord) -> Result<()>;
}

/// Sink that emits one structured tracing event per cycle
#[derive(Debug, Default)]
pub struct TracingDecisionLog;

impl DecisionLogSink for TracingDecisionLog {
    fn record(&self, record: &CycleRecord) -> Result<()> {
        let provider = match &record.provider {
            ProviderOutcome::Decided { commands, .. } => format!("{} proposed", commands.len()),
            ProviderOutcome::Failed { error } => error.clone(),
        };

        info!(
            cycle_id = %record.cycle_id,
            trigger = ?record.trigger,
            devices = record.snapshot.device_count,
            context = record.context.len(),
            provider = %provider,
            accepted = record.accepted.len(),
            rejected = record.rejected.len(),
            fallback = record.fallback_used,
            actuation_failures = record.actuation_failures.len(),
            "Decision cycle recorded"
        );
        Ok(())
    }
}

/// Sink that appends one JSON object per line to a file
pub struct JsonlDecisionLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlDecisionLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("Failed to create decision log directory")?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open decision log {}", path.display()))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DecisionLogSink for JsonlDecisionLog {
    fn record(&self, record: &CycleRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("Failed to serialize cycle record")?;
        line.push('\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())
            .context("Failed to append cycle record")?;
        file.flush().context("Failed to flush decision log")?;
        Ok(())
    }
}

/// Sink that keeps records in memory
#[derive(Debug, Default)]
pub struct MemoryDecisionLog {
    records: Mutex<Vec<CycleRecord>>,
}

impl MemoryDecisionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CycleRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DecisionLogSink for MemoryDecisionLog {
    fn record(&self, record: &CycleRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

/// Sink selected by configuration
pub fn open_sink(config: &DecisionLogConfig) -> Result<Box<dyn DecisionLogSink>> {
    match &config.path {
        Some(path) => Ok(Box::new(JsonlDecisionLog::open(path)?)),
        None => Ok(Box::new(TracingDecisionLog)),
    }
}
