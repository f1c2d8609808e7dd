//! Pluggable per-agent log adapters
//!
//! An adapter knows where one coding agent writes its session logs, how to
//! tell whether a log belongs to a local session, and how to turn the log
//! into normalized records. Everything agent-specific stays behind these
//! traits.

pub mod claude;

pub use claude::ClaudeAdapter;

use crate::correlation::CorrelationParams;
use crate::data::{FileEntry, MetricsDelta, ParsedSession};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Result of one incremental parse of an agent log
#[derive(Debug, Clone, Default)]
pub struct IncrementalMetrics {
    /// New deltas in log order; none of them is in the processed-id set
    pub deltas: Vec<MetricsDelta>,
    /// Ids of every log line folded into `deltas`
    pub consumed_ids: Vec<String>,
    /// Number of complete lines in the log at parse time
    pub last_position: usize,
    /// Prompt texts attached to a delta for the first time in this pass
    pub newly_attached_prompts: Vec<String>,
}

impl IncrementalMetrics {
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.deltas.iter().map(|d| d.timestamp).max()
    }
}

pub trait AgentAdapter: Send + Sync {
    /// Short agent name stored on sessions (e.g. "claude")
    fn name(&self) -> &str;

    fn provider(&self) -> &str;

    /// Directory the agent writes logs to for a session started in `working_directory`.
    fn session_root(&self, working_directory: &Path) -> PathBuf;

    /// Root under which every log of this agent can be found.
    fn discovery_root(&self) -> PathBuf;

    /// How long to wait after spawning before the log is expected to exist.
    fn settle_delay(&self) -> Option<Duration> {
        None
    }

    /// Whether `path` looks like a session log of this agent.
    fn matches_session_pattern(&self, path: &Path) -> bool;

    /// Agent session id if `candidate` belongs to the session in `params`.
    fn match_session(&self, candidate: &FileEntry, params: &CorrelationParams) -> Option<String>;

    /// Deltas for records not yet in `processed_ids`.
    ///
    /// User prompts in `processed_prompts` were attached to an earlier delta
    /// and must not be attached again.
    fn parse_incremental_metrics(
        &self,
        log_path: &Path,
        processed_ids: &BTreeSet<String>,
        processed_prompts: &BTreeSet<String>,
    ) -> Result<IncrementalMetrics>;

    /// Full transcript of a log.
    fn parse_session_file(&self, path: &Path, session_id: &str) -> Result<ParsedSession>;

    /// Session-end detection, for agents that can reset mid-run.
    fn lifecycle(&self) -> Option<&dyn LifecycleAdapter> {
        None
    }
}

pub trait LifecycleAdapter: Send + Sync {
    /// When the agent's logical session ended after `started_at`, if it did.
    fn detect_session_end(
        &self,
        agent_session_id: &str,
        started_at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>>;
}

/// Adapter for an agent name given on the command line.
pub fn for_agent(name: &str) -> Result<Arc<dyn AgentAdapter>> {
    match name {
        "claude" | "claude-code" => Ok(Arc::new(ClaudeAdapter::new()?)),
        other => bail!("Unsupported agent: {}", other),
    }
}
