//! Session records, cursors and the normalized records extracted from agent logs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// A locally tracked unit of monitored agent work.
///
/// One `Session` exists per wrapped agent run (or per logical agent session
/// when the agent is reset mid-run). It is persisted as a single JSON
/// document keyed by `session_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub agent_name: String,
    pub provider: String,
    #[serde(default)]
    pub project: Option<String>,
    pub working_directory: PathBuf,

    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Start of the currently open activity interval, if any
    #[serde(default)]
    pub activity_started_at: Option<DateTime<Utc>>,
    /// Accumulated working time, excluding idle gaps
    #[serde(default)]
    pub active_duration_ms: u64,

    pub status: SessionStatus,
    #[serde(default)]
    pub correlation: Correlation,
    #[serde(default)]
    pub monitoring: Monitoring,
    #[serde(default)]
    pub sync: SyncState,

    #[serde(default)]
    pub transitioned_to: Option<String>,
    #[serde(default)]
    pub transitioned_from: Option<String>,

    /// Diagnostic context for failures that must not interrupt the agent
    #[serde(default)]
    pub error: Option<SessionError>,
}

impl Session {
    /// Create a fresh `active` session with `pending` correlation.
    pub fn new(agent_name: &str, provider: &str, working_directory: PathBuf) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            agent_name: agent_name.to_string(),
            provider: provider.to_string(),
            project: None,
            working_directory,
            start_time: Utc::now(),
            end_time: None,
            activity_started_at: None,
            active_duration_ms: 0,
            status: SessionStatus::Active,
            correlation: Correlation::default(),
            monitoring: Monitoring::default(),
            sync: SyncState::default(),
            transitioned_to: None,
            transitioned_from: None,
            error: None,
        }
    }

    /// Move to a terminal status.
    ///
    /// Returns false (and leaves the session untouched) if the session
    /// already reached a terminal status.
    pub fn finish(&mut self, status: SessionStatus, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || status == SessionStatus::Active {
            return false;
        }
        self.mark_idle(at);
        self.status = status;
        self.end_time = Some(at);
        self.monitoring.is_active = false;
        true
    }

    /// Open an activity interval if none is open.
    pub fn mark_active(&mut self, at: DateTime<Utc>) {
        if self.activity_started_at.is_none() {
            self.activity_started_at = Some(at);
        }
    }

    /// Close the open activity interval, folding it into `active_duration_ms`.
    pub fn mark_idle(&mut self, at: DateTime<Utc>) {
        if let Some(started) = self.activity_started_at.take() {
            let elapsed = at.signed_duration_since(started).num_milliseconds().max(0);
            self.active_duration_ms += elapsed as u64;
        }
    }

    pub fn record_error(&mut self, phase: &str, message: impl Into<String>) {
        self.error = Some(SessionError {
            phase: phase.to_string(),
            message: message.into(),
            occurred_at: Utc::now(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Recovered,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    /// Terminal status for a wrapped process exit code.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Self::Completed
        } else {
            Self::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationStatus {
    #[default]
    Pending,
    Matched,
    Failed,
}

/// Which agent log file belongs to a session
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Correlation {
    pub status: CorrelationStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub agent_session_id: Option<String>,
    #[serde(default)]
    pub agent_session_file: Option<PathBuf>,
    #[serde(default)]
    pub detected_at: Option<DateTime<Utc>>,
}

impl Correlation {
    pub fn matched(agent_session_id: String, file: PathBuf, retry_count: u32) -> Self {
        Self {
            status: CorrelationStatus::Matched,
            retry_count,
            agent_session_id: Some(agent_session_id),
            agent_session_file: Some(file),
            detected_at: Some(Utc::now()),
        }
    }

    pub fn failed(retry_count: u32) -> Self {
        Self {
            status: CorrelationStatus::Failed,
            retry_count,
            ..Default::default()
        }
    }

    pub fn is_matched(&self) -> bool {
        self.status == CorrelationStatus::Matched
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Monitoring {
    pub is_active: bool,
    pub change_count: u64,
}

/// Per-processor cursor blocks. `None` means the stream was never initialized.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default)]
    pub metrics: Option<MetricsSyncState>,
    #[serde(default)]
    pub conversations: Option<ConversationSyncState>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsSyncState {
    /// Every record id ever collected for this session; only grows
    #[serde(default)]
    pub processed_record_ids: BTreeSet<String>,
    /// User prompts already attached to a delta
    #[serde(default)]
    pub attached_prompts: BTreeSet<String>,
    /// Complete lines of the agent log consumed so far
    #[serde(default)]
    pub last_processed_line: usize,
    #[serde(default)]
    pub last_processed_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_deltas: u64,
    #[serde(default)]
    pub synced_deltas: u64,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConversationSyncState {
    /// Remote conversation id, minted on the first successful sync
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub last_synced_message_id: Option<String>,
    /// Number of transcript messages synced (position fallback cursor)
    #[serde(default)]
    pub last_synced_index: usize,
    #[serde(default)]
    pub synced_messages: u64,
    #[serde(default)]
    pub resets: u32,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionError {
    pub phase: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

// =============================================================================
// Snapshots
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    /// Not every filesystem reports creation time
    pub created_at: Option<DateTime<Utc>>,
}

impl FileEntry {
    /// Creation time, falling back to modification time.
    pub fn born_at(&self) -> DateTime<Utc> {
        self.created_at.unwrap_or(self.modified_at)
    }
}

/// Recursive listing of a directory at one point in time
#[derive(Debug, Clone, PartialEq)]
pub struct FileSnapshot {
    pub files: Vec<FileEntry>,
    pub taken_at: DateTime<Utc>,
}

// =============================================================================
// Telemetry records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_read + self.cache_creation
    }
}

/// One incrementally extracted unit of usage telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsDelta {
    pub record_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub agent_session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens: TokenUsage,
    /// Tool name -> invocation count
    #[serde(default)]
    pub tool_calls: BTreeMap<String, u32>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub user_prompts: Vec<String>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub sync_attempts: u32,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

/// Audit record of one transcript message handed to the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub record_id: String,
    pub conversation_id: String,
    pub index: usize,
    pub role: Role,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub sync_attempts: u32,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Parsed transcripts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub id: String,
    pub index: usize,
    pub role: Role,
    pub timestamp: Option<DateTime<Utc>>,
    pub text: String,
    #[serde(default)]
    pub tool_names: Vec<String>,
    #[serde(default)]
    pub is_sidechain: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub agent_session_id: Option<String>,
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    pub model: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Whole-file parse of an agent log
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedSession {
    pub messages: Vec<ParsedMessage>,
    pub metadata: SessionMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_session_is_active_and_pending() {
        let session = Session::new("claude", "anthropic", PathBuf::from("/work"));
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.correlation.status, CorrelationStatus::Pending);
        assert!(session.sync.metrics.is_none());
    }

    #[test]
    fn test_finish_is_terminal() {
        let mut session = Session::new("claude", "anthropic", PathBuf::from("/work"));
        let now = Utc::now();
        assert!(session.finish(SessionStatus::Completed, now));
        assert!(!session.finish(SessionStatus::Failed, now));
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.end_time, Some(now));
    }

    #[test]
    fn test_finish_rejects_active() {
        let mut session = Session::new("claude", "anthropic", PathBuf::from("/work"));
        assert!(!session.finish(SessionStatus::Active, Utc::now()));
        assert!(session.end_time.is_none());
    }

    #[test]
    fn test_activity_accounting() {
        let mut session = Session::new("claude", "anthropic", PathBuf::from("/work"));
        let t0 = Utc::now();
        session.mark_active(t0);
        // Second mark does not move the interval start
        session.mark_active(t0 + Duration::seconds(5));
        session.mark_idle(t0 + Duration::seconds(10));
        assert_eq!(session.active_duration_ms, 10_000);

        // Idle without an open interval is a no-op
        session.mark_idle(t0 + Duration::seconds(60));
        assert_eq!(session.active_duration_ms, 10_000);
    }

    #[test]
    fn test_status_from_exit_code() {
        assert_eq!(SessionStatus::from_exit_code(0), SessionStatus::Completed);
        assert_eq!(SessionStatus::from_exit_code(1), SessionStatus::Failed);
        assert_eq!(SessionStatus::from_exit_code(-9), SessionStatus::Failed);
    }

    #[test]
    fn test_session_deserializes_without_optional_blocks() {
        let json = r#"{
            "session_id": "s1",
            "agent_name": "claude",
            "provider": "anthropic",
            "working_directory": "/work",
            "start_time": "2025-01-01T00:00:00Z",
            "status": "active"
        }"#;
        let session: Session = serde_json::from_str(json).unwrap();
        assert_eq!(session.correlation, Correlation::default());
        assert_eq!(session.sync, SyncState::default());
    }
}
