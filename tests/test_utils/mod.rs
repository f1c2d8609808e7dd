//! Fixtures shared by the sessiontap integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sessiontap::adapters::{claude::encode_project_dir, AgentAdapter, ClaudeAdapter};
use sessiontap::config::{Config, MonitoringConfig};
use sessiontap::data::{Correlation, Session};
use sessiontap::processors::{ParsedLog, ProcessingContext};
use sessiontap::store::sync_state::initialize_cursors;
use sessiontap::store::StoreLayout;
use sessiontap::transport::{Payload, SendOutcome, Transport};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const AGENT_SESSION: &str = "6f1d2c3b-9a8e-4f70-8d21-0c5b4a3e2f10";
pub const OTHER_AGENT_SESSION: &str = "a4c0e8d2-1b7f-4e39-9c65-3d2f1e0b9a87";

// =============================================================================
// Claude log lines
// =============================================================================

pub fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

pub fn user_line(cwd: &Path, uuid: &str, text: &str, branch: &str) -> String {
    json!({
        "type": "user",
        "uuid": uuid,
        "sessionId": AGENT_SESSION,
        "timestamp": ts(Utc::now()),
        "cwd": cwd,
        "gitBranch": branch,
        "message": {"role": "user", "content": text}
    })
    .to_string()
}

pub fn assistant_line(cwd: &Path, uuid: &str, message_id: &str, branch: &str) -> String {
    assistant_line_with(cwd, uuid, message_id, branch, json!([{"type": "text", "text": "ok"}]))
}

pub fn assistant_line_with(
    cwd: &Path,
    uuid: &str,
    message_id: &str,
    branch: &str,
    content: Value,
) -> String {
    json!({
        "type": "assistant",
        "uuid": uuid,
        "sessionId": AGENT_SESSION,
        "timestamp": ts(Utc::now()),
        "cwd": cwd,
        "gitBranch": branch,
        "message": {
            "id": message_id,
            "role": "assistant",
            "model": "claude-sonnet-4",
            "content": content,
            "usage": {"input_tokens": 12, "output_tokens": 7}
        }
    })
    .to_string()
}

pub fn clear_line(cwd: &Path, uuid: &str, at: DateTime<Utc>) -> String {
    json!({
        "type": "user",
        "uuid": uuid,
        "timestamp": ts(at),
        "cwd": cwd,
        "message": {"role": "user", "content": "<command-name>/clear</command-name>"}
    })
    .to_string()
}

// =============================================================================
// Workspace fixture
// =============================================================================

/// Temp tree holding a fake `~/.claude/projects`, a data dir and a working dir
pub struct Fixture {
    _temp: TempDir,
    pub projects: PathBuf,
    pub data: PathBuf,
    pub workdir: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let projects = temp.path().join("projects");
        let data = temp.path().join("data");
        let workdir = temp.path().join("work").join("app");
        std::fs::create_dir_all(&projects).unwrap();
        std::fs::create_dir_all(&workdir).unwrap();
        Self {
            _temp: temp,
            projects,
            data,
            workdir,
        }
    }

    pub fn adapter(&self) -> Arc<dyn AgentAdapter> {
        Arc::new(ClaudeAdapter::with_root(&self.projects))
    }

    pub fn layout(&self) -> StoreLayout {
        StoreLayout::new(&self.data)
    }

    /// Where the agent writes logs for `workdir`
    pub fn log_dir(&self) -> PathBuf {
        self.projects.join(encode_project_dir(&self.workdir))
    }

    pub fn log_path(&self, agent_session_id: &str) -> PathBuf {
        self.log_dir().join(format!("{}.jsonl", agent_session_id))
    }

    /// Append complete lines to an agent log, creating it if needed.
    pub fn append(&self, agent_session_id: &str, lines: &[String]) -> PathBuf {
        let path = self.log_path(agent_session_id);
        std::fs::create_dir_all(self.log_dir()).unwrap();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        path
    }

    /// A persisted session correlated with `log` and ready to sync.
    pub fn correlated_session(&self, agent_session_id: &str) -> Session {
        let mut session = Session::new("claude", "anthropic", self.workdir.clone());
        session.start_time = Utc::now() - chrono::Duration::seconds(60);
        session.correlation =
            Correlation::matched(agent_session_id.to_string(), self.log_path(agent_session_id), 1);
        initialize_cursors(&mut session);
        self.layout().session_store().save(&session).unwrap();
        session
    }

    pub fn load(&self, session_id: &str) -> Session {
        self.layout()
            .session_store()
            .load(session_id)
            .unwrap()
            .expect("session exists")
    }

    pub fn parsed_log(&self, session_id: &str, agent_session_id: &str) -> ParsedLog {
        let path = self.log_path(agent_session_id);
        let parsed = self.adapter().parse_session_file(&path, session_id).unwrap();
        ParsedLog {
            path,
            session_id: session_id.to_string(),
            parsed,
        }
    }
}

/// Monitoring timings that keep tests fast
pub fn fast_monitoring() -> MonitoringConfig {
    MonitoringConfig {
        debounce_ms: 50,
        discovery_interval_secs: 3_600,
        settle_delay_ms: 0,
        correlation_attempts: 3,
        correlation_retry_delay_ms: 10,
        correlation_backoff: false,
        idle_timeout_secs: 3_600,
    }
}

pub fn context(transport: Arc<RecordingTransport>, dry_run: bool) -> ProcessingContext {
    ProcessingContext::new(&Config::default(), dry_run, transport)
}

// =============================================================================
// Transport double
// =============================================================================

type FailWhen = Box<dyn Fn(&Payload) -> bool + Send + Sync>;

/// Records every payload; optionally slow, optionally failing some sends
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Payload>>,
    delay: Option<Duration>,
    fail_when: Option<FailWhen>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn failing(when: impl Fn(&Payload) -> bool + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            fail_when: Some(Box::new(when)),
            ..Default::default()
        })
    }

    pub fn sent(&self) -> Vec<Payload> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, prefix: &str) -> Vec<Payload> {
        self.sent()
            .into_iter()
            .filter(|p| p.endpoint.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, payload: &Payload) -> SendOutcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().unwrap().push(payload.clone());
        match &self.fail_when {
            Some(fail) if fail(payload) => SendOutcome::failed("HTTP 503"),
            _ => SendOutcome::ok("HTTP 200"),
        }
    }
}
