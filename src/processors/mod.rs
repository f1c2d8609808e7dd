//! Independent consumers of one parsed agent log
//!
//! Each processor turns the same [`ParsedLog`] into its own output stream
//! and keeps its own cursor in the session's `sync` block. Processors share
//! nothing mutable; the coordinator runs them in ascending [`Processor::priority`].

pub mod conversations;
pub mod metrics;

pub use conversations::ConversationsProcessor;
pub use metrics::MetricsProcessor;

use crate::config::Config;
use crate::data::ParsedSession;
use crate::transport::{Payload, SendOutcome, Transport};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// One agent log, parsed once per pass and shared by every processor
#[derive(Debug, Clone)]
pub struct ParsedLog {
    pub path: PathBuf,
    /// Local session that owns the log
    pub session_id: String,
    pub parsed: ParsedSession,
}

/// Immutable per-pass settings
#[derive(Clone)]
pub struct ProcessingContext {
    pub api_base_url: String,
    pub auth_token: Option<String>,
    pub client_id: String,
    pub dry_run: bool,
    pub transport: Arc<dyn Transport>,
}

impl ProcessingContext {
    pub fn new(config: &Config, dry_run: bool, transport: Arc<dyn Transport>) -> Self {
        Self {
            api_base_url: config.api.base_url.clone(),
            auth_token: config.api.token.clone(),
            client_id: config.api.client_id.clone(),
            dry_run,
            transport,
        }
    }

    /// Send through the transport, or only log it in dry-run mode.
    pub async fn deliver(&self, payload: &Payload) -> SendOutcome {
        if self.dry_run {
            tracing::info!(
                endpoint = %payload.endpoint,
                body = %payload.body,
                "Dry run: payload not sent"
            );
            return SendOutcome::ok("dry run");
        }
        self.transport.send(payload).await
    }
}

impl std::fmt::Debug for ProcessingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingContext")
            .field("api_base_url", &self.api_base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("client_id", &self.client_id)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessResult {
    pub success: bool,
    pub message: String,
    pub metadata: Map<String, Value>,
}

impl ProcessResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            metadata: Map::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            metadata: Map::new(),
        }
    }

    /// Nothing to do (busy, not initialized, no new records).
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::ok(reason).with("skipped", true)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn is_skipped(&self) -> bool {
        self.metadata.get("skipped") == Some(&Value::Bool(true))
    }
}

#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first
    fn priority(&self) -> u32;

    /// Process what is new in `log` since this processor's cursor.
    ///
    /// A call arriving while another is in flight on the same instance
    /// returns a skipped success immediately.
    async fn process(&self, log: &ParsedLog, ctx: &ProcessingContext) -> ProcessResult;
}
