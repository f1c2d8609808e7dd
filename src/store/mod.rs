//! Durable per-session state
//!
//! Layout under the data directory:
//!
//! ```text
//! <data_dir>/
//! ├── sessions/
//! │   ├── <session_id>.json       <- one Session record
//! │   └── <session_id>.lock       <- fs2 lock for read-modify-write
//! ├── metrics/
//! │   └── <session_id>.jsonl      <- MetricsDelta stream
//! └── conversations/
//!     └── <session_id>.jsonl      <- ConversationRecord stream
//! ```

pub mod append_log;
pub mod atomic;
pub mod session_store;
pub mod sync_state;

pub use append_log::{AppendLog, SyncRecord};
pub use session_store::{SessionLock, SessionStore};
pub use sync_state::SyncStateTracker;

use crate::data::{ConversationRecord, MetricsDelta};
use std::path::{Path, PathBuf};

/// Resolves every durable path from a single root.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn metrics_dir(&self) -> PathBuf {
        self.root.join("metrics")
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.root.join("conversations")
    }

    pub fn session_store(&self) -> SessionStore {
        SessionStore::new(self.sessions_dir())
    }

    pub fn metrics_log(&self) -> AppendLog<MetricsDelta> {
        AppendLog::new(self.metrics_dir())
    }

    pub fn conversations_log(&self) -> AppendLog<ConversationRecord> {
        AppendLog::new(self.conversations_dir())
    }
}

/// Session ids become file names; anything outside `[A-Za-z0-9_-]` is replaced.
pub(crate) fn file_stem_for(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
