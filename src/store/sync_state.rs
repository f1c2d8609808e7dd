//! Cursor bookkeeping on top of [`SessionStore`]
//!
//! Each processor owns one cursor block inside `Session.sync`. A missing
//! block means the stream was never initialized and callers treat it as
//! "nothing to do yet".

use super::session_store::SessionStore;
use crate::data::{ConversationSyncState, MetricsSyncState, Session};
use anyhow::Result;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct SyncStateTracker {
    store: SessionStore,
}

/// What one collection pass consumed from the agent log
#[derive(Debug, Clone, Default)]
pub struct MetricsAdvance {
    /// Log line ids consumed by the pass
    pub record_ids: Vec<String>,
    /// Deltas appended to the stream by the pass
    pub new_deltas: usize,
    pub attached_prompts: Vec<String>,
    pub last_position: usize,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl SyncStateTracker {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn metrics_cursor(&self, session_id: &str) -> Result<Option<MetricsSyncState>> {
        Ok(self
            .store
            .load(session_id)?
            .and_then(|s| s.sync.metrics))
    }

    pub fn conversation_cursor(&self, session_id: &str) -> Result<Option<ConversationSyncState>> {
        Ok(self
            .store
            .load(session_id)?
            .and_then(|s| s.sync.conversations))
    }

    /// Create empty cursors if absent. Existing cursors are left alone.
    pub fn initialize(&self, session_id: &str) -> Result<()> {
        self.store.update(session_id, initialize_cursors)?;
        Ok(())
    }

    /// Record a successful metrics send of `synced` deltas.
    pub fn record_metrics_sync(&self, session_id: &str, synced: usize) -> Result<()> {
        self.store.update(session_id, |session| {
            if let Some(cursor) = session.sync.metrics.as_mut() {
                cursor.synced_deltas += synced as u64;
                cursor.last_sync_at = Some(Utc::now());
            }
        })?;
        Ok(())
    }

    /// Persist a conversation cursor as a whole.
    pub fn save_conversation_cursor(
        &self,
        session_id: &str,
        cursor: ConversationSyncState,
    ) -> Result<()> {
        self.store.update(session_id, |session| {
            session.sync.conversations = Some(cursor);
        })?;
        Ok(())
    }
}

pub fn initialize_cursors(session: &mut Session) {
    if session.sync.metrics.is_none() {
        session.sync.metrics = Some(MetricsSyncState::default());
    }
    if session.sync.conversations.is_none() {
        session.sync.conversations = Some(ConversationSyncState::default());
    }
}

/// Fold a collection pass into the metrics cursor.
///
/// The processed-id set only grows and the line position never moves
/// backwards. Returns false when the cursor is not initialized.
pub fn advance_metrics(session: &mut Session, advance: &MetricsAdvance) -> bool {
    let Some(cursor) = session.sync.metrics.as_mut() else {
        return false;
    };

    cursor
        .processed_record_ids
        .extend(advance.record_ids.iter().cloned());
    cursor.total_deltas += advance.new_deltas as u64;
    cursor
        .attached_prompts
        .extend(advance.attached_prompts.iter().cloned());
    cursor.last_processed_line = cursor.last_processed_line.max(advance.last_position);
    if let Some(ts) = advance.last_timestamp {
        cursor.last_processed_timestamp = Some(
            cursor
                .last_processed_timestamp
                .map_or(ts, |existing| existing.max(ts)),
        );
    }
    true
}
