//! Incremental delta collection for one session
//!
//! Every trigger (debounced file change, discovery tick, final flush, the
//! metrics processor) funnels into [`collect_deltas`]. It holds the session
//! lock for the whole pass so the cursor and the delta stream move together.

use crate::adapters::AgentAdapter;
use crate::data::MetricsDelta;
use crate::store::sync_state::{advance_metrics, MetricsAdvance};
use crate::store::{AppendLog, SessionStore, StoreLayout, SyncRecord};
use crate::util::{run_blocking, RunGuard};
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOutcome {
    /// Session or metrics cursor does not exist yet
    NotInitialized,
    /// No agent log has been matched to the session
    NotCorrelated,
    /// Another pass was in flight; this trigger was dropped
    Busy,
    /// Session already finished; late triggers must not extend its stream
    Closed,
    NoChanges,
    Collected { new: usize, position: usize },
}

/// One collection pass. Blocking; run off the async runtime.
pub fn collect_deltas(
    adapter: &dyn AgentAdapter,
    store: &SessionStore,
    metrics_log: &AppendLog<MetricsDelta>,
    session_id: &str,
) -> Result<CollectOutcome> {
    let _lock = store.lock(session_id)?;
    let Some(mut session) = store.load(session_id)? else {
        return Ok(CollectOutcome::NotInitialized);
    };
    if session.status.is_terminal() {
        tracing::debug!(session_id, status = ?session.status, "Session closed, not collecting");
        return Ok(CollectOutcome::Closed);
    }
    let Some(cursor) = &session.sync.metrics else {
        return Ok(CollectOutcome::NotInitialized);
    };
    let log_path = match &session.correlation.agent_session_file {
        Some(path) if session.correlation.is_matched() => path.clone(),
        _ => return Ok(CollectOutcome::NotCorrelated),
    };
    if !log_path.exists() {
        tracing::debug!(session_id, path = %log_path.display(), "Agent log not present yet");
        return Ok(CollectOutcome::NoChanges);
    }

    let parsed = adapter
        .parse_incremental_metrics(
            &log_path,
            &cursor.processed_record_ids,
            &cursor.attached_prompts,
        )
        .with_context(|| format!("Failed to parse {}", log_path.display()))?;
    let position = parsed.last_position;

    if parsed.deltas.is_empty() {
        if position > cursor.last_processed_line {
            let advance = MetricsAdvance {
                last_position: position,
                ..Default::default()
            };
            advance_metrics(&mut session, &advance);
            store.save(&session)?;
        }
        return Ok(CollectOutcome::NoChanges);
    }

    let last_timestamp = parsed.last_timestamp();

    // A crash after the append but before the cursor save replays the same
    // records next pass; they are already in the stream.
    let already_logged: HashSet<String> = metrics_log
        .read_all(session_id)?
        .iter()
        .map(|d| d.record_id().to_string())
        .collect();
    let deltas: Vec<MetricsDelta> = parsed
        .deltas
        .into_iter()
        .filter(|d| !already_logged.contains(&d.record_id))
        .map(|mut d| {
            d.session_id = session_id.to_string();
            d
        })
        .collect();
    let new = deltas.len();
    metrics_log.append_all(session_id, &deltas)?;

    let advance = MetricsAdvance {
        record_ids: parsed.consumed_ids,
        new_deltas: new,
        attached_prompts: parsed.newly_attached_prompts,
        last_position: position,
        last_timestamp,
    };
    advance_metrics(&mut session, &advance);
    session.mark_active(Utc::now());
    store.save(&session)?;

    tracing::debug!(session_id, new, position, "Collected metrics deltas");
    Ok(CollectOutcome::Collected { new, position })
}

/// Guarded collector bound to one session
pub struct DeltaCollector {
    adapter: Arc<dyn AgentAdapter>,
    store: SessionStore,
    metrics_log: AppendLog<MetricsDelta>,
    session_id: String,
    guard: RunGuard,
}

impl DeltaCollector {
    pub fn new(adapter: Arc<dyn AgentAdapter>, layout: &StoreLayout, session_id: &str) -> Self {
        Self {
            adapter,
            store: layout.session_store(),
            metrics_log: layout.metrics_log(),
            session_id: session_id.to_string(),
            guard: RunGuard::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn run(&self) -> Result<CollectOutcome> {
        collect_deltas(
            self.adapter.as_ref(),
            &self.store,
            &self.metrics_log,
            &self.session_id,
        )
    }

    /// Collect unless a pass is already running.
    pub fn try_collect(&self) -> Result<CollectOutcome> {
        match self.guard.try_acquire() {
            Some(_token) => self.run(),
            None => Ok(CollectOutcome::Busy),
        }
    }

    /// Wait for any in-flight pass, then collect.
    pub fn collect_blocking(&self) -> Result<CollectOutcome> {
        let _token = self.guard.acquire_blocking();
        self.run()
    }

    /// [`DeltaCollector::try_collect`] on the blocking pool.
    pub async fn collect(self: &Arc<Self>) -> Result<CollectOutcome> {
        let this = Arc::clone(self);
        run_blocking(move || this.try_collect()).await
    }

    /// [`DeltaCollector::collect_blocking`] on the blocking pool.
    pub async fn collect_forced(self: &Arc<Self>) -> Result<CollectOutcome> {
        let this = Arc::clone(self);
        run_blocking(move || this.collect_blocking()).await
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ClaudeAdapter;
    use crate::data::{Correlation, Session, SessionStatus, SyncStatus};
    use crate::store::sync_state::initialize_cursors;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const AGENT_SESSION: &str = "7c1e2d3f-4a5b-4c6d-8e9f-0a1b2c3d4e5f";

    fn assistant_line(msg_id: &str) -> String {
        message_line(&format!("uuid-{}", msg_id), msg_id, json!([]), 1)
    }

    fn message_line(uuid: &str, msg_id: &str, content: serde_json::Value, output: u64) -> String {
        json!({
            "type": "assistant",
            "uuid": uuid,
            "sessionId": AGENT_SESSION,
            "timestamp": "2025-01-01T00:00:01Z",
            "cwd": "/work",
            "message": {
                "id": msg_id,
                "content": content,
                "usage": {"input_tokens": 1, "output_tokens": output}
            }
        })
        .to_string()
            + "\n"
    }

    fn setup(temp_dir: &TempDir, initialize: bool) -> (StoreLayout, Session, PathBuf) {
        let layout = StoreLayout::new(temp_dir.path().join("data"));
        let log_path = temp_dir.path().join(format!("{}.jsonl", AGENT_SESSION));
        std::fs::write(&log_path, "").unwrap();

        let mut session = Session::new("claude", "anthropic", PathBuf::from("/work"));
        session.correlation = Correlation::matched(AGENT_SESSION.to_string(), log_path.clone(), 1);
        if initialize {
            initialize_cursors(&mut session);
        }
        layout.session_store().save(&session).unwrap();
        (layout, session, log_path)
    }

    fn append(path: &Path, line: &str) {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(line.as_bytes()).unwrap();
    }

    #[test]
    fn test_uninitialized_cursor_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let (layout, session, log_path) = setup(&temp_dir, false);
        append(&log_path, &assistant_line("m1"));
        let adapter = ClaudeAdapter::with_root(temp_dir.path());

        let outcome = collect_deltas(
            &adapter,
            &layout.session_store(),
            &layout.metrics_log(),
            &session.session_id,
        )
        .unwrap();

        assert_eq!(outcome, CollectOutcome::NotInitialized);
        assert!(layout.metrics_log().read_all(&session.session_id).unwrap().is_empty());
    }

    #[test]
    fn test_collects_only_new_records() {
        let temp_dir = TempDir::new().unwrap();
        let (layout, session, log_path) = setup(&temp_dir, true);
        let adapter: Arc<dyn AgentAdapter> = Arc::new(ClaudeAdapter::with_root(temp_dir.path()));
        let collector = DeltaCollector::new(adapter, &layout, &session.session_id);

        append(&log_path, &assistant_line("m1"));
        assert_eq!(
            collector.try_collect().unwrap(),
            CollectOutcome::Collected { new: 1, position: 1 }
        );
        assert_eq!(collector.try_collect().unwrap(), CollectOutcome::NoChanges);

        append(&log_path, &assistant_line("m2"));
        assert_eq!(
            collector.try_collect().unwrap(),
            CollectOutcome::Collected { new: 1, position: 2 }
        );

        let deltas = layout.metrics_log().read_all(&session.session_id).unwrap();
        let ids: Vec<&str> = deltas.iter().map(|d| d.record_id.as_str()).collect();
        assert_eq!(ids, vec!["uuid-m1", "uuid-m2"]);
        assert!(deltas.iter().all(|d| d.session_id == session.session_id));
        assert!(deltas.iter().all(|d| d.sync_status == SyncStatus::Pending));

        let stored = layout.session_store().load(&session.session_id).unwrap().unwrap();
        let cursor = stored.sync.metrics.unwrap();
        assert_eq!(cursor.total_deltas, 2);
        assert_eq!(cursor.last_processed_line, 2);
        assert!(stored.activity_started_at.is_some());
    }

    #[test]
    fn test_replay_after_lost_cursor_does_not_duplicate() {
        let temp_dir = TempDir::new().unwrap();
        let (layout, session, log_path) = setup(&temp_dir, true);
        let adapter = ClaudeAdapter::with_root(temp_dir.path());
        append(&log_path, &assistant_line("m1"));

        // Stream already holds the delta, but the cursor save never happened
        let mut orphan = adapter
            .parse_incremental_metrics(&log_path, &Default::default(), &Default::default())
            .unwrap()
            .deltas;
        orphan[0].session_id = session.session_id.clone();
        layout.metrics_log().append_all(&session.session_id, &orphan).unwrap();

        let outcome = collect_deltas(
            &adapter,
            &layout.session_store(),
            &layout.metrics_log(),
            &session.session_id,
        )
        .unwrap();

        assert_eq!(outcome, CollectOutcome::Collected { new: 0, position: 1 });
        assert_eq!(layout.metrics_log().read_all(&session.session_id).unwrap().len(), 1);
    }

    #[test]
    fn test_busy_guard_drops_trigger() {
        let temp_dir = TempDir::new().unwrap();
        let (layout, session, _) = setup(&temp_dir, true);
        let adapter: Arc<dyn AgentAdapter> = Arc::new(ClaudeAdapter::with_root(temp_dir.path()));
        let collector = DeltaCollector::new(adapter, &layout, &session.session_id);

        let _held = collector.guard.try_acquire().unwrap();
        assert_eq!(collector.try_collect().unwrap(), CollectOutcome::Busy);
    }

    #[test]
    fn test_message_split_across_passes_keeps_later_lines() {
        let temp_dir = TempDir::new().unwrap();
        let (layout, session, log_path) = setup(&temp_dir, true);
        let adapter: Arc<dyn AgentAdapter> = Arc::new(ClaudeAdapter::with_root(temp_dir.path()));
        let collector = DeltaCollector::new(adapter, &layout, &session.session_id);

        append(
            &log_path,
            &message_line("line-1", "msg_1", json!([{"type": "text", "text": "Editing"}]), 5),
        );
        assert_eq!(
            collector.try_collect().unwrap(),
            CollectOutcome::Collected { new: 1, position: 1 }
        );

        let edit = json!([{"type": "tool_use", "name": "Edit", "input": {"file_path": "/work/a.rs"}}]);
        append(&log_path, &message_line("line-2", "msg_1", edit, 9));
        assert_eq!(
            collector.try_collect().unwrap(),
            CollectOutcome::Collected { new: 1, position: 2 }
        );
        assert_eq!(collector.try_collect().unwrap(), CollectOutcome::NoChanges);

        let deltas = layout.metrics_log().read_all(&session.session_id).unwrap();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[1].record_id, "line-2");
        assert_eq!(deltas[1].tool_calls.get("Edit"), Some(&1));
        assert_eq!(deltas[1].files_modified, vec!["/work/a.rs"]);
        // Only the output growth of the message is reported again
        assert_eq!(deltas[0].tokens.output + deltas[1].tokens.output, 9);
        assert_eq!(deltas[1].tokens.input, 0);

        let cursor = layout
            .session_store()
            .load(&session.session_id)
            .unwrap()
            .unwrap()
            .sync
            .metrics
            .unwrap();
        assert_eq!(cursor.total_deltas, 2);
        assert!(cursor.processed_record_ids.contains("line-1"));
        assert!(cursor.processed_record_ids.contains("line-2"));
    }

    #[test]
    fn test_finished_session_is_not_extended() {
        let temp_dir = TempDir::new().unwrap();
        let (layout, session, log_path) = setup(&temp_dir, true);
        let adapter: Arc<dyn AgentAdapter> = Arc::new(ClaudeAdapter::with_root(temp_dir.path()));
        let collector = DeltaCollector::new(adapter, &layout, &session.session_id);

        layout
            .session_store()
            .update(&session.session_id, |s| {
                s.finish(SessionStatus::Completed, chrono::Utc::now());
            })
            .unwrap();
        append(&log_path, &assistant_line("m1"));

        assert_eq!(collector.try_collect().unwrap(), CollectOutcome::Closed);
        assert!(layout.metrics_log().read_all(&session.session_id).unwrap().is_empty());
    }
}
