//! Usage metrics: collect new deltas, send them grouped by git branch
//!
//! Cursor: the session's `sync.metrics` block (processed record ids plus a
//! line position). Delivery state lives on each delta in the metrics stream,
//! so a failed group simply stays `pending` for the next pass.

use super::{ParsedLog, ProcessResult, ProcessingContext, Processor};
use crate::adapters::AgentAdapter;
use crate::data::MetricsDelta;
use crate::orchestrator::collector::{collect_deltas, CollectOutcome};
use crate::store::{StoreLayout, SyncStateTracker};
use crate::transport::Payload;
use crate::util::{run_blocking, RunGuard};
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

pub const METRICS_ENDPOINT: &str = "/v1/metrics";

/// Branch groups in flight at once
const MAX_CONCURRENT_GROUPS: usize = 4;

pub struct MetricsProcessor {
    adapter: Arc<dyn AgentAdapter>,
    layout: StoreLayout,
    guard: RunGuard,
}

impl MetricsProcessor {
    pub fn new(adapter: Arc<dyn AgentAdapter>, layout: StoreLayout) -> Self {
        Self {
            adapter,
            layout,
            guard: RunGuard::new(),
        }
    }

    /// Collect whatever the watchers missed, then return every pending delta.
    async fn load_pending(&self, session_id: &str) -> Result<Option<Vec<MetricsDelta>>> {
        let adapter = Arc::clone(&self.adapter);
        let layout = self.layout.clone();
        let session_id = session_id.to_string();

        run_blocking(move || {
            let metrics_log = layout.metrics_log();
            let outcome = collect_deltas(
                adapter.as_ref(),
                &layout.session_store(),
                &metrics_log,
                &session_id,
            )?;
            if outcome == CollectOutcome::NotInitialized {
                return Ok(None);
            }
            metrics_log.pending(&session_id).map(Some)
        })
        .await
    }

    async fn mark_synced(&self, session_id: &str, ids: HashSet<String>) -> Result<usize> {
        let layout = self.layout.clone();
        let session_id = session_id.to_string();

        run_blocking(move || {
            let changed = layout.metrics_log().mark_synced(&session_id, &ids)?;
            SyncStateTracker::new(layout.session_store())
                .record_metrics_sync(&session_id, changed)?;
            Ok(changed)
        })
        .await
    }

    /// Send each branch group, at most [`MAX_CONCURRENT_GROUPS`] at a time.
    async fn deliver_groups(
        &self,
        log: &ParsedLog,
        ctx: &ProcessingContext,
        groups: BTreeMap<Option<String>, Vec<MetricsDelta>>,
    ) -> Vec<(Vec<MetricsDelta>, bool)> {
        let sends = groups.into_iter().map(|(branch, deltas)| {
            let payload = self.payload(log, ctx, branch.as_deref(), &deltas);
            async move {
                let outcome = ctx.deliver(&payload).await;
                if !outcome.success {
                    tracing::warn!(
                        session_id = %log.session_id,
                        branch = branch.as_deref().unwrap_or("-"),
                        deltas = deltas.len(),
                        "Metrics group not delivered: {}",
                        outcome.message
                    );
                }
                (deltas, outcome.success)
            }
        });

        stream::iter(sends)
            .buffer_unordered(MAX_CONCURRENT_GROUPS)
            .collect()
            .await
    }

    fn payload(
        &self,
        log: &ParsedLog,
        ctx: &ProcessingContext,
        branch: Option<&str>,
        deltas: &[MetricsDelta],
    ) -> Payload {
        let records: Vec<serde_json::Value> = deltas
            .iter()
            .map(|d| {
                json!({
                    "record_id": d.record_id,
                    "timestamp": d.timestamp,
                    "model": d.model,
                    "tokens": d.tokens,
                    "tool_calls": d.tool_calls,
                    "files_modified": d.files_modified,
                    "user_prompts": d.user_prompts,
                })
            })
            .collect();

        Payload::new(
            METRICS_ENDPOINT,
            json!({
                "session_id": log.session_id,
                "agent": self.adapter.name(),
                "provider": self.adapter.provider(),
                "agent_session_id": log.parsed.metadata.agent_session_id,
                "git_branch": branch,
                "client_id": ctx.client_id,
                "deltas": records,
            }),
        )
    }
}

#[async_trait]
impl Processor for MetricsProcessor {
    fn name(&self) -> &str {
        "metrics"
    }

    fn priority(&self) -> u32 {
        10
    }

    async fn process(&self, log: &ParsedLog, ctx: &ProcessingContext) -> ProcessResult {
        let Some(_token) = self.guard.try_acquire() else {
            return ProcessResult::skipped("metrics sync already running");
        };

        let pending = match self.load_pending(&log.session_id).await {
            Ok(Some(pending)) => pending,
            Ok(None) => return ProcessResult::skipped("metrics cursor not initialized"),
            Err(e) => return ProcessResult::failed(format!("{:#}", e)),
        };
        if pending.is_empty() {
            return ProcessResult::skipped("no pending deltas");
        }

        let mut groups: BTreeMap<Option<String>, Vec<MetricsDelta>> = BTreeMap::new();
        for delta in pending {
            groups.entry(delta.git_branch.clone()).or_default().push(delta);
        }

        let group_count = groups.len();
        let outcomes = self.deliver_groups(log, ctx, groups).await;

        let mut synced: HashSet<String> = HashSet::new();
        let mut failed_groups = 0usize;
        for (deltas, delivered) in &outcomes {
            if *delivered {
                synced.extend(deltas.iter().map(|d| d.record_id.clone()));
            } else {
                failed_groups += 1;
            }
        }

        let changed = match self.mark_synced(&log.session_id, synced).await {
            Ok(changed) => changed,
            Err(e) => return ProcessResult::failed(format!("{:#}", e)),
        };

        let result = if failed_groups == 0 {
            ProcessResult::ok(format!("Synced {} deltas", changed))
        } else {
            ProcessResult::failed(format!(
                "{} of {} metric groups failed",
                failed_groups, group_count
            ))
        };
        result
            .with("synced", changed)
            .with("groups", group_count)
            .with("failed_groups", failed_groups)
    }
}
