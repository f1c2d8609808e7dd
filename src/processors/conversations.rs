//! Conversation transcripts, synced in ordered batches
//!
//! Cursor: the id of the last message the API acknowledged, with the
//! message count as a fallback. If the stored id is no longer in the log
//! (the agent rewrote or rotated it) the whole current transcript is sent
//! again, flagged `reset`, and the cursor restarts from it.

use super::{ParsedLog, ProcessResult, ProcessingContext, Processor};
use crate::data::{ConversationRecord, ConversationSyncState, ParsedMessage, SyncStatus};
use crate::store::{StoreLayout, SyncRecord, SyncStateTracker};
use crate::transport::Payload;
use crate::util::{run_blocking, RunGuard};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;

/// Messages per request
pub const BATCH_SIZE: usize = 50;

pub struct ConversationsProcessor {
    layout: StoreLayout,
    guard: RunGuard,
}

/// Where the unsynced tail of a transcript starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Resume {
    start: usize,
    reset: bool,
}

fn resume_point(cursor: &ConversationSyncState, messages: &[ParsedMessage]) -> Resume {
    if let Some(last_id) = &cursor.last_synced_message_id {
        return match messages.iter().position(|m| &m.id == last_id) {
            Some(pos) => Resume {
                start: pos + 1,
                reset: false,
            },
            None => Resume {
                start: 0,
                reset: true,
            },
        };
    }
    if cursor.last_synced_index > messages.len() {
        return Resume {
            start: 0,
            reset: true,
        };
    }
    Resume {
        start: cursor.last_synced_index,
        reset: false,
    }
}

impl ConversationsProcessor {
    pub fn new(layout: StoreLayout) -> Self {
        Self {
            layout,
            guard: RunGuard::new(),
        }
    }

    async fn load_cursor(&self, session_id: &str) -> Result<Option<ConversationSyncState>> {
        let tracker = SyncStateTracker::new(self.layout.session_store());
        let session_id = session_id.to_string();
        run_blocking(move || tracker.conversation_cursor(&session_id)).await
    }

    /// Append the records the stream does not hold yet.
    ///
    /// A retried batch or a full re-sync offers ids that were logged before;
    /// those keep their existing entry and status.
    async fn record_pending(
        &self,
        session_id: &str,
        records: Vec<ConversationRecord>,
    ) -> Result<usize> {
        let log = self.layout.conversations_log();
        let session_id = session_id.to_string();
        run_blocking(move || {
            let logged: HashSet<String> = log
                .read_all(&session_id)?
                .iter()
                .map(|r| r.record_id().to_string())
                .collect();
            let fresh: Vec<ConversationRecord> = records
                .into_iter()
                .filter(|r| !logged.contains(&r.record_id))
                .collect();
            log.append_all(&session_id, &fresh)?;
            Ok(fresh.len())
        })
        .await
    }

    async fn save_cursor(&self, session_id: &str, cursor: ConversationSyncState) -> Result<()> {
        let tracker = SyncStateTracker::new(self.layout.session_store());
        let session_id = session_id.to_string();
        run_blocking(move || tracker.save_conversation_cursor(&session_id, cursor)).await
    }

    async fn commit(
        &self,
        session_id: &str,
        ids: HashSet<String>,
        cursor: ConversationSyncState,
    ) -> Result<()> {
        let layout = self.layout.clone();
        let session_id = session_id.to_string();
        run_blocking(move || {
            layout.conversations_log().mark_synced(&session_id, &ids)?;
            SyncStateTracker::new(layout.session_store())
                .save_conversation_cursor(&session_id, cursor)
        })
        .await
    }
}

fn message_json(message: &ParsedMessage) -> serde_json::Value {
    json!({
        "id": message.id,
        "index": message.index,
        "role": message.role,
        "timestamp": message.timestamp,
        "text": message.text,
        "tool_names": message.tool_names,
        "is_sidechain": message.is_sidechain,
    })
}

#[async_trait]
impl Processor for ConversationsProcessor {
    fn name(&self) -> &str {
        "conversations"
    }

    fn priority(&self) -> u32 {
        20
    }

    async fn process(&self, log: &ParsedLog, ctx: &ProcessingContext) -> ProcessResult {
        let Some(_token) = self.guard.try_acquire() else {
            return ProcessResult::skipped("conversation sync already running");
        };

        let mut cursor = match self.load_cursor(&log.session_id).await {
            Ok(Some(cursor)) => cursor,
            Ok(None) => return ProcessResult::skipped("conversation cursor not initialized"),
            Err(e) => return ProcessResult::failed(format!("{:#}", e)),
        };

        let messages = &log.parsed.messages;
        let resume = resume_point(&cursor, messages);
        if resume.reset {
            tracing::warn!(
                session_id = %log.session_id,
                last_synced = cursor.last_synced_message_id.as_deref().unwrap_or("-"),
                messages = messages.len(),
                "Conversation cursor not found in log; re-syncing full transcript"
            );
        }

        let unsynced = &messages[resume.start..];
        if unsynced.is_empty() {
            return ProcessResult::skipped("no new messages");
        }

        let conversation_id = match cursor.conversation_id.clone() {
            Some(id) => id,
            None => {
                // Fixed before the first send so retries reuse the same id
                let id = uuid::Uuid::new_v4().to_string();
                cursor.conversation_id = Some(id.clone());
                if let Err(e) = self.save_cursor(&log.session_id, cursor.clone()).await {
                    return ProcessResult::failed(format!("{:#}", e));
                }
                id
            }
        };
        let endpoint = format!("/v1/conversations/{}/messages", conversation_id);
        let metadata = &log.parsed.metadata;

        let mut sent = 0usize;
        for (batch_no, batch) in unsynced.chunks(BATCH_SIZE).enumerate() {
            let reset = resume.reset && batch_no == 0;
            let records: Vec<ConversationRecord> = batch
                .iter()
                .map(|m| ConversationRecord {
                    record_id: m.id.clone(),
                    conversation_id: conversation_id.clone(),
                    index: m.index,
                    role: m.role,
                    timestamp: m.timestamp,
                    sync_status: SyncStatus::Pending,
                    sync_attempts: 0,
                    synced_at: None,
                })
                .collect();
            if let Err(e) = self.record_pending(&log.session_id, records).await {
                return ProcessResult::failed(format!("{:#}", e)).with("synced", sent);
            }

            let payload = Payload::new(
                endpoint.clone(),
                json!({
                    "conversation_id": conversation_id,
                    "session_id": log.session_id,
                    "agent_session_id": metadata.agent_session_id,
                    "cwd": metadata.cwd,
                    "git_branch": metadata.git_branch,
                    "model": metadata.model,
                    "client_id": ctx.client_id,
                    "reset": reset,
                    "messages": batch.iter().map(message_json).collect::<Vec<_>>(),
                }),
            );

            let outcome = ctx.deliver(&payload).await;
            if !outcome.success {
                tracing::warn!(
                    session_id = %log.session_id,
                    conversation_id = %conversation_id,
                    batch = batch_no,
                    "Conversation batch not delivered: {}",
                    outcome.message
                );
                let message = format!("Batch {} failed: {}", batch_no, outcome.message);
                return ProcessResult::failed(message).with("synced", sent);
            }

            // Batches are acknowledged in order, so the cursor always marks a contiguous prefix
            let Some(last) = batch.last() else {
                continue;
            };
            cursor.last_synced_message_id = Some(last.id.clone());
            cursor.last_synced_index = last.index + 1;
            cursor.synced_messages += batch.len() as u64;
            cursor.last_sync_at = Some(Utc::now());
            if reset {
                cursor.resets += 1;
            }

            let ids: HashSet<String> = batch.iter().map(|m| m.id.clone()).collect();
            if let Err(e) = self.commit(&log.session_id, ids, cursor.clone()).await {
                return ProcessResult::failed(format!("{:#}", e)).with("synced", sent);
            }
            sent += batch.len();
        }

        ProcessResult::ok(format!("Synced {} messages", sent))
            .with("synced", sent)
            .with("conversation_id", conversation_id)
            .with("reset", resume.reset)
    }
}
