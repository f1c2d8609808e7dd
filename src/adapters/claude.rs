//! Claude Code session logs
//!
//! Claude Code writes one JSON-lines file per session under
//! `~/.claude/projects/<encoded cwd>/<session uuid>.jsonl`. Each line is a
//! record with a `type` (`user`, `assistant`, `summary`, ...), the session
//! id, cwd, git branch and an Anthropic-style `message`.
//!
//! The agent appends while we read, so only newline-terminated lines are
//! consumed. A trailing fragment is left for the next pass.

use super::{AgentAdapter, IncrementalMetrics, LifecycleAdapter};
use crate::correlation::CorrelationParams;
use crate::data::{
    FileEntry, MetricsDelta, ParsedMessage, ParsedSession, Role, SyncStatus, TokenUsage,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Tools whose `file_path` input is a file the agent modified
const EDIT_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];

const CLEAR_COMMAND: &str = "<command-name>/clear</command-name>";

/// Lines inspected when identifying a log by its first records
const HEAD_LINES: usize = 50;

#[derive(Debug, Clone)]
pub struct ClaudeAdapter {
    projects_dir: PathBuf,
}

impl ClaudeAdapter {
    /// Adapter reading from `~/.claude/projects`.
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(Self::with_root(home.join(".claude").join("projects")))
    }

    pub fn with_root(projects_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
        }
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    fn find_log(&self, agent_session_id: &str) -> Option<PathBuf> {
        let file_name = format!("{}.jsonl", agent_session_id);
        WalkDir::new(&self.projects_dir)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .find(|e| e.file_type().is_file() && e.file_name().to_string_lossy() == file_name)
            .map(|e| e.into_path())
    }

    /// Timestamp of a `/clear` command logged into `path` after `after`.
    fn clear_command_in(&self, path: &Path, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let content = fs::read_to_string(path).ok()?;
        complete_lines(&content)
            .filter_map(parse_record)
            .filter(|r| r.kind == "user" && r.is_clear_command())
            .filter_map(|r| r.timestamp())
            .find(|ts| *ts > after)
    }

    /// Timestamp of the `/clear` that opened `path`, if the log was born
    /// after `after` and its first prompt record is that command.
    fn opened_by_clear(&self, path: &Path, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let born = crate::snapshot::file_entry(path)?.born_at();
        if born < after {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        let first = complete_lines(&content)
            .take(HEAD_LINES)
            .filter_map(parse_record)
            .find(|r| r.kind == "user" && !r.is_meta)?;
        if !first.is_clear_command() {
            return None;
        }
        first.timestamp().filter(|ts| *ts > after)
    }
}

/// Claude's directory name for a project path: `/` and `.` become `-`.
pub fn encode_project_dir(project_root: &Path) -> String {
    let encoded = project_root
        .to_string_lossy()
        .replace(['/', '.'], "-")
        .trim_start_matches('-')
        .to_string();
    format!("-{}", encoded)
}

impl AgentAdapter for ClaudeAdapter {
    fn name(&self) -> &str {
        "claude"
    }

    fn provider(&self) -> &str {
        "anthropic"
    }

    fn session_root(&self, working_directory: &Path) -> PathBuf {
        self.projects_dir.join(encode_project_dir(working_directory))
    }

    fn discovery_root(&self) -> PathBuf {
        self.projects_dir.clone()
    }

    fn matches_session_pattern(&self, path: &Path) -> bool {
        if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
            return false;
        }
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(|stem| uuid::Uuid::parse_str(stem).is_ok())
    }

    fn match_session(&self, candidate: &FileEntry, params: &CorrelationParams) -> Option<String> {
        let content = fs::read_to_string(&candidate.path).ok()?;
        let cwd = complete_lines(&content)
            .take(HEAD_LINES)
            .filter_map(parse_record)
            .find_map(|r| r.cwd)?;

        if Path::new(&cwd) != params.working_directory {
            return None;
        }

        candidate
            .path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
    }

    fn parse_incremental_metrics(
        &self,
        log_path: &Path,
        processed_ids: &BTreeSet<String>,
        processed_prompts: &BTreeSet<String>,
    ) -> Result<IncrementalMetrics> {
        let content = fs::read_to_string(log_path)
            .with_context(|| format!("Failed to read {}", log_path.display()))?;

        let mut result = IncrementalMetrics {
            last_position: complete_line_count(&content),
            ..Default::default()
        };
        let mut groups: Vec<String> = Vec::new();
        let mut pending_prompts: Vec<String> = Vec::new();
        // Claude writes one line per content block and lines of one message
        // share its id. Lines are the unit of dedup; new lines of one message
        // fold into a single delta per pass.
        let mut by_message: HashMap<String, usize> = HashMap::new();
        // Usage already reported for messages whose earlier lines were collected
        let mut reported: HashMap<String, TokenUsage> = HashMap::new();

        for record in complete_lines(&content).filter_map(parse_record) {
            match record.kind.as_str() {
                "user" => {
                    let Some(prompt) = record.user_prompt() else {
                        continue;
                    };
                    let seen = processed_prompts.contains(&prompt)
                        || result.newly_attached_prompts.contains(&prompt)
                        || pending_prompts.contains(&prompt);
                    if !seen {
                        pending_prompts.push(prompt);
                    }
                }
                "assistant" => {
                    let Some(message) = &record.message else {
                        continue;
                    };
                    let Some(line_id) = record.uuid.clone().or_else(|| message.id.clone())
                    else {
                        continue;
                    };
                    let message_id = message.id.clone().unwrap_or_else(|| line_id.clone());

                    if processed_ids.contains(&line_id) {
                        if let Some(usage) = &message.usage {
                            merge_usage(reported.entry(message_id).or_default(), usage.tokens());
                        }
                        continue;
                    }

                    let idx = match by_message.get(&message_id) {
                        Some(&idx) => idx,
                        None => {
                            if message.usage.is_none() && !reported.contains_key(&message_id) {
                                continue;
                            }
                            let prompts = std::mem::take(&mut pending_prompts);
                            result.newly_attached_prompts.extend(prompts.iter().cloned());
                            result.deltas.push(MetricsDelta {
                                record_id: line_id.clone(),
                                session_id: String::new(),
                                agent_session_id: record.session_id.clone(),
                                timestamp: record.timestamp().unwrap_or_else(Utc::now),
                                git_branch: record.git_branch.clone(),
                                model: message.model.clone(),
                                tokens: TokenUsage::default(),
                                tool_calls: Default::default(),
                                files_modified: Vec::new(),
                                user_prompts: prompts,
                                sync_status: SyncStatus::Pending,
                                sync_attempts: 0,
                                synced_at: None,
                            });
                            groups.push(message_id.clone());
                            by_message.insert(message_id, result.deltas.len() - 1);
                            result.deltas.len() - 1
                        }
                    };

                    result.consumed_ids.push(line_id);
                    let delta = &mut result.deltas[idx];
                    if let Some(usage) = &message.usage {
                        merge_usage(&mut delta.tokens, usage.tokens());
                    }
                    for block in &message.content {
                        if let ContentBlock::ToolUse { name, input } = block {
                            *delta.tool_calls.entry(name.clone()).or_insert(0) += 1;
                            if EDIT_TOOLS.contains(&name.as_str()) {
                                if let Some(file) = edited_file(input) {
                                    if !delta.files_modified.contains(&file) {
                                        delta.files_modified.push(file);
                                    }
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        for (delta, message_id) in result.deltas.iter_mut().zip(&groups) {
            if let Some(earlier) = reported.get(message_id) {
                delta.tokens = usage_growth(delta.tokens, *earlier);
            }
        }

        Ok(result)
    }

    fn parse_session_file(&self, path: &Path, session_id: &str) -> Result<ParsedSession> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let mut parsed = ParsedSession::default();
        for record in complete_lines(&content).filter_map(parse_record) {
            let meta = &mut parsed.metadata;
            if meta.agent_session_id.is_none() {
                meta.agent_session_id = record.session_id.clone();
            }
            if meta.cwd.is_none() {
                meta.cwd = record.cwd.clone();
            }
            if meta.git_branch.is_none() {
                meta.git_branch = record.git_branch.clone();
            }
            if meta.started_at.is_none() {
                meta.started_at = record.timestamp();
            }

            let role = match record.kind.as_str() {
                "user" => Role::User,
                "assistant" => Role::Assistant,
                _ => continue,
            };
            if record.is_meta {
                continue;
            }
            let Some(message) = &record.message else {
                continue;
            };
            if role == Role::Assistant && meta.model.is_none() {
                meta.model = message.model.clone();
            }

            let text = message.text();
            let tool_names: Vec<String> = message
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { name, .. } => Some(name.clone()),
                    _ => None,
                })
                .collect();
            if text.is_empty() && tool_names.is_empty() {
                continue;
            }

            let index = parsed.messages.len();
            parsed.messages.push(ParsedMessage {
                id: record
                    .uuid
                    .clone()
                    .unwrap_or_else(|| format!("{}-{}", session_id, index)),
                index,
                role,
                timestamp: record.timestamp(),
                text,
                tool_names,
                is_sidechain: record.is_sidechain,
            });
        }

        Ok(parsed)
    }

    fn lifecycle(&self) -> Option<&dyn LifecycleAdapter> {
        Some(self)
    }
}

impl LifecycleAdapter for ClaudeAdapter {
    /// `/clear` starts a fresh log in the same project directory whose first
    /// user record is the command itself. Older versions logged the command
    /// into the current file, so that file is checked as well.
    fn detect_session_end(
        &self,
        agent_session_id: &str,
        started_at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let log = self.find_log(agent_session_id)?;
        if let Some(at) = self.clear_command_in(&log, started_at) {
            return Some(at);
        }

        let project_dir = log.parent()?;
        fs::read_dir(project_dir)
            .ok()?
            .flatten()
            .map(|e| e.path())
            .filter(|p| *p != log && self.matches_session_pattern(p))
            .filter_map(|p| self.opened_by_clear(&p, started_at))
            .min()
    }
}

// =============================================================================
// Raw record model
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    git_branch: Option<String>,
    #[serde(default)]
    is_sidechain: bool,
    #[serde(default)]
    is_meta: bool,
    #[serde(default)]
    message: Option<RawMessage>,
}

impl RawRecord {
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    fn is_clear_command(&self) -> bool {
        self.message
            .as_ref()
            .is_some_and(|m| m.text().contains(CLEAR_COMMAND))
    }

    /// Text the human typed; tool results and slash-command echoes are not prompts.
    fn user_prompt(&self) -> Option<String> {
        if self.is_meta || self.is_sidechain {
            return None;
        }
        let text = self.message.as_ref()?.text();
        let trimmed = text.trim();
        if trimmed.is_empty()
            || trimmed.starts_with("<command-")
            || trimmed.starts_with("<local-command-")
        {
            return None;
        }
        Some(trimmed.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default, deserialize_with = "deserialize_content")]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

impl RawMessage {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

/// `content` is either a plain string or an array of typed blocks.
fn deserialize_content<'de, D>(deserializer: D) -> std::result::Result<Vec<ContentBlock>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(text)) => vec![ContentBlock::Text { text }],
        Some(serde_json::Value::Array(blocks)) => blocks
            .into_iter()
            .map(|b| serde_json::from_value(b).unwrap_or(ContentBlock::Other))
            .collect(),
        _ => Vec::new(),
    })
}

#[derive(Debug, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

impl RawUsage {
    fn tokens(&self) -> TokenUsage {
        TokenUsage {
            input: self.input_tokens,
            output: self.output_tokens,
            cache_read: self.cache_read_input_tokens,
            cache_creation: self.cache_creation_input_tokens,
        }
    }
}

/// Streaming lines of one message repeat (and grow) the usage block.
fn merge_usage(into: &mut TokenUsage, other: TokenUsage) {
    into.input = into.input.max(other.input);
    into.output = into.output.max(other.output);
    into.cache_read = into.cache_read.max(other.cache_read);
    into.cache_creation = into.cache_creation.max(other.cache_creation);
}

/// Tokens a message gained since its earlier lines were reported.
fn usage_growth(now: TokenUsage, earlier: TokenUsage) -> TokenUsage {
    TokenUsage {
        input: now.input.saturating_sub(earlier.input),
        output: now.output.saturating_sub(earlier.output),
        cache_read: now.cache_read.saturating_sub(earlier.cache_read),
        cache_creation: now.cache_creation.saturating_sub(earlier.cache_creation),
    }
}

fn edited_file(input: &serde_json::Value) -> Option<String> {
    input
        .get("file_path")
        .or_else(|| input.get("notebook_path"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn parse_record(line: &str) -> Option<RawRecord> {
    if line.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::debug!("Skipping unparseable Claude record: {}", e);
            None
        }
    }
}

/// Newline-terminated lines only; a trailing fragment is still being written.
fn complete_lines(content: &str) -> std::str::Lines<'_> {
    let end = content.rfind('\n').map_or(0, |i| i + 1);
    content[..end].lines()
}

fn complete_line_count(content: &str) -> usize {
    content.bytes().filter(|b| *b == b'\n').count()
}
