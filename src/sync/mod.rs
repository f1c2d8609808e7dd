//! Periodic sync of every known agent log
//!
//! Each pass discovers the adapter's logs, resolves the session that owns
//! each one (adopting unowned logs for sessions whose correlation never
//! matched), parses every log once and hands it to all processors in
//! priority order. A failure in one processor or one file never stops the
//! rest of the pass.

use crate::adapters::AgentAdapter;
use crate::config::{parse_flag, SyncConfig};
use crate::correlation::{correlate, CorrelationParams};
use crate::data::{Correlation, Session, SessionStatus};
use crate::processors::{
    ConversationsProcessor, MetricsProcessor, ParsedLog, ProcessResult, ProcessingContext,
    Processor,
};
use crate::snapshot::file_entry;
use crate::store::sync_state::initialize_cursors;
use crate::store::{SessionStore, StoreLayout};
use crate::util::{run_blocking, RunGuard, RunToken};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

/// Sync toggles, resolved once when the coordinator is built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub dry_run: bool,
    pub stale_after: Duration,
}

impl SyncSettings {
    /// Config values overridden by `SESSIONTAP_SYNC_ENABLED`,
    /// `SESSIONTAP_SYNC_INTERVAL_SECS` and `SESSIONTAP_DRY_RUN`.
    pub fn resolve(config: &SyncConfig) -> Self {
        Self::resolve_with(config, |key| std::env::var(key).ok())
    }

    pub fn resolve_with(config: &SyncConfig, var: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = var("SESSIONTAP_SYNC_ENABLED")
            .and_then(|v| parse_flag(&v))
            .unwrap_or(config.enabled);
        let interval_secs = var("SESSIONTAP_SYNC_INTERVAL_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(config.interval_secs);
        let dry_run = var("SESSIONTAP_DRY_RUN")
            .and_then(|v| parse_flag(&v))
            .unwrap_or(config.dry_run);

        Self {
            enabled,
            interval: Duration::from_secs(interval_secs.max(1)),
            dry_run,
            stale_after: Duration::from_secs(config.stale_after_hours.saturating_mul(3_600)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorRun {
    pub session_id: String,
    pub path: PathBuf,
    pub processor: String,
    pub result: ProcessResult,
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Another pass was running; this one did nothing
    pub skipped: bool,
    pub files_seen: usize,
    pub unowned: usize,
    /// Logs matched to a session during this pass
    pub adopted: usize,
    pub parse_failures: usize,
    pub runs: Vec<ProcessorRun>,
    /// Abandoned sessions closed as `recovered`
    pub recovered: Vec<String>,
}

impl SyncReport {
    pub fn failures(&self) -> usize {
        self.runs.iter().filter(|r| !r.result.success).count() + self.parse_failures
    }
}

pub struct SyncCoordinator {
    adapter: Arc<dyn AgentAdapter>,
    layout: StoreLayout,
    processors: Vec<Arc<dyn Processor>>,
    context: ProcessingContext,
    settings: SyncSettings,
    guard: RunGuard,
}

impl SyncCoordinator {
    pub fn new(
        adapter: Arc<dyn AgentAdapter>,
        layout: StoreLayout,
        context: ProcessingContext,
        settings: SyncSettings,
    ) -> Self {
        Self {
            adapter,
            layout,
            processors: Vec::new(),
            context,
            settings,
            guard: RunGuard::new(),
        }
    }

    /// Register a processor; processors run in ascending priority.
    pub fn with_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.push(processor);
        self.processors.sort_by_key(|p| p.priority());
        self
    }

    /// Metrics and conversation processors.
    pub fn with_default_processors(self) -> Self {
        let metrics = MetricsProcessor::new(Arc::clone(&self.adapter), self.layout.clone());
        let conversations = ConversationsProcessor::new(self.layout.clone());
        self.with_processor(Arc::new(metrics))
            .with_processor(Arc::new(conversations))
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn processor_names(&self) -> Vec<&str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// One pass, unless a pass is already running.
    pub async fn run_once(&self) -> SyncReport {
        match self.guard.try_acquire() {
            Some(token) => self.run_pass(token).await,
            None => {
                tracing::debug!("Sync pass already running, skipping");
                SyncReport {
                    skipped: true,
                    ..Default::default()
                }
            }
        }
    }

    /// One pass, waiting for an in-flight pass to finish first.
    pub async fn run_final(&self) -> SyncReport {
        let token = self.guard.acquire().await;
        self.run_pass(token).await
    }

    async fn run_pass(&self, _token: RunToken<'_>) -> SyncReport {
        let mut report = SyncReport::default();

        let root = self.adapter.discovery_root();
        let adapter = Arc::clone(&self.adapter);
        let files = run_blocking(move || Ok(discover_logs(adapter.as_ref(), &root)))
            .await
            .unwrap_or_default();
        report.files_seen = files.len();

        for path in files {
            let session_id = match self.owner_of(&path).await {
                Ok(Some((id, adopted))) => {
                    if adopted {
                        report.adopted += 1;
                    }
                    id
                }
                Ok(None) => {
                    report.unowned += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Failed to resolve owner: {:#}", e);
                    continue;
                }
            };

            let adapter = Arc::clone(&self.adapter);
            let parse_path = path.clone();
            let parse_id = session_id.clone();
            let parsed =
                run_blocking(move || adapter.parse_session_file(&parse_path, &parse_id)).await;
            let parsed = match parsed {
                Ok(parsed) => parsed,
                Err(e) => {
                    report.parse_failures += 1;
                    tracing::warn!(
                        session_id = %session_id,
                        path = %path.display(),
                        "Failed to parse agent log: {:#}",
                        e
                    );
                    continue;
                }
            };

            let log = ParsedLog {
                path: path.clone(),
                session_id: session_id.clone(),
                parsed,
            };
            for processor in &self.processors {
                let result = processor.process(&log, &self.context).await;
                if !result.success {
                    tracing::warn!(
                        session_id = %session_id,
                        processor = processor.name(),
                        "Processor failed: {}",
                        result.message
                    );
                } else if !result.is_skipped() {
                    tracing::debug!(
                        session_id = %session_id,
                        processor = processor.name(),
                        "{}",
                        result.message
                    );
                }
                report.runs.push(ProcessorRun {
                    session_id: session_id.clone(),
                    path: path.clone(),
                    processor: processor.name().to_string(),
                    result,
                });
            }
        }

        let store = self.layout.session_store();
        let agent = self.adapter.name().to_string();
        let stale_after = self.settings.stale_after;
        match run_blocking(move || recover_stale_sessions(&store, &agent, stale_after, Utc::now()))
            .await
        {
            Ok(recovered) => report.recovered = recovered,
            Err(e) => tracing::warn!("Failed to recover stale sessions: {:#}", e),
        }

        tracing::info!(
            files = report.files_seen,
            adopted = report.adopted,
            recovered = report.recovered.len(),
            failures = report.failures(),
            "Sync pass finished"
        );
        report
    }

    /// Session owning `path`, adopting it for an uncorrelated session if one matches.
    ///
    /// The flag is true when the log was adopted by this call.
    async fn owner_of(&self, path: &Path) -> Result<Option<(String, bool)>> {
        let adapter = Arc::clone(&self.adapter);
        let store = self.layout.session_store();
        let path = path.to_path_buf();

        run_blocking(move || {
            if let Some(owner) = store.find_by_agent_file(&path)? {
                return Ok(Some((owner.session_id, false)));
            }
            let Some(entry) = file_entry(&path) else {
                return Ok(None);
            };

            let mut waiting: Vec<_> = store
                .list()?
                .into_iter()
                .filter(|s| s.agent_name == adapter.name())
                .filter(|s| s.status == SessionStatus::Active && !s.correlation.is_matched())
                .collect();
            waiting.sort_by(|a, b| b.start_time.cmp(&a.start_time));

            for session in waiting {
                let params = CorrelationParams {
                    session_id: session.session_id.clone(),
                    agent_name: session.agent_name.clone(),
                    working_directory: session.working_directory.clone(),
                    started_after: session.start_time,
                    exclude: Vec::new(),
                };
                let Some((agent_session_id, file)) =
                    correlate(&params, adapter.as_ref(), std::slice::from_ref(&entry))
                else {
                    continue;
                };

                let adopted = store.update(&session.session_id, |s| {
                    if s.correlation.is_matched() {
                        return false;
                    }
                    let rounds = s.correlation.retry_count + 1;
                    s.correlation = Correlation::matched(agent_session_id.clone(), file.clone(), rounds);
                    initialize_cursors(s);
                    true
                })?;
                if adopted == Some(true) {
                    tracing::info!(
                        session_id = %session.session_id,
                        agent_session_id = %agent_session_id,
                        path = %file.display(),
                        "Adopted agent log during sync"
                    );
                    return Ok(Some((session.session_id, true)));
                }
            }
            Ok(None)
        })
        .await
    }

    /// Run passes every `settings.interval` until the handle is shut down.
    ///
    /// Returns `None` when sync is disabled.
    pub fn start(self: Arc<Self>) -> Option<SyncHandle> {
        if !self.settings.enabled {
            tracing::info!("Sync disabled");
            return None;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let coordinator = Arc::clone(&self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(coordinator.settings.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        coordinator.run_once().await;
                    }
                }
            }
        });

        Some(SyncHandle {
            coordinator: self,
            stop: Some(stop_tx),
            task,
        })
    }
}

/// Background sync loop started by [`SyncCoordinator::start`]
pub struct SyncHandle {
    coordinator: Arc<SyncCoordinator>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Stop the timer, let an in-flight pass finish, then run one final pass.
    pub async fn shutdown(mut self) -> SyncReport {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::debug!("Sync loop ended abnormally: {}", e);
        }
        self.coordinator.run_final().await
    }
}

/// Close `active` sessions of `agent_name` with no activity since `now - stale_after`.
///
/// These were left behind by a host that exited without shutting down. The
/// session ends at its last known activity. Returns the recovered ids.
pub fn recover_stale_sessions(
    store: &SessionStore,
    agent_name: &str,
    stale_after: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let Ok(stale_after) = chrono::Duration::from_std(stale_after) else {
        return Ok(Vec::new());
    };
    let cutoff = now - stale_after;

    let mut recovered = Vec::new();
    for session in store.list()? {
        if session.agent_name != agent_name
            || session.status != SessionStatus::Active
            || last_seen(&session) >= cutoff
        {
            continue;
        }
        let closed = store.update(&session.session_id, |s| {
            let last = last_seen(s);
            if s.status != SessionStatus::Active || last >= cutoff {
                return false;
            }
            s.finish(SessionStatus::Recovered, last)
        })?;
        if closed == Some(true) {
            tracing::warn!(
                session_id = %session.session_id,
                "Closed abandoned session as recovered"
            );
            recovered.push(session.session_id);
        }
    }
    Ok(recovered)
}

fn last_seen(session: &Session) -> DateTime<Utc> {
    let metrics = session.sync.metrics.as_ref();
    let conversations = session.sync.conversations.as_ref();
    [
        Some(session.start_time),
        session.activity_started_at,
        metrics.and_then(|m| m.last_processed_timestamp),
        metrics.and_then(|m| m.last_sync_at),
        conversations.and_then(|c| c.last_sync_at),
    ]
    .into_iter()
    .flatten()
    .max()
    .unwrap_or(session.start_time)
}

/// Every file under `root` the adapter recognises as a session log.
pub fn discover_logs(adapter: &dyn AgentAdapter, root: &Path) -> Vec<PathBuf> {
    let mut logs: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| adapter.matches_session_pattern(p))
        .collect();
    logs.sort();
    logs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_settings_from_config() {
        let config = SyncConfig {
            enabled: true,
            interval_secs: 60,
            dry_run: false,
            stale_after_hours: 2,
        };
        let settings = SyncSettings::resolve_with(&config, |_| None);
        assert!(settings.enabled);
        assert_eq!(settings.interval, Duration::from_secs(60));
        assert!(!settings.dry_run);
        assert_eq!(settings.stale_after, Duration::from_secs(7_200));
    }

    #[test]
    fn test_settings_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SESSIONTAP_SYNC_ENABLED", "false"),
            ("SESSIONTAP_SYNC_INTERVAL_SECS", "0"),
            ("SESSIONTAP_DRY_RUN", "yes"),
        ]
        .into_iter()
        .collect();

        let settings =
            SyncSettings::resolve_with(&SyncConfig::default(), |k| env.get(k).map(|v| v.to_string()));

        assert!(!settings.enabled);
        // Zero would spin; clamped to one second
        assert_eq!(settings.interval, Duration::from_secs(1));
        assert!(settings.dry_run);
    }

    #[test]
    fn test_unparseable_env_falls_back() {
        let settings = SyncSettings::resolve_with(&SyncConfig::default(), |_| {
            Some("banana".to_string())
        });
        assert_eq!(settings, SyncSettings::resolve_with(&SyncConfig::default(), |_| None));
    }

    fn session_started(store: &SessionStore, hours_ago: i64) -> Session {
        let mut session = Session::new("claude", "anthropic", std::path::PathBuf::from("/work"));
        session.start_time = Utc::now() - chrono::Duration::hours(hours_ago);
        store.save(&session).unwrap();
        session
    }

    #[test]
    fn test_abandoned_sessions_recovered() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path());
        let abandoned = session_started(&store, 48);
        let recent = session_started(&store, 1);
        let mut finished = session_started(&store, 72);
        store
            .update(&finished.session_id, |s| {
                s.finish(SessionStatus::Completed, s.start_time)
            })
            .unwrap();
        finished = store.load(&finished.session_id).unwrap().unwrap();

        let recovered =
            recover_stale_sessions(&store, "claude", Duration::from_secs(24 * 3_600), Utc::now())
                .unwrap();
        assert_eq!(recovered, vec![abandoned.session_id.clone()]);

        let closed = store.load(&abandoned.session_id).unwrap().unwrap();
        assert_eq!(closed.status, SessionStatus::Recovered);
        assert_eq!(closed.end_time, Some(abandoned.start_time));
        assert_eq!(
            store.load(&recent.session_id).unwrap().unwrap().status,
            SessionStatus::Active
        );
        assert_eq!(store.load(&finished.session_id).unwrap().unwrap(), finished);
    }

    #[test]
    fn test_recent_activity_keeps_session_open() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path());
        let session = session_started(&store, 48);
        store
            .update(&session.session_id, |s| {
                crate::store::sync_state::initialize_cursors(s);
                if let Some(m) = s.sync.metrics.as_mut() {
                    m.last_processed_timestamp = Some(Utc::now() - chrono::Duration::hours(2));
                }
            })
            .unwrap();

        let recovered =
            recover_stale_sessions(&store, "claude", Duration::from_secs(24 * 3_600), Utc::now())
                .unwrap();
        assert!(recovered.is_empty());
    }
}
