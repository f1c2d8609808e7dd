//! Lifecycle of one monitored agent session
//!
//! ```text
//! before_spawn ──▶ after_spawn ──▶ monitoring ──▶ prepare_for_exit ──▶ mark_complete
//!  (baseline)     (correlate)        │    ▲        (stop + flush)      (terminal)
//!                                    ▼    │
//!                                  transition
//! ```
//!
//! Nothing here may disturb the wrapped process. Failures are logged,
//! attached to the session record and, before spawn, switch monitoring off
//! for the rest of the run.

pub mod collector;
pub mod debounce;
pub mod monitor;

pub use collector::{collect_deltas, CollectOutcome, DeltaCollector};
pub use debounce::PendingTimer;

use crate::adapters::AgentAdapter;
use crate::config::MonitoringConfig;
use crate::correlation::{correlate_with_retry, CorrelationParams, RetryPolicy};
use crate::data::{Correlation, FileEntry, FileSnapshot, Session, SessionStatus};
use crate::hooks::SessionHooks;
use crate::snapshot::{diff, snapshot};
use crate::store::sync_state::initialize_cursors;
use crate::store::{SessionStore, StoreLayout};
use crate::util::run_blocking;
use chrono::{DateTime, Utc};
use monitor::{MonitorContext, MonitorHandle};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Signals from the watch loop to whoever drives the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    /// The agent's logical session ended but the host process is still running
    SessionEnded { ended_at: DateTime<Utc> },
}

pub struct Orchestrator {
    adapter: Arc<dyn AgentAdapter>,
    layout: StoreLayout,
    store: SessionStore,
    config: MonitoringConfig,
    hooks: Arc<dyn SessionHooks>,

    /// Identity and spawn-time fields of the session; the store holds the live record
    draft: Session,
    monitoring_enabled: bool,
    /// Correlate against the pre-spawn baseline rather than every file
    use_baseline: bool,
    baseline: Option<FileSnapshot>,
    exclude: Vec<PathBuf>,

    collector: Option<Arc<DeltaCollector>>,
    monitor: Option<MonitorHandle>,
    events_tx: mpsc::UnboundedSender<OrchestratorEvent>,
    events_rx: mpsc::UnboundedReceiver<OrchestratorEvent>,
}

impl Orchestrator {
    pub fn new(
        adapter: Arc<dyn AgentAdapter>,
        layout: StoreLayout,
        config: MonitoringConfig,
        hooks: Arc<dyn SessionHooks>,
        working_directory: PathBuf,
    ) -> Self {
        let draft = Session::new(adapter.name(), adapter.provider(), working_directory);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            store: layout.session_store(),
            adapter,
            layout,
            config,
            hooks,
            draft,
            monitoring_enabled: true,
            use_baseline: true,
            baseline: None,
            exclude: Vec::new(),
            collector: None,
            monitor: None,
            events_tx,
            events_rx,
        }
    }

    pub fn with_project(mut self, project: Option<String>) -> Self {
        self.draft.project = project;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.draft.session_id
    }

    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring_enabled
    }

    /// Current persisted state of the session.
    pub fn session(&self) -> anyhow::Result<Option<Session>> {
        self.store.load(&self.draft.session_id)
    }

    /// Take the baseline snapshot and persist the initial record.
    ///
    /// Never fails: on error monitoring is switched off and the error is
    /// attached to the session.
    pub async fn before_spawn(&mut self) {
        let root = self.adapter.session_root(&self.draft.working_directory);
        let store = self.store.clone();
        let draft = self.draft.clone();
        let use_baseline = self.use_baseline;

        let result = run_blocking(move || {
            let baseline = use_baseline.then(|| snapshot(&root));
            store.save(&draft)?;
            Ok(baseline)
        })
        .await;

        match result {
            Ok(baseline) => {
                self.baseline = baseline;
                tracing::info!(
                    session_id = %self.draft.session_id,
                    agent = %self.draft.agent_name,
                    cwd = %self.draft.working_directory.display(),
                    "Session started"
                );
                self.hooks.on_session_start(&self.draft);
            }
            Err(e) => self.disable_monitoring("before_spawn", &e).await,
        }
    }

    /// Wait for the agent's log to appear and correlate it.
    ///
    /// On a match the incremental watch loop starts. A failed correlation is
    /// not an error: periodic sync may still adopt the log later.
    pub async fn after_spawn(&mut self) -> Correlation {
        if !self.monitoring_enabled {
            return self.draft.correlation.clone();
        }

        let settle = self
            .adapter
            .settle_delay()
            .unwrap_or(Duration::from_millis(self.config.settle_delay_ms));
        tokio::time::sleep(settle).await;

        let root = self.adapter.session_root(&self.draft.working_directory);
        let baseline = self.baseline.take();
        let candidates = candidates_since(root.clone(), baseline.clone()).await;

        let params = CorrelationParams {
            session_id: self.draft.session_id.clone(),
            agent_name: self.draft.agent_name.clone(),
            working_directory: self.draft.working_directory.clone(),
            started_after: self.draft.start_time,
            exclude: self.exclude.clone(),
        };
        let correlation = correlate_with_retry(
            &params,
            self.adapter.as_ref(),
            candidates,
            RetryPolicy::from_config(&self.config),
            || candidates_since(root.clone(), baseline.clone()),
        )
        .await;

        let store = self.store.clone();
        let session_id = self.draft.session_id.clone();
        let persisted = correlation.clone();
        let saved = run_blocking(move || {
            store.update(&session_id, |s| {
                let matched = persisted.is_matched();
                s.correlation = persisted;
                if matched {
                    initialize_cursors(s);
                    s.monitoring.is_active = true;
                }
            })?;
            Ok(())
        })
        .await;
        if let Err(e) = saved {
            tracing::warn!(
                session_id = %self.draft.session_id,
                "Failed to persist correlation: {:#}",
                e
            );
        }
        self.draft.correlation = correlation.clone();

        if let (Some(agent_session_id), Some(log_path)) = (
            correlation.agent_session_id.clone(),
            correlation.agent_session_file.clone(),
        ) {
            self.start_monitor(agent_session_id, log_path);
        }
        correlation
    }

    fn start_monitor(&mut self, agent_session_id: String, log_path: PathBuf) {
        let collector = Arc::new(DeltaCollector::new(
            Arc::clone(&self.adapter),
            &self.layout,
            &self.draft.session_id,
        ));
        self.monitor = Some(monitor::start(MonitorContext {
            collector: Arc::clone(&collector),
            adapter: Arc::clone(&self.adapter),
            store: self.store.clone(),
            agent_session_id,
            log_path,
            started_at: self.draft.start_time,
            debounce: self.config.debounce(),
            discovery_interval: self.config.discovery_interval(),
            idle_timeout: self.config.idle_timeout(),
            events: self.events_tx.clone(),
        }));
        self.collector = Some(collector);
    }

    /// Next lifecycle event; pending forever while nothing happens.
    pub async fn next_event(&mut self) -> Option<OrchestratorEvent> {
        self.events_rx.recv().await
    }

    /// Run a collection pass now, waiting for any in-flight one.
    pub async fn collect_now(&self) -> anyhow::Result<CollectOutcome> {
        match &self.collector {
            Some(collector) => collector.collect_forced().await,
            None => Ok(CollectOutcome::NotCorrelated),
        }
    }

    /// First shutdown phase: stop every trigger, then flush pending deltas.
    ///
    /// The session stays `active` so a final sync can still run against it.
    pub async fn prepare_for_exit(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }
        if !self.monitoring_enabled {
            return;
        }

        if let Err(e) = self.collect_now().await {
            tracing::warn!(
                session_id = %self.draft.session_id,
                "Final collection failed: {:#}",
                e
            );
        }

        let store = self.store.clone();
        let session_id = self.draft.session_id.clone();
        let idle = run_blocking(move || {
            store.update(&session_id, |s| {
                s.mark_idle(Utc::now());
                s.monitoring.is_active = false;
            })?;
            Ok(())
        })
        .await;
        if let Err(e) = idle {
            tracing::warn!(session_id = %self.draft.session_id, "{:#}", e);
        }
    }

    /// Second shutdown phase: terminal status from the wrapped process's exit code.
    pub async fn mark_complete(&mut self, exit_code: i32) -> Option<Session> {
        let status = SessionStatus::from_exit_code(exit_code);
        let session = self.finalize(status, Utc::now(), None).await?;
        tracing::info!(
            session_id = %session.session_id,
            status = ?session.status,
            exit_code,
            active_ms = session.active_duration_ms,
            "Session finished"
        );
        Some(session)
    }

    async fn finalize(
        &mut self,
        status: SessionStatus,
        at: DateTime<Utc>,
        transitioned_to: Option<String>,
    ) -> Option<Session> {
        let store = self.store.clone();
        let session_id = self.draft.session_id.clone();
        let result = run_blocking(move || {
            store.update(&session_id, |s| {
                if transitioned_to.is_some() {
                    s.transitioned_to = transitioned_to;
                }
                s.finish(status, at);
                s.clone()
            })
        })
        .await;

        match result {
            Ok(Some(session)) => {
                self.hooks.on_session_end(&session);
                Some(session)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.draft.session_id,
                    "Failed to finalize session: {:#}",
                    e
                );
                None
            }
        }
    }

    /// Replace this session with a fresh one after the agent reset itself.
    ///
    /// The current session is stopped, flushed, passed to `final_sync` and
    /// completed before the new one starts correlating. The new session only
    /// considers logs created after `ended_at`, never the old log.
    pub async fn transition<F, Fut>(
        mut self,
        ended_at: DateTime<Utc>,
        final_sync: F,
    ) -> Orchestrator
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut next = Orchestrator::new(
            Arc::clone(&self.adapter),
            self.layout.clone(),
            self.config.clone(),
            Arc::clone(&self.hooks),
            self.draft.working_directory.clone(),
        )
        .with_project(self.draft.project.clone());
        next.draft.start_time = ended_at;
        next.draft.transitioned_from = Some(self.draft.session_id.clone());
        next.use_baseline = false;
        next.exclude = self.exclude.clone();
        if let Some(old_log) = &self.draft.correlation.agent_session_file {
            next.exclude.push(old_log.clone());
        }

        tracing::info!(
            from = %self.draft.session_id,
            to = %next.draft.session_id,
            "Transitioning to a new agent session"
        );

        self.prepare_for_exit().await;
        final_sync(self.draft.session_id.clone()).await;
        let next_id = next.draft.session_id.clone();
        self.finalize(SessionStatus::Completed, ended_at, Some(next_id))
            .await;

        next.before_spawn().await;
        next.after_spawn().await;
        next
    }

    /// Switch monitoring off for the rest of the run and record why.
    async fn disable_monitoring(&mut self, phase: &str, error: &anyhow::Error) {
        self.monitoring_enabled = false;
        tracing::warn!(
            session_id = %self.draft.session_id,
            phase,
            "Monitoring disabled: {:#}",
            error
        );

        self.draft.record_error(phase, format!("{:#}", error));
        let store = self.store.clone();
        let draft = self.draft.clone();
        if let Err(e) = run_blocking(move || store.save(&draft)).await {
            tracing::debug!("Could not persist session error: {:#}", e);
        }
    }
}

/// Candidate logs under `root`: new since `baseline`, or every file without one.
async fn candidates_since(root: PathBuf, baseline: Option<FileSnapshot>) -> Vec<FileEntry> {
    let listed = run_blocking(move || {
        let current = snapshot(&root);
        Ok(match &baseline {
            Some(before) => diff(before, &current),
            None => current.files,
        })
    })
    .await;
    listed.unwrap_or_default()
}
