//! Watch loop for one correlated agent log
//!
//! Two independent triggers feed the same guarded collector:
//! file-change notifications (debounced through a [`PendingTimer`]) and a
//! coarser discovery tick that also looks for the end of the agent's
//! logical session.

use super::collector::{CollectOutcome, DeltaCollector};
use super::debounce::PendingTimer;
use super::OrchestratorEvent;
use crate::adapters::AgentAdapter;
use crate::store::SessionStore;
use crate::util::{run_blocking, send_or_log};
use chrono::{DateTime, Utc};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct MonitorContext {
    pub collector: Arc<DeltaCollector>,
    pub adapter: Arc<dyn AgentAdapter>,
    pub store: SessionStore,
    pub agent_session_id: String,
    pub log_path: PathBuf,
    /// Start of the logical session, for session-end detection
    pub started_at: DateTime<Utc>,
    pub debounce: Duration,
    pub discovery_interval: Duration,
    pub idle_timeout: Duration,
    pub events: mpsc::UnboundedSender<OrchestratorEvent>,
}

/// Running watch loop; dropping it stops every trigger.
pub struct MonitorHandle {
    watcher: Option<RecommendedWatcher>,
    tasks: Vec<JoinHandle<()>>,
    debounce: Arc<PendingTimer>,
}

impl MonitorHandle {
    /// Stop the watcher, the discovery tick and any pending debounce.
    ///
    /// A collection that already started is not interrupted.
    pub fn stop(&mut self) {
        self.watcher.take();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.debounce.cancel();
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn start(ctx: MonitorContext) -> MonitorHandle {
    let debounce = Arc::new(PendingTimer::new());
    let changes = Arc::new(AtomicU64::new(0));
    let (change_tx, change_rx) = mpsc::unbounded_channel::<()>();

    let watcher = match watch_log(&ctx.log_path, change_tx) {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!(
                session_id = %ctx.collector.session_id(),
                path = %ctx.log_path.display(),
                "File watcher unavailable, relying on discovery: {}",
                e
            );
            None
        }
    };

    let change_task = tokio::spawn(change_loop(
        change_rx,
        Arc::clone(&ctx.collector),
        ctx.store.clone(),
        Arc::clone(&debounce),
        Arc::clone(&changes),
        ctx.debounce,
    ));
    let discovery_task = tokio::spawn(discovery_loop(ctx));

    MonitorHandle {
        watcher,
        tasks: vec![change_task, discovery_task],
        debounce,
    }
}

fn watch_log(
    log_path: &std::path::Path,
    tx: mpsc::UnboundedSender<()>,
) -> notify::Result<RecommendedWatcher> {
    let target = log_path.to_path_buf();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                // Our own reads show up as access events
                if !event.kind.is_access() && event.paths.iter().any(|p| *p == target) {
                    let _ = tx.send(());
                }
            }
        },
        NotifyConfig::default().with_poll_interval(Duration::from_secs(1)),
    )?;

    // Watch the directory: editors and agents may replace the file
    let dir = log_path.parent().unwrap_or(log_path);
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

async fn change_loop(
    mut rx: mpsc::UnboundedReceiver<()>,
    collector: Arc<DeltaCollector>,
    store: SessionStore,
    debounce: Arc<PendingTimer>,
    changes: Arc<AtomicU64>,
    delay: Duration,
) {
    while rx.recv().await.is_some() {
        changes.fetch_add(1, Ordering::Relaxed);

        let collector = Arc::clone(&collector);
        let store = store.clone();
        let changes = Arc::clone(&changes);
        debounce.schedule(delay, async move {
            let seen = changes.swap(0, Ordering::Relaxed);
            let session_id = collector.session_id().to_string();
            let counted = run_blocking(move || {
                store.update(&session_id, |s| s.monitoring.change_count += seen)?;
                Ok(())
            })
            .await;
            if let Err(e) = counted {
                tracing::debug!("Failed to record change count: {:#}", e);
            }
            log_outcome(&collector, "file change", collector.collect().await);
        });
    }
}

async fn discovery_loop(ctx: MonitorContext) {
    let session_id = ctx.collector.session_id().to_string();
    let mut interval = tokio::time::interval(ctx.discovery_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    let mut last_activity = Utc::now();
    loop {
        interval.tick().await;

        let outcome = ctx.collector.collect().await;
        if matches!(outcome, Ok(CollectOutcome::Collected { new, .. }) if new > 0) {
            last_activity = Utc::now();
        }
        log_outcome(&ctx.collector, "discovery", outcome);

        let idle_for = Utc::now().signed_duration_since(last_activity);
        if idle_for.to_std().unwrap_or_default() >= ctx.idle_timeout {
            let store = ctx.store.clone();
            let id = session_id.clone();
            let idle = run_blocking(move || {
                store.update(&id, |s| s.mark_idle(last_activity))?;
                Ok(())
            })
            .await;
            if let Err(e) = idle {
                tracing::debug!(session_id = %session_id, "Failed to record idle: {:#}", e);
            }
        }

        let Some(ended_at) = detect_end(&ctx).await else {
            continue;
        };
        tracing::info!(
            session_id = %session_id,
            agent_session_id = %ctx.agent_session_id,
            %ended_at,
            "Agent session ended while host keeps running"
        );
        send_or_log(
            &ctx.events,
            OrchestratorEvent::SessionEnded { ended_at },
            "session end event",
        );
        break;
    }
}

async fn detect_end(ctx: &MonitorContext) -> Option<DateTime<Utc>> {
    ctx.adapter.lifecycle()?;
    let adapter = Arc::clone(&ctx.adapter);
    let agent_session_id = ctx.agent_session_id.clone();
    let started_at = ctx.started_at;
    run_blocking(move || {
        Ok(adapter
            .lifecycle()
            .and_then(|lc| lc.detect_session_end(&agent_session_id, started_at)))
    })
    .await
    .ok()
    .flatten()
}

fn log_outcome(
    collector: &DeltaCollector,
    trigger: &str,
    outcome: anyhow::Result<CollectOutcome>,
) {
    match outcome {
        Ok(CollectOutcome::Collected { new, position }) => tracing::debug!(
            session_id = %collector.session_id(),
            trigger,
            new,
            position,
            "Collection pass finished"
        ),
        Ok(CollectOutcome::Busy) => tracing::debug!(
            session_id = %collector.session_id(),
            trigger,
            "Collection already running, trigger dropped"
        ),
        Ok(_) => {}
        Err(e) => tracing::warn!(
            session_id = %collector.session_id(),
            trigger,
            "Collection failed: {:#}",
            e
        ),
    }
}
