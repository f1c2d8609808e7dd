use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sessiontap::adapters::{self, AgentAdapter};
use sessiontap::config::{self, Config};
use sessiontap::data::Session;
use sessiontap::hooks::SessionHooks;
use sessiontap::orchestrator::{Orchestrator, OrchestratorEvent};
use sessiontap::processors::ProcessingContext;
use sessiontap::store::StoreLayout;
use sessiontap::sync::{SyncCoordinator, SyncReport, SyncSettings};
use sessiontap::transport::{HttpTransport, Transport};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "sessiontap")]
#[command(about = "Wrap coding-agent sessions and sync their telemetry")]
#[command(version)]
struct Args {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an agent command and monitor its session
    Run {
        /// Agent whose logs to correlate
        #[arg(long, default_value = "claude")]
        agent: String,

        /// Project label stored on the session
        #[arg(long)]
        project: Option<String>,

        /// Command to run, after `--`
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Sync every known agent log once
    Sync {
        #[arg(long, default_value = "claude")]
        agent: String,

        /// Keep syncing on the configured interval until interrupted
        #[arg(long)]
        watch: bool,
    },
}

/// Reports session boundaries on stderr
struct CliHooks;

impl SessionHooks for CliHooks {
    fn on_session_start(&self, session: &Session) {
        tracing::debug!(session_id = %session.session_id, "Session record created");
    }

    fn on_session_end(&self, session: &Session) {
        tracing::info!(
            session_id = %session.session_id,
            status = ?session.status,
            transitioned_to = session.transitioned_to.as_deref().unwrap_or("-"),
            "Session closed"
        );
    }
}

fn build_coordinator(
    config: &Config,
    adapter: Arc<dyn AgentAdapter>,
    layout: StoreLayout,
) -> Arc<SyncCoordinator> {
    let settings = SyncSettings::resolve(&config.sync);
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.api));
    let context = ProcessingContext::new(config, settings.dry_run, transport);
    Arc::new(SyncCoordinator::new(adapter, layout, context, settings).with_default_processors())
}

fn log_report(report: &SyncReport) {
    if report.skipped {
        return;
    }
    tracing::info!(
        files = report.files_seen,
        unowned = report.unowned,
        adopted = report.adopted,
        runs = report.runs.len(),
        failures = report.failures(),
        "Sync finished"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout belongs to the wrapped command
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sessiontap=info".parse()?),
        )
        .init();

    let config = config::load(args.config.as_deref())?;
    let layout = StoreLayout::new(config::data_dir(&config)?);

    match args.command {
        Command::Run {
            agent,
            project,
            command,
        } => {
            let code = run(config, layout, &agent, project, command).await?;
            std::process::exit(code);
        }
        Command::Sync { agent, watch } => {
            let adapter = adapters::for_agent(&agent)?;
            let coordinator = build_coordinator(&config, adapter, layout);
            if !watch {
                log_report(&coordinator.run_once().await);
                return Ok(());
            }

            let Some(handle) = Arc::clone(&coordinator).start() else {
                anyhow::bail!("Sync is disabled; enable [sync] or set SESSIONTAP_SYNC_ENABLED=1");
            };
            log_report(&coordinator.run_once().await);
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for interrupt")?;
            log_report(&handle.shutdown().await);
            Ok(())
        }
    }
}

/// Run `command` under an orchestrator; returns the command's exit code.
async fn run(
    config: Config,
    layout: StoreLayout,
    agent: &str,
    project: Option<String>,
    command: Vec<String>,
) -> Result<i32> {
    let adapter = adapters::for_agent(agent)?;
    let (program, program_args) = command
        .split_first()
        .context("No command given after --")?;

    let coordinator = build_coordinator(&config, Arc::clone(&adapter), layout.clone());
    let sync_handle = Arc::clone(&coordinator).start();

    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let mut orchestrator = Orchestrator::new(
        adapter,
        layout,
        config.monitoring.clone(),
        Arc::new(CliHooks),
        cwd,
    )
    .with_project(project);
    orchestrator.before_spawn().await;

    let spawned = tokio::process::Command::new(program)
        .args(program_args)
        .spawn()
        .with_context(|| format!("Failed to start {}", program));
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            orchestrator.prepare_for_exit().await;
            orchestrator.mark_complete(127).await;
            return Err(e);
        }
    };

    // Interrupts are for the child; we exit when it does
    tokio::spawn(async {
        while tokio::signal::ctrl_c().await.is_ok() {}
    });

    orchestrator.after_spawn().await;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(event) = orchestrator.next_event() => match event {
                OrchestratorEvent::SessionEnded { ended_at } => {
                    let coordinator = Arc::clone(&coordinator);
                    orchestrator = orchestrator
                        .transition(ended_at, |_| async move {
                            log_report(&coordinator.run_final().await);
                        })
                        .await;
                }
            },
        }
    };
    let code = match status {
        Ok(status) => status.code().unwrap_or(1),
        Err(e) => {
            tracing::warn!("Failed to wait for {}: {}", program, e);
            1
        }
    };

    orchestrator.prepare_for_exit().await;
    if let Some(handle) = sync_handle {
        log_report(&handle.shutdown().await);
    }
    orchestrator.mark_complete(code).await;
    Ok(code)
}
