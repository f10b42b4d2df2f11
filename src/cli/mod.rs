//! Command-line interface for chronicle.
//!
//! Provides commands for serving the event gateway, running generations in
//! process, and inspecting snapshots and configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use uuid::Uuid;

use crate::config::{self, ResolvedConfig};
use crate::core::{Orchestrator, RunOutcome, RunRequest, StartedRun};
use crate::domain::{EventType, LogSeq, PhaseName, StreamEvent};
use crate::server;
use crate::stream::{EventBuffer, StartFrom};

pub mod remote;

/// Server address used by `tail` and `history`
const DEFAULT_SERVER: &str = "http://127.0.0.1:8787";

/// Events remembered for duplicate suppression while following a run
const FOLLOW_BUFFER: usize = 512;

/// chronicle - Multi-agent story generation orchestrator
#[derive(Parser, Debug)]
#[command(name = "chronicle")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP server (event stream, run control, recovery)
    Serve {
        /// Address to bind to (overrides config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Allow cross-origin requests
        #[arg(long)]
        dev: bool,
    },

    /// Run a generation in this process
    Generate {
        /// Project the run belongs to
        #[arg(short, long)]
        project: String,

        /// Number of scenes to draft
        #[arg(short, long, default_value = "3")]
        scenes: u32,

        /// Stop after a run-level phase
        #[arg(long, value_enum)]
        stop_after: Option<StopPhase>,

        /// Print the run's events as they are published
        #[arg(short, long)]
        follow: bool,
    },

    /// Resume an interrupted run from its snapshot
    Resume {
        /// Run ID to resume
        run_id: String,

        /// Print the run's events as they are published
        #[arg(short, long)]
        follow: bool,
    },

    /// Follow a run's live events on a running server
    Tail {
        /// Run ID
        run_id: String,

        /// Resume after this log sequence (default: only new events)
        #[arg(long)]
        from: Option<u64>,

        /// Server base URL
        #[arg(long, env = "CHRONICLE_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Print a run's recent events from a running server
    History {
        /// Run ID
        run_id: String,

        /// Maximum number of events
        #[arg(short, long, default_value = "100")]
        count: usize,

        /// Server base URL
        #[arg(long, env = "CHRONICLE_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Manage run snapshots
    Snapshots {
        #[command(subcommand)]
        command: SnapshotCommands,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommands {
    /// List snapshots on disk
    List,

    /// Delete snapshots older than the retention window
    Prune,

    /// Delete one run's snapshot
    Delete {
        /// Run ID
        run_id: String,
    },
}

/// Run-level phases accepted by `--stop-after` (maps to PhaseName)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StopPhase {
    Premise,
    Characters,
    WorldBuilding,
    Outline,
}

impl From<StopPhase> for PhaseName {
    fn from(p: StopPhase) -> Self {
        match p {
            StopPhase::Premise => PhaseName::Premise,
            StopPhase::Characters => PhaseName::Characters,
            StopPhase::WorldBuilding => PhaseName::WorldBuilding,
            StopPhase::Outline => PhaseName::Outline,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve { bind, dev } => serve(bind, dev).await,
            Commands::Generate {
                project,
                scenes,
                stop_after,
                follow,
            } => {
                let mut request = RunRequest::new(project, scenes);
                request.stop_after = stop_after.map(PhaseName::from);
                generate(request, follow).await
            }
            Commands::Resume { run_id, follow } => resume(&run_id, follow).await,
            Commands::Tail {
                run_id,
                from,
                server,
            } => tail(&run_id, from, &server).await,
            Commands::History {
                run_id,
                count,
                server,
            } => history(&run_id, count, &server).await,
            Commands::Snapshots { command } => execute_snapshots(command).await,
            Commands::Config => show_config().await,
        }
    }
}

fn parse_run_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid run ID: {}", raw))
}

/// Start the HTTP server
async fn serve(bind: Option<String>, dev: bool) -> Result<()> {
    let mut cfg: ResolvedConfig = config::config()?.clone();
    if let Some(bind) = bind {
        cfg.server.bind = bind;
    }
    if dev {
        cfg.server.dev_mode = true;
    }
    server::start_server(&cfg).await
}

/// Start a run and wait for it, optionally printing its events
async fn generate(mut request: RunRequest, follow: bool) -> Result<()> {
    let services = server::build_services(config::config()?)?;
    let orchestrator = services.orchestrator;

    let run_id = *request.run_id.get_or_insert_with(Uuid::new_v4);
    let follower = spawn_follower(&orchestrator, run_id, follow).await?;

    let started = orchestrator.start(request).await?;
    eprintln!("[Run {} started]", started.handle.run_id);
    finish(started, follower).await
}

/// Resume a run from its snapshot
async fn resume(run_id_str: &str, follow: bool) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let services = server::build_services(config::config()?)?;
    let orchestrator = services.orchestrator;

    let follower = spawn_follower(&orchestrator, run_id, follow).await?;
    let started = orchestrator.resume(run_id).await?;
    eprintln!("[Run {} resumed]", run_id);
    finish(started, follower).await
}

/// Subscribe before the run starts so no event is missed
async fn spawn_follower(
    orchestrator: &Orchestrator,
    run_id: Uuid,
    follow: bool,
) -> Result<Option<tokio::task::JoinHandle<()>>> {
    if !follow {
        return Ok(None);
    }
    if !orchestrator.gateway().is_enabled() {
        eprintln!("[No log store configured; --follow ignored]");
        return Ok(None);
    }

    let mut events = orchestrator
        .gateway()
        .subscribe(run_id, StartFrom::After(LogSeq::ORIGIN))
        .await
        .context("Failed to subscribe to run events")?;

    Ok(Some(tokio::spawn(async move {
        let mut buffer = EventBuffer::new(FOLLOW_BUFFER);
        while let Some(event) = events.next().await {
            if event.event_type == EventType::Heartbeat || !buffer.push(event.clone()) {
                continue;
            }
            print_event(&event);
        }
    })))
}

/// Follow a run on a remote server
async fn tail(run_id_str: &str, from: Option<u64>, server: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let client = remote::GatewayClient::new(server);
    client
        .tail(run_id, from.map(LogSeq), |event| {
            if event.event_type != EventType::Connected {
                print_event(event);
            }
        })
        .await
}

/// Print recent events from a remote server
async fn history(run_id_str: &str, count: usize, server: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let client = remote::GatewayClient::new(server);
    let events = client.history(run_id, count).await?;

    if events.is_empty() {
        println!("No events for run {}", run_id);
        return Ok(());
    }
    for event in &events {
        print_event(event);
    }
    Ok(())
}

fn print_event(event: &StreamEvent) {
    let seq = event
        .log_seq
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:>6} {} {:<24} {}",
        seq,
        event.timestamp.format("%H:%M:%S"),
        event.event_type,
        event.payload
    );
}

async fn finish(
    started: StartedRun,
    follower: Option<tokio::task::JoinHandle<()>>,
) -> Result<()> {
    let run_id = started.handle.run_id;
    let outcome = started.task.await.context("Run task panicked")?;

    if let Some(follower) = follower {
        let _ = follower.await;
    }

    match outcome {
        RunOutcome::Completed => {
            eprintln!("\n[Run {} completed successfully]", run_id);
        }
        RunOutcome::Stopped { phase } => {
            eprintln!("\n[Run {} stopped after {}]", run_id, phase);
        }
        RunOutcome::Cancelled { phase, scene } => {
            eprintln!("\n[Run {} cancelled at {} (scene {})]", run_id, phase, scene);
        }
        RunOutcome::Failed { error } => {
            eprintln!("\n[Run {} failed: {}]", run_id, error);
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Execute snapshot subcommands
async fn execute_snapshots(command: SnapshotCommands) -> Result<()> {
    let cfg = config::config()?;
    let recovery = crate::core::RecoveryManager::new(cfg.runs_dir(), cfg.retention_days);

    match command {
        SnapshotCommands::List => {
            let snapshots = recovery.discover()?;
            if snapshots.is_empty() {
                println!("No snapshots found");
                return Ok(());
            }

            println!(
                "{:<38} {:<16} {:<16} {:<8} {:<10}",
                "RUN ID", "PROJECT", "PHASE", "SCENE", "RESUMABLE"
            );
            println!("{}", "-".repeat(92));
            for info in snapshots {
                println!(
                    "{:<38} {:<16} {:<16} {:<8} {:<10}",
                    info.run_id,
                    info.project_id,
                    info.phase,
                    format!("{}/{}", info.checkpoint_scene, info.total_scenes),
                    if info.resumable { "yes" } else { "no" }
                );
            }
        }
        SnapshotCommands::Prune => {
            let pruned = recovery.prune_expired()?;
            println!("Pruned {} snapshot(s)", pruned.len());
            for run_id in pruned {
                println!("  {}", run_id);
            }
        }
        SnapshotCommands::Delete { run_id } => {
            let run_id = parse_run_id(&run_id)?;
            if recovery.delete(run_id)? {
                println!("Deleted snapshot for {}", run_id);
            } else {
                println!("No snapshot for {}", run_id);
            }
        }
    }

    Ok(())
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Chronicle Configuration");
    println!("{}", "=".repeat(60));
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home: {}", cfg.home.display());
    println!("  Runs: {}", cfg.runs_dir().display());
    println!();
    println!("Event log:");
    println!(
        "  Store URL:        {}",
        cfg.log_url.as_deref().unwrap_or("(none - streaming disabled)")
    );
    println!("  Run log max:      {}", cfg.publisher.run_max_len);
    println!("  Global log max:   {}", cfg.publisher.global_max_len);
    println!("  Heartbeat:        {}s", cfg.gateway.heartbeat.as_secs());
    println!("  Poll interval:    {}ms", cfg.gateway.poll_interval.as_millis());
    println!("  History limit:    {}", cfg.gateway.history_limit);
    println!("  Lag threshold:    {}", cfg.monitor.lag_threshold);
    if !cfg.consumer_groups.is_empty() {
        println!("  Consumer groups:  {}", cfg.consumer_groups.join(", "));
    }
    println!();
    println!("Generation limits:");
    println!("  Max scenes:       {}", cfg.limits.max_scenes);
    println!("  Max revisions:    {}", cfg.limits.max_revisions);
    println!("  Archivist every:  {} scene(s)", cfg.limits.archivist_interval);
    println!("  Step timeout:     {}s", cfg.limits.step_timeout_seconds);
    println!("  Run deadline:     {}s", cfg.limits.run_deadline_seconds);
    println!("  Retry attempts:   {}", cfg.retry.attempts);
    println!();
    println!("Recovery:");
    if cfg.retention_days == 0 {
        println!("  Retention:        forever");
    } else {
        println!("  Retention:        {} days", cfg.retention_days);
    }
    println!();
    println!("Server:");
    println!("  Bind:             {}", cfg.server.bind);
    println!("  Dev mode:         {}", cfg.server.dev_mode);
    println!();
    println!("Steps:");
    if cfg.steps.is_empty() {
        println!("  (none configured)");
    } else {
        for (name, step) in &cfg.steps {
            println!("  {}: {} {}", name, step.command, step.args.join(" "));
        }
    }

    Ok(())
}
