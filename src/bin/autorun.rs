//! autorun CLI: run schedules unattended, or check a schedule file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use autorun::bus::EventBus;
use autorun::config::Config;
use autorun::engine::Scheduler;
use autorun::event::{EventKind, EventType};
use autorun::playback::DryRunPlayback;
use autorun::storage::{InMemoryScheduleRepository, ScheduleRepository, load_schedules};
use autorun::telemetry::{TelemetryConfig, init_telemetry};
use autorun::worker::TaskManager;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "autorun", about = "Unattended automation runner")]
struct Cli {
    /// TOML config file (defaults to AUTORUN_* environment variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Serve {
        /// Schedule file with [[schedule]] tables
        #[arg(long)]
        schedules: PathBuf,
        /// Simulated playback duration per execution (seconds)
        #[arg(long, default_value_t = 2.0)]
        dry_run_secs: f64,
    },
    /// Validate a schedule file and print next execution times
    Check {
        #[arg(long)]
        schedules: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let mut config = Config::from_toml_file(path)?;
            config.otel_endpoint = config
                .otel_endpoint
                .or_else(|| std::env::var("OTEL_ENDPOINT").ok());
            config
        }
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Serve {
            schedules,
            dry_run_secs,
        } => cmd_serve(config, &schedules, dry_run_secs).await,
        Command::Check { schedules } => cmd_check(&schedules),
    }
}

async fn cmd_serve(config: Config, schedules: &Path, dry_run_secs: f64) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from(&config))?;

    let repository = Arc::new(InMemoryScheduleRepository::with_schedules(load_schedules(
        schedules,
    )?));
    let playback = Arc::new(DryRunPlayback::new(
        Duration::try_from_secs_f64(dry_run_secs)?,
        10,
    ));

    let bus = EventBus::new(config.event_bus.clone())?;
    bus.subscribe(EventType::Execution, |event| {
        match &event.kind {
            EventKind::ExecutionCompleted {
                schedule_id,
                duration_ms,
                ..
            } => info!(schedule_id = %schedule_id, duration_ms, "execution completed"),
            EventKind::ExecutionFailed {
                schedule_id, error, ..
            } => warn!(schedule_id = %schedule_id, %error, "execution failed"),
            _ => {}
        }
        Ok(())
    });
    bus.subscribe(EventType::Error, |event| {
        if let EventKind::Error { code, message, .. } = &event.kind {
            warn!(code = %code, %message, source = %event.source, "error reported");
        }
        Ok(())
    });

    let tasks = TaskManager::with_event_bus(config.tasks.clone(), bus.clone());
    let scheduler = Scheduler::new(
        config.scheduler.clone(),
        Arc::clone(&repository) as Arc<dyn ScheduleRepository>,
        playback,
        tasks.clone(),
    )
    .with_event_bus(bus.clone());

    for schedule in repository.all() {
        match scheduler.activate(schedule.id).await {
            Ok(armed) => info!(
                schedule = %armed.name,
                next_execution_at = ?armed.next_execution_at,
                "schedule armed"
            ),
            Err(e) => warn!(schedule = %schedule.name, "schedule not activated: {e}"),
        }
    }

    scheduler.start()?;
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");

    scheduler.stop().await;
    let drained = tokio::task::spawn_blocking({
        let tasks = tasks.clone();
        let timeout = config.event_bus.shutdown_timeout;
        move || tasks.shutdown(timeout)
    })
    .await?;
    if !drained {
        warn!("background tasks still running at exit");
    }
    let stats = scheduler.statistics();
    info!(
        total = stats.total_executions,
        successful = stats.successful_executions,
        failed = stats.failed_executions,
        "scheduler statistics"
    );
    tokio::task::spawn_blocking(move || bus.shutdown()).await?;
    Ok(())
}

fn cmd_check(schedules: &Path) -> anyhow::Result<()> {
    let schedules = load_schedules(schedules)?;
    if schedules.is_empty() {
        println!("No schedules found.");
        return Ok(());
    }

    let now = Utc::now();
    println!("{:<24}  {:<10}  {:<8}  NEXT", "NAME", "TRIGGER", "VALID");
    println!("{}", "-".repeat(72));

    let mut invalid = 0;
    for schedule in &schedules {
        let (valid, next) = match schedule.validate(now) {
            Ok(()) => (
                "yes",
                schedule
                    .compute_next_execution(now)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| "on external signal".to_string()),
            ),
            Err(e) => {
                invalid += 1;
                ("no", e.to_string())
            }
        };
        println!(
            "{:<24}  {:<10}  {:<8}  {}",
            schedule.name,
            schedule.trigger.kind(),
            valid,
            next
        );
    }

    println!("\n{} schedule(s), {invalid} invalid", schedules.len());
    if invalid > 0 {
        anyhow::bail!("{invalid} invalid schedule(s)");
    }
    Ok(())
}
