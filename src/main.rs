//! # OpsClaw: Task Automation Scheduler
//!
//! Discovers tasks, keeps schedules.toml in step with them, and runs each
//! task in its own process on a cron schedule.
//!
//! Usage:
//!   opsclaw                              # Run the scheduler daemon
//!   opsclaw discover --cleanup           # Rescan tasks/, drop orphaned schedules
//!   opsclaw schedules                    # Show schedule status
//!   opsclaw run monitoring/dns_monitor   # Run one task right now

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use opsclaw_core::config::CONFIG_ENV;
use opsclaw_core::{OpsClawConfig, ScheduleEntry};
use opsclaw_scheduler::status::format_time;
use opsclaw_scheduler::{ProcessLauncher, Scheduler, StopHandle, TaskExecution};
use opsclaw_tasks::builtin::builtin_tasks;
use opsclaw_tasks::integrity::validate_task_integrity;
use opsclaw_tasks::reconcile::{signal_reload, sync_schedules_with_discovered};
use opsclaw_tasks::{CredentialFileResolver, TaskDiscovery, TaskRegistry};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "opsclaw",
    version,
    about = "⏰ OpsClaw: cron scheduler for operational automation tasks"
)]
struct Cli {
    /// Config file (default: $OPSCLAW_CONFIG, then ~/.opsclaw/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the task manifest directory
    #[arg(long, global = true)]
    tasks_dir: Option<String>,

    /// Override the directory holding schedules, state and history
    #[arg(long, global = true)]
    config_dir: Option<String>,

    /// Log filter, e.g. "info" or "opsclaw_scheduler=debug"
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the tasks directory and save the task registry
    Discover {
        /// Remove schedules whose task no longer exists
        #[arg(long)]
        cleanup: bool,
        /// Check dependencies and descriptors
        #[arg(long)]
        validate: bool,
        /// Add default schedules for tasks that have none
        #[arg(long)]
        sync_schedules: bool,
    },
    /// List available tasks by category
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show schedule status
    #[command(alias = "status")]
    Schedules {
        #[arg(long)]
        json: bool,
    },
    /// Enable a scheduled task
    Enable { task: String },
    /// Disable a scheduled task
    Disable { task: String },
    /// Create or replace a schedule
    Schedule {
        task: String,
        /// Five-field cron expression, e.g. "*/15 * * * *"
        cron: String,
        /// Maximum runtime in seconds
        #[arg(long, default_value = "3600")]
        timeout: u64,
        /// Early re-runs after a failure
        #[arg(long, default_value = "1")]
        retries: u32,
        /// Create the schedule disabled
        #[arg(long)]
        disabled: bool,
    },
    /// Run a task once, right now
    Run {
        task: String,
        /// JSON file with the task config (default: the schedule's config)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Show recent executions of a task
    History {
        task: String,
        #[arg(long, default_value = "10")]
        count: usize,
        #[arg(long)]
        json: bool,
    },
    /// Check discovery, task integrity and the config directory
    Health {
        #[arg(long)]
        json: bool,
    },
    /// Run the scheduler until interrupted
    Daemon,
    /// Worker entry point for compiled-in tasks
    #[command(hide = true)]
    RunTask { task: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let mut config = OpsClawConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.tasks_dir {
        config.tasks_dir = dir.clone();
    }
    if let Some(dir) = &cli.config_dir {
        config.config_dir = dir.clone();
    }

    let ok = match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Discover {
            cleanup,
            validate,
            sync_schedules,
        } => cmd_discover(&config, cleanup, validate, sync_schedules)?,
        Commands::List { json } => cmd_list(&config, json)?,
        Commands::Schedules { json } => {
            let scheduler = open_scheduler(&config, cli.config.as_deref())?;
            let status = scheduler.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", status.render());
            }
            true
        }
        Commands::Enable { task } => {
            let scheduler = open_scheduler(&config, cli.config.as_deref())?;
            scheduler.enable_task(&task).await?;
            notify_daemon(&config, &scheduler).await?;
            println!("▶️  Enabled {task}");
            true
        }
        Commands::Disable { task } => {
            let scheduler = open_scheduler(&config, cli.config.as_deref())?;
            scheduler.disable_task(&task).await?;
            notify_daemon(&config, &scheduler).await?;
            println!("⏸️  Disabled {task}");
            true
        }
        Commands::Schedule {
            task,
            cron,
            timeout,
            retries,
            disabled,
        } => {
            let scheduler = open_scheduler(&config, cli.config.as_deref())?;
            let entry = ScheduleEntry {
                cron: cron.clone(),
                enabled: !disabled,
                max_runtime: timeout,
                retry_count: retries,
                ..ScheduleEntry::default()
            };
            scheduler.add_schedule(&task, entry).await?;
            notify_daemon(&config, &scheduler).await?;
            println!("📅 Scheduled {task}: {cron}");
            true
        }
        Commands::Run { task, config: task_config } => {
            let scheduler = open_scheduler(&config, cli.config.as_deref())?;
            let payload = match task_config {
                Some(path) => {
                    let content = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    Some(serde_json::from_str(&content)
                        .with_context(|| format!("parsing {}", path.display()))?)
                }
                None => None,
            };
            println!("🚀 Running {task}...");
            let execution = scheduler.run_once(&task, payload).await?;
            print_execution(&execution);
            execution.success
        }
        Commands::History { task, count, json } => {
            let scheduler = open_scheduler(&config, cli.config.as_deref())?;
            let executions = scheduler.history(&task, count).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&executions)?);
            } else if executions.is_empty() {
                println!("No executions recorded for {task}");
            } else {
                for execution in &executions {
                    print_execution(execution);
                }
            }
            true
        }
        Commands::Health { json } => cmd_health(&config, json)?,
        Commands::Daemon => {
            run_daemon(&config, cli.config.as_deref()).await?;
            true
        }
        Commands::RunTask { task } => {
            let resolver = CredentialFileResolver::from_config(&config.credentials);
            opsclaw_tasks::worker::run_from_env(&task, &resolver).await?
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(cli: &Cli) {
    let filter = match (&cli.log_level, cli.verbose) {
        (Some(level), _) => level.clone(),
        (None, true) => "debug".into(),
        (None, false) => "info".into(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn discovery(config: &OpsClawConfig) -> TaskDiscovery {
    TaskDiscovery::new(config.tasks_dir()).with_builtins(builtin_tasks())
}

fn discover_registry(config: &OpsClawConfig) -> TaskRegistry {
    let mut discovery = discovery(config);
    discovery.discover();
    discovery.into_registry()
}

fn launcher(config: &OpsClawConfig, config_path: Option<&Path>) -> Result<ProcessLauncher> {
    let mut launcher = ProcessLauncher::current_exe(config.run_dir())?
        .with_grace_period(Duration::from_secs(config.scheduler.grace_period_secs));
    // Re-executed workers must read the same credentials config.
    if let Some(path) = config_path {
        launcher = launcher.with_env(CONFIG_ENV, path.display().to_string());
    }
    Ok(launcher)
}

fn open_scheduler(config: &OpsClawConfig, config_path: Option<&Path>) -> Result<Scheduler> {
    let registry = discover_registry(config);
    Ok(Scheduler::new(config, registry, launcher(config, config_path)?)?)
}

/// A running daemon picks schedule edits up on its next poll.
async fn notify_daemon(config: &OpsClawConfig, scheduler: &Scheduler) -> Result<()> {
    let status = scheduler.status().await;
    signal_reload(
        &config.reload_signal(),
        scheduler.registry().len(),
        status.total_tasks,
    )?;
    Ok(())
}

fn cmd_discover(
    config: &OpsClawConfig,
    cleanup: bool,
    validate: bool,
    sync_schedules: bool,
) -> Result<bool> {
    let resolver = CredentialFileResolver::from_config(&config.credentials);
    let mut discovery = discovery(config);
    let mut healthy = true;

    if cleanup {
        let report =
            discovery.discover_with_cleanup(&config.schedules_file(), &config.reload_signal(), &resolver)?;
        println!("🔎 Discovered {} task(s)", report.discovered);
        for name in &report.orphans_removed {
            println!("🧹 Removed orphaned schedule: {name}");
        }
        if report.cleanup_skipped {
            println!("⚠️  Orphan cleanup skipped: {} manifest(s) failed to load", report.load_errors.len());
        }
        healthy = !validate || report.integrity.is_healthy();
    } else {
        discovery.discover();
        println!("🔎 Discovered {} task(s)", discovery.registry().len());
        if validate {
            let report = validate_task_integrity(discovery.registry(), &resolver, discovery.load_errors());
            report.log_summary();
            healthy = report.is_healthy();
        }
    }
    for error in discovery.load_errors() {
        println!("❌ {}: {}", error.path.display(), error.message);
    }

    let registry = discovery.registry();
    if sync_schedules {
        let added = sync_schedules_with_discovered(registry, &config.schedules_file())?;
        println!("📅 Added {} default schedule(s)", added.len());
    }
    registry.save(&config.registry_file())?;
    println!("💾 Registry saved to {}", config.registry_file().display());
    Ok(healthy)
}

fn cmd_list(config: &OpsClawConfig, json: bool) -> Result<bool> {
    let registry = discover_registry(config);
    if json {
        println!("{}", serde_json::to_string_pretty(&registry.metadata_map())?);
        return Ok(true);
    }

    let mut by_category: BTreeMap<&str, Vec<_>> = BTreeMap::new();
    for (name, descriptor) in registry.iter() {
        by_category
            .entry(descriptor.metadata.category.as_str())
            .or_default()
            .push((name, &descriptor.metadata));
    }
    println!("📋 {} task(s)\n", registry.len());
    for (category, tasks) in by_category {
        println!("{category}:");
        for (name, meta) in tasks {
            println!("  {name}");
            if !meta.description.is_empty() {
                println!("      {}", meta.description);
            }
            println!(
                "      schedule: {}  max runtime: {}s  kind: {}",
                meta.default_schedule.as_deref().unwrap_or("-"),
                meta.max_runtime,
                meta.kind
            );
        }
    }
    Ok(true)
}

fn cmd_health(config: &OpsClawConfig, json: bool) -> Result<bool> {
    let resolver = CredentialFileResolver::from_config(&config.credentials);
    let mut discovery = discovery(config);
    discovery.discover();
    let integrity = validate_task_integrity(discovery.registry(), &resolver, discovery.load_errors());
    let writable = config_dir_writable(&config.config_dir());
    let healthy = integrity.is_healthy() && writable && !discovery.registry().is_empty();

    if json {
        let report = serde_json::json!({
            "healthy": healthy,
            "tasks_discovered": discovery.registry().len(),
            "config_dir_writable": writable,
            "integrity": integrity,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{} Health", if healthy { "✅" } else { "❌" });
        println!("   Tasks discovered:    {}", discovery.registry().len());
        println!("   Valid tasks:         {}", integrity.valid_tasks.len());
        println!("   Invalid tasks:       {}", integrity.invalid_tasks.len());
        println!("   Missing dependencies: {}", integrity.missing_dependencies.len());
        println!("   Import errors:       {}", integrity.import_errors.len());
        println!("   Config dir writable: {writable}");
    }
    Ok(healthy)
}

fn config_dir_writable(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(".opsclaw-write-test");
    let ok = std::fs::write(&probe, b"ok").is_ok();
    let _ = std::fs::remove_file(&probe);
    ok
}

fn print_execution(execution: &TaskExecution) {
    let icon = if execution.success { "✅" } else { "❌" };
    let duration = execution
        .duration_seconds()
        .map(|secs| format!("{secs:.1}s"))
        .unwrap_or_else(|| "-".into());
    println!(
        "{icon} {}  started {}  duration {}  attempt {}",
        execution.task_name,
        format_time(Some(execution.start_time)),
        duration,
        execution.attempt
    );
    if let Some(error) = &execution.error {
        println!("   error: {error}");
    }
    if let Some(result) = &execution.result {
        println!("   result: {result}");
    }
}

async fn run_daemon(config: &OpsClawConfig, config_path: Option<&Path>) -> Result<()> {
    println!("⏰ OpsClaw scheduler v{}", env!("CARGO_PKG_VERSION"));

    let mut previous = TaskRegistry::new();
    if let Err(e) = previous.load(&config.registry_file()) {
        tracing::warn!("⚠️ Ignoring unreadable registry file: {e}");
    }
    let resolver = CredentialFileResolver::from_config(&config.credentials);
    let mut discovery = discovery(config).with_previous(previous.names());
    let report =
        discovery.discover_with_cleanup(&config.schedules_file(), &config.reload_signal(), &resolver)?;
    if !report.integrity.is_healthy() {
        tracing::warn!("⚠️ Some tasks failed integrity checks; see above");
    }
    let registry = discovery.into_registry();
    sync_schedules_with_discovered(&registry, &config.schedules_file())?;
    registry.save(&config.registry_file())?;

    let scheduler = Arc::new(Scheduler::new(config, registry, launcher(config, config_path)?)?);
    tokio::spawn(stop_on_signal(scheduler.stop_handle()));

    scheduler.run_scheduler_loop().await;
    Ok(())
}

async fn stop_on_signal(stop: StopHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("⚠️ Cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("🛑 Shutdown signal received");
    stop.stop();
}
