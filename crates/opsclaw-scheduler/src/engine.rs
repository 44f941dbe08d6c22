//! Scheduler Engine: the run loop and the per-task execution procedure.
//!
//! Per task, per tick:
//! `IDLE → due && not running → DISPATCHED → process started → RUNNING →
//! exit | timeout | launch error → RECORDED → IDLE`.
//!
//! Dispatch decisions are made by the loop alone and each schedule sits
//! behind its own lock, so a task can never have two live executions. With
//! `concurrent_dispatch` the wait for each process runs on its own tokio
//! task; otherwise due tasks are supervised one after another.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opsclaw_core::config::{OpsClawConfig, SchedulerConfig};
use opsclaw_core::error::{OpsClawError, Result};
use opsclaw_core::schedules::{ScheduleConfig, ScheduleEntry};
use opsclaw_tasks::reconcile::default_entry;
use opsclaw_tasks::registry::TaskRegistry;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinSet;

use crate::launcher::{ProcessLauncher, ProcessOutcome, RunningProcess};
use crate::schedule::{TaskExecution, TaskSchedule};
use crate::state::{HistorySnapshot, StateSnapshot, StateStore};
use crate::status::{SchedulerStatus, TaskStatus, RECENT_EXECUTIONS};

type SharedSchedule = Arc<Mutex<TaskSchedule>>;

/// Result of the first half of an execution.
#[derive(Debug)]
pub enum Dispatch {
    /// Unknown schedule, or the task is still running.
    Skipped,
    /// Ended before a process could be supervised (e.g. launch failure).
    Finished(TaskExecution),
    Started(PendingRun),
}

/// A started process waiting to be supervised.
#[derive(Debug)]
pub struct PendingRun {
    schedule: SharedSchedule,
    execution: TaskExecution,
    process: RunningProcess,
    max_runtime: u64,
}

impl PendingRun {
    pub fn execution(&self) -> &TaskExecution {
        &self.execution
    }
}

/// Cloneable handle that asks a running loop to stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

pub struct Scheduler {
    registry: TaskRegistry,
    launcher: ProcessLauncher,
    settings: SchedulerConfig,
    schedules_file: PathBuf,
    reload_signal: PathBuf,
    schedules: RwLock<BTreeMap<String, SharedSchedule>>,
    /// Entries whose cron failed to parse: not scheduled, but written back.
    rejected: RwLock<BTreeMap<String, ScheduleEntry>>,
    store: StateStore,
    running: AtomicBool,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Scheduler {
    /// Load the schedule configuration (falling back to task defaults when
    /// the file is missing, without writing it) and restore runtime state
    /// and history.
    pub fn new(config: &OpsClawConfig, registry: TaskRegistry, launcher: ProcessLauncher) -> Result<Self> {
        let schedules_file = config.schedules_file();
        let schedule_config = if schedules_file.exists() {
            ScheduleConfig::load(&schedules_file)?
        } else {
            let generated = default_schedules(&registry);
            tracing::info!(
                "📝 {} not found, using {} default schedule(s)",
                schedules_file.display(),
                generated.len()
            );
            generated
        };

        let now = Utc::now();
        let (schedules, rejected) = build_schedules(&registry, schedule_config, now);
        let store = StateStore::new(config.state_file(), config.history_file());
        let state = store.load_state();
        let mut history = store.load_history();
        let mut map = BTreeMap::new();
        for (name, mut schedule) in schedules {
            if let Some(task_state) = state.get(&name) {
                schedule.apply_state(task_state);
            }
            if let Some(executions) = history.remove(&name) {
                schedule.restore_history(executions);
            }
            map.insert(name, Arc::new(Mutex::new(schedule)));
        }
        tracing::info!(
            "📅 Loaded {} schedule(s) ({} rejected)",
            map.len(),
            rejected.len()
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            registry,
            launcher,
            settings: config.scheduler.clone(),
            schedules_file,
            reload_signal: config.reload_signal(),
            schedules: RwLock::new(map),
            rejected: RwLock::new(rejected),
            store,
            running: AtomicBool::new(false),
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    pub fn stop(&self) {
        tracing::info!("🛑 Scheduler stop requested");
        self.shutdown.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn schedule(&self, name: &str) -> Option<SharedSchedule> {
        self.schedules.read().await.get(name).cloned()
    }

    // ── Administrative operations ───────────────────────────

    /// Create or replace a schedule. An existing schedule keeps its history
    /// and any in-flight execution.
    pub async fn add_schedule(&self, name: &str, entry: ScheduleEntry) -> Result<()> {
        let now = Utc::now();
        if !self.registry.contains(name) {
            tracing::warn!("Adding schedule for unregistered task {}", name);
        }
        let existing = self.schedule(name).await;
        match existing {
            Some(schedule) => {
                schedule.lock().await.reconfigure(entry.clone(), now)?;
            }
            None => {
                let schedule = TaskSchedule::new_at(name, entry.clone(), now)?;
                self.schedules
                    .write()
                    .await
                    .insert(name.to_string(), Arc::new(Mutex::new(schedule)));
            }
        }
        self.rejected.write().await.remove(name);
        tracing::info!("📅 Schedule set: {} ({})", name, entry.cron);
        self.save_schedules().await?;
        self.persist_state().await
    }

    pub async fn enable_task(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true).await
    }

    pub async fn disable_task(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let schedule = self
            .schedule(name)
            .await
            .ok_or_else(|| OpsClawError::ScheduleNotFound(name.to_string()))?;
        schedule.lock().await.set_enabled(enabled);
        tracing::info!(
            "{} {}",
            if enabled { "▶️ Enabled" } else { "⏸️ Disabled" },
            name
        );
        self.save_schedules().await?;
        self.persist_state().await
    }

    /// Re-read the schedule configuration. Surviving schedules keep their
    /// history, retry counter and in-flight execution; the rest are dropped.
    pub async fn reload_schedules(&self) -> Result<()> {
        let config = ScheduleConfig::load(&self.schedules_file)?;
        let now = Utc::now();
        let mut rejected = BTreeMap::new();
        {
            let mut map = self.schedules.write().await;
            map.retain(|name, _| config.contains(name));
            for (name, entry) in config.schedules {
                let outcome = match map.get(&name) {
                    Some(schedule) => schedule.lock().await.reconfigure(entry.clone(), now),
                    None => TaskSchedule::new_at(name.clone(), entry.clone(), now).map(|s| {
                        map.insert(name.clone(), Arc::new(Mutex::new(s)));
                    }),
                };
                if let Err(e) = outcome {
                    tracing::error!("❌ Not scheduling {}: {}", name, e);
                    map.remove(&name);
                    rejected.insert(name, entry);
                }
            }
            tracing::info!("🔄 Reloaded {} schedule(s)", map.len());
        }
        *self.rejected.write().await = rejected;
        self.persist_state().await
    }

    /// Rewrite schedules.toml from the in-memory model.
    async fn save_schedules(&self) -> Result<()> {
        let mut config = ScheduleConfig::default();
        for (name, schedule) in self.schedules.read().await.iter() {
            config.insert(name.clone(), schedule.lock().await.entry().clone());
        }
        for (name, entry) in self.rejected.read().await.iter() {
            config.insert(name.clone(), entry.clone());
        }
        config.save(&self.schedules_file)
    }

    /// Write the state and history files.
    pub async fn persist_state(&self) -> Result<()> {
        // Snapshot under the writer lock so a stale snapshot never lands last.
        let writer = self.store.lock().await;
        let mut state = StateSnapshot::new();
        let mut history = HistorySnapshot::new();
        for (name, schedule) in self.schedules.read().await.iter() {
            let schedule = schedule.lock().await;
            state.insert(name.clone(), schedule.state());
            history.insert(name.clone(), schedule.history().cloned().collect());
        }
        writer.save(&state, &history)
    }

    // ── Execution ───────────────────────────────────────────

    /// Run one task to completion. `None` when there is no such schedule or
    /// the task is already running.
    pub async fn execute_scheduled_task(&self, name: &str) -> Option<TaskExecution> {
        let execution = match self.dispatch(name).await {
            Dispatch::Skipped => return None,
            Dispatch::Finished(execution) => execution,
            Dispatch::Started(pending) => self.supervise(pending).await,
        };
        if let Err(e) = self.persist_state().await {
            tracing::warn!("⚠️ Failed to save scheduler state: {e}");
        }
        Some(execution)
    }

    /// Skip check, execution record and process start, all under the
    /// task's lock.
    pub async fn dispatch(&self, name: &str) -> Dispatch {
        let Some(schedule) = self.schedule(name).await else {
            tracing::warn!("No schedule for {}", name);
            return Dispatch::Skipped;
        };
        let mut sched = schedule.lock().await;
        if sched.is_running() {
            tracing::info!("⏭️ {} is still running, skipping", name);
            return Dispatch::Skipped;
        }

        let mut execution = TaskExecution::new(name, sched.retry_attempt() + 1);
        let max_runtime = sched.max_runtime();
        let started = self.start_process(name, sched.config()).map(|process| {
            execution.attach_process(process.handle());
            process
        });
        match started {
            Ok(process) => {
                tracing::info!(
                    "🔔 Task triggered: {} (pid {}, attempt {})",
                    name,
                    process.pid(),
                    execution.attempt
                );
                sched.begin_execution(execution.clone());
                drop(sched);
                Dispatch::Started(PendingRun {
                    schedule,
                    execution,
                    process,
                    max_runtime,
                })
            }
            Err(e) => {
                execution.fail(failure_message(&e));
                self.record(&mut sched, execution.clone(), false);
                Dispatch::Finished(execution)
            }
        }
    }

    fn start_process(&self, name: &str, config: &toml::Table) -> Result<RunningProcess> {
        let entry = self
            .registry
            .get(name)
            .and_then(|d| d.entry.clone())
            .ok_or_else(|| OpsClawError::task(format!("Task '{name}' is not registered")))?;
        let config = serde_json::to_value(config).map_err(OpsClawError::serialization)?;
        let id = uuid::Uuid::new_v4().to_string();
        self.launcher.spawn(name, &entry, &config, &id)
    }

    /// Wait for the process, then record the outcome and the next run.
    pub async fn supervise(&self, pending: PendingRun) -> TaskExecution {
        let PendingRun {
            schedule,
            mut execution,
            process,
            max_runtime,
        } = pending;

        let mut timed_out = false;
        match process
            .wait_with_timeout(Duration::from_secs(max_runtime))
            .await
        {
            Ok(ProcessOutcome::Exited { code: 0, output }) => execution.succeed(output.result),
            Ok(ProcessOutcome::Exited { code, output }) => {
                execution.result = output.result;
                execution.fail(match output.error {
                    Some(detail) => format!("Task exited with code {code}: {detail}"),
                    None => format!("Task exited with code {code}"),
                });
            }
            Ok(ProcessOutcome::TimedOut) => {
                timed_out = true;
                execution.fail(format!("Task exceeded timeout of {max_runtime} seconds"));
            }
            Err(e) => execution.fail(e.to_string()),
        }

        let mut sched = schedule.lock().await;
        self.record(&mut sched, execution.clone(), timed_out);
        execution
    }

    /// Append to history, move `next_run` forward and apply the retry policy.
    fn record(&self, sched: &mut TaskSchedule, execution: TaskExecution, timed_out: bool) {
        let name = execution.task_name.clone();
        let success = execution.success;
        match &execution.error {
            None => tracing::info!(
                "✅ {} finished in {:.1}s",
                name,
                execution.duration_seconds().unwrap_or_default()
            ),
            Some(error) => tracing::warn!("⚠️ {} failed: {}", name, error),
        }
        let finished_at = execution.end_time.unwrap_or_else(Utc::now);
        sched.add_execution(execution);
        sched.update_next_run_at(finished_at);
        if let Some(attempt) =
            sched.apply_retry_policy(success, timed_out, self.settings.retry_backoff_secs)
        {
            tracing::info!(
                "🔁 {} retry {}/{} at {}",
                name,
                attempt,
                sched.retry_count(),
                sched.next_run.map(|t| t.to_rfc3339()).unwrap_or_default()
            );
        }
    }

    /// One isolated execution outside any schedule. Uses the schedule's
    /// config unless `config` is given, and never touches history.
    pub async fn run_once(&self, name: &str, config: Option<serde_json::Value>) -> Result<TaskExecution> {
        let descriptor = self.registry.require(name)?;
        let entry = descriptor
            .entry
            .clone()
            .ok_or_else(|| OpsClawError::task(format!("Task '{name}' is not registered")))?;

        let (max_runtime, config) = match self.schedule(name).await {
            Some(schedule) => {
                let sched = schedule.lock().await;
                let config = match config {
                    Some(config) => config,
                    None => serde_json::to_value(sched.config()).map_err(OpsClawError::serialization)?,
                };
                (sched.max_runtime(), config)
            }
            None => (
                descriptor.metadata.max_runtime,
                config.unwrap_or_else(|| serde_json::json!({})),
            ),
        };

        let mut execution = TaskExecution::new(name, 1);
        let process = self.launcher.spawn(name, &entry, &config, &execution.id)?;
        execution.attach_process(process.handle());
        tracing::info!("▶️ Running {} once (pid {})", name, process.pid());

        match process.wait_with_timeout(Duration::from_secs(max_runtime)).await? {
            ProcessOutcome::Exited { code: 0, output } => execution.succeed(output.result),
            ProcessOutcome::Exited { code, output } => {
                execution.result = output.result;
                execution.fail(match output.error {
                    Some(detail) => format!("Task exited with code {code}: {detail}"),
                    None => format!("Task exited with code {code}"),
                });
            }
            ProcessOutcome::TimedOut => {
                execution.fail(format!("Task exceeded timeout of {max_runtime} seconds"));
            }
        }
        Ok(execution)
    }

    // ── Run loop ────────────────────────────────────────────

    async fn due_tasks(&self, now: DateTime<Utc>) -> Vec<String> {
        let schedules: Vec<(String, SharedSchedule)> = self
            .schedules
            .read()
            .await
            .iter()
            .map(|(name, s)| (name.clone(), Arc::clone(s)))
            .collect();
        let mut due = Vec::new();
        for (name, schedule) in schedules {
            if schedule.lock().await.is_due(now) {
                due.push(name);
            }
        }
        due
    }

    async fn check_reload_signal(&self) {
        if !self.reload_signal.exists() {
            return;
        }
        tracing::info!("📣 Reload requested via {}", self.reload_signal.display());
        if let Err(e) = self.reload_schedules().await {
            tracing::error!("❌ Reload failed: {e}");
        }
        if let Err(e) = std::fs::remove_file(&self.reload_signal) {
            tracing::warn!("⚠️ Could not remove {}: {e}", self.reload_signal.display());
        }
    }

    /// Poll until stopped. Errors never leave an iteration. A stop request
    /// is observed between iterations: the current iteration's due tasks are
    /// still dispatched, the sleep is cut short and no further iteration
    /// starts. In-flight runs are awaited before returning.
    pub async fn run_scheduler_loop(self: &Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let poll = Duration::from_secs(self.settings.poll_interval_secs.max(1));
        let concurrent = self.settings.concurrent_dispatch;
        tracing::info!(
            "⏰ Scheduler started (check every {}s, {} dispatch)",
            poll.as_secs(),
            if concurrent { "concurrent" } else { "sequential" }
        );

        let mut in_flight = JoinSet::new();
        while !*shutdown.borrow() {
            self.check_reload_signal().await;

            for name in self.due_tasks(Utc::now()).await {
                match self.dispatch(&name).await {
                    Dispatch::Started(pending) if concurrent => {
                        let this = Arc::clone(self);
                        in_flight.spawn(async move {
                            this.supervise(pending).await;
                            if let Err(e) = this.persist_state().await {
                                tracing::warn!("⚠️ Failed to save scheduler state: {e}");
                            }
                        });
                    }
                    Dispatch::Started(pending) => {
                        self.supervise(pending).await;
                    }
                    Dispatch::Finished(_) | Dispatch::Skipped => {}
                }
            }
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!("❌ Supervisor task failed: {e}");
                }
            }
            if let Err(e) = self.persist_state().await {
                tracing::warn!("⚠️ Failed to save scheduler state: {e}");
            }

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.changed() => {}
            }
        }

        if !in_flight.is_empty() {
            tracing::info!("⏳ Waiting for {} running task(s)", in_flight.len());
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!("❌ Supervisor task failed: {e}");
            }
        }
        if let Err(e) = self.persist_state().await {
            tracing::warn!("⚠️ Failed to save scheduler state: {e}");
        }
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("👋 Scheduler stopped");
    }

    // ── Introspection ───────────────────────────────────────

    pub async fn status(&self) -> SchedulerStatus {
        let mut tasks = BTreeMap::new();
        for (name, schedule) in self.schedules.read().await.iter() {
            let sched = schedule.lock().await;
            tasks.insert(
                name.clone(),
                TaskStatus {
                    enabled: sched.enabled(),
                    cron: sched.cron().to_string(),
                    max_runtime: sched.max_runtime(),
                    last_run: sched.last_run,
                    next_run: sched.next_run,
                    is_running: sched.is_running(),
                    retry_attempt: sched.retry_attempt(),
                    recent_executions: sched.recent_executions(RECENT_EXECUTIONS),
                },
            );
        }
        let invalid_schedules = self
            .rejected
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.cron.clone()))
            .collect();
        SchedulerStatus::new(self.is_running(), tasks, invalid_schedules)
    }

    /// Up to `count` most recent executions of one task, oldest first.
    pub async fn history(&self, name: &str, count: usize) -> Result<Vec<TaskExecution>> {
        let schedule = self
            .schedule(name)
            .await
            .ok_or_else(|| OpsClawError::ScheduleNotFound(name.to_string()))?;
        let sched = schedule.lock().await;
        Ok(sched.recent_executions(count))
    }
}

/// Parse every entry; unparsable ones are set aside, not scheduled.
fn build_schedules(
    registry: &TaskRegistry,
    config: ScheduleConfig,
    now: DateTime<Utc>,
) -> (Vec<(String, TaskSchedule)>, BTreeMap<String, ScheduleEntry>) {
    let mut schedules = Vec::new();
    let mut rejected = BTreeMap::new();
    for (name, entry) in config.schedules {
        if !registry.contains(&name) {
            tracing::warn!("Schedule for unregistered task {}", name);
        }
        match TaskSchedule::new_at(name.clone(), entry.clone(), now) {
            Ok(schedule) => schedules.push((name, schedule)),
            Err(e) => {
                tracing::error!("❌ Not scheduling {}: {}", name, e);
                rejected.insert(name, entry);
            }
        }
    }
    (schedules, rejected)
}

/// Launch and lookup failures are recorded without the error-kind prefix.
fn failure_message(error: &OpsClawError) -> String {
    match error {
        OpsClawError::Task(msg) | OpsClawError::Launch(msg) => msg.clone(),
        other => other.to_string(),
    }
}

/// A schedule configuration built from each task's default schedule.
pub fn default_schedules(registry: &TaskRegistry) -> ScheduleConfig {
    let mut config = ScheduleConfig::default();
    for (name, descriptor) in registry.iter() {
        if descriptor.metadata.default_schedule.is_some() && descriptor.is_runnable() {
            config.insert(name.clone(), default_entry(registry, name));
        }
    }
    config
}
