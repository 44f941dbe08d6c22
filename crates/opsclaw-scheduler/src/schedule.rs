//! Schedule model: one record per scheduled task plus its execution history.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use opsclaw_core::error::Result;
use opsclaw_core::schedules::ScheduleEntry;
use opsclaw_core::CronExpr;
use serde::{Deserialize, Serialize};

use crate::state::TaskState;

/// Executions kept per task; the oldest are evicted first.
pub const HISTORY_CAPACITY: usize = 100;

/// Liveness of the OS process behind an execution. Clones share the flag.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    alive: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn mark_exited(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// One run of a task. Immutable once `end_time` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: String,
    pub task_name: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    /// 1 for the scheduled run, 2.. for retries.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    #[serde(skip)]
    process: Option<ProcessHandle>,
}

fn first_attempt() -> u32 { 1 }

impl TaskExecution {
    pub fn new(task_name: impl Into<String>, attempt: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_name: task_name.into(),
            start_time: Utc::now(),
            end_time: None,
            success: false,
            result: None,
            error: None,
            pid: None,
            attempt,
            process: None,
        }
    }

    pub fn attach_process(&mut self, handle: ProcessHandle) {
        self.pid = Some(handle.pid());
        self.process = Some(handle);
    }

    /// Started, not yet finished, and the process has not been reaped.
    pub fn is_active(&self) -> bool {
        self.end_time.is_none() && self.process.as_ref().is_some_and(|p| p.is_alive())
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn succeed(&mut self, result: Option<serde_json::Value>) {
        self.success = true;
        self.result = result;
        self.error = None;
        self.finish();
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.success = false;
        self.error = Some(error.into());
        self.finish();
    }

    fn finish(&mut self) {
        self.end_time = Some(Utc::now());
        if let Some(process) = &self.process {
            process.mark_exited();
        }
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds() as f64 / 1000.0)
    }
}

/// A task's schedule: the configured entry, its parsed cron, run timestamps
/// and bounded history.
#[derive(Debug)]
pub struct TaskSchedule {
    task_name: String,
    entry: ScheduleEntry,
    cron: CronExpr,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    current: Option<TaskExecution>,
    history: VecDeque<TaskExecution>,
    retry_attempt: u32,
}

impl TaskSchedule {
    /// Fails on an unparsable cron expression.
    pub fn new(task_name: impl Into<String>, entry: ScheduleEntry) -> Result<Self> {
        Self::new_at(task_name, entry, Utc::now())
    }

    pub fn new_at(
        task_name: impl Into<String>,
        entry: ScheduleEntry,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let cron = CronExpr::parse(&entry.cron)?;
        let next_run = cron.next_after(now);
        Ok(Self {
            task_name: task_name.into(),
            entry,
            cron,
            last_run: None,
            next_run,
            current: None,
            history: VecDeque::new(),
            retry_attempt: 0,
        })
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn entry(&self) -> &ScheduleEntry {
        &self.entry
    }

    pub fn cron(&self) -> &CronExpr {
        &self.cron
    }

    pub fn enabled(&self) -> bool {
        self.entry.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.entry.enabled = enabled;
    }

    pub fn max_runtime(&self) -> u64 {
        self.entry.max_runtime
    }

    pub fn retry_count(&self) -> u32 {
        self.entry.retry_count
    }

    pub fn config(&self) -> &toml::Table {
        &self.entry.config
    }

    /// Consecutive failed attempts currently being retried.
    pub fn retry_attempt(&self) -> u32 {
        self.retry_attempt
    }

    /// Swap in a new entry while keeping history and any in-flight run.
    /// `next_run` is recomputed only when the cron expression changed.
    pub fn reconfigure(&mut self, entry: ScheduleEntry, now: DateTime<Utc>) -> Result<()> {
        if entry.cron != self.entry.cron {
            self.cron = CronExpr::parse(&entry.cron)?;
            self.next_run = self.cron.next_after(self.last_run.unwrap_or(now).max(now));
            self.retry_attempt = 0;
        }
        self.entry = entry;
        Ok(())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled() && self.next_run.is_some_and(|next| now >= next)
    }

    pub fn is_running(&self) -> bool {
        self.current.as_ref().is_some_and(TaskExecution::is_active)
    }

    pub fn current_execution(&self) -> Option<&TaskExecution> {
        self.current.as_ref()
    }

    pub fn update_next_run(&mut self) {
        self.update_next_run_at(Utc::now());
    }

    /// Record a run at `now` and compute the following tick from it.
    pub fn update_next_run_at(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now);
        self.next_run = self.cron.next_after(now);
    }

    /// Mark an execution as in flight without adding it to history.
    pub fn begin_execution(&mut self, execution: TaskExecution) {
        self.current = Some(execution);
    }

    /// Make `execution` current and append it to the history.
    pub fn add_execution(&mut self, execution: TaskExecution) {
        self.current = Some(execution.clone());
        self.history.push_back(execution);
        while self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }
    }

    /// Decide whether a finished run gets retried before its next cron tick.
    ///
    /// Must be called after [`update_next_run_at`](Self::update_next_run_at).
    /// Returns the retry attempt number when one was scheduled.
    pub fn apply_retry_policy(&mut self, success: bool, timed_out: bool, backoff_secs: u64) -> Option<u32> {
        if success || timed_out || self.retry_attempt >= self.entry.retry_count {
            self.retry_attempt = 0;
            return None;
        }
        let last_run = self.last_run?;
        self.retry_attempt += 1;
        let factor = 1u64 << (self.retry_attempt - 1).min(16);
        let secs = i64::try_from(backoff_secs.saturating_mul(factor)).unwrap_or(i64::MAX);
        // Out-of-range delays saturate, leaving the cron tick in charge.
        let retry_at = Duration::try_seconds(secs)
            .and_then(|delay| last_run.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.next_run = Some(match self.next_run {
            Some(cron_next) => cron_next.min(retry_at),
            None => retry_at,
        });
        Some(self.retry_attempt)
    }

    pub fn history(&self) -> impl Iterator<Item = &TaskExecution> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Up to `count` most recent executions, oldest first.
    pub fn recent_executions(&self, count: usize) -> Vec<TaskExecution> {
        let skip = self.history.len().saturating_sub(count);
        self.history.iter().skip(skip).cloned().collect()
    }

    pub fn restore_history(&mut self, executions: Vec<TaskExecution>) {
        let skip = executions.len().saturating_sub(HISTORY_CAPACITY);
        self.history = executions.into_iter().skip(skip).collect();
    }

    /// Restored timestamps win over the computed ones. `enabled` stays with
    /// the configuration.
    pub fn apply_state(&mut self, state: &TaskState) {
        if state.last_run.is_some() {
            self.last_run = state.last_run;
        }
        if state.next_run.is_some() {
            self.next_run = state.next_run;
        }
    }

    pub fn state(&self) -> TaskState {
        TaskState {
            last_run: self.last_run,
            next_run: self.next_run,
            enabled: self.enabled(),
        }
    }
}
