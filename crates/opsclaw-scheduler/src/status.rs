//! Status snapshot for the CLI and logs.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::schedule::TaskExecution;

/// Executions included per task in a status snapshot.
pub const RECENT_EXECUTIONS: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub enabled: bool,
    pub cron: String,
    pub max_runtime: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub retry_attempt: u32,
    pub recent_executions: Vec<TaskExecution>,
}

impl TaskStatus {
    pub fn last_outcome(&self) -> Option<&TaskExecution> {
        self.recent_executions.last()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub total_tasks: usize,
    pub enabled_tasks: usize,
    pub running_tasks: usize,
    pub tasks: BTreeMap<String, TaskStatus>,
    /// Task name → cron expression that failed to parse.
    pub invalid_schedules: BTreeMap<String, String>,
}

impl SchedulerStatus {
    pub fn new(
        running: bool,
        tasks: BTreeMap<String, TaskStatus>,
        invalid_schedules: BTreeMap<String, String>,
    ) -> Self {
        Self {
            running,
            total_tasks: tasks.len(),
            enabled_tasks: tasks.values().filter(|t| t.enabled).count(),
            running_tasks: tasks.values().filter(|t| t.is_running).count(),
            tasks,
            invalid_schedules,
        }
    }

    /// Human-readable table.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Schedules: {} total, {} enabled, {} running",
            self.total_tasks, self.enabled_tasks, self.running_tasks
        );
        for (name, task) in &self.tasks {
            let state = if task.is_running {
                "running"
            } else if task.enabled {
                "enabled"
            } else {
                "disabled"
            };
            let last = match task.last_outcome() {
                Some(exec) if exec.success => "ok".to_string(),
                Some(exec) => format!("failed: {}", exec.error.as_deref().unwrap_or("unknown")),
                None => "never run".to_string(),
            };
            let _ = writeln!(
                out,
                "  {name:<40} {state:<9} {cron:<16} next {next:<25} last {last_run:<25} {last}",
                cron = task.cron,
                next = format_time(task.next_run),
                last_run = format_time(task.last_run),
            );
        }
        for (name, cron) in &self.invalid_schedules {
            let _ = writeln!(out, "  {name:<40} invalid   {cron}");
        }
        out
    }
}

pub fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".into())
}
