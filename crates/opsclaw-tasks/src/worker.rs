//! Worker side of the process hand-off.
//!
//! The scheduler never runs task code in its own process. Compiled-in tasks
//! are started by re-executing the binary with the hidden `run-task`
//! sub-command; this module is what that sub-command calls. The parent passes
//! everything through environment variables:
//!
//! - `OPSCLAW_TASK`: qualified task name
//! - `OPSCLAW_TASK_CONFIG`: path of a JSON file with the schedule's config
//! - `OPSCLAW_RESULT_FILE`: where to write the [`TaskReport`]

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use opsclaw_core::error::{OpsClawError, Result};
use serde::{Deserialize, Serialize};

use crate::builtin::find_builtin;
use crate::integrity::DependencyResolver;
use crate::task::{Task, TaskContext};

pub const TASK_ENV: &str = "OPSCLAW_TASK";
pub const TASK_CONFIG_ENV: &str = "OPSCLAW_TASK_CONFIG";
pub const RESULT_FILE_ENV: &str = "OPSCLAW_RESULT_FILE";

/// What a worker writes to the result file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub success: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub runtime_seconds: f64,
    #[serde(default)]
    pub task_result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Run a task in the current process and capture the outcome.
pub async fn run_task(
    task: &dyn Task,
    config: serde_json::Value,
    resolver: &dyn DependencyResolver,
) -> TaskReport {
    let ctx = TaskContext::new(task.qualified_name(), config);
    let start_time = ctx.started_at;

    let missing: Vec<String> = task
        .dependencies()
        .into_iter()
        .filter(|dep| resolver.check(dep).is_err())
        .collect();
    let outcome = if missing.is_empty() {
        task.run(&ctx).await
    } else {
        Err(OpsClawError::task(format!(
            "missing dependencies: {}",
            missing.join(", ")
        )))
    };

    let end_time = Utc::now();
    let runtime_seconds = (end_time - start_time).num_milliseconds() as f64 / 1000.0;
    match outcome {
        Ok(value) => TaskReport {
            success: true,
            start_time,
            end_time,
            runtime_seconds,
            task_result: Some(value),
            error: None,
        },
        Err(e) => TaskReport {
            success: false,
            start_time,
            end_time,
            runtime_seconds,
            task_result: None,
            error: Some(e.to_string()),
        },
    }
}

/// One `run-task` invocation, as handed over by the parent.
#[derive(Debug, Clone)]
pub struct WorkerInvocation {
    pub task_name: String,
    pub config_file: Option<PathBuf>,
    pub result_file: Option<PathBuf>,
}

impl WorkerInvocation {
    /// `task_name` comes from the command line; the rest from the environment.
    pub fn from_env(task_name: &str) -> Self {
        if let Ok(env_name) = std::env::var(TASK_ENV)
            && env_name != task_name
        {
            tracing::warn!("{} is '{}' but asked to run '{}'", TASK_ENV, env_name, task_name);
        }
        Self {
            task_name: task_name.to_string(),
            config_file: std::env::var_os(TASK_CONFIG_ENV).map(PathBuf::from),
            result_file: std::env::var_os(RESULT_FILE_ENV).map(PathBuf::from),
        }
    }

    /// Run the compiled-in task and write the report.
    pub async fn execute(&self, resolver: &dyn DependencyResolver) -> Result<TaskReport> {
        let task = find_builtin(&self.task_name)
            .ok_or_else(|| OpsClawError::TaskNotFound(self.task_name.clone()))?;
        let config = match &self.config_file {
            Some(path) => read_config(path)?,
            None => serde_json::Value::Object(Default::default()),
        };

        let report = run_task(task.as_ref(), config, resolver).await;
        if let Some(path) = &self.result_file {
            let json = serde_json::to_string_pretty(&report).map_err(OpsClawError::serialization)?;
            std::fs::write(path, json)?;
        }
        if report.success {
            tracing::info!("✅ {} finished in {:.1}s", self.task_name, report.runtime_seconds);
        } else {
            tracing::error!(
                "❌ {} failed: {}",
                self.task_name,
                report.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(report)
    }
}

/// Entry point of the hidden `run-task` sub-command. `Ok(false)` means the
/// task ran and failed; the caller turns that into exit code 1.
pub async fn run_from_env(task_name: &str, resolver: &dyn DependencyResolver) -> Result<bool> {
    let report = WorkerInvocation::from_env(task_name).execute(resolver).await?;
    Ok(report.success)
}

fn read_config(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(OpsClawError::serialization)
}
