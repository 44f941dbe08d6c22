//! Compiled-in task catalog.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use opsclaw_core::error::Result;
use serde_json::json;

use crate::task::{Task, TaskContext};

/// Every compiled-in task, in registration order.
pub fn builtin_tasks() -> Vec<Arc<dyn Task>> {
    vec![
        Arc::new(SampleTask),
        Arc::new(SleepTask),
        Arc::new(HeartbeatTask),
    ]
}

/// Look up a compiled-in task by qualified name.
pub fn find_builtin(qualified_name: &str) -> Option<Arc<dyn Task>> {
    builtin_tasks()
        .into_iter()
        .find(|t| t.qualified_name() == qualified_name)
}

/// Returns a fixed payload. Used to smoke-test the worker path.
pub struct SampleTask;

#[async_trait]
impl Task for SampleTask {
    fn name(&self) -> &str {
        "sample"
    }

    fn category(&self) -> &str {
        "testing"
    }

    fn description(&self) -> &str {
        "Sample task that always succeeds"
    }

    fn max_runtime(&self) -> u64 {
        60
    }

    async fn run(&self, ctx: &TaskContext) -> Result<serde_json::Value> {
        tracing::info!("🧪 Sample task running ({})", ctx.task_name);
        Ok(json!({"result": "sample_success"}))
    }
}

/// Sleeps `config.seconds` (default 5). Handy for exercising timeouts.
pub struct SleepTask;

const DEFAULT_SLEEP_SECS: u64 = 5;

#[async_trait]
impl Task for SleepTask {
    fn name(&self) -> &str {
        "sleep"
    }

    fn category(&self) -> &str {
        "testing"
    }

    fn description(&self) -> &str {
        "Sleeps for config.seconds"
    }

    fn max_runtime(&self) -> u64 {
        300
    }

    async fn run(&self, ctx: &TaskContext) -> Result<serde_json::Value> {
        let seconds = ctx.config_u64("seconds").unwrap_or(DEFAULT_SLEEP_SECS);
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        Ok(json!({"slept_seconds": seconds}))
    }
}

/// Liveness beacon: host, pid and wall-clock time.
pub struct HeartbeatTask;

#[async_trait]
impl Task for HeartbeatTask {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn category(&self) -> &str {
        "system"
    }

    fn description(&self) -> &str {
        "Reports host name and time"
    }

    fn default_schedule(&self) -> Option<&str> {
        Some("*/5 * * * *")
    }

    fn max_runtime(&self) -> u64 {
        30
    }

    async fn run(&self, _ctx: &TaskContext) -> Result<serde_json::Value> {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".into());
        Ok(json!({
            "host": host,
            "pid": std::process::id(),
            "time": Utc::now().to_rfc3339(),
        }))
    }
}
