//! Task contract: the interface every schedulable unit of work satisfies.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opsclaw_core::error::Result;
use opsclaw_core::schedules::{DEFAULT_MAX_RUNTIME, DEFAULT_RETRY_COUNT};
use serde::{Deserialize, Serialize};

/// Build the `category/name` key a task is registered under.
pub fn qualified_name(category: &str, name: &str) -> String {
    format!("{category}/{name}")
}

/// What a compiled-in task receives when its process starts.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Qualified task name.
    pub task_name: String,
    /// The schedule's `config` payload (always a JSON object).
    pub config: serde_json::Value,
    pub started_at: DateTime<Utc>,
}

impl TaskContext {
    pub fn new(task_name: impl Into<String>, config: serde_json::Value) -> Self {
        let config = if config.is_object() {
            config
        } else {
            serde_json::Value::Object(Default::default())
        };
        Self {
            task_name: task_name.into(),
            config,
            started_at: Utc::now(),
        }
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| v.as_u64())
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(|v| v.as_bool())
    }
}

/// A compiled-in task.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    fn category(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Opaque dependency identifiers, e.g. credential sections.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Cron expression used when no schedule has been configured.
    fn default_schedule(&self) -> Option<&str> {
        None
    }

    /// Maximum runtime in seconds.
    fn max_runtime(&self) -> u64 {
        DEFAULT_MAX_RUNTIME
    }

    fn retry_count(&self) -> u32 {
        DEFAULT_RETRY_COUNT
    }

    fn qualified_name(&self) -> String {
        qualified_name(self.category(), self.name())
    }

    /// Do the work. Runs inside the task's own worker process.
    async fn run(&self, ctx: &TaskContext) -> Result<serde_json::Value>;
}

/// An external program declared by a task manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    /// Convenience for `sh -c <script>`.
    pub fn shell(script: &str) -> Self {
        Self::new("/bin/sh", vec!["-c".into(), script.into()])
    }

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// How a registered task is started.
#[derive(Clone)]
pub enum TaskEntry {
    Builtin(Arc<dyn Task>),
    Command(CommandSpec),
}

impl TaskEntry {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Builtin(_) => TaskKind::Builtin,
            Self::Command(_) => TaskKind::Command,
        }
    }
}

impl fmt::Debug for TaskEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin(task) => write!(f, "Builtin({})", task.qualified_name()),
            Self::Command(spec) => f.debug_tuple("Command").field(spec).finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Builtin,
    Command,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin => write!(f, "builtin"),
            Self::Command => write!(f, "command"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Task for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        fn category(&self) -> &str {
            "testing"
        }
        async fn run(&self, _ctx: &TaskContext) -> Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn test_trait_defaults() {
        let task = Noop;
        assert_eq!(task.qualified_name(), "testing/noop");
        assert_eq!(task.max_runtime(), 3600);
        assert_eq!(task.retry_count(), 1);
        assert!(task.default_schedule().is_none());
        assert!(task.dependencies().is_empty());
    }

    #[test]
    fn test_context_config_is_object() {
        let ctx = TaskContext::new("testing/noop", serde_json::json!("not an object"));
        assert!(ctx.config.is_object());

        let ctx = TaskContext::new("testing/noop", serde_json::json!({"seconds": 3, "mode": "fast"}));
        assert_eq!(ctx.config_u64("seconds"), Some(3));
        assert_eq!(ctx.config_str("mode"), Some("fast"));
        assert_eq!(ctx.config_bool("missing"), None);
    }

    #[test]
    fn test_command_argv() {
        let spec = CommandSpec::shell("exit 0");
        assert_eq!(spec.argv(), vec!["/bin/sh", "-c", "exit 0"]);
        let entry = TaskEntry::Command(spec);
        assert_eq!(entry.kind(), TaskKind::Command);
        assert_eq!(TaskKind::Builtin.to_string(), "builtin");
    }
}
