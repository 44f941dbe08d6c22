//! Task Registry: qualified name → implementation + metadata.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use opsclaw_core::error::{OpsClawError, Result};
use serde::{Deserialize, Serialize};

use crate::task::{qualified_name, Task, TaskEntry, TaskKind};

/// Descriptive metadata; this is what task_registry.json holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub default_schedule: Option<String>,
    pub max_runtime: u64,
    pub retry_count: u32,
    pub kind: TaskKind,
    /// Manifest path for command tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl TaskMetadata {
    pub fn qualified_name(&self) -> String {
        qualified_name(&self.category, &self.name)
    }

    pub fn from_task(task: &dyn Task) -> Self {
        Self {
            name: task.name().to_string(),
            category: task.category().to_string(),
            description: task.description().to_string(),
            dependencies: task.dependencies(),
            default_schedule: task.default_schedule().map(String::from),
            max_runtime: task.max_runtime(),
            retry_count: task.retry_count(),
            kind: TaskKind::Builtin,
            source: None,
        }
    }
}

/// A registered task. `entry` is `None` for descriptors merged from a
/// registry file, which carry metadata but nothing runnable.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub metadata: TaskMetadata,
    pub entry: Option<TaskEntry>,
}

impl TaskDescriptor {
    pub fn builtin(task: Arc<dyn Task>) -> Self {
        Self {
            metadata: TaskMetadata::from_task(task.as_ref()),
            entry: Some(TaskEntry::Builtin(task)),
        }
    }

    pub fn new(metadata: TaskMetadata, entry: TaskEntry) -> Self {
        Self {
            metadata,
            entry: Some(entry),
        }
    }

    pub fn qualified_name(&self) -> String {
        self.metadata.qualified_name()
    }

    pub fn is_runnable(&self) -> bool {
        self.entry.is_some()
    }
}

/// Registry of all known tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskDescriptor>,
}

impl TaskRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task, replacing any previous entry with the same name.
    pub fn register(&mut self, descriptor: TaskDescriptor) {
        let name = descriptor.qualified_name();
        tracing::debug!("🧩 Registered task: {} ({})", name, descriptor.metadata.kind);
        if self.tasks.insert(name.clone(), descriptor).is_some() {
            tracing::debug!("Task '{}' re-registered, previous entry replaced", name);
        }
    }

    pub fn register_builtin(&mut self, task: Arc<dyn Task>) {
        self.register(TaskDescriptor::builtin(task));
    }

    pub fn get(&self, name: &str) -> Option<&TaskDescriptor> {
        self.tasks.get(name)
    }

    /// Like [`get`](Self::get) but as an error for callers that propagate.
    pub fn require(&self, name: &str) -> Result<&TaskDescriptor> {
        self.get(name)
            .ok_or_else(|| OpsClawError::TaskNotFound(name.to_string()))
    }

    pub fn metadata(&self, name: &str) -> Option<&TaskMetadata> {
        self.tasks.get(name).map(|d| &d.metadata)
    }

    /// All qualified names, sorted.
    pub fn list(&self) -> Vec<String> {
        self.names().into_iter().collect()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.tasks.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn tasks_in_category(&self, category: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, d)| d.metadata.category == category)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Descriptors sorted by qualified name.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &TaskDescriptor)> {
        let mut entries: Vec<_> = self.tasks.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter()
    }

    pub fn metadata_map(&self) -> BTreeMap<String, TaskMetadata> {
        self.tasks
            .iter()
            .map(|(name, d)| (name.clone(), d.metadata.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Write the metadata map (not the runnable entries) as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.metadata_map())
            .map_err(OpsClawError::serialization)?;
        std::fs::write(path, json)?;
        tracing::debug!("💾 Saved {} task descriptor(s) to {}", self.len(), path.display());
        Ok(())
    }

    /// Merge metadata from a registry file. Existing entries keep their
    /// runnable entry and take the file's metadata; unknown names are added
    /// without one. A missing file is a no-op.
    pub fn load(&mut self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let json = std::fs::read_to_string(path)?;
        let loaded: BTreeMap<String, TaskMetadata> =
            serde_json::from_str(&json).map_err(OpsClawError::serialization)?;
        let count = loaded.len();
        for (name, metadata) in loaded {
            match self.tasks.get_mut(&name) {
                Some(existing) => existing.metadata = metadata,
                None => {
                    self.tasks.insert(
                        name,
                        TaskDescriptor {
                            metadata,
                            entry: None,
                        },
                    );
                }
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CommandSpec;

    fn command_task(category: &str, name: &str, schedule: Option<&str>) -> TaskDescriptor {
        TaskDescriptor::new(
            TaskMetadata {
                name: name.into(),
                category: category.into(),
                description: format!("{name} task"),
                dependencies: vec![],
                default_schedule: schedule.map(String::from),
                max_runtime: 60,
                retry_count: 1,
                kind: TaskKind::Command,
                source: None,
            },
            TaskEntry::Command(CommandSpec::shell("true")),
        )
    }

    #[test]
    fn test_register_and_get() {
        let mut reg = TaskRegistry::new();
        reg.register(command_task("testing", "mock_task_1", Some("0 */1 * * *")));
        reg.register(command_task("testing", "mock_task_2", Some("0 */2 * * *")));
        reg.register(command_task("monitoring", "dns", None));

        assert_eq!(reg.len(), 3);
        let meta = reg.metadata("testing/mock_task_1").unwrap();
        assert_eq!(meta.name, "mock_task_1");
        assert_eq!(meta.default_schedule.as_deref(), Some("0 */1 * * *"));
        assert!(reg.get("nonexistent/task").is_none());
        assert!(matches!(
            reg.require("nonexistent/task"),
            Err(OpsClawError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_reregistration_replaces() {
        let mut reg = TaskRegistry::new();
        reg.register(command_task("testing", "dup", None));
        reg.register(command_task("testing", "dup", Some("* * * * *")));
        assert_eq!(reg.len(), 1);
        assert_eq!(
            reg.metadata("testing/dup").unwrap().default_schedule.as_deref(),
            Some("* * * * *")
        );
    }

    #[test]
    fn test_category_filter() {
        let mut reg = TaskRegistry::new();
        reg.register(command_task("testing", "b", None));
        reg.register(command_task("testing", "a", None));
        reg.register(command_task("monitoring", "dns", None));

        assert_eq!(reg.tasks_in_category("testing"), vec!["testing/a", "testing/b"]);
        assert!(reg.tasks_in_category("nonexistent").is_empty());
        assert_eq!(reg.list(), vec!["monitoring/dns", "testing/a", "testing/b"]);
    }

    #[test]
    fn test_save_and_merge_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task_registry.json");

        let mut original = TaskRegistry::new();
        original.register(command_task("testing", "a", Some("0 * * * *")));
        original.register(command_task("monitoring", "dns", None));
        original.save(&path).unwrap();

        let mut other = TaskRegistry::new();
        other.register(command_task("testing", "a", None));
        other.register(command_task("reporting", "weekly", None));
        assert_eq!(other.load(&path).unwrap(), 2);

        assert_eq!(other.len(), 3);
        // Existing entry keeps its runnable entry but takes the file's metadata.
        let a = other.get("testing/a").unwrap();
        assert!(a.is_runnable());
        assert_eq!(a.metadata.default_schedule.as_deref(), Some("0 * * * *"));
        // Names only in the file are metadata-only.
        assert!(!other.get("monitoring/dns").unwrap().is_runnable());
        assert!(other.get("reporting/weekly").unwrap().is_runnable());
    }

    #[test]
    fn test_load_missing_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = TaskRegistry::new();
        assert_eq!(reg.load(&dir.path().join("absent.json")).unwrap(), 0);
        assert!(reg.is_empty());
    }
}
