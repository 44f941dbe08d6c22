//! Task manifest: the TOML format for command tasks.
//!
//! A manifest file describes one task with top-level keys, or several with a
//! `[[task]]` array:
//!
//! ```toml
//! name = "dns_availability_monitor"
//! description = "Resolve the canary domains"
//! default_schedule = "*/15 * * * *"
//! max_runtime = 300
//! dependencies = ["IPAM"]
//! command = ["./dns_check.sh", "--quiet"]
//!
//! [env]
//! RESOLVER = "10.0.0.53"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use opsclaw_core::error::{OpsClawError, Result};
use opsclaw_core::schedules::{DEFAULT_MAX_RUNTIME, DEFAULT_RETRY_COUNT};
use serde::{Deserialize, Serialize};

use crate::registry::{TaskDescriptor, TaskMetadata};
use crate::task::{CommandSpec, TaskEntry, TaskKind};

/// Category for manifests placed directly in the tasks root.
pub const DEFAULT_CATEGORY: &str = "general";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskManifest {
    /// Defaults to the file stem for single-task files.
    #[serde(default)]
    pub name: Option<String>,
    /// Defaults to the first directory below the tasks root.
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub default_schedule: Option<String>,
    #[serde(default = "default_max_runtime")]
    pub max_runtime: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Program followed by its arguments.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_max_runtime() -> u64 { DEFAULT_MAX_RUNTIME }
fn default_retry_count() -> u32 { DEFAULT_RETRY_COUNT }

#[derive(Debug, Deserialize)]
struct MultiTaskFile {
    task: Vec<TaskManifest>,
}

impl TaskManifest {
    /// Parse manifest content. Returns one manifest per declared task.
    pub fn parse_all(content: &str) -> std::result::Result<Vec<Self>, String> {
        Self::parse(content).map(|(manifests, _)| manifests)
    }

    /// The flag is true for the `[[task]]` form.
    fn parse(content: &str) -> std::result::Result<(Vec<Self>, bool), String> {
        let table: toml::Table = toml::from_str(content).map_err(|e| e.to_string())?;
        if table.contains_key("task") {
            let file: MultiTaskFile = toml::from_str(content).map_err(|e| e.to_string())?;
            Ok((file.task, true))
        } else {
            let manifest: Self = toml::from_str(content).map_err(|e| e.to_string())?;
            Ok((vec![manifest], false))
        }
    }

    /// Load a manifest file and turn every task in it into a descriptor.
    pub fn load(path: &Path, tasks_root: &Path) -> Result<Vec<TaskDescriptor>> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OpsClawError::manifest(path, format!("unreadable: {e}")))?;
        let (manifests, multi) =
            Self::parse(&content).map_err(|e| OpsClawError::manifest(path, e))?;
        if manifests.is_empty() {
            return Err(OpsClawError::manifest(path, "no tasks declared"));
        }
        manifests
            .into_iter()
            .map(|m| m.into_descriptor(path, tasks_root, multi))
            .collect()
    }

    fn into_descriptor(
        self,
        path: &Path,
        tasks_root: &Path,
        multi: bool,
    ) -> Result<TaskDescriptor> {
        let name = match self.name {
            Some(name) => name,
            None if multi => {
                return Err(OpsClawError::manifest(
                    path,
                    "every [[task]] in a multi-task file needs a name",
                ));
            }
            None => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .ok_or_else(|| OpsClawError::manifest(path, "cannot derive task name"))?,
        };
        let category = self
            .category
            .unwrap_or_else(|| category_for(path, tasks_root));

        let mut argv = self.command.into_iter();
        let program = argv
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                OpsClawError::manifest(path, format!("task '{name}' has an empty command"))
            })?;
        let manifest_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        let spec = CommandSpec {
            program: resolve_program(&program, &manifest_dir),
            args: argv.collect(),
            working_dir: Some(manifest_dir),
            env: self.env,
        };
        let metadata = TaskMetadata {
            name,
            category,
            description: self.description,
            dependencies: self.dependencies,
            default_schedule: self.default_schedule,
            max_runtime: self.max_runtime,
            retry_count: self.retry_count,
            kind: TaskKind::Command,
            source: Some(path.display().to_string()),
        };
        Ok(TaskDescriptor::new(metadata, TaskEntry::Command(spec)))
    }
}

/// First directory component between the tasks root and the file.
fn category_for(path: &Path, tasks_root: &Path) -> String {
    path.strip_prefix(tasks_root)
        .ok()
        .and_then(|rel| {
            let mut components = rel.components();
            let first = components.next()?;
            // A bare file name means the manifest sits in the root itself.
            components.next()?;
            Some(first.as_os_str().to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string())
}

/// `./check.sh` and `bin/check` are relative to the manifest; bare names go
/// through PATH.
fn resolve_program(program: &str, manifest_dir: &Path) -> String {
    let candidate = PathBuf::from(program);
    if candidate.is_relative() && program.contains('/') {
        manifest_dir.join(candidate).display().to_string()
    } else {
        program.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_single_task_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitoring").join("dns_monitor.toml");
        write(
            &path,
            r#"
description = "DNS probe"
default_schedule = "*/15 * * * *"
command = ["./probe.sh", "--fast"]
dependencies = ["IPAM"]

[env]
RESOLVER = "10.0.0.53"
"#,
        );

        let descriptors = TaskManifest::load(&path, dir.path()).unwrap();
        assert_eq!(descriptors.len(), 1);
        let d = &descriptors[0];
        assert_eq!(d.qualified_name(), "monitoring/dns_monitor");
        assert_eq!(d.metadata.max_runtime, 3600);
        assert_eq!(d.metadata.retry_count, 1);
        assert_eq!(d.metadata.dependencies, vec!["IPAM"]);
        assert_eq!(d.metadata.kind, TaskKind::Command);

        let Some(TaskEntry::Command(spec)) = &d.entry else {
            panic!("expected a command entry");
        };
        let manifest_dir = dir.path().join("monitoring");
        assert_eq!(
            spec.program,
            manifest_dir.join("./probe.sh").display().to_string()
        );
        assert_eq!(spec.args, vec!["--fast"]);
        assert_eq!(spec.working_dir.as_deref(), Some(manifest_dir.as_path()));
        assert_eq!(spec.env["RESOLVER"], "10.0.0.53");
    }

    #[test]
    fn test_multi_task_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reporting").join("lifecycle.toml");
        write(
            &path,
            r#"
[[task]]
name = "weekly"
default_schedule = "0 6 * * 1"
command = ["echo", "weekly"]

[[task]]
name = "daily"
category = "reports"
max_runtime = 120
command = ["echo", "daily"]
"#,
        );

        let descriptors = TaskManifest::load(&path, dir.path()).unwrap();
        let names: Vec<_> = descriptors.iter().map(|d| d.qualified_name()).collect();
        assert_eq!(names, vec!["reporting/weekly", "reports/daily"]);
        assert_eq!(descriptors[1].metadata.max_runtime, 120);
        // Bare program names are left for PATH lookup.
        let Some(TaskEntry::Command(spec)) = &descriptors[0].entry else {
            panic!("expected a command entry");
        };
        assert_eq!(spec.program, "echo");
    }

    #[test]
    fn test_root_level_manifest_is_general() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cleanup.toml");
        write(&path, r#"command = ["true"]"#);
        let descriptors = TaskManifest::load(&path, dir.path()).unwrap();
        assert_eq!(descriptors[0].qualified_name(), "general/cleanup");
    }

    #[test]
    fn test_nested_directories_use_first_component() {
        let root = Path::new("/srv/tasks");
        assert_eq!(
            category_for(Path::new("/srv/tasks/hardware/hpe/refresh.toml"), root),
            "hardware"
        );
        assert_eq!(category_for(Path::new("/elsewhere/x.toml"), root), "general");
    }

    #[test]
    fn test_rejects_bad_manifests() {
        let dir = tempfile::tempdir().unwrap();

        let empty = dir.path().join("empty_cmd.toml");
        write(&empty, r#"description = "nothing to run""#);
        let err = TaskManifest::load(&empty, dir.path()).unwrap_err();
        assert!(err.to_string().contains("empty command"));

        let unnamed = dir.path().join("multi.toml");
        write(
            &unnamed,
            r#"
[[task]]
command = ["true"]
"#,
        );
        assert!(TaskManifest::load(&unnamed, dir.path()).is_err());

        let broken = dir.path().join("broken.toml");
        write(&broken, "command = [");
        assert!(matches!(
            TaskManifest::load(&broken, dir.path()),
            Err(OpsClawError::Manifest { .. })
        ));
    }
}
