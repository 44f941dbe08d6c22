//! Task discovery: populate a registry from the compiled-in catalog and the
//! tasks directory.
//!
//! Each pass builds a fresh registry, so running it twice over an unchanged
//! tree yields the same contents. A manifest that fails to load is recorded
//! and skipped; the scan carries on with the remaining files.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use opsclaw_core::error::Result;
use serde::Serialize;
use walkdir::WalkDir;

use crate::integrity::{validate_task_integrity, DependencyResolver, IntegrityReport};
use crate::manifest::TaskManifest;
use crate::reconcile::cleanup_orphaned_schedules;
use crate::registry::TaskRegistry;
use crate::task::Task;

/// A manifest that could not be turned into tasks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadError {
    pub path: PathBuf,
    pub message: String,
}

/// Result of [`TaskDiscovery::discover_with_cleanup`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub discovered: usize,
    /// Present in the previous pass, gone now.
    pub removed: BTreeSet<String>,
    /// Schedule entries deleted because their task no longer exists.
    pub orphans_removed: Vec<String>,
    /// True when orphan cleanup was withheld because a manifest failed to load.
    pub cleanup_skipped: bool,
    pub load_errors: Vec<LoadError>,
    pub integrity: IntegrityReport,
}

pub struct TaskDiscovery {
    tasks_dir: PathBuf,
    builtins: Vec<Arc<dyn Task>>,
    registry: TaskRegistry,
    previous: BTreeSet<String>,
    load_errors: Vec<LoadError>,
}

impl TaskDiscovery {
    pub fn new(tasks_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks_dir: tasks_dir.into(),
            builtins: Vec::new(),
            registry: TaskRegistry::new(),
            previous: BTreeSet::new(),
            load_errors: Vec::new(),
        }
    }

    /// Compiled-in tasks registered ahead of manifests on every pass.
    pub fn with_builtins(mut self, builtins: Vec<Arc<dyn Task>>) -> Self {
        self.builtins = builtins;
        self
    }

    /// Names known before this process started, e.g. from the registry file.
    pub fn with_previous(mut self, names: BTreeSet<String>) -> Self {
        self.previous = names;
        self
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn into_registry(self) -> TaskRegistry {
        self.registry
    }

    pub fn load_errors(&self) -> &[LoadError] {
        &self.load_errors
    }

    /// Names seen by the pass before the latest one.
    pub fn previous_names(&self) -> &BTreeSet<String> {
        &self.previous
    }

    /// Run one discovery pass.
    pub fn discover(&mut self) -> &TaskRegistry {
        if !self.registry.is_empty() {
            self.previous = self.registry.names();
        }
        let mut registry = TaskRegistry::new();
        let mut load_errors = Vec::new();

        for task in &self.builtins {
            registry.register_builtin(Arc::clone(task));
        }

        if !self.tasks_dir.is_dir() {
            tracing::warn!(
                "Tasks directory {} not found, only compiled-in tasks are available",
                self.tasks_dir.display()
            );
        } else {
            for path in candidate_files(&self.tasks_dir) {
                match TaskManifest::load(&path, &self.tasks_dir) {
                    Ok(descriptors) => {
                        for descriptor in descriptors {
                            let name = descriptor.qualified_name();
                            if registry.contains(&name) {
                                tracing::warn!(
                                    "Task {} from {} replaces an earlier definition",
                                    name,
                                    path.display()
                                );
                            }
                            registry.register(descriptor);
                        }
                    }
                    Err(e) => {
                        tracing::error!("❌ Failed to load {}: {}", path.display(), e);
                        load_errors.push(LoadError {
                            path: path.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        tracing::info!(
            "🔎 Discovered {} task(s) ({} load error(s)) in {}",
            registry.len(),
            load_errors.len(),
            self.tasks_dir.display()
        );
        self.registry = registry;
        self.load_errors = load_errors;
        &self.registry
    }

    /// Discover, then reconcile the schedule configuration with the result.
    ///
    /// Orphan cleanup is skipped when any manifest failed to load: a task
    /// whose file is temporarily broken must not lose its schedule.
    pub fn discover_with_cleanup(
        &mut self,
        schedules_file: &Path,
        reload_signal: &Path,
        resolver: &dyn DependencyResolver,
    ) -> Result<DiscoveryReport> {
        let previous_known = !self.previous.is_empty() || !self.registry.is_empty();
        self.discover();
        let current = self.registry.names();

        let removed = if previous_known {
            detect_removed(&self.previous, &current)
        } else {
            BTreeSet::new()
        };
        for name in &removed {
            tracing::info!("🗑️ Task removed since last discovery: {}", name);
        }

        let cleanup_skipped = !self.load_errors.is_empty();
        let orphans_removed = if cleanup_skipped {
            tracing::warn!(
                "Skipping orphan cleanup: {} manifest(s) failed to load",
                self.load_errors.len()
            );
            Vec::new()
        } else {
            cleanup_orphaned_schedules(schedules_file, &current, reload_signal)?
        };

        let integrity = validate_task_integrity(&self.registry, resolver, &self.load_errors);
        integrity.log_summary();

        Ok(DiscoveryReport {
            discovered: self.registry.len(),
            removed,
            orphans_removed,
            cleanup_skipped,
            load_errors: self.load_errors.clone(),
            integrity,
        })
    }
}

/// Names present in `previous` but not in `current`.
pub fn detect_removed(previous: &BTreeSet<String>, current: &BTreeSet<String>) -> BTreeSet<String> {
    previous.difference(current).cloned().collect()
}

/// `*.toml` files under `root` in sorted order, skipping names that start
/// with `_` or `.` (and everything inside hidden directories).
fn candidate_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_reserved(e.file_name()))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .collect()
}

fn is_reserved(name: &std::ffi::OsStr) -> bool {
    let name = name.to_string_lossy();
    name.starts_with('_') || name.starts_with('.')
}
