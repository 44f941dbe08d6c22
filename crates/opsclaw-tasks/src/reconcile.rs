//! Reconcile the schedule configuration with what discovery found.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::Utc;
use opsclaw_core::error::Result;
use opsclaw_core::schedules::{ScheduleConfig, ScheduleEntry};
use opsclaw_core::CronExpr;

use crate::registry::TaskRegistry;

/// Drop schedule entries whose task is not in `current_names`.
///
/// The file is rewritten only when something was removed, and the running
/// scheduler is then asked to reload via `reload_signal`.
pub fn cleanup_orphaned_schedules(
    schedules_file: &Path,
    current_names: &BTreeSet<String>,
    reload_signal: &Path,
) -> Result<Vec<String>> {
    if !schedules_file.exists() {
        return Ok(Vec::new());
    }
    let mut config = ScheduleConfig::load(schedules_file)?;
    let orphans: Vec<String> = config
        .names()
        .filter(|name| !current_names.contains(*name))
        .map(String::from)
        .collect();
    if orphans.is_empty() {
        return Ok(orphans);
    }

    for name in &orphans {
        config.remove(name);
        tracing::info!("🧹 Removed orphaned schedule: {}", name);
    }
    config.save(schedules_file)?;
    signal_reload(reload_signal, current_names.len(), config.len())?;
    Ok(orphans)
}

/// Ask a running scheduler to re-read its schedule configuration.
pub fn signal_reload(path: &Path, total_tasks: usize, total_schedules: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = format!(
        "reload_requested_at:{}\ntotal_tasks:{total_tasks}\ntotal_schedules:{total_schedules}\n",
        Utc::now().to_rfc3339()
    );
    std::fs::write(path, content)?;
    tracing::debug!("📣 Reload requested via {}", path.display());
    Ok(())
}

/// Add a schedule entry for every runnable task that declares a default
/// schedule but has none configured yet. Existing entries are untouched.
pub fn sync_schedules_with_discovered(
    registry: &TaskRegistry,
    schedules_file: &Path,
) -> Result<Vec<String>> {
    let mut config = ScheduleConfig::load(schedules_file)?;
    let mut added = Vec::new();

    for (name, descriptor) in registry.iter() {
        let meta = &descriptor.metadata;
        let Some(cron) = &meta.default_schedule else {
            continue;
        };
        if config.contains(name) || !descriptor.is_runnable() {
            continue;
        }
        if let Err(e) = CronExpr::validate(cron) {
            tracing::warn!("Not provisioning {}: {}", name, e);
            continue;
        }
        config.insert(name.clone(), default_entry(registry, name));
        tracing::info!("📅 Provisioned default schedule for {}: {}", name, cron);
        added.push(name.clone());
    }

    if !added.is_empty() {
        config.save(schedules_file)?;
    }
    Ok(added)
}

/// The schedule entry a task would get from its own defaults.
pub fn default_entry(registry: &TaskRegistry, name: &str) -> ScheduleEntry {
    let Some(meta) = registry.metadata(name) else {
        return ScheduleEntry::default();
    };
    ScheduleEntry {
        cron: meta
            .default_schedule
            .clone()
            .unwrap_or_else(|| ScheduleEntry::default().cron),
        enabled: true,
        max_runtime: meta.max_runtime,
        retry_count: meta.retry_count,
        description: (!meta.description.is_empty()).then(|| meta.description.clone()),
        category: Some(meta.category.clone()),
        config: toml::Table::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{TaskDescriptor, TaskMetadata};
    use crate::task::{CommandSpec, TaskEntry, TaskKind};

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn registry_with(tasks: &[(&str, Option<&str>)]) -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        for (name, cron) in tasks {
            registry.register(TaskDescriptor::new(
                TaskMetadata {
                    name: name.to_string(),
                    category: "testing".into(),
                    description: format!("{name} description"),
                    dependencies: vec![],
                    default_schedule: cron.map(String::from),
                    max_runtime: 120,
                    retry_count: 2,
                    kind: TaskKind::Command,
                    source: None,
                },
                TaskEntry::Command(CommandSpec::shell("true")),
            ));
        }
        registry
    }

    #[test]
    fn test_cleanup_removes_only_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let schedules = dir.path().join("schedules.toml");
        let signal = dir.path().join("scheduler.reload");

        let mut config = ScheduleConfig::default();
        config.insert("testing/mock_task_1", ScheduleEntry::new("0 */1 * * *"));
        config.insert("testing/mock_task_2", ScheduleEntry::new("0 */2 * * *"));
        config.insert("removed/task", ScheduleEntry::new("0 0 * * *"));
        config.save(&schedules).unwrap();

        let current = names(&["testing/mock_task_1", "testing/mock_task_2"]);
        let removed = cleanup_orphaned_schedules(&schedules, &current, &signal).unwrap();
        assert_eq!(removed, vec!["removed/task"]);

        let reloaded = ScheduleConfig::load(&schedules).unwrap();
        assert_eq!(reloaded.len(), 2);
        let signal_content = std::fs::read_to_string(&signal).unwrap();
        assert!(signal_content.starts_with("reload_requested_at:"));
        assert!(signal_content.contains("total_tasks:2"));
        assert!(signal_content.contains("total_schedules:2"));
    }

    #[test]
    fn test_cleanup_without_orphans_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let schedules = dir.path().join("schedules.toml");
        let signal = dir.path().join("scheduler.reload");
        // Hand-written formatting must survive a no-op cleanup.
        let original = "[schedules.\"testing/a\"]\ncron = \"0 * * * *\"   # hourly\n";
        std::fs::write(&schedules, original).unwrap();

        let removed = cleanup_orphaned_schedules(&schedules, &names(&["testing/a"]), &signal).unwrap();
        assert!(removed.is_empty());
        assert_eq!(std::fs::read_to_string(&schedules).unwrap(), original);
        assert!(!signal.exists());
    }

    #[test]
    fn test_cleanup_missing_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let schedules = dir.path().join("schedules.toml");
        let removed =
            cleanup_orphaned_schedules(&schedules, &names(&[]), &dir.path().join("sig")).unwrap();
        assert!(removed.is_empty());
        assert!(!schedules.exists());
    }

    #[test]
    fn test_sync_adds_missing_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let schedules = dir.path().join("schedules.toml");

        let mut config = ScheduleConfig::default();
        let mut custom = ScheduleEntry::new("30 2 * * *");
        custom.enabled = false;
        config.insert("testing/configured", custom.clone());
        config.save(&schedules).unwrap();

        let registry = registry_with(&[
            ("configured", Some("0 * * * *")),
            ("fresh", Some("*/10 * * * *")),
            ("manual", None),
            ("broken", Some("whenever")),
        ]);
        let added = sync_schedules_with_discovered(&registry, &schedules).unwrap();
        assert_eq!(added, vec!["testing/fresh"]);

        let reloaded = ScheduleConfig::load(&schedules).unwrap();
        assert_eq!(reloaded.get("testing/configured"), Some(&custom));
        let fresh = reloaded.get("testing/fresh").unwrap();
        assert_eq!(fresh.cron, "*/10 * * * *");
        assert_eq!(fresh.max_runtime, 120);
        assert_eq!(fresh.retry_count, 2);
        assert_eq!(fresh.category.as_deref(), Some("testing"));
        assert_eq!(fresh.description.as_deref(), Some("fresh description"));
        assert!(!reloaded.contains("testing/manual"));
        assert!(!reloaded.contains("testing/broken"));
    }

    #[test]
    fn test_sync_creates_file_only_when_needed() {
        let dir = tempfile::tempdir().unwrap();
        let schedules = dir.path().join("schedules.toml");

        let added =
            sync_schedules_with_discovered(&registry_with(&[("manual", None)]), &schedules).unwrap();
        assert!(added.is_empty());
        assert!(!schedules.exists());

        let added = sync_schedules_with_discovered(
            &registry_with(&[("hourly", Some("0 * * * *"))]),
            &schedules,
        )
        .unwrap();
        assert_eq!(added.len(), 1);
        assert!(schedules.exists());
    }
}
