//! Task integrity validation: dependency and descriptor checks.
//!
//! Validation never fails: every problem lands in one of the report's buckets.

use std::collections::BTreeMap;
use std::path::PathBuf;

use opsclaw_core::config::CredentialsConfig;
use opsclaw_core::CronExpr;
use serde::Serialize;

use crate::discovery::LoadError;
use crate::registry::{TaskDescriptor, TaskRegistry};

/// Decides whether a declared dependency can be satisfied on this host.
pub trait DependencyResolver: Send + Sync {
    /// `Err` carries a human-readable reason.
    fn check(&self, dependency: &str) -> std::result::Result<(), String>;
}

/// Dependencies named in `sections` must appear as `[SECTION]` headers in
/// the credential file. Other dependency names are not credential-backed
/// and always pass.
#[derive(Debug, Clone)]
pub struct CredentialFileResolver {
    file: PathBuf,
    sections: Vec<String>,
}

impl CredentialFileResolver {
    pub fn new(file: impl Into<PathBuf>, sections: Vec<String>) -> Self {
        Self {
            file: file.into(),
            sections,
        }
    }

    pub fn from_config(config: &CredentialsConfig) -> Self {
        Self::new(config.file_path(), config.sections.clone())
    }

    fn has_section(content: &str, section: &str) -> bool {
        content.lines().any(|line| {
            let line = line.trim();
            line.strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
                .is_some_and(|name| name.trim() == section)
        })
    }
}

impl DependencyResolver for CredentialFileResolver {
    fn check(&self, dependency: &str) -> std::result::Result<(), String> {
        if !self.sections.iter().any(|s| s == dependency) {
            return Ok(());
        }
        let content = std::fs::read_to_string(&self.file).map_err(|e| {
            format!("credential file {} unavailable: {e}", self.file.display())
        })?;
        if Self::has_section(&content, dependency) {
            Ok(())
        } else {
            Err(format!(
                "section [{dependency}] missing from {}",
                self.file.display()
            ))
        }
    }
}

/// Outcome buckets of [`validate_task_integrity`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    pub valid_tasks: Vec<String>,
    /// Task name → reason the descriptor is malformed.
    pub invalid_tasks: BTreeMap<String, String>,
    /// Task name → dependencies that could not be resolved.
    pub missing_dependencies: BTreeMap<String, Vec<String>>,
    /// Manifest file or task name → load failure.
    pub import_errors: BTreeMap<String, String>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.invalid_tasks.is_empty()
            && self.missing_dependencies.is_empty()
            && self.import_errors.is_empty()
    }

    pub fn log_summary(&self) {
        tracing::info!(
            "🔍 Integrity: {} valid, {} invalid, {} with missing dependencies, {} import errors",
            self.valid_tasks.len(),
            self.invalid_tasks.len(),
            self.missing_dependencies.len(),
            self.import_errors.len()
        );
        for (name, reason) in &self.invalid_tasks {
            tracing::warn!("Invalid task {}: {}", name, reason);
        }
        for (name, deps) in &self.missing_dependencies {
            tracing::warn!("Task {} missing dependencies: {}", name, deps.join(", "));
        }
        for (source, err) in &self.import_errors {
            tracing::warn!("Import error in {}: {}", source, err);
        }
    }
}

/// Problems with the descriptor itself, independent of the host.
pub fn check_descriptor(descriptor: &TaskDescriptor) -> std::result::Result<(), String> {
    let meta = &descriptor.metadata;
    if meta.name.trim().is_empty() || meta.name.contains('/') {
        return Err(format!("invalid task name '{}'", meta.name));
    }
    if meta.category.trim().is_empty() || meta.category.contains('/') {
        return Err(format!("invalid category '{}'", meta.category));
    }
    if meta.max_runtime == 0 {
        return Err("max_runtime must be greater than zero".into());
    }
    if let Some(expr) = &meta.default_schedule {
        CronExpr::validate(expr).map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Sort every registered task (and every failed manifest) into a bucket.
pub fn validate_task_integrity(
    registry: &TaskRegistry,
    resolver: &dyn DependencyResolver,
    load_errors: &[LoadError],
) -> IntegrityReport {
    let mut report = IntegrityReport::default();

    for error in load_errors {
        report
            .import_errors
            .insert(error.path.display().to_string(), error.message.clone());
    }

    for (name, descriptor) in registry.iter() {
        if !descriptor.is_runnable() {
            report
                .import_errors
                .insert(name.clone(), "no executable entry (metadata only)".into());
            continue;
        }
        if let Err(reason) = check_descriptor(descriptor) {
            report.invalid_tasks.insert(name.clone(), reason);
            continue;
        }
        let missing: Vec<String> = descriptor
            .metadata
            .dependencies
            .iter()
            .filter(|dep| match resolver.check(dep) {
                Ok(()) => false,
                Err(reason) => {
                    tracing::debug!("Dependency {} of {} unresolved: {}", dep, name, reason);
                    true
                }
            })
            .cloned()
            .collect();
        if missing.is_empty() {
            report.valid_tasks.push(name.clone());
        } else {
            report.missing_dependencies.insert(name.clone(), missing);
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TaskMetadata;
    use crate::task::{CommandSpec, TaskEntry, TaskKind};

    fn descriptor(name: &str, deps: &[&str], max_runtime: u64, cron: Option<&str>) -> TaskDescriptor {
        TaskDescriptor::new(
            TaskMetadata {
                name: name.into(),
                category: "testing".into(),
                description: String::new(),
                dependencies: deps.iter().map(|d| d.to_string()).collect(),
                default_schedule: cron.map(String::from),
                max_runtime,
                retry_count: 1,
                kind: TaskKind::Command,
                source: None,
            },
            TaskEntry::Command(CommandSpec::shell("true")),
        )
    }

    fn resolver(dir: &std::path::Path, content: Option<&str>) -> CredentialFileResolver {
        let file = dir.join("credential.ini");
        if let Some(content) = content {
            std::fs::write(&file, content).unwrap();
        }
        CredentialFileResolver::new(file, vec!["IPAM".into(), "HPE_OOB".into()])
    }

    #[test]
    fn test_credential_sections() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path(), Some("[IPAM]\nuser = x\n\n[ OTHER ]\n"));
        assert!(r.check("IPAM").is_ok());
        assert!(r.check("HPE_OOB").is_err());
        // Not credential-backed.
        assert!(r.check("git").is_ok());
    }

    #[test]
    fn test_missing_credential_file() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path(), None);
        let err = r.check("IPAM").unwrap_err();
        assert!(err.contains("unavailable"));
    }

    #[test]
    fn test_report_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path(), Some("[IPAM]\n"));

        let mut registry = TaskRegistry::new();
        registry.register(descriptor("ok", &["IPAM"], 60, Some("0 * * * *")));
        registry.register(descriptor("needs_oob", &["HPE_OOB"], 60, None));
        registry.register(descriptor("zero_runtime", &[], 0, None));
        registry.register(descriptor("bad_cron", &[], 60, Some("every tuesday")));
        registry.register(TaskDescriptor {
            entry: None,
            ..descriptor("stale", &[], 60, None)
        });

        let load_errors = vec![LoadError {
            path: dir.path().join("broken.toml"),
            message: "expected `]`".into(),
        }];
        let report = validate_task_integrity(&registry, &r, &load_errors);

        assert_eq!(report.valid_tasks, vec!["testing/ok"]);
        assert_eq!(report.missing_dependencies["testing/needs_oob"], vec!["HPE_OOB"]);
        assert!(report.invalid_tasks.contains_key("testing/zero_runtime"));
        assert!(report.invalid_tasks.contains_key("testing/bad_cron"));
        assert!(report.import_errors.contains_key("testing/stale"));
        assert_eq!(report.import_errors.len(), 2);
        assert!(!report.is_healthy());
    }

    #[test]
    fn test_empty_registry_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let report = validate_task_integrity(&TaskRegistry::new(), &resolver(dir.path(), None), &[]);
        assert!(report.is_healthy());
        assert!(report.valid_tasks.is_empty());
    }
}
