//! OpsClaw configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{OpsClawError, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "OPSCLAW_CONFIG";

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsClawConfig {
    /// Directory scanned for task manifests.
    #[serde(default = "default_tasks_dir")]
    pub tasks_dir: String,
    /// Directory holding schedules, state, history and the registry file.
    #[serde(default = "default_config_dir")]
    pub config_dir: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

fn default_tasks_dir() -> String { "tasks".into() }
fn default_config_dir() -> String { "~/.opsclaw".into() }

impl Default for OpsClawConfig {
    fn default() -> Self {
        Self {
            tasks_dir: default_tasks_dir(),
            config_dir: default_config_dir(),
            paths: PathsConfig::default(),
            scheduler: SchedulerConfig::default(),
            credentials: CredentialsConfig::default(),
        }
    }
}

impl OpsClawConfig {
    /// Resolve the config file: explicit path, then $OPSCLAW_CONFIG, then
    /// ~/.opsclaw/config.toml. Falls back to defaults when none exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        if let Ok(env_path) = std::env::var(CONFIG_ENV)
            && !env_path.is_empty()
        {
            return Self::load_from(&expand(&env_path));
        }
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OpsClawError::config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML content.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| OpsClawError::config(format!("Failed to parse config: {e}")))
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| OpsClawError::config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the OpsClaw home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".opsclaw")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        expand(&self.tasks_dir)
    }

    pub fn config_dir(&self) -> PathBuf {
        expand(&self.config_dir)
    }

    pub fn schedules_file(&self) -> PathBuf {
        self.resolve(&self.paths.schedules_file, "schedules.toml")
    }

    pub fn state_file(&self) -> PathBuf {
        self.resolve(&self.paths.state_file, "scheduler_state.json")
    }

    pub fn history_file(&self) -> PathBuf {
        self.resolve(&self.paths.history_file, "execution_history.json")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.resolve(&self.paths.registry_file, "task_registry.json")
    }

    pub fn reload_signal(&self) -> PathBuf {
        self.resolve(&self.paths.reload_signal, "scheduler.reload")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.resolve(&self.paths.run_dir, "runs")
    }

    fn resolve(&self, configured: &Option<String>, file_name: &str) -> PathBuf {
        match configured {
            Some(path) => expand(path),
            None => self.config_dir().join(file_name),
        }
    }
}

/// Expand `~` and environment variables in a configured path.
pub fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::full(path).map(|p| p.into_owned()).unwrap_or_else(|_| {
        shellexpand::tilde(path).into_owned()
    }))
}

/// Optional per-file overrides; unset entries live under `config_dir`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default)]
    pub schedules_file: Option<String>,
    #[serde(default)]
    pub state_file: Option<String>,
    #[serde(default)]
    pub history_file: Option<String>,
    #[serde(default)]
    pub registry_file: Option<String>,
    #[serde(default)]
    pub reload_signal: Option<String>,
    #[serde(default)]
    pub run_dir: Option<String>,
}

/// Run loop and process supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Delay between SIGTERM and SIGKILL when a task overruns.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// Base delay before re-running a failed task; doubles per attempt.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
    /// Supervise due tasks concurrently instead of one after another.
    #[serde(default = "bool_true")]
    pub concurrent_dispatch: bool,
}

fn bool_true() -> bool { true }
fn default_poll_interval() -> u64 { 60 }
fn default_grace_period() -> u64 { 10 }
fn default_retry_backoff() -> u64 { 60 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            grace_period_secs: default_grace_period(),
            retry_backoff_secs: default_retry_backoff(),
            concurrent_dispatch: true,
        }
    }
}

/// Credential material that task dependencies may refer to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_credential_file")]
    pub file: String,
    /// Dependency names backed by a section of the credential file.
    #[serde(default = "default_credential_sections")]
    pub sections: Vec<String>,
}

fn default_credential_file() -> String { "~/.config/credential.ini".into() }
fn default_credential_sections() -> Vec<String> {
    vec!["IPAM", "HPE_OOB"].into_iter().map(String::from).collect()
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            file: default_credential_file(),
            sections: default_credential_sections(),
        }
    }
}

impl CredentialsConfig {
    pub fn file_path(&self) -> PathBuf {
        expand(&self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OpsClawConfig::default();
        assert_eq!(config.scheduler.poll_interval_secs, 60);
        assert_eq!(config.scheduler.grace_period_secs, 10);
        assert!(config.scheduler.concurrent_dispatch);
        assert_eq!(config.credentials.sections, vec!["IPAM", "HPE_OOB"]);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = OpsClawConfig::from_toml(
            r#"
tasks_dir = "/srv/tasks"
config_dir = "/srv/opsclaw"

[paths]
state_file = "/var/lib/opsclaw/state.json"

[scheduler]
poll_interval_secs = 15
"#,
        )
        .unwrap();
        assert_eq!(config.tasks_dir(), PathBuf::from("/srv/tasks"));
        assert_eq!(config.scheduler.poll_interval_secs, 15);
        assert_eq!(config.scheduler.grace_period_secs, 10);
        assert_eq!(
            config.schedules_file(),
            PathBuf::from("/srv/opsclaw/schedules.toml")
        );
        assert_eq!(
            config.state_file(),
            PathBuf::from("/var/lib/opsclaw/state.json")
        );
        assert_eq!(config.run_dir(), PathBuf::from("/srv/opsclaw/runs"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = OpsClawConfig::default();
        config.scheduler.retry_backoff_secs = 5;
        config.save_to(&path).unwrap();

        let loaded = OpsClawConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.scheduler.retry_backoff_secs, 5);
    }

    #[test]
    fn test_tilde_expansion() {
        let expanded = expand("~/.opsclaw");
        assert!(!expanded.to_string_lossy().starts_with('~'));
    }
}
