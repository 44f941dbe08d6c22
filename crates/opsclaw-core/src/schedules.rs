//! Schedule configuration: the hand-editable schedules.toml.
//!
//! Authoritative record of what *should* run. Rewritten wholesale on every
//! administrative change, so entries are kept sorted by task name.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{OpsClawError, Result};

pub const DEFAULT_CRON: &str = "0 0 * * *";
pub const DEFAULT_MAX_RUNTIME: u64 = 3600;
pub const DEFAULT_RETRY_COUNT: u32 = 1;

/// One task's schedule as written in schedules.toml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds before the task process is terminated.
    #[serde(default = "default_max_runtime")]
    pub max_runtime: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Task-specific payload handed to the task process.
    #[serde(default)]
    pub config: toml::Table,
}

fn default_cron() -> String { DEFAULT_CRON.into() }
fn default_true() -> bool { true }
fn default_max_runtime() -> u64 { DEFAULT_MAX_RUNTIME }
fn default_retry_count() -> u32 { DEFAULT_RETRY_COUNT }

impl ScheduleEntry {
    pub fn new(cron: impl Into<String>) -> Self {
        Self {
            cron: cron.into(),
            ..Self::default()
        }
    }
}

impl Default for ScheduleEntry {
    fn default() -> Self {
        Self {
            cron: default_cron(),
            enabled: true,
            max_runtime: DEFAULT_MAX_RUNTIME,
            retry_count: DEFAULT_RETRY_COUNT,
            description: None,
            category: None,
            config: toml::Table::new(),
        }
    }
}

/// The whole schedules.toml document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub schedules: BTreeMap<String, ScheduleEntry>,
}

impl ScheduleConfig {
    /// Load from disk. A missing file is an empty configuration.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content).map_err(|e| match e {
            OpsClawError::Config(msg) => {
                OpsClawError::config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| OpsClawError::config(format!("Failed to parse schedules: {e}")))
    }

    /// Write the whole document, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(OpsClawError::serialization)?;
        std::fs::write(path, content)?;
        tracing::debug!("💾 Saved {} schedule(s) to {}", self.schedules.len(), path.display());
        Ok(())
    }

    pub fn get(&self, task_name: &str) -> Option<&ScheduleEntry> {
        self.schedules.get(task_name)
    }

    pub fn insert(&mut self, task_name: impl Into<String>, entry: ScheduleEntry) {
        self.schedules.insert(task_name.into(), entry);
    }

    pub fn remove(&mut self, task_name: &str) -> Option<ScheduleEntry> {
        self.schedules.remove(task_name)
    }

    pub fn contains(&self, task_name: &str) -> bool {
        self.schedules.contains_key(task_name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schedules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }
}
