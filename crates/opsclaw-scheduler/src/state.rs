//! Runtime state and execution history files.
//!
//! Both are derived data: losing them only costs `last_run`/`next_run`
//! continuity and past outcomes. Reads therefore never fail; a missing or
//! corrupt file is logged and treated as empty.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use opsclaw_core::error::{OpsClawError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use crate::schedule::TaskExecution;

/// Per-task entry of the state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool { true }

pub type StateSnapshot = BTreeMap<String, TaskState>;
pub type HistorySnapshot = BTreeMap<String, Vec<TaskExecution>>;

/// Serializes writes to the state and history files.
pub struct StateStore {
    state_file: PathBuf,
    history_file: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(state_file: impl Into<PathBuf>, history_file: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
            history_file: history_file.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn load_state(&self) -> StateSnapshot {
        read_or_default(&self.state_file)
    }

    pub fn load_history(&self) -> HistorySnapshot {
        read_or_default(&self.history_file)
    }

    /// Exclusive access to both files until the writer is dropped. Take it
    /// before building the snapshot to keep writes in snapshot order.
    pub async fn lock(&self) -> StateWriter<'_> {
        StateWriter {
            store: self,
            _guard: self.write_lock.lock().await,
        }
    }

    /// Write both files. Concurrent callers are serialized.
    pub async fn save(&self, state: &StateSnapshot, history: &HistorySnapshot) -> Result<()> {
        self.lock().await.save(state, history)
    }
}

pub struct StateWriter<'a> {
    store: &'a StateStore,
    _guard: MutexGuard<'a, ()>,
}

impl StateWriter<'_> {
    pub fn save(&self, state: &StateSnapshot, history: &HistorySnapshot) -> Result<()> {
        write_json_atomic(&self.store.state_file, state)?;
        write_json_atomic(&self.store.history_file, history)?;
        tracing::debug!("💾 Saved state for {} schedule(s)", state.len());
        Ok(())
    }
}

fn read_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    match std::fs::read_to_string(path) {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            tracing::warn!("⚠️ Ignoring corrupt {}: {e}", path.display());
            T::default()
        }),
        Err(e) => {
            tracing::warn!("⚠️ Failed to read {}: {e}", path.display());
            T::default()
        }
    }
}

/// Write to a temporary sibling, then rename over the target.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value).map_err(OpsClawError::serialization)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(
            dir.path().join("state").join("scheduler_state.json"),
            dir.path().join("state").join("execution_history.json"),
        );

        let mut state = StateSnapshot::new();
        state.insert(
            "testing/sample".into(),
            TaskState {
                last_run: Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()),
                next_run: Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 1, 0).unwrap()),
                enabled: true,
            },
        );
        let mut exec = TaskExecution::new("testing/sample", 1);
        exec.fail("Task exited with code 3");
        let mut history = HistorySnapshot::new();
        history.insert("testing/sample".into(), vec![exec]);

        store.save(&state, &history).await.unwrap();
        assert_eq!(store.load_state(), state);
        let loaded = store.load_history();
        assert_eq!(
            loaded["testing/sample"][0].error.as_deref(),
            Some("Task exited with code 3")
        );
        assert!(!dir.path().join("state").join("scheduler_state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_writer_holds_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"), dir.path().join("history.json"));
        let writer = store.lock().await;
        assert!(store.write_lock.try_lock().is_err());
        writer.save(&StateSnapshot::new(), &HistorySnapshot::new()).unwrap();
        drop(writer);
        assert!(store.write_lock.try_lock().is_ok());
        assert!(dir.path().join("history.json").exists());
    }

    #[test]
    fn test_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("scheduler_state.json");
        let store = StateStore::new(&state_file, dir.path().join("history.json"));
        assert!(store.load_state().is_empty());

        std::fs::write(&state_file, "{ not json").unwrap();
        assert!(store.load_state().is_empty());
        assert!(store.load_history().is_empty());
    }

    #[test]
    fn test_state_defaults() {
        let state: StateSnapshot =
            serde_json::from_str(r#"{"testing/sample": {"last_run": null}}"#).unwrap();
        let entry = &state["testing/sample"];
        assert!(entry.enabled);
        assert!(entry.next_run.is_none());
    }
}
