//! OpsClaw error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors shared across the OpsClaw crates.
#[derive(Debug, Error)]
pub enum OpsClawError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Schedule not found: {0}")]
    ScheduleNotFound(String),

    #[error("Invalid task manifest {}: {message}", path.display())]
    Manifest { path: PathBuf, message: String },

    #[error("Launch error: {0}")]
    Launch(String),

    #[error("Task error: {0}")]
    Task(String),
}

impl OpsClawError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    pub fn launch(msg: impl Into<String>) -> Self {
        Self::Launch(msg.into())
    }

    pub fn task(msg: impl Into<String>) -> Self {
        Self::Task(msg.into())
    }

    pub fn manifest(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Manifest {
            path: path.into(),
            message: msg.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OpsClawError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = OpsClawError::InvalidCron {
            expression: "bad".into(),
            reason: "need 5 fields".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid cron expression 'bad': need 5 fields"
        );

        let err = OpsClawError::manifest("/tmp/tasks/x.toml", "missing command");
        assert_eq!(
            err.to_string(),
            "Invalid task manifest /tmp/tasks/x.toml: missing command"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: OpsClawError = io.into();
        assert!(matches!(err, OpsClawError::Io(_)));
    }
}
