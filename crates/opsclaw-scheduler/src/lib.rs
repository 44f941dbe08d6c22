//! # OpsClaw Scheduler
//!
//! Runs registered tasks on cron schedules, one OS process per run.
//!
//! ## Architecture
//! ```text
//! schedules.toml ──► Scheduler ◄── scheduler_state.json / execution_history.json
//!                      │  (one TaskSchedule per task, each behind its own lock)
//!                      │
//!   run loop (poll) ── due? ── dispatch ──► ProcessLauncher ──► child process
//!                      │                       config.json in, result.json out
//!                      └── supervise: wait ≤ max_runtime
//!                             ├── exit 0      → success
//!                             ├── exit N      → "Task exited with code N"
//!                             └── overrun     → SIGTERM, grace, SIGKILL
//! ```
//!
//! - At most one live execution per task
//! - Failed runs are retried early, up to `retry_count`, with exponential backoff
//! - `scheduler.reload` in the config directory triggers a schedule reload

pub mod engine;
pub mod launcher;
pub mod schedule;
pub mod state;
pub mod status;

pub use engine::{Dispatch, PendingRun, Scheduler, StopHandle};
pub use launcher::{ProcessLauncher, RUN_TASK_SUBCOMMAND};
pub use schedule::{TaskExecution, TaskSchedule, HISTORY_CAPACITY};
pub use status::{SchedulerStatus, TaskStatus};
