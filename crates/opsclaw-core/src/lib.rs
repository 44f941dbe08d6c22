//! # OpsClaw Core
//!
//! Shared building blocks for the OpsClaw automation scheduler:
//! - `error`: the workspace-wide error type
//! - `config`: application configuration (config.toml)
//! - `cron`: cron expression parsing and next-tick computation
//! - `schedules`: the hand-editable schedule configuration (schedules.toml)

pub mod config;
pub mod cron;
pub mod error;
pub mod schedules;

pub use config::OpsClawConfig;
pub use cron::CronExpr;
pub use error::{OpsClawError, Result};
pub use schedules::{ScheduleConfig, ScheduleEntry};
