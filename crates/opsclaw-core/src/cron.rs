//! Cron expression handling.
//!
//! Accepts standard 5-field cron ("MIN HOUR DOM MON DOW") as written in
//! schedules.toml and task manifests, plus the 6/7-field form of the `cron`
//! crate (leading seconds, optional trailing year).
//! Example: "0 8 * * *" = every day at 08:00 UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{OpsClawError, Result};

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A validated cron expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    expression: String,
    schedule: cron::Schedule,
}

impl CronExpr {
    /// Parse and validate an expression. Fails instead of falling back to a default.
    pub fn parse(expression: &str) -> Result<Self> {
        let normalized = normalize(expression)?;
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| OpsClawError::InvalidCron {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    /// The expression as the user wrote it.
    pub fn as_str(&self) -> &str {
        &self.expression
    }

    /// First tick strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Check an expression without keeping the parsed form.
    pub fn validate(expression: &str) -> Result<()> {
        Self::parse(expression).map(|_| ())
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl FromStr for CronExpr {
    type Err = OpsClawError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Translate a user expression into the `cron` crate's 6/7-field dialect.
fn normalize(expression: &str) -> Result<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = normalize_day_of_week(fields[4]);
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], dow
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(OpsClawError::InvalidCron {
            expression: expression.to_string(),
            reason: format!("expected 5 fields (MIN HOUR DOM MON DOW), got {n}"),
        }),
    }
}

/// Standard cron numbers days 0-7 from Sunday; the `cron` crate numbers them
/// 1-7. Day names are unambiguous in both, so numbers are rewritten to names.
fn normalize_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let range = range
                .split('-')
                .map(|token| match token.parse::<usize>() {
                    Ok(n) if n <= 7 => DAY_NAMES[n % 7].to_string(),
                    _ => token.to_string(),
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(step) => format!("{range}/{step}"),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}
