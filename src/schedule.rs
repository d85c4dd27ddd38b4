use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

/// Error raised when a cron expression cannot be parsed or yields no future
/// fire time.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    #[error("Cron expression '{0}' has no upcoming occurrence")]
    Exhausted(String),
}

/// Parse a cron expression, accepting both five-field (`min hour dom mon dow`)
/// and six-field (`sec min hour dom mon dow`) grammars.
///
/// Five-field expressions are normalized by prepending a `0` seconds field, so
/// `"0 0 * * *"` fires at midnight exactly like `"0 0 0 * * *"`.
pub fn parse_cron(expression: &str) -> Result<Schedule, ScheduleError> {
    let trimmed = expression.trim();
    let fields = trimmed.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };

    Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// Compute the next fire time of `expression` strictly after `from`
pub fn next_occurrence(
    expression: &str,
    from: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    let schedule = parse_cron(expression)?;
    schedule
        .after(&from)
        .next()
        .ok_or_else(|| ScheduleError::Exhausted(expression.to_string()))
}
