use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a one-shot ticker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TickerId(pub String);

impl TickerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TickerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TickerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TickerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for TickerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Dispatch priority of a ticker function.
///
/// Used as the first tie-break when several tickers come due at the same
/// instant: `High` before `Normal` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskPriority {
    High,
    Normal,
    Low,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
        }
    }
}

/// Outcome of the most recent execution of a ticker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Succeeded,
    Failed { error: String },
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Succeeded => "succeeded",
            ExecutionOutcome::Failed { .. } => "failed",
        }
    }

    pub fn from_db(outcome: &str, error: Option<String>) -> Option<Self> {
        match outcome {
            "succeeded" => Some(ExecutionOutcome::Succeeded),
            "failed" => Some(ExecutionOutcome::Failed {
                error: error.unwrap_or_default(),
            }),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::Succeeded => None,
            ExecutionOutcome::Failed { error } => Some(error),
        }
    }
}

/// Lifecycle state of a one-shot ticker.
///
/// `Completed` and `Failed` are terminal: a one-shot ticker never runs twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeTickerState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TimeTickerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeTickerState::Pending => "pending",
            TimeTickerState::Running => "running",
            TimeTickerState::Completed => "completed",
            TimeTickerState::Failed => "failed",
        }
    }

    pub fn from_db(state: &str) -> Self {
        match state {
            "running" => TimeTickerState::Running,
            "completed" => TimeTickerState::Completed,
            "failed" => TimeTickerState::Failed,
            _ => TimeTickerState::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TimeTickerState::Completed | TimeTickerState::Failed)
    }
}

/// A persisted recurring ticker driven by a cron expression.
///
/// Keyed by the function key it invokes; the store holds at most one record
/// per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronTicker {
    pub key: String,
    pub cron: String,
    pub enabled: bool,
    pub next_run: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<ExecutionOutcome>,
    pub updated_at: DateTime<Utc>,
}

impl CronTicker {
    pub fn new<S1, S2>(key: S1, cron: S2, next_run: DateTime<Utc>) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            key: key.into(),
            cron: cron.into(),
            enabled: true,
            next_run,
            last_run_at: None,
            last_outcome: None,
            updated_at: Utc::now(),
        }
    }
}

/// A persisted one-shot ticker that fires once at a target instant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeTicker {
    pub id: TickerId,
    pub function_key: String,
    pub run_at: DateTime<Utc>,
    pub state: TimeTickerState,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TimeTicker {
    pub fn new<S: Into<String>>(function_key: S, run_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: TickerId::new(),
            function_key: function_key.into(),
            run_at,
            state: TimeTickerState::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Live status of the scheduling host, surfaced to observers.
///
/// Never persisted; held in memory by the host and mutated only by the host
/// and dispatcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostStatus {
    pub active: bool,
    pub next_occurrence: Option<DateTime<Utc>>,
    pub last_exception: Option<String>,
}
