pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ticker::{CronTicker, ExecutionOutcome, TickerId, TimeTicker};

pub use memory::MemoryTickerStore;
pub use sqlite::SqliteTickerStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ticker not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable catalog of cron and one-shot tickers.
///
/// The store is the only shared mutable state in the engine. Implementations
/// must make claim operations atomic per record: two concurrent claims of the
/// same ticker must hand it to exactly one caller, while claims of distinct
/// tickers never block each other.
#[async_trait]
pub trait TickerStore: Send + Sync {
    /// Insert a cron ticker iff no record with `key` exists. Returns whether
    /// a row was inserted. Never overwrites an existing record.
    async fn insert_cron_if_absent(
        &self,
        key: &str,
        cron: &str,
        next_run: DateTime<Utc>,
    ) -> Result<bool>;

    /// Insert or replace a cron ticker wholesale. Used for operator edits,
    /// not by the reconciler (which never overwrites).
    async fn upsert_cron(&self, ticker: CronTicker) -> Result<()>;

    /// Enabled cron tickers with `next_run <= now`
    async fn due_cron(&self, now: DateTime<Utc>) -> Result<Vec<CronTicker>>;

    /// Compare-and-set advance of a cron ticker's `next_run`. Succeeds only
    /// when the stored value still equals `expected_next`, so a due ticker is
    /// claimed by exactly one dispatch cycle.
    async fn claim_cron(
        &self,
        key: &str,
        expected_next: DateTime<Utc>,
        new_next: DateTime<Utc>,
    ) -> Result<bool>;

    async fn insert_time(&self, ticker: TimeTicker) -> Result<TickerId>;

    /// Atomically move every pending one-shot with `run_at <= now` to the
    /// running state and return the claimed set.
    async fn claim_due_time(&self, now: DateTime<Utc>) -> Result<Vec<TimeTicker>>;

    /// Record the outcome of a cron execution along with its recomputed next
    /// occurrence.
    async fn record_cron_outcome(
        &self,
        key: &str,
        outcome: ExecutionOutcome,
        next_run: DateTime<Utc>,
    ) -> Result<()>;

    /// Record the terminal outcome of a one-shot execution
    async fn record_time_outcome(&self, id: &TickerId, outcome: ExecutionOutcome) -> Result<()>;

    /// Minimum upcoming fire time across enabled cron tickers and pending
    /// one-shots, or `None` when nothing is scheduled.
    async fn next_occurrence(&self) -> Result<Option<DateTime<Utc>>>;

    async fn get_cron(&self, key: &str) -> Result<Option<CronTicker>>;
    async fn get_time(&self, id: &TickerId) -> Result<Option<TimeTicker>>;
    async fn all_cron(&self) -> Result<Vec<CronTicker>>;
}
