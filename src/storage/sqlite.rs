use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::ticker::{CronTicker, ExecutionOutcome, TickerId, TimeTicker, TimeTickerState};

use super::{Result, StoreError, TickerStore};

/// SQLite-backed ticker store.
///
/// Timestamps are stored as RFC 3339 UTC text, which compares correctly with
/// SQL string ordering. Claims are single-statement conditional updates, so
/// per-record atomicity comes from SQLite itself.
pub struct SqliteTickerStore {
    pub pool: SqlitePool,
}

impl SqliteTickerStore {
    pub async fn new(database_url: &str) -> std::result::Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.configure().await?;
        store.migrate().await?;
        Ok(store)
    }

    async fn configure(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await?;

        sqlx::query("PRAGMA busy_timeout=5000;")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Run database migrations
    async fn migrate(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cron_tickers (
                key TEXT PRIMARY KEY,
                cron TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                next_run TEXT NOT NULL,
                last_run_at TEXT,
                last_outcome TEXT,
                last_error TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_cron_tickers_next_run ON cron_tickers(enabled, next_run)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS time_tickers (
                id TEXT PRIMARY KEY,
                function_key TEXT NOT NULL,
                run_at TEXT NOT NULL,
                state TEXT NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_time_tickers_state_run_at ON time_tickers(state, run_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_cron(&self, row: sqlx::sqlite::SqliteRow) -> Result<CronTicker> {
        let key: String = row.get("key");
        let cron: String = row.get("cron");
        let enabled: i32 = row.get("enabled");
        let next_run_str: String = row.get("next_run");
        let last_run_at_str: Option<String> = row.get("last_run_at");
        let last_outcome_str: Option<String> = row.get("last_outcome");
        let last_error: Option<String> = row.get("last_error");
        let updated_at_str: String = row.get("updated_at");

        let next_run = DateTime::parse_from_rfc3339(&next_run_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        let last_run_at = last_run_at_str
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let updated_at = DateTime::parse_from_rfc3339(&updated_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        let last_outcome =
            last_outcome_str.and_then(|s| ExecutionOutcome::from_db(&s, last_error));

        Ok(CronTicker {
            key,
            cron,
            enabled: enabled != 0,
            next_run,
            last_run_at,
            last_outcome,
            updated_at,
        })
    }

    fn row_to_time(&self, row: sqlx::sqlite::SqliteRow) -> Result<TimeTicker> {
        let id: String = row.get("id");
        let function_key: String = row.get("function_key");
        let run_at_str: String = row.get("run_at");
        let state_str: String = row.get("state");
        let error: Option<String> = row.get("error");
        let created_at_str: String = row.get("created_at");
        let updated_at_str: String = row.get("updated_at");

        let run_at = DateTime::parse_from_rfc3339(&run_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        let created_at = DateTime::parse_from_rfc3339(&created_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        let updated_at = DateTime::parse_from_rfc3339(&updated_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(TimeTicker {
            id: TickerId(id),
            function_key,
            run_at,
            state: TimeTickerState::from_db(&state_str),
            error,
            created_at,
            updated_at,
        })
    }
}

#[async_trait]
impl TickerStore for SqliteTickerStore {
    async fn insert_cron_if_absent(
        &self,
        key: &str,
        cron: &str,
        next_run: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO cron_tickers (key, cron, enabled, next_run, updated_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(cron)
        .bind(next_run.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn upsert_cron(&self, ticker: CronTicker) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cron_tickers (key, cron, enabled, next_run, last_run_at, last_outcome, last_error, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                cron = excluded.cron,
                enabled = excluded.enabled,
                next_run = excluded.next_run,
                last_run_at = excluded.last_run_at,
                last_outcome = excluded.last_outcome,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&ticker.key)
        .bind(&ticker.cron)
        .bind(ticker.enabled as i32)
        .bind(ticker.next_run.to_rfc3339())
        .bind(ticker.last_run_at.map(|dt| dt.to_rfc3339()))
        .bind(ticker.last_outcome.as_ref().map(|o| o.as_str()))
        .bind(ticker.last_outcome.as_ref().and_then(|o| o.error()))
        .bind(ticker.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn due_cron(&self, now: DateTime<Utc>) -> Result<Vec<CronTicker>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM cron_tickers
            WHERE enabled = 1 AND next_run <= ?
            "#,
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.row_to_cron(row)).collect()
    }

    async fn claim_cron(
        &self,
        key: &str,
        expected_next: DateTime<Utc>,
        new_next: DateTime<Utc>,
    ) -> Result<bool> {
        // Conditional update on the previously observed next_run: only one
        // concurrent dispatch cycle can win the claim.
        let result = sqlx::query(
            r#"
            UPDATE cron_tickers
            SET next_run = ?, updated_at = ?
            WHERE key = ? AND next_run = ?
            "#,
        )
        .bind(new_next.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(key)
        .bind(expected_next.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM cron_tickers WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn insert_time(&self, ticker: TimeTicker) -> Result<TickerId> {
        sqlx::query(
            r#"
            INSERT INTO time_tickers (id, function_key, run_at, state, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&ticker.id.0)
        .bind(&ticker.function_key)
        .bind(ticker.run_at.to_rfc3339())
        .bind(ticker.state.as_str())
        .bind(&ticker.error)
        .bind(ticker.created_at.to_rfc3339())
        .bind(ticker.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(ticker.id)
    }

    async fn claim_due_time(&self, now: DateTime<Utc>) -> Result<Vec<TimeTicker>> {
        // Claim by flipping state in the same statement so concurrent cycles
        // never hand out the same one-shot twice.
        let rows = sqlx::query(
            r#"
            UPDATE time_tickers
            SET state = 'running', updated_at = ?
            WHERE state = 'pending' AND run_at <= ?
            RETURNING *
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.row_to_time(row)).collect()
    }

    async fn record_cron_outcome(
        &self,
        key: &str,
        outcome: ExecutionOutcome,
        next_run: DateTime<Utc>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        // MAX keeps whichever next_run is later: the claim already advanced
        // it, and a long execution may push it further.
        let result = sqlx::query(
            r#"
            UPDATE cron_tickers
            SET last_outcome = ?, last_error = ?, last_run_at = ?,
                next_run = MAX(next_run, ?), updated_at = ?
            WHERE key = ?
            "#,
        )
        .bind(outcome.as_str())
        .bind(outcome.error())
        .bind(&now)
        .bind(next_run.to_rfc3339())
        .bind(&now)
        .bind(key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn record_time_outcome(&self, id: &TickerId, outcome: ExecutionOutcome) -> Result<()> {
        let state = match &outcome {
            ExecutionOutcome::Succeeded => "completed",
            ExecutionOutcome::Failed { .. } => "failed",
        };

        // Guard on non-terminal states so completed/failed stay terminal.
        let result = sqlx::query(
            r#"
            UPDATE time_tickers
            SET state = ?, error = ?, updated_at = ?
            WHERE id = ? AND state IN ('pending', 'running')
            "#,
        )
        .bind(state)
        .bind(outcome.error())
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<i32> =
                sqlx::query_scalar("SELECT 1 FROM time_tickers WHERE id = ?")
                    .bind(&id.0)
                    .fetch_optional(&self.pool)
                    .await?;
            if exists.is_none() {
                return Err(StoreError::NotFound(id.to_string()));
            }
        }
        Ok(())
    }

    async fn next_occurrence(&self) -> Result<Option<DateTime<Utc>>> {
        let min_str: Option<String> = sqlx::query_scalar(
            r#"
            SELECT MIN(t) FROM (
                SELECT next_run AS t FROM cron_tickers WHERE enabled = 1
                UNION ALL
                SELECT run_at AS t FROM time_tickers WHERE state = 'pending'
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(min_str
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    async fn get_cron(&self, key: &str) -> Result<Option<CronTicker>> {
        let row = sqlx::query("SELECT * FROM cron_tickers WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_cron(row)?)),
            None => Ok(None),
        }
    }

    async fn get_time(&self, id: &TickerId) -> Result<Option<TimeTicker>> {
        let row = sqlx::query("SELECT * FROM time_tickers WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_time(row)?)),
            None => Ok(None),
        }
    }

    async fn all_cron(&self) -> Result<Vec<CronTicker>> {
        let rows = sqlx::query("SELECT * FROM cron_tickers ORDER BY key")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|row| self.row_to_cron(row)).collect()
    }
}
