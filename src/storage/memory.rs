use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ticker::{CronTicker, ExecutionOutcome, TickerId, TimeTicker, TimeTickerState};

use super::{Result, StoreError, TickerStore};

/// In-memory ticker store, the default persistence provider.
///
/// Suitable for single-process deployments and tests; state does not survive
/// a restart. One mutex over both maps keeps every claim a single critical
/// section, which trivially satisfies the per-record atomicity contract.
#[derive(Default)]
pub struct MemoryTickerStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    cron: HashMap<String, CronTicker>,
    time: HashMap<String, TimeTicker>,
}

impl MemoryTickerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TickerStore for MemoryTickerStore {
    async fn insert_cron_if_absent(
        &self,
        key: &str,
        cron: &str,
        next_run: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.cron.contains_key(key) {
            return Ok(false);
        }
        inner
            .cron
            .insert(key.to_string(), CronTicker::new(key, cron, next_run));
        Ok(true)
    }

    async fn upsert_cron(&self, ticker: CronTicker) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.cron.insert(ticker.key.clone(), ticker);
        Ok(())
    }

    async fn due_cron(&self, now: DateTime<Utc>) -> Result<Vec<CronTicker>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .cron
            .values()
            .filter(|t| t.enabled && t.next_run <= now)
            .cloned()
            .collect())
    }

    async fn claim_cron(
        &self,
        key: &str,
        expected_next: DateTime<Utc>,
        new_next: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.cron.get_mut(key) {
            Some(ticker) if ticker.next_run == expected_next => {
                ticker.next_run = new_next;
                ticker.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn insert_time(&self, ticker: TimeTicker) -> Result<TickerId> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = ticker.id.clone();
        inner.time.insert(id.0.clone(), ticker);
        Ok(id)
    }

    async fn claim_due_time(&self, now: DateTime<Utc>) -> Result<Vec<TimeTicker>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut claimed = Vec::new();
        for ticker in inner.time.values_mut() {
            if ticker.state == TimeTickerState::Pending && ticker.run_at <= now {
                ticker.state = TimeTickerState::Running;
                ticker.updated_at = Utc::now();
                claimed.push(ticker.clone());
            }
        }
        Ok(claimed)
    }

    async fn record_cron_outcome(
        &self,
        key: &str,
        outcome: ExecutionOutcome,
        next_run: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let ticker = inner
            .cron
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let now = Utc::now();
        ticker.last_run_at = Some(now);
        ticker.last_outcome = Some(outcome);
        ticker.updated_at = now;
        if next_run > ticker.next_run {
            ticker.next_run = next_run;
        }
        Ok(())
    }

    async fn record_time_outcome(&self, id: &TickerId, outcome: ExecutionOutcome) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let ticker = inner
            .time
            .get_mut(&id.0)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        // Terminal states never transition again.
        if ticker.state.is_terminal() {
            return Ok(());
        }
        match outcome {
            ExecutionOutcome::Succeeded => {
                ticker.state = TimeTickerState::Completed;
                ticker.error = None;
            }
            ExecutionOutcome::Failed { error } => {
                ticker.state = TimeTickerState::Failed;
                ticker.error = Some(error);
            }
        }
        ticker.updated_at = Utc::now();
        Ok(())
    }

    async fn next_occurrence(&self) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cron_min = inner
            .cron
            .values()
            .filter(|t| t.enabled)
            .map(|t| t.next_run)
            .min();
        let time_min = inner
            .time
            .values()
            .filter(|t| t.state == TimeTickerState::Pending)
            .map(|t| t.run_at)
            .min();
        Ok(match (cron_min, time_min) {
            (Some(c), Some(t)) => Some(c.min(t)),
            (c, t) => c.or(t),
        })
    }

    async fn get_cron(&self, key: &str) -> Result<Option<CronTicker>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.cron.get(key).cloned())
    }

    async fn get_time(&self, id: &TickerId) -> Result<Option<TimeTicker>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.time.get(&id.0).cloned())
    }

    async fn all_cron(&self) -> Result<Vec<CronTicker>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut tickers: Vec<CronTicker> = inner.cron.values().cloned().collect();
        tickers.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(tickers)
    }
}
