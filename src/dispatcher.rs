use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::clock::TickerClock;
use crate::notify::NotificationSink;
use crate::registry::{ExecutionError, SealedRegistry, TickerContext};
use crate::schedule;
use crate::storage::TickerStore;
use crate::ticker::{CronTicker, ExecutionOutcome, HostStatus, TickerId, TimeTicker};

/// Optional per-execution error hook, invoked before the generic host
/// exception notification. Absence of a handler is not an error.
#[async_trait]
pub trait TickerExceptionHandler: Send + Sync {
    async fn handle(&self, function_key: &str, error: &ExecutionError);
}

/// A ticker claimed by the scheduler loop and awaiting execution
#[derive(Debug, Clone)]
pub enum DueTicker {
    Cron(CronTicker),
    Time(TimeTicker),
}

impl DueTicker {
    pub fn function_key(&self) -> &str {
        match self {
            DueTicker::Cron(t) => &t.key,
            DueTicker::Time(t) => &t.function_key,
        }
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        match self {
            DueTicker::Cron(t) => t.next_run,
            DueTicker::Time(t) => t.run_at,
        }
    }

    fn ticker_id(&self) -> Option<TickerId> {
        match self {
            DueTicker::Cron(_) => None,
            DueTicker::Time(t) => Some(t.id.clone()),
        }
    }
}

/// Sort a dispatch batch into deterministic execution order: priority (high
/// first), then scheduled time, then registry insertion order, then one-shot
/// creation time.
pub fn order_batch(registry: &SealedRegistry, batch: &mut [DueTicker]) {
    batch.sort_by_key(|ticker| {
        let created = match ticker {
            DueTicker::Cron(_) => DateTime::<Utc>::MIN_UTC,
            DueTicker::Time(t) => t.created_at,
        };
        (
            registry.priority(ticker.function_key()),
            ticker.scheduled_at(),
            registry.insertion_index(ticker.function_key()),
            created,
        )
    });
}

/// Bounded-concurrency executor for due tickers.
///
/// Holds a semaphore sized by the configured maximum concurrency; a batch is
/// worked through in order, each execution waiting for a permit before it is
/// spawned. A failing callable is contained to its own execution and reported
/// through the exception handler and notification sink.
pub struct Dispatcher {
    registry: Arc<SealedRegistry>,
    store: Arc<dyn TickerStore>,
    clock: Arc<dyn TickerClock>,
    sink: Arc<dyn NotificationSink>,
    exception_handler: Option<Arc<dyn TickerExceptionHandler>>,
    status: Arc<RwLock<HostStatus>>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SealedRegistry>,
        store: Arc<dyn TickerStore>,
        clock: Arc<dyn TickerClock>,
        sink: Arc<dyn NotificationSink>,
        exception_handler: Option<Arc<dyn TickerExceptionHandler>>,
        status: Arc<RwLock<HostStatus>>,
        max_concurrency: usize,
    ) -> Self {
        let permits = if max_concurrency == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            max_concurrency
        };

        Self {
            registry,
            store,
            clock,
            sink,
            exception_handler,
            status,
            semaphore: Arc::new(Semaphore::new(permits)),
            tracker: TaskTracker::new(),
        }
    }

    /// Hand a pre-ordered batch to the worker pool.
    ///
    /// Returns immediately; permit acquisition and execution run on a
    /// tracked task so the scheduler loop goes straight back to waiting.
    pub fn dispatch(self: Arc<Self>, batch: Vec<DueTicker>) {
        if batch.is_empty() {
            return;
        }
        debug!(count = batch.len(), "Dispatching due tickers");

        let tracker = self.tracker.clone();
        let dispatcher = self;
        tracker.spawn(async move {
            let mut queue = batch.into_iter();
            while let Some(ticker) = queue.next() {
                // Acquire in batch order so a saturated pool queues tickers
                // in the tie-break order computed by the scheduler.
                let permit = match Arc::clone(&dispatcher.semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        // Pool closed by shutdown. Every ticker here was
                        // already claimed, so record a failure rather than
                        // strand one-shots in the running state.
                        for abandoned in std::iter::once(ticker).chain(queue) {
                            warn!(function_key = %abandoned.function_key(), "Ticker abandoned by shutdown before execution");
                            dispatcher
                                .persist_outcome(
                                    abandoned,
                                    ExecutionOutcome::Failed {
                                        error: "Host shut down before execution".to_string(),
                                    },
                                )
                                .await;
                        }
                        return;
                    }
                };

                let worker = Arc::clone(&dispatcher);
                dispatcher.tracker.spawn(async move {
                    worker.execute(ticker).await;
                    drop(permit);
                });
            }
        });
    }

    /// Stop accepting work and wait up to `timeout` for in-flight executions
    pub async fn shutdown(&self, timeout: Duration) {
        self.semaphore.close();
        self.tracker.close();
        if tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(?timeout, "Shutdown timeout reached with dispatches still in flight");
        }
    }

    async fn execute(&self, ticker: DueTicker) {
        let key = ticker.function_key().to_string();
        let ctx = TickerContext {
            ticker_id: ticker.ticker_id(),
            function_key: key.clone(),
            scheduled_at: ticker.scheduled_at(),
        };

        let result = self.invoke(&key, ctx).await;

        let outcome = match result {
            Ok(()) => {
                info!(function_key = %key, "Ticker execution succeeded");
                ExecutionOutcome::Succeeded
            }
            Err(e) => {
                warn!(function_key = %key, error = %e, "Ticker execution failed");
                self.report_exception(&key, &e).await;
                ExecutionOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        self.persist_outcome(ticker, outcome).await;
    }

    /// Run the registered callable inside its own task so a panic is caught
    /// at the join boundary instead of taking down the worker.
    async fn invoke(&self, key: &str, ctx: TickerContext) -> Result<(), ExecutionError> {
        let callable = self
            .registry
            .callable(key)
            .ok_or_else(|| ExecutionError::FunctionNotFound(key.to_string()))?;

        let future = callable(ctx);
        let handle = tokio::spawn(async move { future.await });

        let join_to_error = |e: JoinError| {
            if e.is_panic() {
                ExecutionError::Panicked
            } else {
                ExecutionError::Execution("Ticker function cancelled".to_string())
            }
        };

        handle.await.map_err(join_to_error)?
    }

    async fn report_exception(&self, key: &str, error: &ExecutionError) {
        if let Some(handler) = &self.exception_handler {
            handler.handle(key, error).await;
        }

        let message = error.to_string();
        {
            let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
            status.last_exception = Some(message.clone());
        }
        self.sink.update_host_exception(&message);
    }

    async fn persist_outcome(&self, ticker: DueTicker, outcome: ExecutionOutcome) {
        match ticker {
            DueTicker::Cron(cron) => {
                // Recompute relative to completion time; a failed run still
                // advances so one failure never stalls the schedule.
                let next_run = match schedule::next_occurrence(&cron.cron, self.clock.now()) {
                    Ok(next) => next,
                    Err(e) => {
                        error!(function_key = %cron.key, error = %e, "Failed to recompute next occurrence");
                        cron.next_run
                    }
                };

                if let Err(e) = self
                    .store
                    .record_cron_outcome(&cron.key, outcome, next_run)
                    .await
                {
                    error!(function_key = %cron.key, error = %e, "Failed to record cron outcome");
                    self.sink.update_host_exception(&e.to_string());
                }
            }
            DueTicker::Time(time) => {
                if let Err(e) = self.store.record_time_outcome(&time.id, outcome).await {
                    error!(ticker_id = %time.id, error = %e, "Failed to record one-shot outcome");
                    self.sink.update_host_exception(&e.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TickerRegistry;
    use crate::ticker::TaskPriority;
    use chrono::TimeZone;

    fn sealed_with(keys: &[(&str, TaskPriority)]) -> SealedRegistry {
        let mut registry = TickerRegistry::new();
        for (key, priority) in keys {
            registry
                .register(key, None, *priority, |_ctx| async { Ok(()) })
                .unwrap();
        }
        registry.resolve(|_| None)
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn batch_orders_by_priority_then_time_then_insertion() {
        let registry = sealed_with(&[
            ("low-early", TaskPriority::Low),
            ("high-late", TaskPriority::High),
            ("normal-a", TaskPriority::Normal),
            ("normal-b", TaskPriority::Normal),
        ]);

        let mut batch = vec![
            DueTicker::Cron(CronTicker::new("normal-b", "0 0 * * *", at(1))),
            DueTicker::Cron(CronTicker::new("low-early", "0 0 * * *", at(0))),
            DueTicker::Cron(CronTicker::new("normal-a", "0 0 * * *", at(1))),
            DueTicker::Cron(CronTicker::new("high-late", "0 0 * * *", at(2))),
        ];
        order_batch(&registry, &mut batch);

        let keys: Vec<&str> = batch.iter().map(|t| t.function_key()).collect();
        // Priority wins over scheduled time; equal (priority, time) falls
        // back to registration order.
        assert_eq!(keys, vec!["high-late", "normal-a", "normal-b", "low-early"]);
    }

    #[tokio::test]
    async fn closed_pool_fails_remaining_claimed_tickers() {
        use crate::clock::ManualClock;
        use crate::notify::NullSink;
        use crate::storage::{MemoryTickerStore, TickerStore};
        use crate::ticker::TimeTickerState;

        let registry = Arc::new(sealed_with(&[("late", TaskPriority::Normal)]));
        let store: Arc<dyn TickerStore> = Arc::new(MemoryTickerStore::new());
        let clock: Arc<dyn TickerClock> = Arc::new(ManualClock::new(at(0)));
        let status = Arc::new(RwLock::new(HostStatus::default()));

        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            Arc::clone(&store),
            clock,
            Arc::new(NullSink),
            None,
            status,
            1,
        ));

        let id = store
            .insert_time(TimeTicker::new("late", at(0)))
            .await
            .unwrap();
        let claimed = store.claim_due_time(at(0)).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // Shutdown closes the semaphore before the batch is fed in.
        dispatcher.shutdown(Duration::ZERO).await;
        Arc::clone(&dispatcher).dispatch(claimed.into_iter().map(DueTicker::Time).collect());
        dispatcher.tracker.wait().await;

        // The claimed one-shot must reach a terminal state, not stay running.
        let ticker = store.get_time(&id).await.unwrap().unwrap();
        assert_eq!(ticker.state, TimeTickerState::Failed);
        assert!(ticker.error.is_some());
    }

    #[test]
    fn simultaneous_batch_orders_by_priority() {
        let registry = sealed_with(&[("low", TaskPriority::Low), ("high", TaskPriority::High)]);

        let mut batch = vec![
            DueTicker::Cron(CronTicker::new("low", "0 0 * * *", at(0))),
            DueTicker::Cron(CronTicker::new("high", "0 0 * * *", at(0))),
        ];
        order_batch(&registry, &mut batch);

        assert_eq!(batch[0].function_key(), "high");
        assert_eq!(batch[1].function_key(), "low");
    }
}
