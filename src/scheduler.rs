use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::TickerClock;
use crate::dispatcher::{order_batch, Dispatcher, DueTicker};
use crate::notify::NotificationSink;
use crate::registry::SealedRegistry;
use crate::schedule;
use crate::storage::{StoreError, TickerStore};
use crate::ticker::HostStatus;

/// Backoff between retries when the store is unavailable mid-loop
const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Timer-driven loop that computes the next due instant across all tickers,
/// sleeps until it (or a wake signal), and hands every due ticker to the
/// dispatcher.
///
/// The wake signal fires when a one-shot is inserted with an earlier due time
/// than currently awaited; shutdown comes through the cancellation token. The
/// loop reads the injected clock once per tick so due collection and cron
/// recomputation agree on "now".
pub struct SchedulerLoop {
    registry: Arc<SealedRegistry>,
    store: Arc<dyn TickerStore>,
    clock: Arc<dyn TickerClock>,
    dispatcher: Arc<Dispatcher>,
    sink: Arc<dyn NotificationSink>,
    status: Arc<RwLock<HostStatus>>,
    wake: Arc<Notify>,
}

impl SchedulerLoop {
    pub fn new(
        registry: Arc<SealedRegistry>,
        store: Arc<dyn TickerStore>,
        clock: Arc<dyn TickerClock>,
        dispatcher: Arc<Dispatcher>,
        sink: Arc<dyn NotificationSink>,
        status: Arc<RwLock<HostStatus>>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            dispatcher,
            sink,
            status,
            wake,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!("Scheduler loop started");
        let mut last_published: Option<Option<DateTime<Utc>>> = None;

        loop {
            // Computing
            let next = match self.store.next_occurrence().await {
                Ok(next) => next,
                Err(e) => {
                    error!(error = %e, "Failed to compute next occurrence");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(STORE_ERROR_BACKOFF) => continue,
                    }
                }
            };

            if last_published != Some(next) {
                self.publish_next(next);
                last_published = Some(next);
            }

            // Waiting
            match next {
                None => {
                    // Nothing scheduled; wait for an insertion or shutdown.
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.wake.notified() => continue,
                    }
                }
                Some(at) => {
                    let now = self.clock.now();
                    if at > now {
                        let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            // An earlier one-shot may have arrived; recompute.
                            _ = self.wake.notified() => continue,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }

            // A due-now instant skips the sleep above, so a shutdown issued
            // while work keeps arriving must still be observed here.
            if shutdown.is_cancelled() {
                break;
            }

            // Woken
            if let Err(e) = self.tick().await {
                error!(error = %e, "Scheduler tick failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(STORE_ERROR_BACKOFF) => {}
                }
            }
        }

        info!("Scheduler loop stopped");
    }

    /// Claim everything due at or before the clock's now and dispatch it as
    /// one ordered batch.
    async fn tick(&self) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut batch: Vec<DueTicker> = Vec::new();

        for ticker in self.store.claim_due_time(now).await? {
            batch.push(DueTicker::Time(ticker));
        }

        for cron in self.store.due_cron(now).await? {
            let new_next = match schedule::next_occurrence(&cron.cron, now) {
                Ok(next) => next,
                Err(e) => {
                    // A due record whose expression no longer parses can
                    // never advance on its own; left enabled it would pin
                    // next_occurrence in the past and spin the loop. Disable
                    // it until an operator repairs the expression.
                    error!(function_key = %cron.key, cron = %cron.cron, error = %e, "Disabling cron ticker with unparseable expression");
                    let mut quarantined = cron;
                    quarantined.enabled = false;
                    quarantined.updated_at = now;
                    self.store.upsert_cron(quarantined).await?;
                    continue;
                }
            };

            // CAS on the observed next_run; a concurrent cycle that already
            // advanced it wins and we skip this firing.
            match self.store.claim_cron(&cron.key, cron.next_run, new_next).await {
                Ok(true) => batch.push(DueTicker::Cron(cron)),
                Ok(false) => {
                    debug!(function_key = %cron.key, "Cron ticker already claimed");
                }
                Err(e) => {
                    error!(function_key = %cron.key, error = %e, "Failed to claim cron ticker");
                }
            }
        }

        if !batch.is_empty() {
            order_batch(&self.registry, &mut batch);
            Arc::clone(&self.dispatcher).dispatch(batch);
        }

        Ok(())
    }

    fn publish_next(&self, next: Option<DateTime<Utc>>) {
        {
            let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
            status.next_occurrence = next;
        }
        self.sink.update_next_occurrence(next);
    }
}
