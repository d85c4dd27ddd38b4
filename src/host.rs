use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::clock::{SystemClock, TickerClock};
use crate::dispatcher::{Dispatcher, TickerExceptionHandler};
use crate::notify::{NotificationSink, NullSink};
use crate::reconciler;
use crate::registry::{RegistryError, SealedRegistry};
use crate::scheduler::SchedulerLoop;
use crate::storage::{StoreError, TickerStore};
use crate::ticker::{HostStatus, TickerId, TimeTicker};

/// Whether the embedding application starts the host itself or lets the
/// integration layer do it immediately after wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    Immediate,
    Manual,
}

/// Top-level error surface for host lifecycle and scheduling calls
#[derive(Debug, thiserror::Error)]
pub enum TickerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Unknown function key: {0}")]
    UnknownFunction(String),

    #[error("Delay out of range: {0:?}")]
    DelayOutOfRange(Duration),
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct TickerOptions {
    /// Maximum concurrent executions; 0 means available parallelism
    pub max_concurrency: usize,
    /// Identifier reported in logs, defaults to `$HOSTNAME` or "local"
    pub instance_identifier: String,
    /// How long `stop()` waits for in-flight dispatches
    pub shutdown_timeout: Duration,
}

impl Default for TickerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            instance_identifier: std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string()),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl TickerOptions {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_instance_identifier<S: Into<String>>(mut self, id: S) -> Self {
        self.instance_identifier = id.into();
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

struct Running {
    shutdown: CancellationToken,
    dispatcher: Arc<Dispatcher>,
    scheduler_handle: JoinHandle<()>,
}

/// Owns the lifecycle of the scheduler loop and dispatcher and surfaces host
/// status to observers.
///
/// Preconditions for `start()`: the registry is sealed (enforced by the type)
/// and reconciliation runs inside `start()` before the loop spawns.
pub struct TickerHost {
    registry: Arc<SealedRegistry>,
    store: Arc<dyn TickerStore>,
    clock: Arc<dyn TickerClock>,
    sink: Arc<dyn NotificationSink>,
    exception_handler: Option<Arc<dyn TickerExceptionHandler>>,
    options: TickerOptions,
    status: Arc<RwLock<HostStatus>>,
    wake: Arc<Notify>,
    running: Mutex<Option<Running>>,
}

impl TickerHost {
    pub fn new(
        registry: SealedRegistry,
        store: Arc<dyn TickerStore>,
        options: TickerOptions,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
            clock: Arc::new(SystemClock),
            sink: Arc::new(NullSink),
            exception_handler: None,
            options,
            status: Arc::new(RwLock::new(HostStatus::default())),
            wake: Arc::new(Notify::new()),
            running: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn TickerClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_exception_handler(mut self, handler: Arc<dyn TickerExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    /// Reconcile declared cron tickers and start the scheduler loop.
    ///
    /// Idempotent: calling `start()` on an active host is a no-op.
    pub async fn start(&self) -> Result<(), TickerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        reconciler::sync_declared_cron(&self.store, &self.registry.declared_cron(), &self.clock)
            .await?;

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Arc::clone(&self.sink),
            self.exception_handler.clone(),
            Arc::clone(&self.status),
            self.options.max_concurrency,
        ));

        let shutdown = CancellationToken::new();
        let scheduler = SchedulerLoop::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Arc::clone(&dispatcher),
            Arc::clone(&self.sink),
            Arc::clone(&self.status),
            Arc::clone(&self.wake),
        );

        let loop_shutdown = shutdown.clone();
        let scheduler_handle = tokio::spawn(async move {
            scheduler.run(loop_shutdown).await;
        });

        {
            let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
            status.active = true;
        }
        self.sink.update_host_status(true);
        info!(instance = %self.options.instance_identifier, "Ticker host started");

        *running = Some(Running {
            shutdown,
            dispatcher,
            scheduler_handle,
        });
        Ok(())
    }

    /// Start according to `mode`; `Manual` defers to an explicit `start()`
    pub async fn start_with_mode(&self, mode: StartMode) -> Result<(), TickerError> {
        match mode {
            StartMode::Immediate => self.start().await,
            StartMode::Manual => Ok(()),
        }
    }

    /// Stop the scheduler loop and wait for in-flight dispatches, capped by
    /// the configured shutdown timeout.
    pub async fn stop(&self) {
        let running = {
            let mut guard = self.running.lock().await;
            guard.take()
        };

        let Some(running) = running else {
            return;
        };

        running.shutdown.cancel();
        if let Err(e) = running.scheduler_handle.await {
            error!(error = %e, "Scheduler task ended abnormally");
        }
        running.dispatcher.shutdown(self.options.shutdown_timeout).await;

        {
            let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
            status.active = false;
        }
        self.sink.update_host_status(false);
        info!(instance = %self.options.instance_identifier, "Ticker host stopped");
    }

    /// Schedule a one-shot invocation of a registered function at `run_at`.
    ///
    /// Wakes the scheduler loop so an earlier due time shortens the current
    /// wait.
    pub async fn schedule_at(
        &self,
        function_key: &str,
        run_at: DateTime<Utc>,
    ) -> Result<TickerId, TickerError> {
        if !self.registry.contains(function_key) {
            return Err(TickerError::UnknownFunction(function_key.to_string()));
        }

        let id = self
            .store
            .insert_time(TimeTicker::new(function_key, run_at))
            .await?;
        self.wake.notify_one();
        Ok(id)
    }

    /// Schedule a one-shot invocation after `delay` from the injected clock's
    /// now
    pub async fn schedule_after(
        &self,
        function_key: &str,
        delay: Duration,
    ) -> Result<TickerId, TickerError> {
        let delay =
            chrono::Duration::from_std(delay).map_err(|_| TickerError::DelayOutOfRange(delay))?;
        self.schedule_at(function_key, self.clock.now() + delay).await
    }

    /// Signal the scheduler loop to recompute its wait.
    ///
    /// Called automatically when a one-shot is scheduled through this host;
    /// call it manually after inserting or editing store records out of band.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn is_active(&self) -> bool {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .active
    }

    pub fn next_occurrence(&self) -> Option<DateTime<Utc>> {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .next_occurrence
    }

    pub fn last_exception(&self) -> Option<String> {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last_exception
            .clone()
    }

    pub fn status(&self) -> HostStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn store(&self) -> Arc<dyn TickerStore> {
        Arc::clone(&self.store)
    }
}
