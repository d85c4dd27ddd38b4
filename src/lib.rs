//! Ticker scheduling engine: application-defined functions executed on a
//! recurring cron schedule or once at a future instant, with bounded
//! concurrency, durable state, and an observable host.
//!
//! Functions are registered into a [`TickerRegistry`], `%name%` schedule
//! placeholders are resolved against configuration, and the sealed registry
//! is handed to a [`TickerHost`]. On start the host reconciles declared cron
//! tickers into the [`TickerStore`] (additive, never overwriting existing
//! records) and runs a wait/wake scheduler loop that dispatches due tickers
//! to a bounded worker pool.
//!
//! Cron grammar: standard five-field expressions plus an optional leading
//! seconds field; `"0 0 * * *"` and `"0 0 0 * * *"` both mean daily at
//! midnight UTC.

mod clock;
mod dispatcher;
mod host;
mod notify;
mod reconciler;
mod registry;
mod schedule;
mod scheduler;
mod storage;
mod ticker;

pub use clock::{ManualClock, SystemClock, TickerClock};
pub use dispatcher::{DueTicker, TickerExceptionHandler};
pub use host::{StartMode, TickerError, TickerHost, TickerOptions};
pub use notify::{LogSink, NotificationSink, NullSink};
pub use reconciler::sync_declared_cron;
pub use registry::{
    ExecutionError, RegistryError, ScheduleExpression, SealedRegistry, TickerContext,
    TickerRegistry,
};
pub use schedule::{next_occurrence, ScheduleError};
pub use storage::{MemoryTickerStore, SqliteTickerStore, StoreError, TickerStore};
pub use ticker::{
    CronTicker, ExecutionOutcome, HostStatus, TaskPriority, TickerId, TimeTicker, TimeTickerState,
};
