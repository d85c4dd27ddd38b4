use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Fire-and-forget observer of host status changes.
///
/// The host never blocks on delivery and never retries; implementations
/// forward to whatever surface needs the signal (push channel, dashboard,
/// log). Calls may arrive from the scheduler task or a dispatch worker.
pub trait NotificationSink: Send + Sync {
    fn update_next_occurrence(&self, next: Option<DateTime<Utc>>);
    fn update_host_status(&self, active: bool);
    fn update_host_exception(&self, message: &str);
}

/// Default sink that swallows every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn update_next_occurrence(&self, _next: Option<DateTime<Utc>>) {}
    fn update_host_status(&self, _active: bool) {}
    fn update_host_exception(&self, _message: &str) {}
}

/// Sink that mirrors notifications into the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn update_next_occurrence(&self, next: Option<DateTime<Utc>>) {
        match next {
            Some(at) => info!(next_occurrence = %at, "Next ticker occurrence"),
            None => info!("No upcoming ticker occurrence"),
        }
    }

    fn update_host_status(&self, active: bool) {
        info!(active, "Ticker host status changed");
    }

    fn update_host_exception(&self, message: &str) {
        warn!(message, "Ticker host exception");
    }
}
