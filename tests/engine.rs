//! End-to-end engine tests driven by an in-memory store and a manual clock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tickerq::{
    CronTicker, ExecutionError, ExecutionOutcome, ManualClock, MemoryTickerStore,
    NotificationSink, TaskPriority, TickerClock, TickerError, TickerExceptionHandler, TickerHost,
    TickerOptions, TickerRegistry, TickerStore, TimeTickerState,
};

fn before_midnight() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 3, 23, 59, 0).unwrap()
}

fn midnight() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 0, 0, 0).unwrap()
}

/// Sink that records every notification for later assertions
#[derive(Default)]
struct RecordingSink {
    statuses: Mutex<Vec<bool>>,
    exceptions: Mutex<Vec<String>>,
    occurrences: Mutex<Vec<Option<DateTime<Utc>>>>,
}

impl NotificationSink for RecordingSink {
    fn update_next_occurrence(&self, next: Option<DateTime<Utc>>) {
        self.occurrences.lock().unwrap().push(next);
    }

    fn update_host_status(&self, active: bool) {
        self.statuses.lock().unwrap().push(active);
    }

    fn update_host_exception(&self, message: &str) {
        self.exceptions.lock().unwrap().push(message.to_string());
    }
}

#[derive(Default)]
struct RecordingHandler {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl TickerExceptionHandler for RecordingHandler {
    async fn handle(&self, function_key: &str, error: &ExecutionError) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{function_key}: {error}"));
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}

#[tokio::test]
async fn midnight_cron_fires_exactly_once_and_advances() {
    let clock = Arc::new(ManualClock::new(before_midnight()));
    let store: Arc<dyn TickerStore> = Arc::new(MemoryTickerStore::new());
    let count = Arc::new(AtomicUsize::new(0));

    let mut registry = TickerRegistry::new();
    let count_in = Arc::clone(&count);
    registry
        .register("daily-report", Some("0 0 * * *"), TaskPriority::High, move |_ctx| {
            let count = Arc::clone(&count_in);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
    let sealed = registry.resolve(|_| None);

    let host = TickerHost::new(sealed, Arc::clone(&store), TickerOptions::default())
        .with_clock(clock.clone() as Arc<dyn TickerClock>);
    host.start().await.unwrap();

    // Reconciliation against the empty store seeded exactly one record.
    let ticker = store.get_cron("daily-report").await.unwrap().unwrap();
    assert_eq!(ticker.next_run, midnight());
    assert_eq!(store.all_cron().await.unwrap().len(), 1);

    // Advance to midnight and wake the loop.
    clock.set(midnight());
    host.wake();

    eventually("cron executed once", || async {
        count.load(Ordering::SeqCst) == 1
    })
    .await;

    eventually("outcome recorded with advanced next_run", || async {
        let ticker = store.get_cron("daily-report").await.unwrap().unwrap();
        ticker.last_outcome == Some(ExecutionOutcome::Succeeded)
            && ticker.next_run == Utc.with_ymd_and_hms(2026, 5, 5, 0, 0, 0).unwrap()
    })
    .await;

    // No second firing for the same occurrence.
    host.wake();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let ticker = store.get_cron("daily-report").await.unwrap().unwrap();
    assert!(ticker.next_run > midnight());

    host.stop().await;
}

#[tokio::test]
async fn unresolved_placeholder_seeds_nothing_and_host_still_starts() {
    let store: Arc<dyn TickerStore> = Arc::new(MemoryTickerStore::new());

    let mut registry = TickerRegistry::new();
    registry
        .register("report", Some("%Report:Cron%"), TaskPriority::Normal, |_ctx| async {
            Ok(())
        })
        .unwrap();
    let sealed = registry.resolve(|_| None);

    let sink = Arc::new(RecordingSink::default());
    let host = TickerHost::new(sealed, Arc::clone(&store), TickerOptions::default())
        .with_sink(sink.clone() as Arc<dyn NotificationSink>);

    host.start().await.unwrap();
    assert!(host.is_active());
    assert!(store.all_cron().await.unwrap().is_empty());
    assert_eq!(sink.statuses.lock().unwrap().as_slice(), &[true]);

    host.stop().await;
    assert!(!host.is_active());
    assert_eq!(sink.statuses.lock().unwrap().as_slice(), &[true, false]);
}

#[tokio::test]
async fn reconciliation_through_restart_is_idempotent() {
    let store: Arc<dyn TickerStore> = Arc::new(MemoryTickerStore::new());

    for _ in 0..2 {
        let mut registry = TickerRegistry::new();
        registry
            .register("cleanup", Some("0 3 * * *"), TaskPriority::Low, |_ctx| async {
                Ok(())
            })
            .unwrap();
        let sealed = registry.resolve(|_| None);

        let host = TickerHost::new(sealed, Arc::clone(&store), TickerOptions::default());
        host.start().await.unwrap();
        host.stop().await;
    }

    assert_eq!(store.all_cron().await.unwrap().len(), 1);
}

#[tokio::test]
async fn priority_orders_simultaneous_tickers_and_cap_serializes_them() {
    let clock = Arc::new(ManualClock::new(before_midnight()));
    let store: Arc<dyn TickerStore> = Arc::new(MemoryTickerStore::new());
    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let in_flight = Arc::new(AtomicBool::new(false));

    let mut registry = TickerRegistry::new();
    for (key, priority) in [("low-job", TaskPriority::Low), ("high-job", TaskPriority::High)] {
        let events = Arc::clone(&events);
        let in_flight = Arc::clone(&in_flight);
        registry
            .register(key, None, priority, move |ctx| {
                let events = Arc::clone(&events);
                let in_flight = Arc::clone(&in_flight);
                async move {
                    assert!(
                        !in_flight.swap(true, Ordering::SeqCst),
                        "executions overlapped despite max_concurrency = 1"
                    );
                    events.lock().unwrap().push(format!("start-{}", ctx.function_key));
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    events.lock().unwrap().push(format!("end-{}", ctx.function_key));
                    in_flight.store(false, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
    }
    let sealed = registry.resolve(|_| None);

    let host = TickerHost::new(
        sealed,
        Arc::clone(&store),
        TickerOptions::default().with_max_concurrency(1),
    )
    .with_clock(clock.clone() as Arc<dyn TickerClock>);

    // Both due at the same past instant before the loop starts, so they land
    // in one dispatch cycle.
    host.schedule_at("low-job", before_midnight()).await.unwrap();
    host.schedule_at("high-job", before_midnight()).await.unwrap();
    host.start().await.unwrap();

    eventually("both executions finished", || async {
        events.lock().unwrap().len() == 4
    })
    .await;

    assert_eq!(
        events.lock().unwrap().as_slice(),
        &[
            "start-high-job".to_string(),
            "end-high-job".to_string(),
            "start-low-job".to_string(),
            "end-low-job".to_string(),
        ]
    );

    host.stop().await;
}

#[tokio::test]
async fn failing_ticker_does_not_block_its_sibling() {
    let clock = Arc::new(ManualClock::new(before_midnight()));
    let store: Arc<dyn TickerStore> = Arc::new(MemoryTickerStore::new());
    let ok_ran = Arc::new(AtomicBool::new(false));

    let mut registry = TickerRegistry::new();
    registry
        .register("explode", None, TaskPriority::High, |_ctx| async {
            Err("kaboom".to_string())
        })
        .unwrap();
    let ok_in = Arc::clone(&ok_ran);
    registry
        .register("survive", None, TaskPriority::Normal, move |_ctx| {
            let ok = Arc::clone(&ok_in);
            async move {
                ok.store(true, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
    let sealed = registry.resolve(|_| None);

    let sink = Arc::new(RecordingSink::default());
    let handler = Arc::new(RecordingHandler::default());
    let host = TickerHost::new(sealed, Arc::clone(&store), TickerOptions::default())
        .with_clock(clock.clone() as Arc<dyn TickerClock>)
        .with_sink(sink.clone() as Arc<dyn NotificationSink>)
        .with_exception_handler(handler.clone() as Arc<dyn TickerExceptionHandler>);

    let failing_id = host.schedule_at("explode", before_midnight()).await.unwrap();
    let ok_id = host.schedule_at("survive", before_midnight()).await.unwrap();
    host.start().await.unwrap();

    eventually("sibling executed despite failure", || async {
        ok_ran.load(Ordering::SeqCst)
    })
    .await;

    eventually("both one-shots reached a terminal state", || async {
        let failed = store.get_time(&failing_id).await.unwrap().unwrap();
        let ok = store.get_time(&ok_id).await.unwrap().unwrap();
        failed.state == TimeTickerState::Failed && ok.state == TimeTickerState::Completed
    })
    .await;

    let failed = store.get_time(&failing_id).await.unwrap().unwrap();
    assert!(failed.error.as_deref().unwrap().contains("kaboom"));

    // Exception surfaced through the handler, the sink, and host status.
    assert!(handler.calls.lock().unwrap()[0].starts_with("explode"));
    assert!(sink.exceptions.lock().unwrap()[0].contains("kaboom"));
    assert!(host.last_exception().unwrap().contains("kaboom"));

    host.stop().await;
}

#[tokio::test]
async fn one_shot_runs_exactly_once() {
    let clock = Arc::new(ManualClock::new(before_midnight()));
    let store: Arc<dyn TickerStore> = Arc::new(MemoryTickerStore::new());
    let count = Arc::new(AtomicUsize::new(0));

    let mut registry = TickerRegistry::new();
    let count_in = Arc::clone(&count);
    registry
        .register("once", None, TaskPriority::Normal, move |_ctx| {
            let count = Arc::clone(&count_in);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
    let sealed = registry.resolve(|_| None);

    let host = TickerHost::new(sealed, Arc::clone(&store), TickerOptions::default())
        .with_clock(clock.clone() as Arc<dyn TickerClock>);
    host.start().await.unwrap();

    let id = host.schedule_at("once", before_midnight()).await.unwrap();

    eventually("one-shot completed", || async {
        store.get_time(&id).await.unwrap().unwrap().state == TimeTickerState::Completed
    })
    .await;

    // Waking the loop again never re-runs a terminal one-shot.
    clock.advance(chrono::Duration::hours(1));
    host.wake();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    host.stop().await;
}

#[tokio::test]
async fn scheduling_unknown_function_is_rejected() {
    let registry = TickerRegistry::new();
    let sealed = registry.resolve(|_| None);
    let store: Arc<dyn TickerStore> = Arc::new(MemoryTickerStore::new());
    let host = TickerHost::new(sealed, store, TickerOptions::default());

    let err = host.schedule_at("ghost", Utc::now()).await.unwrap_err();
    assert!(matches!(err, TickerError::UnknownFunction(key) if key == "ghost"));
}

#[tokio::test]
async fn failed_cron_run_still_advances_the_schedule() {
    let clock = Arc::new(ManualClock::new(before_midnight()));
    let store: Arc<dyn TickerStore> = Arc::new(MemoryTickerStore::new());

    let mut registry = TickerRegistry::new();
    registry
        .register("flaky-report", Some("0 0 * * *"), TaskPriority::Normal, |_ctx| async {
            Err("report generation failed".to_string())
        })
        .unwrap();
    let sealed = registry.resolve(|_| None);

    let host = TickerHost::new(sealed, Arc::clone(&store), TickerOptions::default())
        .with_clock(clock.clone() as Arc<dyn TickerClock>);
    host.start().await.unwrap();

    clock.set(midnight());
    host.wake();

    eventually("failure recorded and schedule advanced", || async {
        let ticker = store.get_cron("flaky-report").await.unwrap().unwrap();
        matches!(ticker.last_outcome, Some(ExecutionOutcome::Failed { .. }))
            && ticker.next_run > midnight()
    })
    .await;

    host.stop().await;
}

#[tokio::test]
async fn unparseable_stored_cron_is_disabled_and_stop_stays_prompt() {
    let clock = Arc::new(ManualClock::new(before_midnight()));
    let store: Arc<dyn TickerStore> = Arc::new(MemoryTickerStore::new());

    // An operator edit can leave a due record whose expression no longer
    // parses; the loop must quarantine it instead of retrying it forever.
    store
        .upsert_cron(CronTicker::new(
            "broken",
            "not a cron",
            before_midnight() - chrono::Duration::minutes(5),
        ))
        .await
        .unwrap();

    let registry = TickerRegistry::new();
    let host = TickerHost::new(registry.resolve(|_| None), Arc::clone(&store), TickerOptions::default())
        .with_clock(clock.clone() as Arc<dyn TickerClock>);
    host.start().await.unwrap();

    eventually("broken ticker disabled", || async {
        !store.get_cron("broken").await.unwrap().unwrap().enabled
    })
    .await;

    // With the record quarantined the loop is back to waiting and a stop
    // request is honored immediately.
    tokio::time::timeout(Duration::from_secs(5), host.stop())
        .await
        .expect("stop completed");
    assert!(!host.is_active());
}

#[tokio::test]
async fn out_of_range_delay_is_rejected() {
    let mut registry = TickerRegistry::new();
    registry
        .register("task", None, TaskPriority::Normal, |_ctx| async { Ok(()) })
        .unwrap();
    let store: Arc<dyn TickerStore> = Arc::new(MemoryTickerStore::new());
    let host = TickerHost::new(registry.resolve(|_| None), store, TickerOptions::default());

    let err = host.schedule_after("task", Duration::MAX).await.unwrap_err();
    assert!(matches!(err, TickerError::DelayOutOfRange(_)));
}
