use std::sync::Arc;

use tracing::{debug, error, info};

use crate::clock::TickerClock;
use crate::schedule;
use crate::storage::{Result, TickerStore};

/// Merge the registry's declared cron tickers into the store.
///
/// Additive and idempotent: a `(key, cron)` pair is inserted only when no
/// record with that key exists. Records already in the store, including ones
/// edited by an operator, are never touched, and records the registry no
/// longer declares are never deleted.
///
/// Must complete before the scheduler loop starts.
pub async fn sync_declared_cron(
    store: &Arc<dyn TickerStore>,
    declared: &[(String, String)],
    clock: &Arc<dyn TickerClock>,
) -> Result<()> {
    let now = clock.now();
    let mut seeded = 0usize;

    for (key, cron) in declared {
        if cron.trim().is_empty() {
            continue;
        }

        let next_run = match schedule::next_occurrence(cron, now) {
            Ok(next) => next,
            Err(e) => {
                error!(function_key = %key, cron = %cron, error = %e, "Skipping cron ticker with invalid expression");
                continue;
            }
        };

        if store.insert_cron_if_absent(key, cron, next_run).await? {
            debug!(function_key = %key, cron = %cron, next_run = %next_run, "Seeded cron ticker");
            seeded += 1;
        } else {
            debug!(function_key = %key, "Cron ticker already present, left untouched");
        }
    }

    info!(declared = declared.len(), seeded, "Cron ticker reconciliation complete");
    Ok(())
}
