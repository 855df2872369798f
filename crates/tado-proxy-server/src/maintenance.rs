//! Periodic housekeeping of ephemeral records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tado_proxy_store::SharedStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Delete every device code that never reached `authorized`.
///
/// Runs at startup, before any waiter exists.
pub fn purge_codes(store: &SharedStore) -> Result<usize> {
    let purged = store.purge_unauthorized_codes()?;
    if purged > 0 {
        tracing::info!(purged, "Purged unauthorized device codes");
    }
    Ok(purged)
}

fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> Option<DateTime<Utc>> {
    let retention = chrono::Duration::from_std(retention).ok()?;
    now.checked_sub_signed(retention)
}

/// Delete request logs older than `retention`.
pub fn purge_requests(store: &SharedStore, retention: Duration) -> Result<usize> {
    let Some(cutoff) = retention_cutoff(Utc::now(), retention) else {
        return Ok(0);
    };
    let purged = store.purge_requests_before(cutoff)?;
    if purged > 0 {
        tracing::info!(purged, %cutoff, "Purged request logs");
    }
    Ok(purged)
}

/// Purge request logs now and then every `interval` until `cancel` fires.
pub fn spawn_request_purge(
    store: SharedStore,
    retention: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = purge_requests(&store, retention) {
                        tracing::error!(error = %e, "Failed to purge request logs");
                    }
                }
            }
        }

        tracing::debug!("Request log purge stopped");
    })
}
