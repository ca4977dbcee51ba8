//! Background retention enforcement.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::recorder::ErrorRecorder;

/// Default interval between purges.
pub const DEFAULT_RETENTION_INTERVAL_SECS: u64 = 3600;

/// Spawn a task purging expired occurrences every `interval` until `cancel`
/// fires. Uses the retention period from the current tracking settings.
pub fn start_retention_task(
    recorder: Arc<ErrorRecorder>,
    interval: Duration,
    purge_groups: bool,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            interval_secs = interval.as_secs(),
            purge_groups,
            "Starting retention task"
        );

        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Retention task stopped");
                    break;
                }
                _ = timer.tick() => {
                    if let Err(e) = recorder.purge_expired(None, purge_groups).await {
                        tracing::error!(error = %e, "Retention purge failed");
                    }
                    recorder.broadcaster().prune();
                }
            }
        }
    })
}
