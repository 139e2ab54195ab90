//! Background archival driver: drains due retries on a short period and runs the policy
//! tick (scheduled/age-threshold archival plus eviction) on the configured schedule.

use super::AdapterInner;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub(crate) struct ArchivalDriver {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl ArchivalDriver {
    pub(crate) fn spawn(inner: Arc<AdapterInner>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let drain_every = Duration::from_millis(inner.config.performance.drain_interval_ms.max(1));
        let tick_every = Duration::from_secs(
            inner
                .config
                .archival_policy
                .schedule_interval_seconds
                .max(1),
        );

        let handle = tokio::spawn(async move {
            info!(
                "[ArchivalDriver] Started (drain every {:?}, policy tick every {:?})",
                drain_every, tick_every
            );
            let mut drain = tokio::time::interval_at(Instant::now() + drain_every, drain_every);
            drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut tick = tokio::time::interval_at(Instant::now() + tick_every, tick_every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("[ArchivalDriver] Stopping");
                        break;
                    }
                    _ = drain.tick() => {
                        if !inner.config.performance.retry_enabled || inner.queue.is_empty() {
                            continue;
                        }
                        let report = inner.drain_due().await;
                        if !report.archive_ids.is_empty() || report.requeued > 0 {
                            debug!(
                                "[ArchivalDriver] Retry drain: {} archived, {} requeued, {} dropped",
                                report.archive_ids.len(),
                                report.requeued,
                                report.permanent_failures.len()
                            );
                        }
                    }
                    _ = tick.tick() => {
                        let report = inner.run_tick().await;
                        debug!(
                            "[ArchivalDriver] Policy tick: {} archived, {} deferred, {} evicted",
                            report.batch.archived.len(),
                            report.batch.deferred.len(),
                            report.evicted.len()
                        );
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Signal the loop and wait for it until `deadline`; abort it afterwards.
    pub(crate) async fn stop(self, deadline: Instant) {
        let _ = self.shutdown_tx.send(());
        let mut handle = self.handle;
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            warn!("[ArchivalDriver] Did not stop before the deadline, aborting");
            handle.abort();
        }
    }
}
