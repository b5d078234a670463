//! Periodic presence flush.
//!
//! The scheduler is the only caller of [`PresenceCache::flush`] in a running
//! server. Ticks, manual flushes and the shutdown flush all go through the same
//! async mutex so two drains never overlap.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics::ApiMetrics;
use crate::presence::{DrainReport, PresenceCache};

pub struct FlushScheduler {
    cache: Arc<PresenceCache>,
    metrics: Arc<ApiMetrics>,
    interval: Duration,
    in_flight: Mutex<()>,
}

impl FlushScheduler {
    pub fn new(cache: Arc<PresenceCache>, metrics: Arc<ApiMetrics>, interval: Duration) -> Self {
        Self {
            cache,
            metrics,
            interval,
            in_flight: Mutex::new(()),
        }
    }

    /// Drain the cache now, waiting for any drain already in progress
    pub async fn flush_now(&self) -> DrainReport {
        let _guard = self.in_flight.lock().await;

        let report = self.cache.flush().await;
        let cached = self.cache.len();
        self.metrics.record_drain(&report, cached);

        if report.retried > 0 || report.superseded > 0 {
            warn!(
                persisted = report.persisted,
                retried = report.retried,
                superseded = report.superseded,
                "Presence flush incomplete"
            );
        } else if report.persisted > 0 {
            debug!(persisted = report.persisted, "Presence flushed");
        }

        report
    }

    /// Run until `shutdown` flips to true (or its sender goes away), then do
    /// one last flush.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Presence flush every {}s", self.interval.as_secs());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_now().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let report = self.flush_now().await;
        info!(
            persisted = report.persisted,
            unflushed = self.cache.len(),
            "Final presence flush done"
        );
    }
}
