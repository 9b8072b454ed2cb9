//! Periodic cache maintenance.
//!
//! Two cooperative callbacks on the tokio loop: the **worker** fires
//! every 15 seconds, expiring orphans and validating every object that
//! currently has a live subscription; the **cleaner** fires once after
//! 120 seconds and reclaims unsubscribed directory-type objects.
//! Neither blocks beyond the engine lock; both respect cancellation
//! for graceful shutdown.

use crate::service::subscription::{SharedCacheSet, SubscriptionRegistry};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default interval between worker passes (15 seconds).
pub const DEFAULT_WORKER_INTERVAL_SECS: u64 = 15;

/// Default delay before the one-shot directory-type cleaner (120
/// seconds).
pub const DEFAULT_CLEANER_DELAY_SECS: u64 = 120;

/// Background daemon driving the periodic cache maintenance.
pub struct MaintenanceTicker {
    set: SharedCacheSet,
    subscriptions: SubscriptionRegistry,
    worker_interval: Duration,
    cleaner_delay: Duration,
}

impl MaintenanceTicker {
    pub fn new(set: SharedCacheSet, subscriptions: SubscriptionRegistry) -> Self {
        Self {
            set,
            subscriptions,
            worker_interval: Duration::from_secs(DEFAULT_WORKER_INTERVAL_SECS),
            cleaner_delay: Duration::from_secs(DEFAULT_CLEANER_DELAY_SECS),
        }
    }

    /// Sets a custom worker interval.
    pub fn with_worker_interval(mut self, interval: Duration) -> Self {
        self.worker_interval = interval;
        self
    }

    /// Sets a custom cleaner delay.
    pub fn with_cleaner_delay(mut self, delay: Duration) -> Self {
        self.cleaner_delay = delay;
        self
    }

    /// Runs the ticker until shutdown is signalled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            worker_interval_secs = self.worker_interval.as_secs(),
            cleaner_delay_secs = self.cleaner_delay.as_secs(),
            "maintenance ticker starting"
        );

        let mut worker = tokio::time::interval(self.worker_interval);
        // Skip the first immediate tick.
        worker.tick().await;

        let cleaner = tokio::time::sleep(self.cleaner_delay);
        tokio::pin!(cleaner);
        let mut cleaner_fired = false;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("maintenance ticker shutting down");
                    break;
                }

                () = &mut cleaner, if !cleaner_fired => {
                    cleaner_fired = true;
                    self.run_cleaner();
                }

                _ = worker.tick() => {
                    self.run_worker();
                }
            }
        }
    }

    /// One worker pass: reap orphans, then size-check every subscribed
    /// object that is still being written.
    fn run_worker(&self) {
        debug!("maintenance worker: cleaning orphans");
        let entries = self.subscriptions.entries();
        if let Ok(mut set) = self.set.lock() {
            set.cleanup_orphans();
            for entry in &entries {
                debug!(id = entry.id, path = %entry.path.display(), "validating subscribed object");
                set.validate_subscribed(&entry.type_name, entry.id);
            }
        }
    }

    /// The one-shot pass over directory types.
    fn run_cleaner(&self) {
        debug!("maintenance cleaner: reclaiming directory types");
        if let Ok(mut set) = self.set.lock() {
            set.cleanup_dir_types();
        }
    }
}
