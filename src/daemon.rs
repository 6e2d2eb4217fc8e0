//! Background daemons: the batch tick, the expiration sweep, and the
//! disk cleanup worker.
//!
//! Each daemon is a plain struct with an async `run` loop driven by a
//! `tokio::time::interval` and stopped through a [`CancellationToken`].
//! Spawning is the caller's business:
//!
//! ```ignore
//! let daemon = BatchDaemon::new(Arc::clone(&collector));
//! tokio::spawn(daemon.run(shutdown.clone()));
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::collector::BatchCollector;
use crate::config::{DEFAULT_BATCH_INTERVAL, DEFAULT_SWEEP_INTERVAL};
use crate::instance::CacheInstance;
use crate::time::Timestamp;

/// Drives the batch collector's tick.
///
/// Ticks on a fixed interval and additionally whenever a producer calls
/// [`BatchCollector::wake`], so a synchronous invalidation does not wait
/// a full interval.
pub struct BatchDaemon {
    collector: Arc<BatchCollector>,
    interval: Duration,
}

impl BatchDaemon {
    /// Create a batch daemon with the default tick interval.
    pub fn new(collector: Arc<BatchCollector>) -> Self {
        Self {
            collector,
            interval: DEFAULT_BATCH_INTERVAL,
        }
    }

    /// Set a custom tick interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs the tick loop until shutdown is signalled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "batch daemon starting"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Skip the first immediate tick
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    // Drain what producers recorded since the last tick.
                    self.collector.tick();
                    info!("batch daemon shutting down");
                    break;
                }

                _ = self.collector.woken() => {
                    debug!("batch daemon woken early");
                    self.collector.tick();
                    interval.reset();
                }

                _ = interval.tick() => {
                    self.collector.tick();
                }
            }
        }
    }
}

/// Drives one instance's expiration sweep.
pub struct SweepDaemon {
    instance: Arc<CacheInstance>,
    collector: Arc<BatchCollector>,
    interval: Duration,
}

impl SweepDaemon {
    /// Create a sweep daemon with the instance's configured interval.
    pub fn new(instance: Arc<CacheInstance>, collector: Arc<BatchCollector>) -> Self {
        let interval = instance.config().sweep_interval;
        Self {
            instance,
            collector,
            interval,
        }
    }

    /// Set a custom sweep interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs the sweep loop until shutdown is signalled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            instance = self.instance.name(),
            interval_ms = self.interval.as_millis() as u64,
            "sweep daemon starting"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(instance = self.instance.name(), "sweep daemon shutting down");
                    break;
                }

                _ = interval.tick() => {
                    let expired = self.instance.sweep_expired(&self.collector, Timestamp::now());
                    if expired > 0 {
                        debug!(instance = self.instance.name(), expired, "expiration sweep");
                        // Get the removals on the wire promptly.
                        self.collector.wake();
                    }
                }
            }
        }
    }
}

/// Default poll interval for the disk buffer's fullness check.
const DISK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Drains one instance's disk invalidation buffer.
///
/// Runs a cleanup on the configured interval, and earlier whenever the
/// buffer reports itself full by size or age.
pub struct DiskCleanupDaemon {
    instance: Arc<CacheInstance>,
    collector: Arc<BatchCollector>,
    interval: Duration,
}

impl DiskCleanupDaemon {
    /// Create a cleanup daemon with the instance's configured interval.
    pub fn new(instance: Arc<CacheInstance>, collector: Arc<BatchCollector>) -> Self {
        let interval = instance
            .config()
            .disk
            .as_ref()
            .map(|d| d.cleanup_interval)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL);
        Self {
            instance,
            collector,
            interval,
        }
    }

    /// Set a custom cleanup interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs the cleanup loop until shutdown is signalled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            instance = self.instance.name(),
            interval_ms = self.interval.as_millis() as u64,
            "disk cleanup daemon starting"
        );

        let mut cleanup = tokio::time::interval(self.interval);
        cleanup.tick().await;
        let mut poll = tokio::time::interval(DISK_POLL_INTERVAL);
        poll.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(instance = self.instance.name(), "disk cleanup daemon shutting down");
                    break;
                }

                _ = cleanup.tick() => {
                    self.run_pass().await;
                }

                _ = poll.tick() => {
                    if self.instance.disk_buffer_full(Timestamp::now()) {
                        debug!(instance = self.instance.name(), "disk buffer full, cleaning early");
                        self.run_pass().await;
                        cleanup.reset();
                    }
                }
            }
        }
    }

    async fn run_pass(&self) {
        if let Some(outcome) = self
            .instance
            .run_disk_cleanup(&self.collector, Timestamp::now())
        {
            debug!(
                instance = self.instance.name(),
                removed = outcome.removed,
                reclaimed = outcome.reclaimed,
                "disk cleanup pass finished"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::entry::{CacheId, EntryDescriptor};
    use bytes::Bytes;

    fn instance(name: &str) -> Arc<CacheInstance> {
        Arc::new(
            CacheInstance::new(CacheConfig::new(name).with_replication(false)).unwrap(),
        )
    }

    #[tokio::test]
    async fn batch_daemon_respects_shutdown() {
        let collector = Arc::new(BatchCollector::new());
        let daemon =
            BatchDaemon::new(Arc::clone(&collector)).with_interval(Duration::from_millis(100));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn batch_daemon_ticks_on_wake() {
        let collector = Arc::new(BatchCollector::new());
        let cache = instance("wakeCache");
        collector.register(Arc::clone(&cache));

        let daemon =
            BatchDaemon::new(Arc::clone(&collector)).with_interval(Duration::from_secs(3600));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(shutdown.clone()));

        cache
            .put(
                &collector,
                EntryDescriptor::new("a"),
                Arc::new(Bytes::from_static(b"v")),
            )
            .unwrap();
        assert!(cache.invalidate(&collector, &CacheId::from("a"), false));

        // The invalidation's own wake, not the hour-long interval, must
        // drain the event.
        let mut drained = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if collector.pending_events("wakeCache") == 0 && cache.is_empty() {
                drained = true;
                break;
            }
        }
        assert!(drained, "wake should have triggered a tick");

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn sweep_daemon_expires_entries() {
        let collector = Arc::new(BatchCollector::new());
        let cache = instance("sweepCache");
        collector.register(Arc::clone(&cache));

        cache
            .put(
                &collector,
                EntryDescriptor::new("a").with_time_limit(Duration::from_millis(20)),
                Arc::new(Bytes::from_static(b"v")),
            )
            .unwrap();

        let daemon = SweepDaemon::new(Arc::clone(&cache), Arc::clone(&collector))
            .with_interval(Duration::from_millis(25));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(shutdown.clone()));

        let mut expired = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if cache.is_empty() {
                expired = true;
                break;
            }
        }
        assert!(expired, "sweep should have removed the expired entry");

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok());
    }
}
