//! Cache statistics tracking and reporting.

use std::time::Instant;

/// Counters for one cache instance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    // Read path
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,

    // Write path
    pub inserts: u64,
    pub updates: u64,

    // Removal
    pub explicit_invalidations: u64,
    pub remote_invalidations: u64,
    pub evictions: u64,
    pub timeouts: u64,
    pub inactivity_timeouts: u64,

    // Pipeline
    pub batch_ticks: u64,
    pub batches_dispatched: u64,
    pub batches_buffered: u64,
    pub breaker_trips: u64,
    pub pushes_dropped: u64,

    // Disk tier
    pub disk_cleanup_passes: u64,
    pub disk_cleanup_failures: u64,
    pub disk_entries_removed: u64,

    // Footprint, refreshed at the end of each batch tick
    pub entry_count: usize,
    pub size_bytes: usize,

    pub created_at: Instant,
}

impl Default for CacheStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStats {
    /// Create a new statistics tracker.
    pub fn new() -> Self {
        Self {
            hits: 0,
            stale_hits: 0,
            misses: 0,
            inserts: 0,
            updates: 0,
            explicit_invalidations: 0,
            remote_invalidations: 0,
            evictions: 0,
            timeouts: 0,
            inactivity_timeouts: 0,
            batch_ticks: 0,
            batches_dispatched: 0,
            batches_buffered: 0,
            breaker_trips: 0,
            pushes_dropped: 0,
            disk_cleanup_passes: 0,
            disk_cleanup_failures: 0,
            disk_entries_removed: 0,
            entry_count: 0,
            size_bytes: 0,
            created_at: Instant::now(),
        }
    }

    /// Hit rate over all reads (0.0 to 1.0). Stale hits count as hits.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.stale_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits + self.stale_hits) as f64 / total as f64
        }
    }

    /// Uptime since statistics started.
    pub fn uptime(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Record a fresh read hit.
    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    /// Record a read served from the invalid-but-present interval.
    pub fn record_stale_hit(&mut self) {
        self.stale_hits += 1;
    }

    /// Record a read miss.
    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    /// Record a write of a previously absent id.
    pub fn record_insert(&mut self) {
        self.inserts += 1;
    }

    /// Record a write over an existing id.
    pub fn record_update(&mut self) {
        self.updates += 1;
    }

    /// Record a caller-initiated invalidation.
    pub fn record_explicit_invalidation(&mut self) {
        self.explicit_invalidations += 1;
    }

    /// Record an invalidation received from a peer.
    pub fn record_remote_invalidation(&mut self) {
        self.remote_invalidations += 1;
    }

    /// Record entries evicted to make room.
    pub fn record_evictions(&mut self, count: u64) {
        self.evictions += count;
    }

    /// Record an explicit-expiration removal.
    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
    }

    /// Record an inactivity-window removal.
    pub fn record_inactivity_timeout(&mut self) {
        self.inactivity_timeouts += 1;
    }

    /// Record one batch tick for this instance.
    pub fn record_batch_tick(&mut self) {
        self.batch_ticks += 1;
    }

    /// Record a batch shipped to the replication channel.
    pub fn record_batch_dispatched(&mut self) {
        self.batches_dispatched += 1;
    }

    /// Record a batch held back by congestion.
    pub fn record_batch_buffered(&mut self) {
        self.batches_buffered += 1;
    }

    /// Record a congestion breaker trip.
    pub fn record_breaker_trip(&mut self) {
        self.breaker_trips += 1;
    }

    /// Record pushes dropped by filtering or serialization failure.
    pub fn record_pushes_dropped(&mut self, count: u64) {
        self.pushes_dropped += count;
    }

    /// Record the outcome of one disk cleanup pass.
    pub fn record_disk_cleanup(&mut self, removed: u64, success: bool) {
        self.disk_cleanup_passes += 1;
        self.disk_entries_removed += removed;
        if !success {
            self.disk_cleanup_failures += 1;
        }
    }

    /// Refresh footprint gauges.
    pub fn update_footprint(&mut self, entry_count: usize, size_bytes: usize) {
        self.entry_count = entry_count;
        self.size_bytes = size_bytes;
    }
}

/// Snapshot of cache statistics for reporting.
#[derive(Debug, Clone)]
pub struct CacheStatistics {
    pub stats: CacheStats,
    pub hit_rate_percent: f64,
    pub uptime_secs: u64,
}

impl CacheStatistics {
    /// Create a statistics snapshot from current stats.
    pub fn from_stats(stats: &CacheStats) -> Self {
        Self {
            stats: stats.clone(),
            hit_rate_percent: stats.hit_rate() * 100.0,
            uptime_secs: stats.uptime().as_secs(),
        }
    }

    /// Format statistics as a human-readable string.
    pub fn format(&self, instance: &str) -> String {
        let stats = &self.stats;

        format!(
            r#"Cache Statistics
Instance: {}

READS
  Hits:        {}
  Stale hits:  {}
  Misses:      {}
  Hit Rate:    {:.1}%

WRITES
  Inserts:     {}
  Updates:     {}

REMOVALS
  Explicit:    {}
  Remote:      {}
  Evictions:   {}
  Timeouts:    {}
  Inactive:    {}

PIPELINE
  Ticks:       {}
  Dispatched:  {}
  Buffered:    {}
  Breaker:     {}
  Dropped:     {}

DISK
  Passes:      {}
  Failures:    {}
  Removed:     {}

FOOTPRINT
  Entries:     {}
  Size:        {:.2} MB
  Uptime:      {}s
"#,
            instance,
            stats.hits,
            stats.stale_hits,
            stats.misses,
            self.hit_rate_percent,
            stats.inserts,
            stats.updates,
            stats.explicit_invalidations,
            stats.remote_invalidations,
            stats.evictions,
            stats.timeouts,
            stats.inactivity_timeouts,
            stats.batch_ticks,
            stats.batches_dispatched,
            stats.batches_buffered,
            stats.breaker_trips,
            stats.pushes_dropped,
            stats.disk_cleanup_passes,
            stats.disk_cleanup_failures,
            stats.disk_entries_removed,
            stats.entry_count,
            stats.size_bytes as f64 / (1024.0 * 1024.0),
            self.uptime_secs,
        )
    }
}
