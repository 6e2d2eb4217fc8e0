//! Cache instance configuration.

use std::time::Duration;

use crate::error::CacheError;

/// Default maximum number of in-memory entries.
pub const DEFAULT_CAPACITY: usize = 2000;

/// Highest entry priority; priorities are clamped into `0..=MAX_PRIORITY`.
pub const MAX_PRIORITY: u32 = 16;

/// Default interval between batch-collector ticks.
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Default interval between expiration sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of consecutive congested ticks tolerated before the
/// replication breaker is considered.
pub const DEFAULT_CONGESTION_TICK_LIMIT: u32 = 60;

/// Default divisor applied to `capacity` to derive the congestion-breaker
/// size threshold (20 gives the historical ~5%). A tunable, not a law.
pub const DEFAULT_CONGESTION_SIZE_DIVISOR: usize = 20;

/// Configuration for one cache instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Instance name, used as the key in the batch collector's tables
    /// and in log output.
    pub name: String,
    /// Maximum number of in-memory entries before eviction kicks in.
    pub capacity: usize,
    /// Interval between batch-collector ticks.
    pub batch_interval: Duration,
    /// Interval between expiration sweeps.
    pub sweep_interval: Duration,
    /// Consecutive congested ticks tolerated before the breaker arms.
    pub congestion_tick_limit: u32,
    /// Divisor applied to `capacity` for the breaker size threshold.
    pub congestion_size_divisor: usize,
    /// Whether batches are replicated to remote peers.
    pub replication_enabled: bool,
    /// Whether surviving events are forwarded to the external cache group.
    pub external_group_enabled: bool,
    /// Disk invalidation buffering policy, when a disk tier is attached.
    pub disk: Option<DiskBufferConfig>,
}

impl CacheConfig {
    /// Create a configuration with defaults for the given instance name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: DEFAULT_CAPACITY,
            batch_interval: DEFAULT_BATCH_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            congestion_tick_limit: DEFAULT_CONGESTION_TICK_LIMIT,
            congestion_size_divisor: DEFAULT_CONGESTION_SIZE_DIVISOR,
            replication_enabled: true,
            external_group_enabled: false,
            disk: None,
        }
    }

    /// Set the in-memory entry capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the batch tick interval.
    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }

    /// Set the expiration sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the congestion breaker tick limit.
    pub fn with_congestion_tick_limit(mut self, ticks: u32) -> Self {
        self.congestion_tick_limit = ticks;
        self
    }

    /// Enable or disable replication of batches to remote peers.
    pub fn with_replication(mut self, enabled: bool) -> Self {
        self.replication_enabled = enabled;
        self
    }

    /// Enable or disable external cache group forwarding.
    pub fn with_external_group(mut self, enabled: bool) -> Self {
        self.external_group_enabled = enabled;
        self
    }

    /// Attach a disk invalidation buffering policy.
    pub fn with_disk(mut self, disk: DiskBufferConfig) -> Self {
        self.disk = Some(disk);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.name.is_empty() {
            return Err(CacheError::InvalidConfig(
                "instance name must not be empty".into(),
            ));
        }
        if self.capacity == 0 {
            return Err(CacheError::InvalidConfig(
                "capacity must be at least 1".into(),
            ));
        }
        if self.congestion_size_divisor == 0 {
            return Err(CacheError::InvalidConfig(
                "congestion_size_divisor must be at least 1".into(),
            ));
        }
        if let Some(disk) = &self.disk {
            disk.validate()?;
        }
        Ok(())
    }
}

/// Disk invalidation buffer policy configuration.
#[derive(Debug, Clone)]
pub struct DiskBufferConfig {
    /// Combined size of the explicit, scan, and reclaim sets that marks
    /// the buffer full.
    pub max_buffered_ids: usize,
    /// Maximum time since the last drain before the buffer counts as
    /// full regardless of size.
    pub max_buffer_age: Duration,
    /// Interval between disk cleanup worker checks.
    pub cleanup_interval: Duration,
}

impl Default for DiskBufferConfig {
    fn default() -> Self {
        Self {
            max_buffered_ids: 1000,
            max_buffer_age: Duration::from_secs(180),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

impl DiskBufferConfig {
    /// Set the size trigger.
    pub fn with_max_buffered_ids(mut self, max: usize) -> Self {
        self.max_buffered_ids = max;
        self
    }

    /// Set the age trigger.
    pub fn with_max_buffer_age(mut self, age: Duration) -> Self {
        self.max_buffer_age = age;
        self
    }

    /// Set the worker check interval.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    fn validate(&self) -> Result<(), CacheError> {
        if self.max_buffered_ids == 0 {
            return Err(CacheError::InvalidConfig(
                "max_buffered_ids must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = CacheConfig::new("baseCache");
        assert_eq!(config.name, "baseCache");
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.batch_interval, Duration::from_secs(1));
        assert_eq!(config.congestion_tick_limit, 60);
        assert_eq!(config.congestion_size_divisor, 20);
        assert!(config.replication_enabled);
        assert!(!config.external_group_enabled);
        assert!(config.disk.is_none());
    }

    #[test]
    fn config_builder() {
        let config = CacheConfig::new("services")
            .with_capacity(500)
            .with_batch_interval(Duration::from_millis(250))
            .with_congestion_tick_limit(3)
            .with_replication(false)
            .with_external_group(true)
            .with_disk(DiskBufferConfig::default().with_max_buffered_ids(64));

        assert_eq!(config.capacity, 500);
        assert_eq!(config.batch_interval, Duration::from_millis(250));
        assert_eq!(config.congestion_tick_limit, 3);
        assert!(!config.replication_enabled);
        assert!(config.external_group_enabled);
        assert_eq!(config.disk.unwrap().max_buffered_ids, 64);
    }

    #[test]
    fn validate_rejects_empty_name() {
        let config = CacheConfig::new("");
        assert!(matches!(
            config.validate(),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let config = CacheConfig::new("c").with_capacity(0);
        assert!(matches!(
            config.validate(),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_rejects_zero_disk_buffer() {
        let config =
            CacheConfig::new("c").with_disk(DiskBufferConfig::default().with_max_buffered_ids(0));
        assert!(matches!(
            config.validate(),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(CacheConfig::new("baseCache").validate().is_ok());
    }
}
