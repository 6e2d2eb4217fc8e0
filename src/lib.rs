//! An in-process object cache with batched invalidation propagation.
//!
//! Each [`CacheInstance`] holds a bounded in-memory store with
//! per-priority second-chance eviction, alias/dependency/template
//! indexes, and an expiration scheduler. Mutations that must reach
//! other nodes are recorded into a shared [`BatchCollector`] and
//! shipped on a fixed tick, with cross-filtering so a batch never
//! carries both a write and the invalidation that retracts it.
//!
//! Remote transports, disk tiers, audit filters, and invalidation
//! policies plug in through the traits in [`collaborators`]; everything
//! runs fully local without them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use objcache::{BatchCollector, CacheConfig, CacheId, CacheInstance, EntryDescriptor};
//!
//! # fn main() -> Result<(), objcache::CacheError> {
//! let collector = Arc::new(BatchCollector::new());
//! let cache = Arc::new(CacheInstance::new(CacheConfig::new("baseCache"))?);
//! collector.register(Arc::clone(&cache));
//!
//! cache.put(
//!     &collector,
//!     EntryDescriptor::new("page:home").with_priority(3),
//!     Arc::new(Bytes::from_static(b"<html>...</html>")),
//! )?;
//!
//! let hit = cache.get(&CacheId::from("page:home"));
//! assert!(hit.is_some());
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod collaborators;
pub mod collector;
pub mod config;
pub mod daemon;
pub mod disk_buffer;
pub mod entry;
pub mod error;
pub mod events;
pub mod expiration;
pub mod instance;
pub mod lru;
pub mod pool;
pub mod stats;
pub mod store;
pub mod time;

pub use batch::{breaker_tripped, BatchUpdateList, CongestionThresholds};
pub use collaborators::{
    AllowAllAudit, AuditFilter, DiskCleanupOutcome, DiskTier, EntryPush, ExternalCacheGroup,
    PreInvalidationPolicy, ReplicationBatch, ReplicationChannel,
};
pub use collector::BatchCollector;
pub use config::{CacheConfig, DiskBufferConfig, DEFAULT_CAPACITY, MAX_PRIORITY};
pub use daemon::{BatchDaemon, DiskCleanupDaemon, SweepDaemon};
pub use disk_buffer::{CleanupPass, DiskInvalidationBuffer};
pub use entry::{
    CacheId, CacheValue, EntryDescriptor, EntrySnapshot, Payload, PinState, SharingPolicy,
};
pub use error::{CacheError, FieldFailure, SerializationError};
pub use events::{
    ExternalFragmentEvent, InvalidateByIdEvent, InvalidateByTemplateEvent, InvalidationCause,
    InvalidationSource, PushAliasEvent, TemplateCommand,
};
pub use instance::{CacheInstance, GetOutcome};
pub use stats::{CacheStatistics, CacheStats};
pub use time::Timestamp;
