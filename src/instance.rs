//! A cache instance: the store, its expiration scheduler, statistics,
//! and the collaborators the pipeline dispatches to.
//!
//! Callers interact with an instance directly for reads and writes;
//! every mutation that must leave the process is recorded into the
//! shared [`BatchCollector`](crate::collector::BatchCollector) and
//! handled on the next tick. The instance also exposes the tick-side
//! operations the collector drives: applying surviving invalidations,
//! serializing pushes, releasing pinned handles, and refreshing
//! counters.
//!
//! Lock order is store, then scheduler, then stats. No lock is held
//! across a collaborator call.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::collaborators::{
    AllowAllAudit, AuditFilter, DiskCleanupOutcome, DiskTier, ExternalCacheGroup,
    PreInvalidationPolicy, ReplicationChannel,
};
use crate::collector::BatchCollector;
use crate::config::CacheConfig;
use crate::disk_buffer::DiskInvalidationBuffer;
use crate::entry::{CacheId, CacheValue, EntryDescriptor, EntrySnapshot, Payload};
use crate::error::CacheError;
use crate::events::{
    ExternalFragmentEvent, InvalidateByIdEvent, InvalidateByTemplateEvent, InvalidationCause,
    InvalidationSource, PushAliasEvent, PushEntryEvent, TemplateCommand,
};
use crate::expiration::ExpirationScheduler;
use crate::pool::EntryHandle;
use crate::stats::{CacheStatistics, CacheStats};
use crate::store::EntryStore;
use crate::time::Timestamp;

/// A successful read: the payload plus its freshness.
#[derive(Debug, Clone)]
pub struct GetOutcome {
    pub payload: Payload,
    /// Inside the invalid-but-present interval: usable, but the caller
    /// should start revalidating.
    pub stale: bool,
}

struct DiskAttachment {
    tier: Arc<dyn DiskTier>,
    buffer: DiskInvalidationBuffer,
}

/// One named cache with its own capacity, policies, and collaborators.
pub struct CacheInstance {
    name: String,
    config: CacheConfig,
    store: Mutex<EntryStore>,
    scheduler: Mutex<ExpirationScheduler>,
    stats: Mutex<CacheStats>,
    /// Sticky: cleared by the congestion breaker, never re-set.
    replication_enabled: AtomicBool,
    audit: Arc<dyn AuditFilter>,
    replication: Option<Arc<dyn ReplicationChannel>>,
    external_group: Option<Arc<dyn ExternalCacheGroup>>,
    disk: Option<DiskAttachment>,
    policy: Option<Arc<dyn PreInvalidationPolicy>>,
}

impl CacheInstance {
    /// Create an instance from a validated configuration.
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        Ok(Self {
            name: config.name.clone(),
            store: Mutex::new(EntryStore::new(config.capacity)),
            scheduler: Mutex::new(ExpirationScheduler::new()),
            stats: Mutex::new(CacheStats::new()),
            replication_enabled: AtomicBool::new(config.replication_enabled),
            audit: Arc::new(AllowAllAudit),
            replication: None,
            external_group: None,
            disk: None,
            policy: None,
            config,
        })
    }

    /// Attach a replication channel.
    pub fn with_replication_channel(mut self, channel: Arc<dyn ReplicationChannel>) -> Self {
        self.replication = Some(channel);
        self
    }

    /// Replace the default allow-all audit filter.
    pub fn with_audit(mut self, audit: Arc<dyn AuditFilter>) -> Self {
        self.audit = audit;
        self
    }

    /// Attach an external cache group.
    pub fn with_external_group(mut self, group: Arc<dyn ExternalCacheGroup>) -> Self {
        self.external_group = Some(group);
        self
    }

    /// Attach a disk tier with the configured buffering policy.
    pub fn with_disk_tier(mut self, tier: Arc<dyn DiskTier>) -> Self {
        let policy = self.config.disk.clone().unwrap_or_default();
        self.disk = Some(DiskAttachment {
            tier,
            buffer: DiskInvalidationBuffer::new(policy),
        });
        self
    }

    /// Attach a pre-invalidation veto policy.
    pub fn with_invalidation_policy(mut self, policy: Arc<dyn PreInvalidationPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Instance name, the key in the collector's tables.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration this instance was built from.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of in-memory entries.
    pub fn len(&self) -> usize {
        self.store.lock().expect("store poisoned").len()
    }

    /// Whether the instance holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the instance's statistics.
    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics::from_stats(&self.stats.lock().expect("stats poisoned"))
    }

    // ── caller operations ───────────────────────────────────────────────

    /// Write an entry.
    pub fn put(
        &self,
        collector: &BatchCollector,
        descriptor: EntryDescriptor,
        value: Arc<dyn CacheValue>,
    ) -> Result<(), CacheError> {
        self.put_at(collector, descriptor, value, Timestamp::now())
    }

    /// Write an entry at a caller-supplied instant.
    pub fn put_at(
        &self,
        collector: &BatchCollector,
        descriptor: EntryDescriptor,
        value: Arc<dyn CacheValue>,
        now: Timestamp,
    ) -> Result<(), CacheError> {
        let id = descriptor
            .id()
            .ok_or(CacheError::InvalidState("descriptor id was never set"))?
            .clone();

        let (outcome, push, aliases) = {
            let mut store = self.store.lock().expect("store poisoned");
            let outcome = store.insert(&descriptor, value, now)?;
            let push = if descriptor.sharing.is_push() {
                // Held pinned until the batch tick ships or drops it.
                store.pin(&id).map(|handle| PushEntryEvent {
                    handle,
                    id: id.clone(),
                    timestamp: now,
                    dependency_ids: descriptor.dependency_ids.clone(),
                    templates: descriptor.templates.clone(),
                    renounce_ownership: false,
                })
            } else {
                None
            };
            let aliases = (!descriptor.aliases.is_empty()).then(|| PushAliasEvent {
                id: id.clone(),
                aliases: descriptor.aliases.clone(),
                timestamp: now,
            });
            (outcome, push, aliases)
        };

        if descriptor.expiration_time.is_some()
            || descriptor.time_limit.is_some()
            || descriptor.inactivity.is_some()
        {
            let expiration = descriptor
                .expiration_time
                .or(descriptor.time_limit.map(|ttl| now + ttl));
            self.scheduler
                .lock()
                .expect("scheduler poisoned")
                .schedule(id.clone(), expiration, descriptor.inactivity, now)?;
        }

        for evicted in &outcome.evicted {
            self.scheduler
                .lock()
                .expect("scheduler poisoned")
                .unschedule(evicted);
            if let Some(disk) = &self.disk {
                disk.buffer.add_reclaim(evicted.clone());
            }
            collector.record_invalidate_by_id(
                &self.name,
                InvalidateByIdEvent {
                    id: evicted.clone(),
                    cause: InvalidationCause::LruEviction,
                    source: InvalidationSource::Local,
                    timestamp: now,
                    renounce_ownership: false,
                    // Eviction already removed the entry.
                    apply_locally: false,
                },
            );
        }

        if let Some(event) = push {
            collector.record_push_entry(&self.name, event);
        }
        if let Some(event) = aliases {
            collector.record_push_alias(&self.name, event);
        }

        let mut stats = self.stats.lock().expect("stats poisoned");
        if outcome.updated {
            stats.record_update();
        } else {
            stats.record_insert();
        }
        stats.record_evictions(outcome.evicted.len() as u64);
        Ok(())
    }

    /// Read an entry (or one of its aliases).
    pub fn get(&self, id: &CacheId) -> Option<GetOutcome> {
        self.get_at(id, Timestamp::now())
    }

    /// Read at a caller-supplied instant.
    pub fn get_at(&self, id: &CacheId, now: Timestamp) -> Option<GetOutcome> {
        let read = {
            let mut store = self.store.lock().expect("store poisoned");
            match store.lookup(id, now) {
                Some(hit) => {
                    let entry = match store.entry(hit.handle) {
                        Ok(entry) => entry,
                        Err(_) => return None,
                    };
                    let outcome = GetOutcome {
                        payload: entry.payload().clone(),
                        stale: hit.stale,
                    };
                    let reschedule = entry.inactivity.map(|window| {
                        (
                            entry.id().cloned(),
                            entry.expiration_time,
                            window,
                        )
                    });
                    if let Err(err) = store.unpin(hit.handle) {
                        warn!(error = %err, "read unpin failed");
                    }
                    Some((outcome, reschedule))
                }
                None => None,
            }
        };

        match read {
            Some((outcome, reschedule)) => {
                if let Some((Some(canonical), expiration, window)) = reschedule {
                    let mut scheduler = self.scheduler.lock().expect("scheduler poisoned");
                    if let Err(err) = scheduler.touch(canonical, expiration, Some(window), now) {
                        warn!(error = %err, "inactivity reset failed");
                    }
                }
                let mut stats = self.stats.lock().expect("stats poisoned");
                if outcome.stale {
                    stats.record_stale_hit();
                } else {
                    stats.record_hit();
                }
                Some(outcome)
            }
            None => {
                // Memory miss: the disk tier may still hold the entry.
                if let Some(found) = self.read_from_disk(id) {
                    self.stats.lock().expect("stats poisoned").record_hit();
                    return Some(found);
                }
                self.stats.lock().expect("stats poisoned").record_miss();
                None
            }
        }
    }

    fn read_from_disk(&self, id: &CacheId) -> Option<GetOutcome> {
        let disk = self.disk.as_ref()?;
        match disk.tier.read(id) {
            Ok(Some(bytes)) => {
                debug!(instance = %self.name, id = %id, "served from disk tier");
                Some(GetOutcome {
                    payload: Payload::Serialized(bytes),
                    stale: false,
                })
            }
            Ok(None) => None,
            Err(err) => {
                warn!(instance = %self.name, id = %id, error = %err, "disk read failed");
                None
            }
        }
    }

    /// Request invalidation of an id. Returns whether the request was
    /// accepted; a veto by the pre-invalidation policy declines it.
    ///
    /// The removal itself happens on the next batch tick, together with
    /// its propagation.
    pub fn invalidate(
        &self,
        collector: &BatchCollector,
        id: &CacheId,
        renounce_ownership: bool,
    ) -> bool {
        self.invalidate_at(collector, id, renounce_ownership, Timestamp::now())
    }

    /// Request invalidation at a caller-supplied instant.
    pub fn invalidate_at(
        &self,
        collector: &BatchCollector,
        id: &CacheId,
        renounce_ownership: bool,
        now: Timestamp,
    ) -> bool {
        if let Some(policy) = &self.policy {
            if !policy.should_invalidate(id, InvalidationSource::Local, InvalidationCause::Direct) {
                debug!(instance = %self.name, id = %id, "invalidation vetoed");
                return false;
            }
        }
        collector.record_invalidate_by_id(
            &self.name,
            InvalidateByIdEvent {
                id: id.clone(),
                cause: InvalidationCause::Direct,
                source: InvalidationSource::Local,
                timestamp: now,
                renounce_ownership,
                apply_locally: true,
            },
        );
        self.stats
            .lock()
            .expect("stats poisoned")
            .record_explicit_invalidation();
        // The caller was promised prompt propagation; pull the next tick
        // forward instead of waiting out the interval.
        collector.wake();
        true
    }

    /// Request invalidation of every member of a template.
    pub fn invalidate_template(&self, collector: &BatchCollector, template: &str) {
        collector.record_invalidate_by_template(
            &self.name,
            InvalidateByTemplateEvent {
                template: template.to_string(),
                command: TemplateCommand::Invalidate,
                source: InvalidationSource::Local,
                timestamp: Timestamp::now(),
            },
        );
        self.stats
            .lock()
            .expect("stats poisoned")
            .record_explicit_invalidation();
        collector.wake();
    }

    /// Request a whole-instance clear.
    pub fn clear(&self, collector: &BatchCollector) {
        collector.record_clear(
            &self.name,
            InvalidateByTemplateEvent {
                template: String::new(),
                command: TemplateCommand::Clear,
                source: InvalidationSource::Local,
                timestamp: Timestamp::now(),
            },
        );
        collector.wake();
    }

    /// Record a rendered fragment for the external cache group.
    pub fn record_fragment(&self, collector: &BatchCollector, event: ExternalFragmentEvent) {
        collector.record_fragment(&self.name, event);
    }

    /// Ingest an invalidation received from a peer. Applied on the next
    /// tick; never replicated back out. Returns whether the event was
    /// accepted; the pre-invalidation policy may veto it like a local
    /// one.
    pub fn receive_remote_invalidation(
        &self,
        collector: &BatchCollector,
        id: CacheId,
        timestamp: Timestamp,
    ) -> bool {
        if let Some(policy) = &self.policy {
            if !policy.should_invalidate(&id, InvalidationSource::Remote, InvalidationCause::Direct)
            {
                debug!(instance = %self.name, id = %id, "remote invalidation vetoed");
                return false;
            }
        }
        collector.record_invalidate_by_id(
            &self.name,
            InvalidateByIdEvent {
                id,
                cause: InvalidationCause::Direct,
                source: InvalidationSource::Remote,
                timestamp,
                renounce_ownership: false,
                apply_locally: true,
            },
        );
        self.stats
            .lock()
            .expect("stats poisoned")
            .record_remote_invalidation();
        true
    }

    /// Ingest an entry pushed by a peer.
    pub fn receive_remote_entry(&self, snapshot: EntrySnapshot) -> Result<(), CacheError> {
        let mut descriptor = EntryDescriptor::new(snapshot.id.clone())
            .with_priority(snapshot.priority)
            .with_sharing(snapshot.sharing);
        if let Some(at) = snapshot.expiration_time {
            descriptor = descriptor.with_expiration(at);
        }
        if let Some(at) = snapshot.validator_expiration_time {
            descriptor = descriptor.with_validator_expiration(at);
        }
        descriptor.dependency_ids = snapshot.dependency_ids;
        descriptor.templates = snapshot.templates;
        descriptor.aliases = snapshot.aliases;

        let mut store = self.store.lock().expect("store poisoned");
        store.insert(&descriptor, Arc::new(snapshot.value), snapshot.timestamp)?;
        drop(store);

        if let Some(at) = snapshot.expiration_time {
            self.scheduler
                .lock()
                .expect("scheduler poisoned")
                .schedule(snapshot.id, Some(at), None, snapshot.timestamp)?;
        }
        Ok(())
    }

    // ── tick-side operations ────────────────────────────────────────────

    /// Update timestamp of the in-memory entry for `id`, if any.
    pub(crate) fn entry_timestamp(&self, id: &CacheId) -> Option<Timestamp> {
        self.store.lock().expect("store poisoned").timestamp_of(id)
    }

    /// Apply one surviving id invalidation, cascading through the
    /// dependency index. Returns the number of entries removed.
    ///
    /// A fresher in-memory write (entry timestamp past the event's)
    /// survives the invalidation untouched.
    pub(crate) fn apply_invalidate_by_id(
        &self,
        event: &InvalidateByIdEvent,
    ) -> Result<usize, CacheError> {
        if self
            .entry_timestamp(&event.id)
            .is_some_and(|ts| ts > event.timestamp)
        {
            debug!(instance = %self.name, id = %event.id, "fresher write survives invalidation");
            return Ok(0);
        }
        self.remove_cascading(&event.id, event.cause, event.source)
    }

    /// Apply one surviving template event. Returns the number of entries
    /// removed.
    pub(crate) fn apply_template_event(
        &self,
        event: &InvalidateByTemplateEvent,
    ) -> Result<usize, CacheError> {
        match event.command {
            TemplateCommand::Invalidate => {
                let members = {
                    let store = self.store.lock().expect("store poisoned");
                    store.members_of_template(&event.template)
                };
                let mut removed = 0;
                for id in members {
                    removed += self.remove_cascading(&id, InvalidationCause::Direct, event.source)?;
                }
                Ok(removed)
            }
            TemplateCommand::Clear => self.clear_local(),
        }
    }

    fn remove_cascading(
        &self,
        id: &CacheId,
        cause: InvalidationCause,
        source: InvalidationSource,
    ) -> Result<usize, CacheError> {
        let mut store = self.store.lock().expect("store poisoned");
        let mut scheduler = self.scheduler.lock().expect("scheduler poisoned");

        let mut removed = 0;
        let mut queue = vec![id.clone()];
        let mut visited = HashSet::new();
        while let Some(next) = queue.pop() {
            if !visited.insert(next.clone()) {
                continue;
            }
            queue.extend(store.members_of_dependency(&next));
            if let Some(gone) = store.remove(&next)? {
                scheduler.unschedule(&gone.id);
                if let Some(disk) = &self.disk {
                    disk.buffer.add_explicit(gone.id, cause, source);
                }
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Drop every in-memory entry and pending expiration.
    pub(crate) fn clear_local(&self) -> Result<usize, CacheError> {
        let removed = {
            let mut store = self.store.lock().expect("store poisoned");
            let removed = store.clear()?;
            self.scheduler.lock().expect("scheduler poisoned").clear();
            removed
        };
        if let Some(disk) = &self.disk {
            for gone in &removed {
                disk.buffer.add_explicit(
                    gone.id.clone(),
                    InvalidationCause::Clear,
                    InvalidationSource::Local,
                );
            }
        }
        debug!(instance = %self.name, removed = removed.len(), "instance cleared");
        Ok(removed.len())
    }

    /// Remove everything past its deadline and record the removals for
    /// propagation. Returns the number of entries expired.
    pub fn sweep_expired(&self, collector: &BatchCollector, now: Timestamp) -> usize {
        let expired = self
            .scheduler
            .lock()
            .expect("scheduler poisoned")
            .sweep(now);
        if expired.is_empty() {
            return 0;
        }

        let mut count = 0;
        for task in expired {
            let removed = {
                let mut store = self.store.lock().expect("store poisoned");
                store.remove(&task.id)
            };
            match removed {
                Ok(Some(gone)) => {
                    let cause = if task.inactivity_timeout {
                        InvalidationCause::Inactive
                    } else {
                        InvalidationCause::Timeout
                    };
                    if let Some(disk) = &self.disk {
                        disk.buffer.add_explicit(
                            gone.id.clone(),
                            cause,
                            InvalidationSource::Local,
                        );
                    }
                    collector.record_invalidate_by_id(
                        &self.name,
                        InvalidateByIdEvent {
                            id: gone.id,
                            cause,
                            source: InvalidationSource::Local,
                            timestamp: now,
                            renounce_ownership: false,
                            // Removed here; peers still need to hear.
                            apply_locally: false,
                        },
                    );
                    let mut stats = self.stats.lock().expect("stats poisoned");
                    if task.inactivity_timeout {
                        stats.record_inactivity_timeout();
                    } else {
                        stats.record_timeout();
                    }
                    count += 1;
                }
                Ok(None) => {}
                Err(err) => warn!(instance = %self.name, error = %err, "expired removal failed"),
            }
        }
        count
    }

    /// Serialize a pushed entry for dispatch.
    pub(crate) fn prepare_push(&self, handle: EntryHandle) -> Result<EntrySnapshot, CacheError> {
        let mut store = self.store.lock().expect("store poisoned");
        let delta = store.entry_mut(handle)?.prepare_for_serialization()?;
        store.apply_size_delta(delta);
        store.entry(handle)?.snapshot()
    }

    /// Release a pin held for a push event.
    pub(crate) fn release_push_handle(&self, handle: EntryHandle) {
        let mut store = self.store.lock().expect("store poisoned");
        if let Err(err) = store.unpin(handle) {
            warn!(instance = %self.name, error = %err, "push handle release failed");
        }
    }

    /// Whether batches should be dispatched for this instance.
    pub fn replication_active(&self) -> bool {
        self.replication_enabled.load(Ordering::Acquire) && self.replication.is_some()
    }

    /// Trip the congestion breaker: replication stays off until restart.
    pub(crate) fn disable_replication(&self) {
        self.replication_enabled.store(false, Ordering::Release);
        self.stats
            .lock()
            .expect("stats poisoned")
            .record_breaker_trip();
        warn!(instance = %self.name, "replication disabled by congestion breaker");
    }

    pub(crate) fn replication_channel(&self) -> Option<&Arc<dyn ReplicationChannel>> {
        self.replication.as_ref()
    }

    pub(crate) fn external_group(&self) -> Option<&Arc<dyn ExternalCacheGroup>> {
        self.config
            .external_group_enabled
            .then_some(self.external_group.as_ref())
            .flatten()
    }

    pub(crate) fn audit(&self) -> &Arc<dyn AuditFilter> {
        &self.audit
    }

    pub(crate) fn stats_mut(&self) -> std::sync::MutexGuard<'_, CacheStats> {
        self.stats.lock().expect("stats poisoned")
    }

    /// Refresh the footprint gauges from the store.
    pub fn refresh_counters(&self) {
        let (count, bytes) = {
            let store = self.store.lock().expect("store poisoned");
            (store.len(), store.size_bytes())
        };
        self.stats
            .lock()
            .expect("stats poisoned")
            .update_footprint(count, bytes);
    }

    // ── disk cleanup ────────────────────────────────────────────────────

    /// Whether the disk buffer has filled and wants an off-interval
    /// cleanup.
    pub fn disk_buffer_full(&self, now: Timestamp) -> bool {
        self.disk.as_ref().is_some_and(|d| d.buffer.is_full(now))
    }

    /// Ask the next cleanup to also scan the disk tier for expired
    /// entries.
    pub fn request_disk_scan(&self) {
        if let Some(disk) = &self.disk {
            disk.buffer.invoke_background_invalidation(true);
        }
    }

    /// Drain the disk buffer through one cleanup pass. Ids the tier
    /// garbage-collected are recorded for propagation.
    pub fn run_disk_cleanup(
        &self,
        collector: &BatchCollector,
        now: Timestamp,
    ) -> Option<DiskCleanupOutcome> {
        let disk = self.disk.as_ref()?;
        let pass = disk.buffer.begin_cleanup(now)?;

        match disk.tier.remove_invalidated(&pass) {
            Ok(outcome) => {
                disk.buffer.finish_cleanup(pass, true);
                for id in &outcome.garbage_collected {
                    collector.record_invalidate_by_id(
                        &self.name,
                        InvalidateByIdEvent {
                            id: id.clone(),
                            cause: InvalidationCause::DiskGarbage,
                            source: InvalidationSource::Local,
                            timestamp: now,
                            renounce_ownership: false,
                            apply_locally: false,
                        },
                    );
                }
                self.stats
                    .lock()
                    .expect("stats poisoned")
                    .record_disk_cleanup(outcome.removed as u64, true);
                Some(outcome)
            }
            Err(err) => {
                warn!(instance = %self.name, error = %err, "disk cleanup pass failed");
                disk.buffer.finish_cleanup(pass, false);
                self.stats
                    .lock()
                    .expect("stats poisoned")
                    .record_disk_cleanup(0, false);
                None
            }
        }
    }
}

impl std::fmt::Debug for CacheInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheInstance")
            .field("name", &self.name)
            .field("capacity", &self.config.capacity)
            .finish_non_exhaustive()
    }
}
