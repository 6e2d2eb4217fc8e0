//! The batch collector: one shared pipeline draining every instance's
//! pending events on a fixed tick.
//!
//! Producers record events between ticks; a tick swaps out the pending
//! tables and, per instance, runs the stages in order:
//!
//! 1. cleanup filtering (outrun renouncing invalidations dropped,
//!    pushes crossed off against surviving invalidations),
//! 2. audit registration and push/fragment vetting,
//! 3. replication: dispatch, or fold into the congestion buffer when
//!    the channel is congested or down, or trip the breaker,
//! 4. local apply of surviving invalidations,
//! 5. external cache group propagation,
//! 6. exactly-once release of every pinned push handle not retained by
//!    the congestion buffer,
//! 7. counter refresh.
//!
//! Dispatch is fire-and-forget: a channel error is logged and the batch
//! is not retried. Only the congestion buffer carries events across
//! ticks, and it holds its pushes pinned until they ship or are dropped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::batch::{breaker_tripped, BatchUpdateList, CongestionThresholds};
use crate::collaborators::{EntryPush, ReplicationBatch};
use crate::entry::CacheId;
use crate::events::{
    ExternalFragmentEvent, InvalidateByIdEvent, InvalidateByTemplateEvent, InvalidationSource,
    PushAliasEvent, PushEntryEvent, TemplateCommand,
};
use crate::instance::CacheInstance;
use crate::pool::EntryHandle;
use crate::time::Timestamp;

/// Shared event pipeline for a set of cache instances.
#[derive(Debug, Default)]
pub struct BatchCollector {
    instances: DashMap<String, Arc<CacheInstance>>,
    /// Events recorded since the last tick, per instance.
    pending: Mutex<HashMap<String, BatchUpdateList>>,
    /// Congestion buffers carried across ticks, per instance.
    buffers: Mutex<HashMap<String, BatchUpdateList>>,
    wake: Notify,
}

impl BatchCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance so ticks can reach its store.
    pub fn register(&self, instance: Arc<CacheInstance>) {
        self.instances
            .insert(instance.name().to_string(), instance);
    }

    /// Look up a registered instance.
    pub fn instance(&self, name: &str) -> Option<Arc<CacheInstance>> {
        self.instances.get(name).map(|r| Arc::clone(r.value()))
    }

    /// Ask the batch daemon to tick ahead of its interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }

    // ── producer side ───────────────────────────────────────────────────

    fn with_pending(&self, instance: &str, record: impl FnOnce(&mut BatchUpdateList)) {
        let mut pending = self.pending.lock().expect("pending poisoned");
        record(pending.entry(instance.to_string()).or_default());
    }

    /// Record an id invalidation for the next tick.
    pub fn record_invalidate_by_id(&self, instance: &str, event: InvalidateByIdEvent) {
        self.with_pending(instance, |list| list.record_invalidate_by_id(event));
    }

    /// Record a template invalidation for the next tick.
    pub fn record_invalidate_by_template(&self, instance: &str, event: InvalidateByTemplateEvent) {
        self.with_pending(instance, |list| list.record_invalidate_by_template(event));
    }

    /// Record a whole-instance clear, subsuming pending events.
    pub fn record_clear(&self, instance: &str, event: InvalidateByTemplateEvent) {
        self.with_pending(instance, |list| list.record_clear(event));
    }

    /// Record a pinned entry push for the next tick.
    pub fn record_push_entry(&self, instance: &str, event: PushEntryEvent) {
        self.with_pending(instance, |list| list.record_push_entry(event));
    }

    /// Record an alias push for the next tick.
    pub fn record_push_alias(&self, instance: &str, event: PushAliasEvent) {
        self.with_pending(instance, |list| list.record_push_alias(event));
    }

    /// Record an external fragment for the next tick.
    pub fn record_fragment(&self, instance: &str, event: ExternalFragmentEvent) {
        self.with_pending(instance, |list| list.record_fragment(event));
    }

    /// Number of events pending for an instance, for observation.
    pub fn pending_events(&self, instance: &str) -> usize {
        self.pending
            .lock()
            .expect("pending poisoned")
            .get(instance)
            .map(BatchUpdateList::event_count)
            .unwrap_or(0)
    }

    /// Congested ticks the instance's buffer has been carried through.
    pub fn buffered_congestion_count(&self, instance: &str) -> u32 {
        self.buffers
            .lock()
            .expect("buffers poisoned")
            .get(instance)
            .map(BatchUpdateList::congestion_count)
            .unwrap_or(0)
    }

    // ── tick ────────────────────────────────────────────────────────────

    /// Run one tick at the current wall-clock time.
    pub fn tick(&self) {
        self.tick_at(Timestamp::now());
    }

    /// Run one tick at a caller-supplied instant.
    pub fn tick_at(&self, now: Timestamp) {
        let mut swapped = std::mem::take(&mut *self.pending.lock().expect("pending poisoned"));

        let names: HashSet<String> = swapped
            .keys()
            .chain(self.buffers.lock().expect("buffers poisoned").keys())
            .cloned()
            .collect();

        for name in names {
            let fresh = swapped.remove(&name).unwrap_or_default();
            let buffered = self
                .buffers
                .lock()
                .expect("buffers poisoned")
                .remove(&name);
            let Some(instance) = self.instance(&name) else {
                warn!(instance = %name, "events recorded for an unregistered instance, dropped");
                continue;
            };
            self.process_instance(&instance, fresh, buffered, now);
        }

        for entry in self.instances.iter() {
            entry.value().refresh_counters();
        }
    }

    fn process_instance(
        &self,
        instance: &Arc<CacheInstance>,
        mut fresh: BatchUpdateList,
        buffered: Option<BatchUpdateList>,
        now: Timestamp,
    ) {
        instance.stats_mut().record_batch_tick();

        // Every handle recorded this tick is released at the end unless
        // the congestion buffer retains it.
        let mut to_release: HashSet<EntryHandle> =
            fresh.superseded_handles.drain(..).collect();
        for push in fresh.push_entries.values() {
            to_release.insert(push.handle);
        }

        self.cleanup_filter(instance, &mut fresh);
        self.audit_filter(instance, &mut fresh);

        // Survivors to apply locally and forward externally; captured
        // before the congestion path may move the list into the buffer.
        let local_by_id: Vec<InvalidateByIdEvent> = fresh
            .invalidate_by_id
            .values()
            .filter(|e| e.apply_locally)
            .cloned()
            .collect();
        let local_templates: Vec<InvalidateByTemplateEvent> =
            fresh.invalidate_by_template.values().cloned().collect();
        let external_by_id: Vec<InvalidateByIdEvent> =
            fresh.invalidate_by_id.values().cloned().collect();
        let fragments: Vec<ExternalFragmentEvent> =
            fresh.push_fragments.values().cloned().collect();

        self.replicate(instance, &mut fresh, buffered, &mut to_release, now);

        for event in &local_by_id {
            match instance.apply_invalidate_by_id(event) {
                Ok(removed) if removed > 0 => {
                    debug!(instance = %instance.name(), id = %event.id, removed, "invalidation applied");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(instance = %instance.name(), id = %event.id, error = %err, "invalidation failed");
                }
            }
        }
        for event in &local_templates {
            if let Err(err) = instance.apply_template_event(event) {
                warn!(instance = %instance.name(), template = %event.template, error = %err, "template invalidation failed");
            }
        }

        if let Some(group) = instance.external_group() {
            if !fragments.is_empty() || !external_by_id.is_empty() || !local_templates.is_empty() {
                if let Err(err) = group.propagate(
                    instance.name(),
                    external_by_id,
                    local_templates,
                    fragments,
                ) {
                    warn!(instance = %instance.name(), error = %err, "external group propagation failed");
                }
            }
        }

        for handle in to_release {
            instance.release_push_handle(handle);
        }
    }

    /// Drop events the batch itself has made moot.
    fn cleanup_filter(&self, instance: &Arc<CacheInstance>, list: &mut BatchUpdateList) {
        // A write fresher than the invalidation survives it locally. The
        // invalidation is dropped only when it renounced ownership (the
        // renunciation then travels on the write's push); a plain stale
        // invalidation still ships alongside the push, since peers may
        // hold the older entry.
        let mut renounced: HashSet<CacheId> = HashSet::new();
        let mut outrun: HashSet<CacheId> = HashSet::new();
        list.invalidate_by_id.retain(|id, event| {
            let stale = instance
                .entry_timestamp(id)
                .is_some_and(|ts| ts > event.timestamp);
            if !stale {
                return true;
            }
            if event.renounce_ownership {
                renounced.insert(id.clone());
                false
            } else {
                outrun.insert(id.clone());
                true
            }
        });
        for id in renounced {
            if let Some(push) = list.push_entries.get_mut(&id) {
                push.renounce_ownership = true;
            }
        }

        // Outrun invalidations do not cross off the fresher push.
        let surviving_ids: HashSet<CacheId> = list
            .invalidate_by_id
            .keys()
            .filter(|id| !outrun.contains(*id))
            .cloned()
            .collect();
        let clear_pending = list
            .invalidate_by_template
            .values()
            .any(|e| e.command == TemplateCommand::Clear);
        let surviving_templates: HashSet<&str> = list
            .invalidate_by_template
            .values()
            .filter(|e| e.command == TemplateCommand::Invalidate)
            .map(|e| e.template.as_str())
            .collect();

        // A push whose id, dependency, or template is invalidated in the
        // same batch would be retracted on arrival; drop it here.
        let mut dropped = 0u64;
        list.push_entries.retain(|id, push| {
            let crossed = clear_pending
                || surviving_ids.contains(id)
                || push.dependency_ids.iter().any(|d| surviving_ids.contains(d))
                || push
                    .templates
                    .iter()
                    .any(|t| surviving_templates.contains(t.as_str()));
            if crossed {
                dropped += 1;
            }
            !crossed
        });

        // An alias push is redundant next to a push of the same entry
        // (the snapshot carries its aliases) and moot next to its
        // invalidation.
        let pushes = &list.push_entries;
        list.push_aliases.retain(|id, _| {
            !clear_pending && !surviving_ids.contains(id) && !pushes.contains_key(id)
        });

        list.push_fragments.retain(|_, fragment| {
            !clear_pending
                && !surviving_ids.contains(&fragment.id)
                && !fragment
                    .invalidation_ids
                    .iter()
                    .any(|i| surviving_ids.contains(i))
                && !fragment
                    .templates
                    .iter()
                    .any(|t| surviving_templates.contains(t.as_str()))
        });

        if dropped > 0 {
            instance.stats_mut().record_pushes_dropped(dropped);
        }
    }

    /// Let the audit collaborator observe invalidations and veto
    /// outbound pushes and fragments.
    fn audit_filter(&self, instance: &Arc<CacheInstance>, list: &mut BatchUpdateList) {
        let by_id: Vec<InvalidateByIdEvent> = list.invalidate_by_id.values().cloned().collect();
        let by_template: Vec<InvalidateByTemplateEvent> =
            list.invalidate_by_template.values().cloned().collect();
        instance
            .audit()
            .register_invalidations(instance.name(), &by_id, &by_template);

        let candidates: HashSet<CacheId> = list.push_entries.keys().cloned().collect();
        if !candidates.is_empty() {
            let allowed = instance
                .audit()
                .filter_entry_list(instance.name(), candidates.clone());
            let denied = candidates.len() - allowed.len();
            if denied > 0 {
                list.push_entries.retain(|id, _| allowed.contains(id));
                instance.stats_mut().record_pushes_dropped(denied as u64);
            }
        }

        let fragment_candidates: HashSet<CacheId> =
            list.push_fragments.keys().cloned().collect();
        if !fragment_candidates.is_empty() {
            let allowed = instance
                .audit()
                .filter_fragment_list(instance.name(), fragment_candidates);
            list.push_fragments.retain(|id, _| allowed.contains(id));
        }
    }

    /// Dispatch, buffer, or drop the outbound share of the batch.
    fn replicate(
        &self,
        instance: &Arc<CacheInstance>,
        fresh: &mut BatchUpdateList,
        buffered: Option<BatchUpdateList>,
        to_release: &mut HashSet<EntryHandle>,
        _now: Timestamp,
    ) {
        // Old buffer pins default to release; the retained set is
        // subtracted below if the buffer survives this tick.
        let absorb = |buf: &mut BatchUpdateList, to_release: &mut HashSet<EntryHandle>| {
            for push in buf.push_entries.values() {
                to_release.insert(push.handle);
            }
            to_release.extend(buf.superseded_handles.drain(..));
        };

        if !instance.replication_active() {
            if let Some(mut buf) = buffered {
                absorb(&mut buf, to_release);
            }
            return;
        }
        let Some(channel) = instance.replication_channel().cloned() else {
            return;
        };

        let outbound = split_outbound(fresh);

        // A disconnected channel degrades the same way as a congested
        // one: the backlog is buffered, not dropped. Only the breaker
        // deliberately discards it.
        if !channel.is_ready() || channel.is_congested() {
            let mut base = buffered.unwrap_or_default();
            absorb(&mut base, to_release);
            let mut merged = BatchUpdateList::merge(base, outbound);
            to_release.extend(merged.superseded_handles.drain(..));
            merged.congestion_count += 1;

            let config = instance.config();
            let thresholds = CongestionThresholds::derive(
                config.capacity,
                config.congestion_size_divisor,
                config.congestion_tick_limit,
            );
            if breaker_tripped(merged.congestion_count, merged.event_count(), thresholds) {
                // Sustained congestion: stop replicating and drop the
                // backlog rather than let it pin entries forever.
                instance.disable_replication();
                return;
            }

            debug!(
                instance = %instance.name(),
                ready = channel.is_ready(),
                congestion_count = merged.congestion_count,
                events = merged.event_count(),
                "channel unavailable, batch buffered"
            );
            instance.stats_mut().record_batch_buffered();
            for push in merged.push_entries.values() {
                to_release.remove(&push.handle);
            }
            self.buffers
                .lock()
                .expect("buffers poisoned")
                .insert(instance.name().to_string(), merged);
            return;
        }

        let outbound = match buffered {
            Some(mut base) => {
                absorb(&mut base, to_release);
                let mut merged = BatchUpdateList::merge(base, outbound);
                to_release.extend(merged.superseded_handles.drain(..));
                // Buffered events may have been overtaken while the
                // channel was backed up: a buffered push whose id got
                // invalidated this tick must not ship, and buffered
                // invalidations may have gone stale. Same filter as a
                // fresh list; pins of dropped pushes are already in the
                // release set.
                self.cleanup_filter(instance, &mut merged);
                merged
            }
            None => outbound,
        };

        let batch = self.build_batch(instance, outbound, to_release);
        if batch.is_empty() {
            return;
        }
        match channel.dispatch(instance.name(), batch) {
            Ok(()) => instance.stats_mut().record_batch_dispatched(),
            Err(err) => {
                warn!(instance = %instance.name(), error = %err, "batch dispatch failed");
            }
        }
    }

    /// Serialize surviving pushes and assemble the wire batch.
    fn build_batch(
        &self,
        instance: &Arc<CacheInstance>,
        outbound: BatchUpdateList,
        to_release: &mut HashSet<EntryHandle>,
    ) -> ReplicationBatch {
        let mut batch = ReplicationBatch {
            invalidate_by_id: outbound.invalidate_by_id.into_values().collect(),
            invalidate_by_template: outbound.invalidate_by_template.into_values().collect(),
            ..Default::default()
        };

        let mut serialization_failures = 0u64;
        for (_, push) in outbound.push_entries {
            to_release.insert(push.handle);
            match instance.prepare_push(push.handle) {
                Ok(snapshot) => batch.push_entries.push(EntryPush {
                    snapshot,
                    renounce_ownership: push.renounce_ownership,
                }),
                Err(err) => {
                    serialization_failures += 1;
                    warn!(instance = %instance.name(), id = %push.id, error = %err, "push dropped");
                }
            }
        }
        if serialization_failures > 0 {
            instance
                .stats_mut()
                .record_pushes_dropped(serialization_failures);
        }
        batch.push_aliases = outbound.push_aliases.into_values().collect();
        batch
    }
}

/// Move the replicable share of a list out: locally sourced
/// invalidations plus all pushes and aliases. Remote-sourced events stay
/// behind (they must not bounce back to peers) and fragments belong to
/// the external group, not the channel.
fn split_outbound(fresh: &mut BatchUpdateList) -> BatchUpdateList {
    let mut outbound = BatchUpdateList::new();
    outbound.invalidate_by_id = fresh
        .invalidate_by_id
        .drain()
        .filter(|(_, e)| e.source == InvalidationSource::Local)
        .collect();
    outbound.invalidate_by_template = fresh
        .invalidate_by_template
        .drain()
        .filter(|(_, e)| e.source == InvalidationSource::Local)
        .collect();
    outbound.push_entries = std::mem::take(&mut fresh.push_entries);
    outbound.push_aliases = std::mem::take(&mut fresh.push_aliases);
    outbound
}
