//! Per-instance batch accumulation and congestion accounting.
//!
//! A [`BatchUpdateList`] collects the events recorded between two batch
//! ticks. Within one list the latest event for a key wins; a push
//! superseded by a newer push gives up its pin via `superseded_handles`
//! so the tick can release it.
//!
//! When the replication channel is congested, the tick folds the fresh
//! list into a carried-over buffer with [`BatchUpdateList::merge`] and
//! re-evaluates the breaker with [`breaker_tripped`]. Both are pure over
//! their inputs, so the congestion policy is testable without a channel.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::entry::CacheId;
use crate::events::{
    ExternalFragmentEvent, InvalidateByIdEvent, InvalidateByTemplateEvent, PushAliasEvent,
    PushEntryEvent, TemplateCommand,
};
use crate::pool::EntryHandle;

/// Events accumulated for one instance since the last tick.
#[derive(Debug, Default)]
pub struct BatchUpdateList {
    pub(crate) invalidate_by_id: HashMap<CacheId, InvalidateByIdEvent>,
    pub(crate) invalidate_by_template: HashMap<String, InvalidateByTemplateEvent>,
    /// Pushes dispatch in the order they were recorded, so the maps are
    /// insertion-ordered; a re-recorded id moves to the back.
    pub(crate) push_entries: IndexMap<CacheId, PushEntryEvent>,
    pub(crate) push_aliases: IndexMap<CacheId, PushAliasEvent>,
    pub(crate) push_fragments: HashMap<CacheId, ExternalFragmentEvent>,
    /// Pins given up by events replaced before the tick saw them. The
    /// tick releases these alongside the surviving handles.
    pub(crate) superseded_handles: Vec<EntryHandle>,
    /// Consecutive congested ticks this list has been carried through.
    pub(crate) congestion_count: u32,
}

impl BatchUpdateList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no events are pending.
    pub fn is_empty(&self) -> bool {
        self.invalidate_by_id.is_empty()
            && self.invalidate_by_template.is_empty()
            && self.push_entries.is_empty()
            && self.push_aliases.is_empty()
            && self.push_fragments.is_empty()
    }

    /// Total number of pending events.
    pub fn event_count(&self) -> usize {
        self.invalidate_by_id.len()
            + self.invalidate_by_template.len()
            + self.push_entries.len()
            + self.push_aliases.len()
            + self.push_fragments.len()
    }

    /// Consecutive congested ticks this list has survived.
    pub fn congestion_count(&self) -> u32 {
        self.congestion_count
    }

    /// Record an id invalidation; a later one for the same id wins.
    pub fn record_invalidate_by_id(&mut self, event: InvalidateByIdEvent) {
        self.invalidate_by_id.insert(event.id.clone(), event);
    }

    /// Record a template invalidation; a later one for the same template
    /// wins.
    pub fn record_invalidate_by_template(&mut self, event: InvalidateByTemplateEvent) {
        self.invalidate_by_template
            .insert(event.template.clone(), event);
    }

    /// Record an entry push. A pending push for the same id is replaced
    /// (its pin queued for release) and the id moves to the back of the
    /// dispatch order.
    pub fn record_push_entry(&mut self, event: PushEntryEvent) {
        if let Some(old) = self.push_entries.shift_remove(&event.id) {
            self.superseded_handles.push(old.handle);
        }
        self.push_entries.insert(event.id.clone(), event);
    }

    /// Record an alias push; a later one for the same id wins and moves
    /// to the back of the dispatch order.
    pub fn record_push_alias(&mut self, event: PushAliasEvent) {
        self.push_aliases.shift_remove(&event.id);
        self.push_aliases.insert(event.id.clone(), event);
    }

    /// Record an external fragment; a later one for the same id wins.
    pub fn record_fragment(&mut self, event: ExternalFragmentEvent) {
        self.push_fragments.insert(event.id.clone(), event);
    }

    /// Record a whole-instance clear.
    ///
    /// Everything already pending is subsumed: pending events are
    /// dropped (pins queued for release) and the clear is recorded as a
    /// template event carrying the [`TemplateCommand::Clear`] command.
    /// Events recorded afterwards accumulate as usual.
    pub fn record_clear(&mut self, event: InvalidateByTemplateEvent) {
        debug_assert_eq!(event.command, TemplateCommand::Clear);
        self.invalidate_by_id.clear();
        self.invalidate_by_template.clear();
        for (_, push) in self.push_entries.drain(..) {
            self.superseded_handles.push(push.handle);
        }
        self.push_aliases.clear();
        self.push_fragments.clear();
        self.invalidate_by_template
            .insert(event.template.clone(), event);
    }

    /// Fold a newer list onto an older one.
    ///
    /// The newer event wins every key collision; pins of pushes it
    /// replaces are queued for release. Push order in the result is the
    /// older list's remainder followed by the newer list's entries, in
    /// their recorded order. The congestion count carries over from the
    /// older list (the buffer), so repeated merges count ticks, not
    /// events. Merging onto an empty buffer yields the newer list
    /// unchanged apart from that count.
    pub fn merge(mut older: BatchUpdateList, newer: BatchUpdateList) -> BatchUpdateList {
        older.superseded_handles.extend(newer.superseded_handles);
        older.invalidate_by_id.extend(newer.invalidate_by_id);
        older
            .invalidate_by_template
            .extend(newer.invalidate_by_template);
        for (id, push) in newer.push_entries {
            if let Some(old) = older.push_entries.shift_remove(&id) {
                older.superseded_handles.push(old.handle);
            }
            older.push_entries.insert(id, push);
        }
        for (id, alias) in newer.push_aliases {
            older.push_aliases.shift_remove(&id);
            older.push_aliases.insert(id, alias);
        }
        older.push_fragments.extend(newer.push_fragments);
        older
    }
}

/// Limits the congestion breaker compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionThresholds {
    /// Consecutive congested ticks tolerated.
    pub tick_limit: u32,
    /// Merged-batch event count tolerated.
    pub size_limit: usize,
}

impl CongestionThresholds {
    /// Derive thresholds from an instance's capacity and tuning knobs.
    pub fn derive(capacity: usize, size_divisor: usize, tick_limit: u32) -> Self {
        Self {
            tick_limit,
            size_limit: (capacity / size_divisor).max(1),
        }
    }
}

/// Decide whether sustained congestion trips the replication breaker.
///
/// Both conditions must hold: the batch has been carried through more
/// congested ticks than tolerated, and it has grown past the size limit.
/// A long-congested but small batch keeps waiting; a large batch during
/// a brief stall does too.
pub fn breaker_tripped(
    congestion_count: u32,
    merged_size: usize,
    thresholds: CongestionThresholds,
) -> bool {
    congestion_count > thresholds.tick_limit && merged_size > thresholds.size_limit
}
