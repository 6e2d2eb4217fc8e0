//! Collaborator seams: the services the pipeline talks to but does not
//! own.
//!
//! Each seam is a trait with a no-op default implementation, so an
//! instance can run fully local and tests can substitute recording
//! fakes. Dispatch to a collaborator is fire-and-forget from the
//! pipeline's point of view: an error is logged by the caller and the
//! batch is not retried.

use std::collections::HashSet;

use bytes::Bytes;

use crate::disk_buffer::CleanupPass;
use crate::entry::{CacheId, EntrySnapshot};
use crate::error::CacheError;
use crate::events::{
    ExternalFragmentEvent, InvalidateByIdEvent, InvalidateByTemplateEvent, PushAliasEvent,
};
use crate::events::{InvalidationCause, InvalidationSource};

/// A serialized entry on its way to peers.
#[derive(Debug, Clone)]
pub struct EntryPush {
    pub snapshot: EntrySnapshot,
    /// The pushing node gives up ownership of the id; set when a
    /// renouncing invalidation was outrun by this write.
    pub renounce_ownership: bool,
}

/// The filtered events a tick ships to remote peers.
#[derive(Debug, Default)]
pub struct ReplicationBatch {
    pub invalidate_by_id: Vec<InvalidateByIdEvent>,
    pub invalidate_by_template: Vec<InvalidateByTemplateEvent>,
    pub push_entries: Vec<EntryPush>,
    pub push_aliases: Vec<PushAliasEvent>,
}

impl ReplicationBatch {
    /// Whether nothing survived filtering.
    pub fn is_empty(&self) -> bool {
        self.invalidate_by_id.is_empty()
            && self.invalidate_by_template.is_empty()
            && self.push_entries.is_empty()
            && self.push_aliases.is_empty()
    }
}

/// Observes invalidations and vetoes outbound pushes.
///
/// `register_invalidations` is called once per tick with the surviving
/// invalidations before anything is dispatched. The filter methods
/// return the allowed subset; ids removed from the returned set are
/// dropped from the batch (their pins are still released normally).
pub trait AuditFilter: Send + Sync {
    /// Observe the invalidations surviving this tick.
    fn register_invalidations(
        &self,
        instance: &str,
        by_id: &[InvalidateByIdEvent],
        by_template: &[InvalidateByTemplateEvent],
    );

    /// Restrict which entry pushes may leave the process.
    fn filter_entry_list(&self, instance: &str, candidates: HashSet<CacheId>) -> HashSet<CacheId>;

    /// Restrict which external fragments may leave the process.
    fn filter_fragment_list(&self, instance: &str, candidates: HashSet<CacheId>)
        -> HashSet<CacheId>;
}

/// Auditor that observes nothing and allows everything.
#[derive(Debug, Default)]
pub struct AllowAllAudit;

impl AuditFilter for AllowAllAudit {
    fn register_invalidations(
        &self,
        _instance: &str,
        _by_id: &[InvalidateByIdEvent],
        _by_template: &[InvalidateByTemplateEvent],
    ) {
    }

    fn filter_entry_list(&self, _instance: &str, candidates: HashSet<CacheId>) -> HashSet<CacheId> {
        candidates
    }

    fn filter_fragment_list(
        &self,
        _instance: &str,
        candidates: HashSet<CacheId>,
    ) -> HashSet<CacheId> {
        candidates
    }
}

/// Transport to remote cache peers.
pub trait ReplicationChannel: Send + Sync {
    /// Whether the transport is connected at all. A disconnected channel
    /// makes the tick buffer the batch, the same as congestion; the tick
    /// still applies locally.
    fn is_ready(&self) -> bool;

    /// Whether the transport is backed up. A congested channel makes the
    /// tick buffer instead of dispatch.
    fn is_congested(&self) -> bool;

    /// Ship one filtered batch. Errors are logged by the caller and the
    /// batch is not retried.
    fn dispatch(&self, instance: &str, batch: ReplicationBatch) -> Result<(), CacheError>;
}

/// External cache group: receives the tick's surviving invalidations
/// (including clears) and rendered fragments.
pub trait ExternalCacheGroup: Send + Sync {
    fn propagate(
        &self,
        instance: &str,
        invalidate_by_id: Vec<InvalidateByIdEvent>,
        invalidate_by_template: Vec<InvalidateByTemplateEvent>,
        fragments: Vec<ExternalFragmentEvent>,
    ) -> Result<(), CacheError>;
}

/// Result of one disk cleanup pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiskCleanupOutcome {
    /// Entries deleted from disk.
    pub removed: usize,
    /// Disk regions returned to the allocator.
    pub reclaimed: usize,
    /// Ids the tier's own garbage collection removed; these still need
    /// invalidation events so peers hear about them.
    pub garbage_collected: Vec<CacheId>,
}

/// The disk tier behind an instance.
pub trait DiskTier: Send + Sync {
    /// Apply one checked-out cleanup pass. An `Err` aborts the pass; the
    /// buffer restores its work for the next trigger.
    fn remove_invalidated(&self, pass: &CleanupPass) -> Result<DiskCleanupOutcome, CacheError>;

    /// Fetch the serialized bytes for an id, if present on disk.
    fn read(&self, id: &CacheId) -> Result<Option<Bytes>, CacheError>;
}

/// Consulted before a direct invalidation is accepted, whether it was
/// requested locally or arrived from a peer.
///
/// Eviction-, expiration-, and clear-driven invalidations are never
/// subject to veto.
pub trait PreInvalidationPolicy: Send + Sync {
    fn should_invalidate(
        &self,
        id: &CacheId,
        source: InvalidationSource,
        cause: InvalidationCause,
    ) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_all_audit_passes_candidates_through() {
        let audit = AllowAllAudit;
        let candidates: HashSet<CacheId> =
            [CacheId::from("a"), CacheId::from("b")].into_iter().collect();
        let allowed = audit.filter_entry_list("baseCache", candidates.clone());
        assert_eq!(allowed, candidates);
    }

    #[test]
    fn empty_batch_detection() {
        let batch = ReplicationBatch::default();
        assert!(batch.is_empty());
    }
}
