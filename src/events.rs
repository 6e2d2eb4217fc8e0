//! Events flowing through the batch pipeline.
//!
//! Every mutation that must leave the local instance (invalidations,
//! pushed entries, alias updates, external fragments) is recorded as one
//! of these events and accumulated per instance until the next batch
//! tick. Events carry the timestamp of the originating operation so the
//! cleanup pass can order them against later local writes.

use std::collections::HashSet;

use bytes::Bytes;

use crate::entry::CacheId;
use crate::pool::EntryHandle;
use crate::time::Timestamp;

/// Why an entry was invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationCause {
    /// Explicit invalidation by a caller.
    Direct,
    /// Evicted to make room.
    LruEviction,
    /// Explicit expiration time passed.
    Timeout,
    /// Inactivity window elapsed without a read.
    Inactive,
    /// Removed by disk-tier garbage collection.
    DiskGarbage,
    /// The whole instance was cleared.
    Clear,
}

/// Where an invalidation originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationSource {
    /// This process.
    Local,
    /// A remote peer; must not be replicated back out.
    Remote,
}

/// Invalidate a single id (and its dependents) everywhere.
#[derive(Debug, Clone)]
pub struct InvalidateByIdEvent {
    pub id: CacheId,
    pub cause: InvalidationCause,
    pub source: InvalidationSource,
    /// When the invalidation was requested; compared against entry
    /// update timestamps so a fresher local write survives it.
    pub timestamp: Timestamp,
    /// The invalidator gives up ownership of the id; peers may claim it.
    pub renounce_ownership: bool,
    /// Whether the local instance still needs to apply this event at
    /// tick time. Evictions apply immediately and set this to `false`.
    pub apply_locally: bool,
}

/// What a template event asks of its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateCommand {
    /// Invalidate every member of the template.
    Invalidate,
    /// Clear the whole instance the template belongs to.
    Clear,
}

/// Invalidate every entry associated with a template.
#[derive(Debug, Clone)]
pub struct InvalidateByTemplateEvent {
    pub template: String,
    pub command: TemplateCommand,
    pub source: InvalidationSource,
    pub timestamp: Timestamp,
}

/// Ship a written entry to peers.
///
/// The entry stays pinned from the recording write until the batch tick
/// releases the handle, so the pool cannot recycle it mid-flight.
#[derive(Debug, Clone)]
pub struct PushEntryEvent {
    /// Pinned pool reference, released exactly once by the tick.
    pub handle: EntryHandle,
    pub id: CacheId,
    pub timestamp: Timestamp,
    /// Dependency ids at write time, for cross-filtering against
    /// invalidations in the same batch.
    pub dependency_ids: HashSet<CacheId>,
    /// Templates at write time, for the same cross-filtering.
    pub templates: HashSet<String>,
    /// Set when the original write was an update racing an invalidation
    /// that renounced ownership.
    pub renounce_ownership: bool,
}

/// Propagate alias bindings for an entry to peers.
#[derive(Debug, Clone)]
pub struct PushAliasEvent {
    pub id: CacheId,
    pub aliases: HashSet<CacheId>,
    pub timestamp: Timestamp,
}

/// A pre-rendered fragment bound for the external cache group.
#[derive(Debug, Clone)]
pub struct ExternalFragmentEvent {
    pub id: CacheId,
    /// Templates whose invalidation retracts this fragment.
    pub templates: HashSet<String>,
    /// Ids whose invalidation retracts this fragment.
    pub invalidation_ids: HashSet<CacheId>,
    pub content: Bytes,
    pub timestamp: Timestamp,
}
