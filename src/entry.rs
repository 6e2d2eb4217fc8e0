//! Cache entry representation: identity, payload, metadata, pin state.
//!
//! Entries are mutable, pooled objects owned by an [`EntryArena`]
//! (`crate::pool`); everything here is the per-entry state and the rules
//! for populating, pinning, and serializing it.
//!
//! # Pin state machine
//!
//! The reference count and the "remove when unpinned" flag form one small
//! state machine over a single atomic word, so `acquire`/`release` stay
//! lock-free while the state remains observable:
//!
//! ```text
//! Live(n) --acquire--> Live(n+1)
//! Live(n>0) --release--> Live(n-1)
//! Live(n) --mark_for_removal--> PendingRemoval(n)   (n > 0)
//! Live(0) --mark_for_removal--> Reclaimable
//! PendingRemoval(1) --release--> Reclaimable
//! ```
//!
//! Only a `Reclaimable` entry may be returned to the pool.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

use crate::config::MAX_PRIORITY;
use crate::error::{CacheError, FieldFailure, SerializationError};
use crate::time::Timestamp;

/// Opaque cache key: hashable, equality-comparable, cheaply cloneable.
///
/// Ordering is total (lexicographic) and is used as the deterministic
/// tie-break for simultaneous expirations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheId(Arc<str>);

impl CacheId {
    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheId {
    fn from(s: &str) -> Self {
        CacheId(Arc::from(s))
    }
}

impl From<String> for CacheId {
    fn from(s: String) -> Self {
        CacheId(Arc::from(s))
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cacheable value: convertible to a serialized byte form on demand.
///
/// At most one of the two representations (live object, serialized
/// bytes) is materialized in an entry at a time.
pub trait CacheValue: fmt::Debug + Send + Sync {
    /// Convert to the serialized form. The error string becomes the
    /// per-field failure reason in [`SerializationError`].
    fn to_bytes(&self) -> Result<Bytes, String>;

    /// Approximate in-memory footprint in bytes, used for the owning
    /// instance's size accounting.
    fn size_hint(&self) -> usize {
        0
    }
}

impl CacheValue for Bytes {
    fn to_bytes(&self) -> Result<Bytes, String> {
        Ok(self.clone())
    }

    fn size_hint(&self) -> usize {
        self.len()
    }
}

impl CacheValue for Vec<u8> {
    fn to_bytes(&self) -> Result<Bytes, String> {
        Ok(Bytes::copy_from_slice(self))
    }

    fn size_hint(&self) -> usize {
        self.len()
    }
}

/// The entry payload: empty, a live object, or its serialized form.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    /// No value present (freshly allocated or reset entry).
    #[default]
    Empty,
    /// The live in-memory object.
    Object(Arc<dyn CacheValue>),
    /// The serialized byte form; the live object has been released.
    Serialized(Bytes),
}

impl Payload {
    /// Approximate footprint of the materialized representation.
    pub fn size_bytes(&self) -> usize {
        match self {
            Payload::Empty => 0,
            Payload::Object(v) => v.size_hint(),
            Payload::Serialized(b) => b.len(),
        }
    }
}

/// Per-entry classification controlling replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SharingPolicy {
    /// Entry stays local.
    #[default]
    NotShared,
    /// Entry is pushed to peers on write.
    Push,
    /// Peers pull the entry on demand; only invalidations are shipped.
    Pull,
    /// Pushed on write and pullable.
    PushPull,
}

impl SharingPolicy {
    /// Whether writes under this policy generate push-entry events.
    pub fn is_push(self) -> bool {
        matches!(self, SharingPolicy::Push | SharingPolicy::PushPull)
    }
}

/// Immutable write descriptor: the metadata a cache write supplies.
///
/// `commit` via [`CacheEntry::copy_metadata`] fails with `InvalidState`
/// if the id was never set.
#[derive(Debug, Clone, Default)]
pub struct EntryDescriptor {
    id: Option<CacheId>,
    /// Eviction priority, clamped into `0..=MAX_PRIORITY`.
    pub priority: u32,
    /// Relative time-to-live; resolved to an absolute expiration at commit.
    pub time_limit: Option<Duration>,
    /// Relative inactivity window; resets on read.
    pub inactivity: Option<Duration>,
    /// Absolute expiration, overrides `time_limit` when set.
    pub expiration_time: Option<Timestamp>,
    /// Start of the invalid-but-present interval.
    pub validator_expiration_time: Option<Timestamp>,
    /// Dependency keys; invalidating one invalidates this entry.
    pub dependency_ids: HashSet<CacheId>,
    /// Template names; invalidating one invalidates this entry.
    pub templates: HashSet<String>,
    /// Alternate keys mapping to this entry.
    pub aliases: HashSet<CacheId>,
    /// Replication classification.
    pub sharing: SharingPolicy,
}

impl EntryDescriptor {
    /// Create a descriptor for the given id.
    pub fn new(id: impl Into<CacheId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    /// The id, if set.
    pub fn id(&self) -> Option<&CacheId> {
        self.id.as_ref()
    }

    /// Set the eviction priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set a relative time-to-live.
    pub fn with_time_limit(mut self, ttl: Duration) -> Self {
        self.time_limit = Some(ttl);
        self
    }

    /// Set an inactivity window.
    pub fn with_inactivity(mut self, window: Duration) -> Self {
        self.inactivity = Some(window);
        self
    }

    /// Set an absolute expiration time.
    pub fn with_expiration(mut self, at: Timestamp) -> Self {
        self.expiration_time = Some(at);
        self
    }

    /// Set the start of the invalid-but-present interval.
    pub fn with_validator_expiration(mut self, at: Timestamp) -> Self {
        self.validator_expiration_time = Some(at);
        self
    }

    /// Add a dependency id.
    pub fn with_dependency(mut self, dep: impl Into<CacheId>) -> Self {
        self.dependency_ids.insert(dep.into());
        self
    }

    /// Add a template name.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.templates.insert(template.into());
        self
    }

    /// Add an alias key.
    pub fn with_alias(mut self, alias: impl Into<CacheId>) -> Self {
        self.aliases.insert(alias.into());
        self
    }

    /// Set the sharing policy.
    pub fn with_sharing(mut self, sharing: SharingPolicy) -> Self {
        self.sharing = sharing;
        self
    }
}

/// Observable pin state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    /// Referenced (or idle) and not scheduled for removal.
    Live(u32),
    /// A removal raced a pin; reclaim once the count drains.
    PendingRemoval(u32),
    /// Unpinned and marked: may be returned to the pool.
    Reclaimable,
}

/// Outcome of a `release` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Entry still pinned or not marked for removal.
    Retained,
    /// Count reached zero with the removal flag set; the caller must
    /// return the entry to the pool.
    Reclaim,
}

const REMOVE_FLAG: u32 = 1 << 31;
const COUNT_MASK: u32 = REMOVE_FLAG - 1;

/// Atomic reference count with a sticky remove-when-unpinned flag.
///
/// Reference-count mutation is the one operation allowed to bypass the
/// instance lock, since it happens on every read.
#[derive(Debug, Default)]
pub struct PinCount(AtomicU32);

impl PinCount {
    /// Increment the reference count; returns the new count.
    pub fn acquire(&self) -> u32 {
        (self.0.fetch_add(1, Ordering::AcqRel) & COUNT_MASK) + 1
    }

    /// Decrement the reference count. Underflow is clamped to zero and
    /// logged as an invariant violation, not propagated.
    pub fn release(&self) -> ReleaseOutcome {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current & COUNT_MASK == 0 {
                warn!("reference count released below zero; clamped");
                return ReleaseOutcome::Retained;
            }
            match self.0.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let new = current - 1;
                    if new & COUNT_MASK == 0 && new & REMOVE_FLAG != 0 {
                        return ReleaseOutcome::Reclaim;
                    }
                    return ReleaseOutcome::Retained;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Set the remove-when-unpinned flag. Returns `true` if the entry is
    /// immediately reclaimable (count was already zero).
    pub fn mark_for_removal(&self) -> bool {
        let previous = self.0.fetch_or(REMOVE_FLAG, Ordering::AcqRel);
        previous & COUNT_MASK == 0
    }

    /// Snapshot the observable state.
    pub fn state(&self) -> PinState {
        let word = self.0.load(Ordering::Acquire);
        let count = word & COUNT_MASK;
        if word & REMOVE_FLAG == 0 {
            PinState::Live(count)
        } else if count > 0 {
            PinState::PendingRemoval(count)
        } else {
            PinState::Reclaimable
        }
    }

    /// Current reference count.
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire) & COUNT_MASK
    }

    /// Whether any reader currently pins the entry.
    pub fn is_pinned(&self) -> bool {
        self.count() > 0
    }

    /// Reset to the idle state (pool recycle).
    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// One cached value with its metadata and ownership bookkeeping.
///
/// Link fields (`lru_prev`/`lru_next`/`ring`) are arena slot indices
/// maintained by `crate::lru` under the owning instance's lock; an entry
/// belongs to at most one ring at a time.
#[derive(Debug, Default)]
pub struct CacheEntry {
    pub(crate) id: Option<CacheId>,
    pub(crate) payload: Payload,
    pub(crate) priority: u32,
    pub(crate) time_limit: Option<Duration>,
    pub(crate) inactivity: Option<Duration>,
    pub(crate) expiration_time: Option<Timestamp>,
    pub(crate) validator_expiration_time: Option<Timestamp>,
    pub(crate) timestamp: Timestamp,
    pub(crate) dependency_ids: HashSet<CacheId>,
    pub(crate) templates: HashSet<String>,
    pub(crate) aliases: HashSet<CacheId>,
    pub(crate) sharing: SharingPolicy,
    pub(crate) pin: PinCount,
    pub(crate) clock: u32,
    pub(crate) lru_prev: Option<u32>,
    pub(crate) lru_next: Option<u32>,
    pub(crate) ring: Option<u32>,
}

impl CacheEntry {
    /// The entry's id; `None` only for a reset pool entry.
    pub fn id(&self) -> Option<&CacheId> {
        self.id.as_ref()
    }

    /// Creation/update instant, used to order concurrent updates against
    /// in-flight invalidations.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Eviction priority.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Replication classification.
    pub fn sharing(&self) -> SharingPolicy {
        self.sharing
    }

    /// Pin bookkeeping.
    pub fn pin(&self) -> &PinCount {
        &self.pin
    }

    /// Current payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Reset to default state for pool reuse.
    pub(crate) fn reset(&mut self) {
        self.id = None;
        self.payload = Payload::Empty;
        self.priority = 0;
        self.time_limit = None;
        self.inactivity = None;
        self.expiration_time = None;
        self.validator_expiration_time = None;
        self.timestamp = Timestamp::default();
        self.dependency_ids.clear();
        self.templates.clear();
        self.aliases.clear();
        self.sharing = SharingPolicy::NotShared;
        self.pin.reset();
        self.clock = 0;
        self.lru_prev = None;
        self.lru_next = None;
        self.ring = None;
    }

    /// Populate metadata from a write descriptor.
    ///
    /// A relative `time_limit` resolves to `now + time_limit` unless the
    /// descriptor carries an explicit absolute expiration.
    pub fn copy_metadata(
        &mut self,
        descriptor: &EntryDescriptor,
        now: Timestamp,
    ) -> Result<(), CacheError> {
        let id = descriptor
            .id()
            .ok_or(CacheError::InvalidState("descriptor id was never set"))?;

        self.id = Some(id.clone());
        self.priority = descriptor.priority.min(MAX_PRIORITY);
        self.time_limit = descriptor.time_limit;
        self.inactivity = descriptor.inactivity;
        self.expiration_time = descriptor
            .expiration_time
            .or(descriptor.time_limit.map(|ttl| now + ttl));
        self.validator_expiration_time = descriptor.validator_expiration_time;
        self.timestamp = now;
        self.dependency_ids = descriptor.dependency_ids.clone();
        self.templates = descriptor.templates.clone();
        self.aliases = descriptor.aliases.clone();
        self.sharing = descriptor.sharing;
        self.clock = self.priority;
        Ok(())
    }

    /// Install the live value.
    pub fn set_value(&mut self, value: Arc<dyn CacheValue>) {
        self.payload = Payload::Object(value);
    }

    /// Whether the entry is past its expiration.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expiration_time.is_some_and(|at| at <= now)
    }

    /// Whether the entry is inside the invalid-but-present (read-stale)
    /// interval `[validator_expiration_time, expiration_time)`.
    pub fn is_stale(&self, now: Timestamp) -> bool {
        self.validator_expiration_time.is_some_and(|at| at <= now) && !self.is_expired(now)
    }

    /// Reset the clock credit on access.
    pub(crate) fn touch(&mut self) {
        self.clock = self.priority;
    }

    /// Spend one clock credit; returns the remaining credit.
    pub(crate) fn clock_tick(&mut self) -> u32 {
        self.clock = self.clock.saturating_sub(1);
        self.clock
    }

    /// Convert cross-boundary fields to serialized form, releasing the
    /// in-memory form. Idempotent after success. A failure on one field
    /// does not stop conversion of the others, but any failure fails the
    /// whole call and the entry must not be dispatched.
    ///
    /// Returns the payload size delta for footprint accounting.
    pub fn prepare_for_serialization(&mut self) -> Result<i64, SerializationError> {
        let mut failures = Vec::new();
        let mut delta = 0i64;

        if let Payload::Object(value) = &self.payload {
            let before = value.size_hint() as i64;
            match value.to_bytes() {
                Ok(bytes) => {
                    delta += bytes.len() as i64 - before;
                    self.payload = Payload::Serialized(bytes);
                }
                Err(reason) => failures.push(FieldFailure {
                    field: "value",
                    reason,
                }),
            }
        }

        if failures.is_empty() {
            Ok(delta)
        } else {
            Err(SerializationError { failures })
        }
    }

    /// Immutable snapshot for dispatch to the replication channel.
    ///
    /// Requires `prepare_for_serialization` to have succeeded.
    pub fn snapshot(&self) -> Result<EntrySnapshot, CacheError> {
        let id = self
            .id
            .clone()
            .ok_or(CacheError::InvalidState("snapshot of an unset entry"))?;
        let value = match &self.payload {
            Payload::Serialized(bytes) => bytes.clone(),
            Payload::Empty => Bytes::new(),
            Payload::Object(_) => {
                return Err(CacheError::InvalidState(
                    "snapshot before prepare_for_serialization",
                ))
            }
        };
        Ok(EntrySnapshot {
            id,
            value,
            timestamp: self.timestamp,
            priority: self.priority,
            expiration_time: self.expiration_time,
            validator_expiration_time: self.validator_expiration_time,
            dependency_ids: self.dependency_ids.clone(),
            templates: self.templates.clone(),
            aliases: self.aliases.clone(),
            sharing: self.sharing,
        })
    }
}

/// Immutable, serialized view of an entry as shipped to replicas.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub id: CacheId,
    pub value: Bytes,
    pub timestamp: Timestamp,
    pub priority: u32,
    pub expiration_time: Option<Timestamp>,
    pub validator_expiration_time: Option<Timestamp>,
    pub dependency_ids: HashSet<CacheId>,
    pub templates: HashSet<String>,
    pub aliases: HashSet<CacheId>,
    pub sharing: SharingPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A value whose serializer always fails, for error-path tests.
    #[derive(Debug)]
    struct Unserializable;

    impl CacheValue for Unserializable {
        fn to_bytes(&self) -> Result<Bytes, String> {
            Err("cannot encode".into())
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pin state machine
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn pin_acquire_release_cycle() {
        let pin = PinCount::default();
        assert_eq!(pin.state(), PinState::Live(0));

        assert_eq!(pin.acquire(), 1);
        assert_eq!(pin.acquire(), 2);
        assert_eq!(pin.state(), PinState::Live(2));

        assert_eq!(pin.release(), ReleaseOutcome::Retained);
        assert_eq!(pin.release(), ReleaseOutcome::Retained);
        assert_eq!(pin.state(), PinState::Live(0));
    }

    #[test]
    fn pin_release_underflow_is_clamped() {
        let pin = PinCount::default();
        assert_eq!(pin.release(), ReleaseOutcome::Retained);
        assert_eq!(pin.count(), 0);
        assert_eq!(pin.state(), PinState::Live(0));
    }

    #[test]
    fn pin_removal_while_pinned_defers_reclaim() {
        let pin = PinCount::default();
        pin.acquire();
        pin.acquire();

        assert!(!pin.mark_for_removal());
        assert_eq!(pin.state(), PinState::PendingRemoval(2));

        assert_eq!(pin.release(), ReleaseOutcome::Retained);
        assert_eq!(pin.release(), ReleaseOutcome::Reclaim);
        assert_eq!(pin.state(), PinState::Reclaimable);
    }

    #[test]
    fn pin_removal_when_idle_is_immediately_reclaimable() {
        let pin = PinCount::default();
        assert!(pin.mark_for_removal());
        assert_eq!(pin.state(), PinState::Reclaimable);
    }

    #[test]
    fn pin_count_never_observed_negative() {
        let pin = PinCount::default();
        pin.acquire();
        pin.release();
        pin.release();
        pin.release();
        assert_eq!(pin.count(), 0);
    }

    #[test]
    fn pin_concurrent_acquire_release() {
        use std::sync::Arc;

        let pin = Arc::new(PinCount::default());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pin = Arc::clone(&pin);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    pin.acquire();
                    pin.release();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pin.count(), 0);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metadata
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn copy_metadata_requires_id() {
        let mut entry = CacheEntry::default();
        let descriptor = EntryDescriptor::default();

        let result = entry.copy_metadata(&descriptor, Timestamp::from_millis(0));
        assert!(matches!(result, Err(CacheError::InvalidState(_))));
    }

    #[test]
    fn copy_metadata_populates_fields() {
        let mut entry = CacheEntry::default();
        let descriptor = EntryDescriptor::new("page:home")
            .with_priority(3)
            .with_dependency("dep:user")
            .with_template("home.tpl")
            .with_alias("page:index")
            .with_sharing(SharingPolicy::Push);

        entry
            .copy_metadata(&descriptor, Timestamp::from_millis(42))
            .unwrap();

        assert_eq!(entry.id().unwrap().as_str(), "page:home");
        assert_eq!(entry.priority(), 3);
        assert_eq!(entry.clock, 3);
        assert_eq!(entry.timestamp(), Timestamp::from_millis(42));
        assert!(entry.dependency_ids.contains(&CacheId::from("dep:user")));
        assert!(entry.templates.contains("home.tpl"));
        assert!(entry.aliases.contains(&CacheId::from("page:index")));
        assert_eq!(entry.sharing(), SharingPolicy::Push);
    }

    #[test]
    fn copy_metadata_clamps_priority() {
        let mut entry = CacheEntry::default();
        let descriptor = EntryDescriptor::new("a").with_priority(999);
        entry
            .copy_metadata(&descriptor, Timestamp::from_millis(0))
            .unwrap();
        assert_eq!(entry.priority(), MAX_PRIORITY);
    }

    #[test]
    fn copy_metadata_resolves_relative_ttl() {
        let mut entry = CacheEntry::default();
        let descriptor = EntryDescriptor::new("a").with_time_limit(Duration::from_secs(10));
        entry
            .copy_metadata(&descriptor, Timestamp::from_millis(1_000))
            .unwrap();
        assert_eq!(entry.expiration_time, Some(Timestamp::from_millis(11_000)));
    }

    #[test]
    fn explicit_expiration_overrides_ttl() {
        let mut entry = CacheEntry::default();
        let descriptor = EntryDescriptor::new("a")
            .with_time_limit(Duration::from_secs(10))
            .with_expiration(Timestamp::from_millis(5_000));
        entry
            .copy_metadata(&descriptor, Timestamp::from_millis(1_000))
            .unwrap();
        assert_eq!(entry.expiration_time, Some(Timestamp::from_millis(5_000)));
    }

    #[test]
    fn reset_clears_everything() {
        let mut entry = CacheEntry::default();
        entry
            .copy_metadata(&EntryDescriptor::new("a").with_priority(2), Timestamp::now())
            .unwrap();
        entry.set_value(Arc::new(Bytes::from_static(b"v")));
        entry.pin.acquire();
        entry.ring = Some(2);

        entry.reset();

        assert!(entry.id().is_none());
        assert!(matches!(entry.payload, Payload::Empty));
        assert_eq!(entry.pin.count(), 0);
        assert!(entry.ring.is_none());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Expiration windows
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn stale_interval_is_validator_to_expiration() {
        let mut entry = CacheEntry::default();
        let descriptor = EntryDescriptor::new("a")
            .with_validator_expiration(Timestamp::from_millis(100))
            .with_expiration(Timestamp::from_millis(200));
        entry
            .copy_metadata(&descriptor, Timestamp::from_millis(0))
            .unwrap();

        assert!(!entry.is_stale(Timestamp::from_millis(50)));
        assert!(entry.is_stale(Timestamp::from_millis(100)));
        assert!(entry.is_stale(Timestamp::from_millis(199)));
        assert!(!entry.is_stale(Timestamp::from_millis(200)));
        assert!(entry.is_expired(Timestamp::from_millis(200)));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Serialization
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn prepare_converts_live_payload() {
        let mut entry = CacheEntry::default();
        entry
            .copy_metadata(&EntryDescriptor::new("a"), Timestamp::now())
            .unwrap();
        entry.set_value(Arc::new(Bytes::from_static(b"hello")));

        let delta = entry.prepare_for_serialization().unwrap();
        assert_eq!(delta, 0); // bytes round-trip, same size
        assert!(matches!(entry.payload, Payload::Serialized(_)));
    }

    #[test]
    fn prepare_is_idempotent() {
        let mut entry = CacheEntry::default();
        entry
            .copy_metadata(&EntryDescriptor::new("a"), Timestamp::now())
            .unwrap();
        entry.set_value(Arc::new(Bytes::from_static(b"hello")));

        entry.prepare_for_serialization().unwrap();
        let delta = entry.prepare_for_serialization().unwrap();
        assert_eq!(delta, 0);
        assert!(matches!(entry.payload, Payload::Serialized(_)));
    }

    #[test]
    fn prepare_reports_field_failure() {
        let mut entry = CacheEntry::default();
        entry
            .copy_metadata(&EntryDescriptor::new("a"), Timestamp::now())
            .unwrap();
        entry.set_value(Arc::new(Unserializable));

        let err = entry.prepare_for_serialization().unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].field, "value");
        // The live form stays in place; the entry must not be dispatched.
        assert!(matches!(entry.payload, Payload::Object(_)));
    }

    #[test]
    fn snapshot_requires_serialized_payload() {
        let mut entry = CacheEntry::default();
        entry
            .copy_metadata(&EntryDescriptor::new("a"), Timestamp::now())
            .unwrap();
        entry.set_value(Arc::new(Bytes::from_static(b"v")));

        assert!(matches!(
            entry.snapshot(),
            Err(CacheError::InvalidState(_))
        ));

        entry.prepare_for_serialization().unwrap();
        let snap = entry.snapshot().unwrap();
        assert_eq!(snap.id.as_str(), "a");
        assert_eq!(&snap.value[..], b"v");
    }
}
