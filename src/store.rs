//! In-memory entry store: directory, secondary indexes, and eviction.
//!
//! One store backs one cache instance and is protected by that
//! instance's lock. It owns the entry arena, the id directory, the
//! alias/dependency/template indexes, and one LRU ring per priority.
//!
//! Eviction is second-chance clock over the rings in ascending priority
//! order: the ring head spends one clock credit and rotates to the tail,
//! or is evicted when its credit is spent. Reads refill the credit to
//! the entry's priority, so higher-priority entries survive more
//! eviction passes between reads. Pinned entries are never evicted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use crate::config::MAX_PRIORITY;
use crate::entry::{CacheId, CacheValue, EntryDescriptor, ReleaseOutcome};
use crate::error::CacheError;
use crate::lru::LruRing;
use crate::pool::{EntryArena, EntryHandle, SlotIndex};
use crate::time::Timestamp;

/// Result of a write.
#[derive(Debug)]
pub struct InsertOutcome {
    /// Handle to the written entry.
    pub handle: EntryHandle,
    /// Whether an existing id was overwritten.
    pub updated: bool,
    /// Ids evicted to make room for this write.
    pub evicted: Vec<CacheId>,
}

/// A successful read.
#[derive(Debug, Clone, Copy)]
pub struct Hit {
    /// Pinned handle; the caller must `unpin` it when done.
    pub handle: EntryHandle,
    /// Whether the entry is inside its invalid-but-present interval.
    pub stale: bool,
}

/// An id removed by `remove` or `clear`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedEntry {
    /// Canonical id of the removed entry.
    pub id: CacheId,
    /// Update timestamp the entry carried.
    pub timestamp: Timestamp,
    /// Whether readers still pinned it; reclaim happens at last unpin.
    pub deferred: bool,
}

/// Entry directory and eviction state for one instance.
#[derive(Debug)]
pub struct EntryStore {
    arena: EntryArena,
    directory: HashMap<CacheId, SlotIndex>,
    /// Alias key to canonical id.
    aliases: HashMap<CacheId, CacheId>,
    /// Dependency id to the member ids that registered it.
    dependencies: HashMap<CacheId, HashSet<CacheId>>,
    /// Template name to the member ids that registered it.
    templates: HashMap<String, HashSet<CacheId>>,
    /// One ring per priority, indexed by priority.
    rings: Vec<LruRing>,
    capacity: usize,
    size_bytes: usize,
}

impl EntryStore {
    /// Create an empty store with the given entry capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: EntryArena::new(),
            directory: HashMap::new(),
            aliases: HashMap::new(),
            dependencies: HashMap::new(),
            templates: HashMap::new(),
            rings: (0..=MAX_PRIORITY).map(LruRing::new).collect(),
            capacity,
            size_bytes: 0,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.directory.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.directory.is_empty()
    }

    /// Approximate payload footprint in bytes.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Configured entry capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the id (or an alias of it) is present.
    pub fn contains(&self, id: &CacheId) -> bool {
        self.resolve(id).is_some()
    }

    /// Update timestamp of the entry for `id`, if present.
    pub fn timestamp_of(&self, id: &CacheId) -> Option<Timestamp> {
        let slot = self.resolve(id)?;
        Some(self.arena.entry_at(slot).timestamp())
    }

    /// Checked entry access through a handle.
    pub fn entry(&self, handle: EntryHandle) -> Result<&crate::entry::CacheEntry, CacheError> {
        self.arena.get(handle)
    }

    /// Checked mutable entry access through a handle.
    pub fn entry_mut(
        &mut self,
        handle: EntryHandle,
    ) -> Result<&mut crate::entry::CacheEntry, CacheError> {
        self.arena.get_mut(handle)
    }

    /// Adjust the footprint gauge after a payload representation change.
    pub fn apply_size_delta(&mut self, delta: i64) {
        self.size_bytes = (self.size_bytes as i64 + delta).max(0) as usize;
    }

    /// Write an entry, evicting to make room when the id is new and the
    /// store is full.
    pub fn insert(
        &mut self,
        descriptor: &EntryDescriptor,
        value: Arc<dyn CacheValue>,
        now: Timestamp,
    ) -> Result<InsertOutcome, CacheError> {
        let id = descriptor
            .id()
            .ok_or(CacheError::InvalidState("descriptor id was never set"))?
            .clone();

        let mut evicted = Vec::new();
        let (slot, updated) = match self.directory.get(&id).copied() {
            Some(slot) => {
                self.detach(slot)?;
                self.unindex(slot);
                let old_size = self.arena.entry_at(slot).payload().size_bytes();
                self.size_bytes = self.size_bytes.saturating_sub(old_size);
                (slot, true)
            }
            None => {
                while self.directory.len() >= self.capacity {
                    match self.evict_one()? {
                        Some(removed) => evicted.push(removed.id),
                        None => {
                            warn!(capacity = self.capacity, "all entries pinned, growing past capacity");
                            break;
                        }
                    }
                }
                (self.arena.allocate().slot(), false)
            }
        };

        {
            let entry = self.arena.entry_at_mut(slot);
            entry.copy_metadata(descriptor, now)?;
            entry.set_value(value);
        }
        let (priority, size) = {
            let entry = self.arena.entry_at(slot);
            (entry.priority(), entry.payload().size_bytes())
        };
        self.rings[priority as usize].add_last(&mut self.arena, slot)?;
        self.size_bytes += size;

        self.directory.insert(id.clone(), slot);
        self.index(slot, &id);

        Ok(InsertOutcome {
            handle: self.arena.handle_at(slot),
            updated,
            evicted,
        })
    }

    /// Read an entry, pinning it. Aliases resolve to their canonical id.
    ///
    /// An expired entry reads as a miss; its removal belongs to the
    /// expiration sweep. A hit refills the entry's clock credit.
    pub fn lookup(&mut self, id: &CacheId, now: Timestamp) -> Option<Hit> {
        let slot = self.resolve(id)?;
        let entry = self.arena.entry_at_mut(slot);
        if entry.is_expired(now) {
            return None;
        }
        entry.touch();
        entry.pin().acquire();
        let stale = entry.is_stale(now);
        Some(Hit {
            handle: self.arena.handle_at(slot),
            stale,
        })
    }

    /// Pin the entry for `id` without touching its clock credit, for
    /// holding it across a batch tick.
    pub fn pin(&mut self, id: &CacheId) -> Option<EntryHandle> {
        let slot = self.resolve(id)?;
        self.arena.entry_at(slot).pin().acquire();
        Some(self.arena.handle_at(slot))
    }

    /// Release a pin taken by `lookup` or `pin`.
    ///
    /// When the last pin of a removed entry drains, the slot goes back
    /// to the pool here. A stale handle means the entry was already
    /// reclaimed through another path; that is the callers' race to
    /// avoid, so it surfaces as an error.
    pub fn unpin(&mut self, handle: EntryHandle) -> Result<(), CacheError> {
        let outcome = self.arena.get(handle)?.pin().release();
        if outcome == ReleaseOutcome::Reclaim {
            self.arena.release(handle)?;
        }
        Ok(())
    }

    /// Remove the entry for `id` (resolving aliases).
    ///
    /// The entry leaves the directory and all indexes immediately; the
    /// slot returns to the pool now if unpinned, or at the last `unpin`
    /// otherwise.
    pub fn remove(&mut self, id: &CacheId) -> Result<Option<RemovedEntry>, CacheError> {
        let Some(slot) = self.resolve(id) else {
            return Ok(None);
        };
        Ok(Some(self.remove_slot(slot)?))
    }

    /// Remove every entry, returning what was removed.
    pub fn clear(&mut self) -> Result<Vec<RemovedEntry>, CacheError> {
        let slots: Vec<SlotIndex> = self.directory.values().copied().collect();
        let mut removed = Vec::with_capacity(slots.len());
        for slot in slots {
            removed.push(self.remove_slot(slot)?);
        }
        Ok(removed)
    }

    /// Member ids registered under a dependency id.
    pub fn members_of_dependency(&self, dep: &CacheId) -> Vec<CacheId> {
        self.dependencies
            .get(dep)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Member ids registered under a template.
    pub fn members_of_template(&self, template: &str) -> Vec<CacheId> {
        self.templates
            .get(template)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ── internals ───────────────────────────────────────────────────────

    fn resolve(&self, id: &CacheId) -> Option<SlotIndex> {
        if let Some(&slot) = self.directory.get(id) {
            return Some(slot);
        }
        let canonical = self.aliases.get(id)?;
        self.directory.get(canonical).copied()
    }

    fn remove_slot(&mut self, slot: SlotIndex) -> Result<RemovedEntry, CacheError> {
        self.detach(slot)?;
        self.unindex(slot);

        let (id, timestamp, size) = {
            let entry = self.arena.entry_at(slot);
            (
                entry
                    .id()
                    .cloned()
                    .ok_or(CacheError::InvalidState("directory points at a reset entry"))?,
                entry.timestamp(),
                entry.payload().size_bytes(),
            )
        };
        self.directory.remove(&id);
        self.size_bytes = self.size_bytes.saturating_sub(size);

        let reclaim_now = self.arena.entry_at(slot).pin().mark_for_removal();
        if reclaim_now {
            let handle = self.arena.handle_at(slot);
            self.arena.release(handle)?;
        }
        Ok(RemovedEntry {
            id,
            timestamp,
            deferred: !reclaim_now,
        })
    }

    /// Evict one unpinned entry by the second-chance clock policy, or
    /// `None` when every entry is pinned.
    ///
    /// An entry at zero credit is the victim; otherwise it spends one
    /// credit and rotates to the tail. Credits start at the entry's
    /// priority and drain one per pass, so after at most
    /// `MAX_PRIORITY + 1` passes some unpinned entry reaches zero.
    fn evict_one(&mut self) -> Result<Option<RemovedEntry>, CacheError> {
        for _pass in 0..=MAX_PRIORITY {
            for priority in 0..self.rings.len() {
                let budget = self.rings[priority].len();
                for _ in 0..budget {
                    let Some(head) = self.rings[priority].remove_first(&mut self.arena) else {
                        break;
                    };
                    let entry = self.arena.entry_at_mut(head);
                    if !entry.pin().is_pinned() && entry.clock == 0 {
                        return Ok(Some(self.remove_slot(head)?));
                    }
                    entry.clock_tick();
                    self.rings[priority].add_last(&mut self.arena, head)?;
                }
            }
        }
        Ok(None)
    }

    fn detach(&mut self, slot: SlotIndex) -> Result<(), CacheError> {
        let Some(ring) = self.arena.entry_at(slot).ring else {
            return Ok(());
        };
        self.rings[ring as usize].remove(&mut self.arena, slot)
    }

    fn index(&mut self, slot: SlotIndex, id: &CacheId) {
        let (deps, tpls, aliases) = {
            let entry = self.arena.entry_at(slot);
            (
                entry.dependency_ids.clone(),
                entry.templates.clone(),
                entry.aliases.clone(),
            )
        };
        for dep in deps {
            self.dependencies.entry(dep).or_default().insert(id.clone());
        }
        for tpl in tpls {
            self.templates.entry(tpl).or_default().insert(id.clone());
        }
        for alias in aliases {
            self.aliases.insert(alias, id.clone());
        }
    }

    fn unindex(&mut self, slot: SlotIndex) {
        let Some(id) = self.arena.entry_at(slot).id().cloned() else {
            return;
        };
        let (deps, tpls, aliases) = {
            let entry = self.arena.entry_at(slot);
            (
                entry.dependency_ids.clone(),
                entry.templates.clone(),
                entry.aliases.clone(),
            )
        };
        for dep in deps {
            if let Some(members) = self.dependencies.get_mut(&dep) {
                members.remove(&id);
                if members.is_empty() {
                    self.dependencies.remove(&dep);
                }
            }
        }
        for tpl in tpls {
            if let Some(members) = self.templates.get_mut(&tpl) {
                members.remove(&id);
                if members.is_empty() {
                    self.templates.remove(&tpl);
                }
            }
        }
        for alias in aliases {
            if self.aliases.get(&alias) == Some(&id) {
                self.aliases.remove(&alias);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn store(capacity: usize) -> EntryStore {
        EntryStore::new(capacity)
    }

    fn value(content: &'static [u8]) -> Arc<dyn CacheValue> {
        Arc::new(Bytes::from_static(content))
    }

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Insert and lookup
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn insert_then_lookup_round_trip() {
        let mut store = store(10);
        store
            .insert(&EntryDescriptor::new("a"), value(b"hello"), ts(1))
            .unwrap();

        let hit = store.lookup(&CacheId::from("a"), ts(2)).unwrap();
        assert!(!hit.stale);
        assert_eq!(store.entry(hit.handle).unwrap().payload().size_bytes(), 5);
        store.unpin(hit.handle).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.size_bytes(), 5);
    }

    #[test]
    fn update_replaces_in_place() {
        let mut store = store(10);
        store
            .insert(&EntryDescriptor::new("a"), value(b"one"), ts(1))
            .unwrap();
        let outcome = store
            .insert(&EntryDescriptor::new("a"), value(b"three!"), ts(2))
            .unwrap();

        assert!(outcome.updated);
        assert_eq!(store.len(), 1);
        assert_eq!(store.size_bytes(), 6);
        assert_eq!(store.timestamp_of(&CacheId::from("a")), Some(ts(2)));
    }

    #[test]
    fn lookup_resolves_alias() {
        let mut store = store(10);
        store
            .insert(
                &EntryDescriptor::new("page:home").with_alias("page:index"),
                value(b"v"),
                ts(1),
            )
            .unwrap();

        let hit = store.lookup(&CacheId::from("page:index"), ts(2)).unwrap();
        assert_eq!(
            store.entry(hit.handle).unwrap().id().unwrap().as_str(),
            "page:home"
        );
        store.unpin(hit.handle).unwrap();
    }

    #[test]
    fn expired_entry_reads_as_miss() {
        let mut store = store(10);
        store
            .insert(
                &EntryDescriptor::new("a").with_expiration(ts(100)),
                value(b"v"),
                ts(1),
            )
            .unwrap();

        assert!(store.lookup(&CacheId::from("a"), ts(99)).is_some_and(|h| {
            store.unpin(h.handle).unwrap();
            true
        }));
        assert!(store.lookup(&CacheId::from("a"), ts(100)).is_none());
        // Still present; removal belongs to the sweep.
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn stale_window_reported_on_hit() {
        let mut store = store(10);
        store
            .insert(
                &EntryDescriptor::new("a")
                    .with_validator_expiration(ts(50))
                    .with_expiration(ts(100)),
                value(b"v"),
                ts(1),
            )
            .unwrap();

        let hit = store.lookup(&CacheId::from("a"), ts(75)).unwrap();
        assert!(hit.stale);
        store.unpin(hit.handle).unwrap();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Removal
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn remove_unpinned_reclaims_immediately() {
        let mut store = store(10);
        store
            .insert(&EntryDescriptor::new("a"), value(b"v"), ts(1))
            .unwrap();

        let removed = store.remove(&CacheId::from("a")).unwrap().unwrap();
        assert_eq!(removed.id, CacheId::from("a"));
        assert!(!removed.deferred);
        assert!(store.is_empty());
        assert_eq!(store.size_bytes(), 0);
    }

    #[test]
    fn remove_pinned_defers_reclaim_to_last_unpin() {
        let mut store = store(10);
        store
            .insert(&EntryDescriptor::new("a"), value(b"v"), ts(1))
            .unwrap();
        let hit = store.lookup(&CacheId::from("a"), ts(2)).unwrap();

        let removed = store.remove(&CacheId::from("a")).unwrap().unwrap();
        assert!(removed.deferred);
        // Gone from the directory, payload still readable via the pin.
        assert!(!store.contains(&CacheId::from("a")));
        assert!(store.entry(hit.handle).is_ok());

        store.unpin(hit.handle).unwrap();
        // Handle went stale at reclaim.
        assert!(matches!(
            store.entry(hit.handle),
            Err(CacheError::StaleHandle)
        ));
    }

    #[test]
    fn remove_by_alias_removes_canonical() {
        let mut store = store(10);
        store
            .insert(
                &EntryDescriptor::new("a").with_alias("a2"),
                value(b"v"),
                ts(1),
            )
            .unwrap();

        let removed = store.remove(&CacheId::from("a2")).unwrap().unwrap();
        assert_eq!(removed.id, CacheId::from("a"));
        assert!(!store.contains(&CacheId::from("a")));
        assert!(!store.contains(&CacheId::from("a2")));
    }

    #[test]
    fn clear_removes_everything() {
        let mut store = store(10);
        for name in ["a", "b", "c"] {
            store
                .insert(&EntryDescriptor::new(name), value(b"v"), ts(1))
                .unwrap();
        }
        let removed = store.clear().unwrap();
        assert_eq!(removed.len(), 3);
        assert!(store.is_empty());
        assert_eq!(store.size_bytes(), 0);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Indexes
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn dependency_and_template_indexes_track_members() {
        let mut store = store(10);
        store
            .insert(
                &EntryDescriptor::new("a")
                    .with_dependency("dep:user")
                    .with_template("home.tpl"),
                value(b"v"),
                ts(1),
            )
            .unwrap();
        store
            .insert(
                &EntryDescriptor::new("b").with_dependency("dep:user"),
                value(b"v"),
                ts(1),
            )
            .unwrap();

        let mut members = store.members_of_dependency(&CacheId::from("dep:user"));
        members.sort();
        assert_eq!(members, vec![CacheId::from("a"), CacheId::from("b")]);
        assert_eq!(
            store.members_of_template("home.tpl"),
            vec![CacheId::from("a")]
        );

        store.remove(&CacheId::from("a")).unwrap();
        assert_eq!(
            store.members_of_dependency(&CacheId::from("dep:user")),
            vec![CacheId::from("b")]
        );
        assert!(store.members_of_template("home.tpl").is_empty());
    }

    #[test]
    fn update_reindexes_metadata() {
        let mut store = store(10);
        store
            .insert(
                &EntryDescriptor::new("a").with_dependency("dep:old"),
                value(b"v"),
                ts(1),
            )
            .unwrap();
        store
            .insert(
                &EntryDescriptor::new("a").with_dependency("dep:new"),
                value(b"v"),
                ts(2),
            )
            .unwrap();

        assert!(store
            .members_of_dependency(&CacheId::from("dep:old"))
            .is_empty());
        assert_eq!(
            store.members_of_dependency(&CacheId::from("dep:new")),
            vec![CacheId::from("a")]
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Eviction
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn insert_past_capacity_evicts() {
        let mut store = store(2);
        store
            .insert(&EntryDescriptor::new("a"), value(b"v"), ts(1))
            .unwrap();
        store
            .insert(&EntryDescriptor::new("b"), value(b"v"), ts(2))
            .unwrap();

        let outcome = store
            .insert(&EntryDescriptor::new("c"), value(b"v"), ts(3))
            .unwrap();
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn zero_priority_idle_entry_evicted_first() {
        let mut store = store(2);
        store
            .insert(&EntryDescriptor::new("low"), value(b"v"), ts(1))
            .unwrap();
        store
            .insert(
                &EntryDescriptor::new("high").with_priority(5),
                value(b"v"),
                ts(2),
            )
            .unwrap();

        let outcome = store
            .insert(&EntryDescriptor::new("c"), value(b"v"), ts(3))
            .unwrap();
        assert_eq!(outcome.evicted, vec![CacheId::from("low")]);
        assert!(store.contains(&CacheId::from("high")));
    }

    #[test]
    fn read_refills_clock_credit() {
        let mut store = store(2);
        store
            .insert(
                &EntryDescriptor::new("a").with_priority(3),
                value(b"v"),
                ts(1),
            )
            .unwrap();
        store
            .insert(
                &EntryDescriptor::new("b").with_priority(3),
                value(b"v"),
                ts(2),
            )
            .unwrap();

        // Both credits drain at one per pass until "a", the older head,
        // reaches zero and is evicted; "b"'s credit is spent too.
        let outcome = store
            .insert(&EntryDescriptor::new("c"), value(b"v"), ts(3))
            .unwrap();
        assert_eq!(outcome.evicted, vec![CacheId::from("a")]);
        let slot = store.directory[&CacheId::from("b")];
        assert_eq!(store.arena.entry_at(slot).clock, 0);

        let hit = store.lookup(&CacheId::from("b"), ts(4)).unwrap();
        store.unpin(hit.handle).unwrap();
        assert_eq!(store.arena.entry_at(slot).clock, 3);
    }

    #[test]
    fn higher_priority_survives_sustained_eviction() {
        let mut store = store(4);
        store
            .insert(
                &EntryDescriptor::new("keep").with_priority(MAX_PRIORITY),
                value(b"v"),
                ts(1),
            )
            .unwrap();
        for i in 0..20u32 {
            store
                .insert(&EntryDescriptor::new(format!("t{i}")), value(b"v"), ts(2))
                .unwrap();
        }
        assert!(store.contains(&CacheId::from("keep")));
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn pinned_entries_never_evicted() {
        let mut store = store(1);
        store
            .insert(&EntryDescriptor::new("a"), value(b"v"), ts(1))
            .unwrap();
        let hit = store.lookup(&CacheId::from("a"), ts(2)).unwrap();

        // "a" is pinned; the write proceeds past capacity.
        let outcome = store
            .insert(&EntryDescriptor::new("b"), value(b"v"), ts(3))
            .unwrap();
        assert!(outcome.evicted.is_empty());
        assert_eq!(store.len(), 2);
        assert!(store.contains(&CacheId::from("a")));
        store.unpin(hit.handle).unwrap();
    }
}
