//! Entry pool: an index-based arena of reusable [`CacheEntry`] storage.
//!
//! Slots are stable indices with a generation counter bumped on every
//! recycle, so a handle held across a release is detected as
//! [`CacheError::StaleHandle`] instead of silently reading a reused
//! entry. Allocation never blocks: an empty free list grows the arena.

use tracing::trace;

use crate::entry::CacheEntry;
use crate::error::CacheError;

/// Arena slot index.
pub type SlotIndex = u32;

/// Checked reference to a pooled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    slot: SlotIndex,
    generation: u32,
}

impl EntryHandle {
    /// The slot this handle points at.
    pub fn slot(self) -> SlotIndex {
        self.slot
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    occupied: bool,
    entry: CacheEntry,
}

/// Pool of reusable entry storage.
///
/// Protected by the owning instance's lock together with the LRU rings
/// that link through it.
#[derive(Debug, Default)]
pub struct EntryArena {
    slots: Vec<Slot>,
    free: Vec<SlotIndex>,
}

impl EntryArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an idle entry from the pool, growing the arena if none is
    /// free. The returned entry is reset to default state.
    pub fn allocate(&mut self) -> EntryHandle {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::default());
                trace!(slots = self.slots.len(), "entry arena grown");
                (self.slots.len() - 1) as SlotIndex
            }
        };
        let s = &mut self.slots[slot as usize];
        debug_assert!(!s.occupied);
        s.occupied = true;
        s.entry.reset();
        EntryHandle {
            slot,
            generation: s.generation,
        }
    }

    /// Checked shared access.
    pub fn get(&self, handle: EntryHandle) -> Result<&CacheEntry, CacheError> {
        let slot = self
            .slots
            .get(handle.slot as usize)
            .ok_or(CacheError::StaleHandle)?;
        if !slot.occupied || slot.generation != handle.generation {
            return Err(CacheError::StaleHandle);
        }
        Ok(&slot.entry)
    }

    /// Checked exclusive access.
    pub fn get_mut(&mut self, handle: EntryHandle) -> Result<&mut CacheEntry, CacheError> {
        let slot = self
            .slots
            .get_mut(handle.slot as usize)
            .ok_or(CacheError::StaleHandle)?;
        if !slot.occupied || slot.generation != handle.generation {
            return Err(CacheError::StaleHandle);
        }
        Ok(&mut slot.entry)
    }

    /// Return an entry to the pool.
    ///
    /// The entry must be unpinned and detached from any ring; violating
    /// either is a programming error surfaced as `InvalidState`. The
    /// slot's generation is bumped so outstanding handles go stale.
    pub fn release(&mut self, handle: EntryHandle) -> Result<(), CacheError> {
        {
            let entry = self.get(handle)?;
            if entry.pin().is_pinned() {
                return Err(CacheError::InvalidState("released a pinned entry"));
            }
            if entry.ring.is_some() {
                return Err(CacheError::InvalidState("released an entry still in a ring"));
            }
        }
        let slot = &mut self.slots[handle.slot as usize];
        slot.entry.reset();
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.slot);
        Ok(())
    }

    /// Current handle for an occupied slot (ring traversal helper).
    pub(crate) fn handle_at(&self, slot: SlotIndex) -> EntryHandle {
        EntryHandle {
            slot,
            generation: self.slots[slot as usize].generation,
        }
    }

    /// Direct slot access for ring link maintenance. The caller must know
    /// the slot is occupied (links only ever point at occupied slots).
    pub(crate) fn entry_at(&self, slot: SlotIndex) -> &CacheEntry {
        &self.slots[slot as usize].entry
    }

    pub(crate) fn entry_at_mut(&mut self, slot: SlotIndex) -> &mut CacheEntry {
        &mut self.slots[slot as usize].entry
    }

    /// Number of occupied slots.
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Number of idle pooled slots.
    pub fn idle_count(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryDescriptor;
    use crate::time::Timestamp;

    #[test]
    fn allocate_grows_when_empty() {
        let mut arena = EntryArena::new();
        assert_eq!(arena.live_count(), 0);

        let a = arena.allocate();
        let b = arena.allocate();
        assert_ne!(a.slot(), b.slot());
        assert_eq!(arena.live_count(), 2);
        assert_eq!(arena.idle_count(), 0);
    }

    #[test]
    fn release_recycles_slot() {
        let mut arena = EntryArena::new();
        let a = arena.allocate();
        arena.release(a).unwrap();
        assert_eq!(arena.idle_count(), 1);

        let b = arena.allocate();
        assert_eq!(b.slot(), a.slot());
        assert_eq!(arena.idle_count(), 0);
    }

    #[test]
    fn stale_handle_detected_after_release() {
        let mut arena = EntryArena::new();
        let a = arena.allocate();
        arena.release(a).unwrap();
        arena.allocate();

        assert!(matches!(arena.get(a), Err(CacheError::StaleHandle)));
        assert!(matches!(arena.get_mut(a), Err(CacheError::StaleHandle)));
        assert!(matches!(arena.release(a), Err(CacheError::StaleHandle)));
    }

    #[test]
    fn release_rejects_pinned_entry() {
        let mut arena = EntryArena::new();
        let a = arena.allocate();
        arena.get(a).unwrap().pin().acquire();

        assert!(matches!(
            arena.release(a),
            Err(CacheError::InvalidState(_))
        ));

        arena.get(a).unwrap().pin().release();
        arena.release(a).unwrap();
    }

    #[test]
    fn release_rejects_linked_entry() {
        let mut arena = EntryArena::new();
        let a = arena.allocate();
        arena.get_mut(a).unwrap().ring = Some(0);

        assert!(matches!(
            arena.release(a),
            Err(CacheError::InvalidState(_))
        ));
    }

    #[test]
    fn allocate_resets_previous_state() {
        let mut arena = EntryArena::new();
        let a = arena.allocate();
        arena
            .get_mut(a)
            .unwrap()
            .copy_metadata(&EntryDescriptor::new("x"), Timestamp::now())
            .unwrap();
        arena.release(a).unwrap();

        let b = arena.allocate();
        assert!(arena.get(b).unwrap().id().is_none());
    }
}
