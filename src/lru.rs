//! Per-priority LRU ring: an intrusive doubly linked list over arena
//! slots.
//!
//! The list links through each entry's own `lru_prev`/`lru_next` fields,
//! so `remove` is O(1) without a lookup. Removal clears the entry's link
//! fields and ring back-reference, enforcing the invariant that an entry
//! belongs to at most one ring at a time.
//!
//! All operations, including iteration, require the owning instance's
//! lock; the iterator is a single forward cursor that is not safe under
//! concurrent mutation.

use crate::error::CacheError;
use crate::pool::{EntryArena, SlotIndex};

/// Doubly linked list of entries sharing one eviction priority.
#[derive(Debug)]
pub struct LruRing {
    priority: u32,
    head: Option<SlotIndex>,
    tail: Option<SlotIndex>,
    len: usize,
}

impl LruRing {
    /// Create an empty ring for the given priority.
    pub fn new(priority: u32) -> Self {
        Self {
            priority,
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// The priority this ring orders.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Number of linked entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the ring has no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `slot` is the tail entry.
    pub fn is_last(&self, slot: SlotIndex) -> bool {
        self.tail == Some(slot)
    }

    /// Link an entry at the head.
    pub fn add_first(&mut self, arena: &mut EntryArena, slot: SlotIndex) -> Result<(), CacheError> {
        self.check_detached(arena, slot)?;
        let old_head = self.head;
        {
            let entry = arena.entry_at_mut(slot);
            entry.ring = Some(self.priority);
            entry.lru_prev = None;
            entry.lru_next = old_head;
        }
        match old_head {
            Some(h) => arena.entry_at_mut(h).lru_prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
        self.len += 1;
        Ok(())
    }

    /// Link an entry at the tail.
    pub fn add_last(&mut self, arena: &mut EntryArena, slot: SlotIndex) -> Result<(), CacheError> {
        self.check_detached(arena, slot)?;
        let old_tail = self.tail;
        {
            let entry = arena.entry_at_mut(slot);
            entry.ring = Some(self.priority);
            entry.lru_prev = old_tail;
            entry.lru_next = None;
        }
        match old_tail {
            Some(t) => arena.entry_at_mut(t).lru_next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
        Ok(())
    }

    /// Unlink and return the head entry, if any.
    pub fn remove_first(&mut self, arena: &mut EntryArena) -> Option<SlotIndex> {
        let head = self.head?;
        self.remove(arena, head)
            .expect("ring head must be removable");
        Some(head)
    }

    /// Unlink an entry in O(1) via its own link fields.
    pub fn remove(&mut self, arena: &mut EntryArena, slot: SlotIndex) -> Result<(), CacheError> {
        let (prev, next) = {
            let entry = arena.entry_at(slot);
            if entry.ring != Some(self.priority) {
                return Err(CacheError::InvalidState("entry is not in this ring"));
            }
            (entry.lru_prev, entry.lru_next)
        };

        match prev {
            Some(p) => arena.entry_at_mut(p).lru_next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => arena.entry_at_mut(n).lru_prev = prev,
            None => self.tail = prev,
        }

        let entry = arena.entry_at_mut(slot);
        entry.lru_prev = None;
        entry.lru_next = None;
        entry.ring = None;
        self.len -= 1;
        Ok(())
    }

    /// Forward cursor from head to tail. Valid only while the owning
    /// lock is held and the ring is not mutated.
    pub fn iter<'a>(&self, arena: &'a EntryArena) -> LruIter<'a> {
        LruIter {
            arena,
            cursor: self.head,
        }
    }

    fn check_detached(&self, arena: &EntryArena, slot: SlotIndex) -> Result<(), CacheError> {
        if arena.entry_at(slot).ring.is_some() {
            return Err(CacheError::InvalidState("entry already belongs to a ring"));
        }
        Ok(())
    }

    #[cfg(test)]
    fn assert_consistent(&self, arena: &EntryArena) {
        if let Some(h) = self.head {
            assert!(arena.entry_at(h).lru_prev.is_none());
        }
        if let Some(t) = self.tail {
            assert!(arena.entry_at(t).lru_next.is_none());
        }
        assert_eq!(self.head.is_none(), self.tail.is_none());
        if self.len == 1 {
            assert_eq!(self.head, self.tail);
        }
        assert_eq!(self.iter(arena).count(), self.len);
    }
}

/// Single forward cursor over a ring.
pub struct LruIter<'a> {
    arena: &'a EntryArena,
    cursor: Option<SlotIndex>,
}

impl<'a> Iterator for LruIter<'a> {
    type Item = SlotIndex;

    fn next(&mut self) -> Option<SlotIndex> {
        let slot = self.cursor?;
        self.cursor = self.arena.entry_at(slot).lru_next;
        Some(slot)
    }
}
