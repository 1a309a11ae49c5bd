//! Fixed arena of page slots linked by index.
//!
//! Slot indices `0` and `1` anchor the LRU and free rings, the next
//! `max_handles` indices anchor one ownership ring per handle-table entry,
//! and the remaining indices are data slots. Every data slot is on exactly
//! one of the free ring or the LRU ring, or on neither while it is pinned or
//! in transit. A slot holding a page is also threaded on its handle's
//! ownership ring so teardown only walks the pages a handle owns.

use std::io;

use crate::types::{CacheError, PageAddr};

pub(crate) const NIL: u32 = u32::MAX;
const LRU_ANCHOR: u32 = 0;
const FREE_ANCHOR: u32 = 1;
const FIRST_OWNER: u32 = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Ring {
    Anchor,
    Free,
    Lru,
    Detached,
}

/// Failure recorded on a slot so late waiters can observe it.
#[derive(Clone, Debug)]
pub(crate) struct FetchFailure {
    kind: io::ErrorKind,
    message: String,
}

impl FetchFailure {
    pub(crate) fn from_error(err: &CacheError) -> Self {
        match err {
            CacheError::Io(inner) => Self {
                kind: inner.kind(),
                message: inner.to_string(),
            },
            other => Self {
                kind: io::ErrorKind::Other,
                message: other.to_string(),
            },
        }
    }

    pub(crate) fn to_error(&self) -> CacheError {
        CacheError::Io(io::Error::new(self.kind, self.message.clone()))
    }
}

pub(crate) struct SlotMeta {
    pub contents: Option<PageAddr>,
    pub len: usize,
    pub in_transit: bool,
    pub short: bool,
    pub single_use: bool,
    /// Recycle first on the next unpin only.
    pub demote_once: bool,
    pub fresh: bool,
    pub orphaned: bool,
    pub users: u32,
    pub consumed: usize,
    pub failure: Option<FetchFailure>,
    ring: Ring,
    hash_next: u32,
    prev: u32,
    next: u32,
    owner_prev: u32,
    owner_next: u32,
}

impl SlotMeta {
    fn new(idx: u32, ring: Ring) -> Self {
        Self {
            contents: None,
            len: 0,
            in_transit: false,
            short: false,
            single_use: false,
            demote_once: false,
            fresh: false,
            orphaned: false,
            users: 0,
            consumed: 0,
            failure: None,
            ring,
            hash_next: NIL,
            prev: idx,
            next: idx,
            owner_prev: idx,
            owner_next: idx,
        }
    }

    fn reset_page_state(&mut self) {
        self.contents = None;
        self.len = 0;
        self.in_transit = false;
        self.short = false;
        self.single_use = false;
        self.demote_once = false;
        self.fresh = false;
        self.orphaned = false;
        self.consumed = 0;
        self.failure = None;
    }
}

pub(crate) struct SlotArena {
    slots: Vec<SlotMeta>,
    buckets: Vec<u32>,
    first_data: u32,
    data_slots: usize,
    pub evictions: u64,
}

impl SlotArena {
    pub fn new(data_slots: usize, max_handles: usize, buckets: usize) -> Self {
        let first_data = FIRST_OWNER + max_handles as u32;
        let total = first_data as usize + data_slots;
        let mut slots = Vec::with_capacity(total);
        for idx in 0..first_data {
            slots.push(SlotMeta::new(idx, Ring::Anchor));
        }
        for idx in first_data..total as u32 {
            slots.push(SlotMeta::new(idx, Ring::Detached));
        }
        let mut arena = Self {
            slots,
            buckets: vec![NIL; buckets.max(1)],
            first_data,
            data_slots,
            evictions: 0,
        };
        for idx in first_data..total as u32 {
            arena.push_tail(FREE_ANCHOR, idx);
        }
        arena
    }

    pub fn data_slots(&self) -> usize {
        self.data_slots
    }

    /// Position of `idx` among the data slots, used to index page buffers.
    pub fn buffer_index(&self, idx: u32) -> usize {
        (idx - self.first_data) as usize
    }

    pub fn slot(&self, idx: u32) -> &SlotMeta {
        &self.slots[idx as usize]
    }

    pub fn slot_mut(&mut self, idx: u32) -> &mut SlotMeta {
        &mut self.slots[idx as usize]
    }

    fn bucket_of(&self, addr: PageAddr) -> usize {
        (addr.0 % self.buckets.len() as u64) as usize
    }

    pub fn find(&self, addr: PageAddr) -> Option<u32> {
        let mut cur = self.buckets[self.bucket_of(addr)];
        while cur != NIL {
            let slot = &self.slots[cur as usize];
            if slot.contents == Some(addr) {
                return Some(cur);
            }
            cur = slot.hash_next;
        }
        None
    }

    fn hash_insert(&mut self, idx: u32) {
        let Some(addr) = self.slots[idx as usize].contents else {
            return;
        };
        let bucket = self.bucket_of(addr);
        self.slots[idx as usize].hash_next = self.buckets[bucket];
        self.buckets[bucket] = idx;
    }

    fn hash_remove(&mut self, idx: u32) {
        let Some(addr) = self.slots[idx as usize].contents else {
            return;
        };
        let bucket = self.bucket_of(addr);
        let next = self.slots[idx as usize].hash_next;
        self.slots[idx as usize].hash_next = NIL;
        if self.buckets[bucket] == idx {
            self.buckets[bucket] = next;
            return;
        }
        let mut cur = self.buckets[bucket];
        while cur != NIL {
            if self.slots[cur as usize].hash_next == idx {
                self.slots[cur as usize].hash_next = next;
                return;
            }
            cur = self.slots[cur as usize].hash_next;
        }
    }

    fn ring_unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let slot = &self.slots[idx as usize];
            (slot.prev, slot.next)
        };
        self.slots[prev as usize].next = next;
        self.slots[next as usize].prev = prev;
        let slot = &mut self.slots[idx as usize];
        slot.prev = idx;
        slot.next = idx;
        slot.ring = Ring::Detached;
    }

    fn ring_kind(anchor: u32) -> Ring {
        if anchor == FREE_ANCHOR {
            Ring::Free
        } else {
            Ring::Lru
        }
    }

    fn push_head(&mut self, anchor: u32, idx: u32) {
        let first = self.slots[anchor as usize].next;
        self.slots[idx as usize].prev = anchor;
        self.slots[idx as usize].next = first;
        self.slots[idx as usize].ring = Self::ring_kind(anchor);
        self.slots[first as usize].prev = idx;
        self.slots[anchor as usize].next = idx;
    }

    fn push_tail(&mut self, anchor: u32, idx: u32) {
        let last = self.slots[anchor as usize].prev;
        self.slots[idx as usize].next = anchor;
        self.slots[idx as usize].prev = last;
        self.slots[idx as usize].ring = Self::ring_kind(anchor);
        self.slots[last as usize].next = idx;
        self.slots[anchor as usize].prev = idx;
    }

    fn first(&self, anchor: u32) -> Option<u32> {
        let first = self.slots[anchor as usize].next;
        (first != anchor).then_some(first)
    }

    fn owner_anchor(handle_index: usize) -> u32 {
        FIRST_OWNER + handle_index as u32
    }

    fn owner_link(&mut self, idx: u32, handle_index: usize) {
        let anchor = Self::owner_anchor(handle_index);
        let last = self.slots[anchor as usize].owner_prev;
        self.slots[idx as usize].owner_next = anchor;
        self.slots[idx as usize].owner_prev = last;
        self.slots[last as usize].owner_next = idx;
        self.slots[anchor as usize].owner_prev = idx;
    }

    fn owner_unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let slot = &self.slots[idx as usize];
            (slot.owner_prev, slot.owner_next)
        };
        self.slots[prev as usize].owner_next = next;
        self.slots[next as usize].owner_prev = prev;
        self.slots[idx as usize].owner_prev = idx;
        self.slots[idx as usize].owner_next = idx;
    }

    /// Slots currently on the ownership ring of `handle_index`.
    pub fn owned(&self, handle_index: usize) -> Vec<u32> {
        let anchor = Self::owner_anchor(handle_index);
        let mut out = Vec::new();
        let mut cur = self.slots[anchor as usize].owner_next;
        while cur != anchor {
            out.push(cur);
            cur = self.slots[cur as usize].owner_next;
        }
        out
    }

    /// Takes a slot for `addr`, recycling the LRU head when nothing is free.
    /// The slot comes back hashed, owned, pinned once, and in transit.
    pub fn claim(&mut self, addr: PageAddr) -> Option<u32> {
        let idx = match self.first(FREE_ANCHOR) {
            Some(idx) => idx,
            None => {
                let victim = self.first(LRU_ANCHOR)?;
                self.hash_remove(victim);
                self.owner_unlink(victim);
                self.evictions += 1;
                victim
            }
        };
        self.ring_unlink(idx);
        let slot = &mut self.slots[idx as usize];
        slot.reset_page_state();
        slot.contents = Some(addr);
        slot.in_transit = true;
        slot.users = 1;
        self.hash_insert(idx);
        self.owner_link(idx, addr.tag().index());
        Some(idx)
    }

    /// Adds a user to a resident or in-transit slot.
    pub fn pin(&mut self, idx: u32) {
        if self.slots[idx as usize].ring == Ring::Lru {
            self.ring_unlink(idx);
        }
        self.slots[idx as usize].users += 1;
    }

    /// Drops a user. When the last user leaves, the slot returns to the LRU
    /// ring (head for single-use pages) or, if it no longer holds a valid
    /// page, to the free ring.
    pub fn unpin(&mut self, idx: u32) {
        let slot = &mut self.slots[idx as usize];
        slot.users = slot.users.saturating_sub(1);
        if slot.users > 0 || slot.in_transit {
            return;
        }
        if slot.orphaned || slot.contents.is_none() || slot.failure.is_some() {
            slot.reset_page_state();
            self.push_head(FREE_ANCHOR, idx);
        } else if slot.single_use || slot.demote_once {
            slot.demote_once = false;
            self.push_head(LRU_ANCHOR, idx);
        } else {
            self.push_tail(LRU_ANCHOR, idx);
        }
    }

    /// Unhashes a slot whose fetch failed; it is freed once unpinned.
    pub fn fail(&mut self, idx: u32, failure: FetchFailure) {
        self.hash_remove(idx);
        self.owner_unlink(idx);
        let slot = &mut self.slots[idx as usize];
        slot.contents = None;
        slot.in_transit = false;
        slot.failure = Some(failure);
    }

    /// Removes a page from the cache on behalf of truncation or detach.
    /// Pinned or in-transit slots are orphaned and freed on their last unpin.
    pub fn retire(&mut self, idx: u32) {
        self.hash_remove(idx);
        self.owner_unlink(idx);
        let slot = &mut self.slots[idx as usize];
        if slot.users > 0 || slot.in_transit {
            slot.orphaned = true;
            return;
        }
        if slot.ring == Ring::Lru {
            self.ring_unlink(idx);
        }
        self.slots[idx as usize].reset_page_state();
        self.push_head(FREE_ANCHOR, idx);
    }

    /// (free, resident, in_use) data-slot counts.
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut free = 0;
        let mut resident = 0;
        let mut in_use = 0;
        for slot in &self.slots[self.first_data as usize..] {
            if slot.ring == Ring::Free {
                free += 1;
            }
            if slot.contents.is_some() && !slot.orphaned {
                resident += 1;
            }
            if slot.users > 0 {
                in_use += 1;
            }
        }
        (free, resident, in_use)
    }

    /// Checks ring membership and hash consistency; test support only.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        let mut on_ring = vec![0u8; self.slots.len()];
        for anchor in [LRU_ANCHOR, FREE_ANCHOR] {
            let mut cur = self.slots[anchor as usize].next;
            while cur != anchor {
                on_ring[cur as usize] += 1;
                assert_eq!(self.slots[self.slots[cur as usize].next as usize].prev, cur);
                cur = self.slots[cur as usize].next;
            }
        }
        for idx in self.first_data..self.slots.len() as u32 {
            let slot = &self.slots[idx as usize];
            let pinned = slot.users > 0 || slot.in_transit;
            match slot.ring {
                Ring::Free | Ring::Lru => {
                    assert_eq!(on_ring[idx as usize], 1, "slot {idx} ring count");
                    assert!(!pinned, "slot {idx} pinned while on a ring");
                }
                Ring::Detached => {
                    assert_eq!(on_ring[idx as usize], 0, "slot {idx} detached but linked");
                    assert!(pinned, "slot {idx} off every ring while unpinned");
                }
                Ring::Anchor => panic!("data slot {idx} marked as anchor"),
            }
            if let Some(addr) = slot.contents {
                if !slot.orphaned {
                    assert_eq!(self.find(addr), Some(idx), "slot {idx} not hashed");
                }
            }
        }
    }
}
