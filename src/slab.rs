//! Index-addressed arena of cache slots, shared by the buffer cache and
//! the inode cache.
//!
//! Per the design notes, both caches need the same bookkeeping: a fixed
//! pool of slots, hash-indexed by a small key, with a doubly-linked LRU
//! free list. The original encodes this with raw intrusive pointers; here
//! it is an arena of slots addressed by `usize` indices plus per-slot
//! `{hash_next, hash_prev, free_next, free_prev}` link fields, which gets
//! the same O(1) splice behavior without pointer aliasing.
//!
//! `Slab` itself holds no lock: callers (`Bcache`, `Icache`) wrap it in a
//! `Mutex` and pair it with the `Condvar`s for their own wait-channels, so
//! that hash/freelist mutation and the channel wakeups happen under one
//! consistent critical section.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// One cache slot: a key (`None` when the slot has never been hashed, or
/// while it's between eviction and reuse), an exclusive-use flag, and the
/// payload.
pub struct Slot<K, T> {
    pub key: Option<K>,
    pub busy: bool,
    pub refcount: u32,
    pub data: T,
    hash_next: Option<usize>,
    hash_prev: Option<usize>,
    free_next: Option<usize>,
    free_prev: Option<usize>,
    pub in_freelist: bool,
}

pub struct Slab<K, T> {
    buckets: Vec<Option<usize>>,
    slots: Vec<Slot<K, T>>,
    free_head: Option<usize>,
    free_tail: Option<usize>,
}

impl<K: Copy + Eq + Hash, T> Slab<K, T> {
    /// Builds a slab with `capacity` slots, all initially free (LRU order
    /// = index order), initializing each slot's payload with `init`.
    pub fn new(capacity: usize, mut init: impl FnMut() -> T) -> Self {
        let nbuckets = capacity.next_power_of_two().max(4);
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                key: None,
                busy: false,
                refcount: 0,
                data: init(),
                hash_next: None,
                hash_prev: None,
                free_next: None,
                free_prev: None,
                in_freelist: true,
            });
        }
        let mut slab = Self {
            buckets: vec![None; nbuckets],
            slots,
            free_head: None,
            free_tail: None,
        };
        for i in 0..capacity {
            slab.push_free_back(i);
        }
        slab
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, idx: usize) -> &Slot<K, T> {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut Slot<K, T> {
        &mut self.slots[idx]
    }

    fn bucket_of(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.buckets.len()
    }

    /// Finds the slot hashed under `key`, if any.
    pub fn find(&self, key: &K) -> Option<usize> {
        let mut cur = self.buckets[self.bucket_of(key)];
        while let Some(idx) = cur {
            if self.slots[idx].key.as_ref() == Some(key) {
                return Some(idx);
            }
            cur = self.slots[idx].hash_next;
        }
        None
    }

    /// Unhashes slot `idx` (it keeps its old key field until re-hashed or
    /// cleared by the caller).
    pub fn unhash(&mut self, idx: usize) {
        let key = match self.slots[idx].key {
            Some(k) => k,
            None => return,
        };
        let bucket = self.bucket_of(&key);
        let prev = self.slots[idx].hash_prev;
        let next = self.slots[idx].hash_next;
        match prev {
            Some(p) => self.slots[p].hash_next = next,
            None => self.buckets[bucket] = next,
        }
        if let Some(n) = next {
            self.slots[n].hash_prev = prev;
        }
        self.slots[idx].hash_next = None;
        self.slots[idx].hash_prev = None;
        self.slots[idx].key = None;
    }

    /// Hashes slot `idx` under `key`. The slot must not already be hashed.
    pub fn rehash(&mut self, idx: usize, key: K) {
        debug_assert!(self.slots[idx].key.is_none());
        let bucket = self.bucket_of(&key);
        let head = self.buckets[bucket];
        self.slots[idx].key = Some(key);
        self.slots[idx].hash_prev = None;
        self.slots[idx].hash_next = head;
        if let Some(h) = head {
            self.slots[h].hash_prev = Some(idx);
        }
        self.buckets[bucket] = Some(idx);
    }

    fn unlink_free(&mut self, idx: usize) {
        let prev = self.slots[idx].free_prev;
        let next = self.slots[idx].free_next;
        match prev {
            Some(p) => self.slots[p].free_next = next,
            None => self.free_head = next,
        }
        match next {
            Some(n) => self.slots[n].free_prev = prev,
            None => self.free_tail = prev,
        }
        self.slots[idx].free_next = None;
        self.slots[idx].free_prev = None;
        self.slots[idx].in_freelist = false;
    }

    /// Removes `idx` from the free list, if it is on it. No-op otherwise.
    pub fn remove_from_free(&mut self, idx: usize) {
        if self.slots[idx].in_freelist {
            self.unlink_free(idx);
        }
    }

    pub fn push_free_front(&mut self, idx: usize) {
        debug_assert!(!self.slots[idx].in_freelist);
        self.slots[idx].free_prev = None;
        self.slots[idx].free_next = self.free_head;
        if let Some(h) = self.free_head {
            self.slots[h].free_prev = Some(idx);
        }
        self.free_head = Some(idx);
        if self.free_tail.is_none() {
            self.free_tail = Some(idx);
        }
        self.slots[idx].in_freelist = true;
    }

    pub fn push_free_back(&mut self, idx: usize) {
        debug_assert!(!self.slots[idx].in_freelist);
        self.slots[idx].free_next = None;
        self.slots[idx].free_prev = self.free_tail;
        if let Some(t) = self.free_tail {
            self.slots[t].free_next = Some(idx);
        }
        self.free_tail = Some(idx);
        if self.free_head.is_none() {
            self.free_head = Some(idx);
        }
        self.slots[idx].in_freelist = true;
    }

    /// Pops the head of the free list (the next candidate for eviction).
    pub fn pop_free_front(&mut self) -> Option<usize> {
        let idx = self.free_head?;
        self.unlink_free(idx);
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_alloc_free_roundtrip() {
        let mut slab: Slab<(u32, u32), u32> = Slab::new(4, || 0);
        let idx = slab.pop_free_front().unwrap();
        slab.rehash(idx, (1, 2));
        slab.slot_mut(idx).data = 42;
        assert_eq!(slab.find(&(1, 2)), Some(idx));
        slab.unhash(idx);
        assert_eq!(slab.find(&(1, 2)), None);
        slab.push_free_back(idx);
    }
}
