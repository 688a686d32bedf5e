//! Transfer cache: whole batches parked in a central free list.
//!
//! A batch of exactly `batch_size` objects released by a thread cache is
//! kept intact here, so the next thread that needs a refill takes it in one
//! step instead of threading objects back through their spans.
//!
//! Each class starts with one slot. A class that runs out of slots steals
//! one from another class (see `CentralCache::make_cache_space`).

/// Outcome of asking a class to give up one slot.
#[derive(Debug, PartialEq, Eq)]
pub enum Shrink {
    /// Nothing to give, or all slots are in use and eviction was not forced.
    Refused,
    /// An empty slot was dropped.
    Freed,
    /// A full slot was dropped; its batch must go back to the spans.
    Evicted(Vec<usize>),
}

#[derive(Debug)]
pub struct TransferCache {
    batches: Vec<Vec<usize>>,
    capacity: usize,
    max_capacity: usize,
}

impl TransferCache {
    pub fn new(max_capacity: usize) -> Self {
        Self {
            batches: Vec::new(),
            capacity: 1.min(max_capacity),
            max_capacity,
        }
    }

    #[inline]
    pub fn has_space(&self) -> bool {
        self.batches.len() < self.capacity
    }

    #[inline]
    pub fn can_grow(&self) -> bool {
        self.capacity < self.max_capacity
    }

    pub fn grow(&mut self) {
        debug_assert!(self.can_grow());
        self.capacity += 1;
    }

    pub fn push(&mut self, batch: Vec<usize>) {
        debug_assert!(self.has_space());
        self.batches.push(batch);
    }

    /// Most recently parked batch first.
    pub fn pop(&mut self) -> Option<Vec<usize>> {
        self.batches.pop()
    }

    pub fn shrink(&mut self, force: bool) -> Shrink {
        if self.capacity == 0 {
            return Shrink::Refused;
        }
        if self.batches.len() < self.capacity {
            self.capacity -= 1;
            return Shrink::Freed;
        }
        if !force {
            return Shrink::Refused;
        }
        self.capacity -= 1;
        match self.batches.pop() {
            Some(batch) => Shrink::Evicted(batch),
            None => Shrink::Freed,
        }
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.batches.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn object_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}
