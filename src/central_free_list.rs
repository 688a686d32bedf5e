//! Central free lists: one per size class, shared by all threads.
//!
//! Each list owns the spans carved for its class. A carved span hands out
//! objects by slot index from a LIFO of masked indices and tracks live slots
//! in a bitmap, so returning a foreign pointer or the same object twice is
//! caught when it reaches its span.
//!
//! Locking: one spin lock per class. A class lock is never held together
//! with another class lock or with the page heap lock; it is dropped with
//! [`SpinMutexGuard::unlocked`] around both.

use crate::error::{AllocError, HeapViolation, fatal};
use crate::hardening::SlotMask;
use crate::page_heap::SharedPageHeap;
use crate::pagemap::PageMap;
use crate::size_class::SizeClassTable;
use crate::span::SpanId;
use crate::sync::{SpinMutex, SpinMutexGuard};
use crate::transfer_cache::{Shrink, TransferCache};
use crate::PAGE_SHIFT;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Small-object half of a span owned by a central free list.
#[derive(Debug)]
struct CarvedSpan {
    base: usize,
    capacity: u32,
    /// Masked slot indices, most recently freed last.
    free: Vec<u32>,
    live: Vec<u64>,
    refcount: u32,
}

impl CarvedSpan {
    fn new(id: SpanId, base: usize, capacity: u32, mask: &dyn SlotMask) -> Self {
        Self {
            base,
            capacity,
            // Lowest slot is handed out first.
            free: (0..capacity).rev().map(|s| mask.mask(s, id.index())).collect(),
            live: vec![0; (capacity as usize).div_ceil(64)],
            refcount: 0,
        }
    }

    #[inline]
    fn is_live(&self, slot: u32) -> bool {
        self.live[slot as usize / 64] & (1 << (slot % 64)) != 0
    }

    #[inline]
    fn toggle(&mut self, slot: u32) {
        self.live[slot as usize / 64] ^= 1 << (slot % 64);
    }
}

pub struct CentralFreeList {
    size_class: usize,
    object_size: usize,
    pages_per_span: usize,
    batch_size: usize,
    spans: HashMap<SpanId, CarvedSpan>,
    /// Spans with at least one free object.
    nonempty: BTreeSet<SpanId>,
    /// Free objects held in spans (not counting the transfer cache).
    free_objects: usize,
    transfer: TransferCache,
    mask: Arc<dyn SlotMask>,
}

impl CentralFreeList {
    fn new(sizes: &SizeClassTable, size_class: usize, mask: Arc<dyn SlotMask>) -> Self {
        let (object_size, pages_per_span, batch_size, slots) = if size_class == 0 {
            (0, 0, 0, 0)
        } else {
            (
                sizes.byte_size(size_class),
                sizes.pages_per_span(size_class),
                sizes.batch_size(size_class),
                sizes.len(),
            )
        };
        Self {
            size_class,
            object_size,
            pages_per_span,
            batch_size,
            spans: HashMap::new(),
            nonempty: BTreeSet::new(),
            free_objects: 0,
            transfer: TransferCache::new(slots),
            mask,
        }
    }

    fn violation(&self, detail: String) -> HeapViolation {
        HeapViolation::CentralList {
            class: self.size_class,
            detail,
        }
    }

    fn insert_span(&mut self, id: SpanId, base: usize) {
        let capacity = ((self.pages_per_span << PAGE_SHIFT) / self.object_size) as u32;
        let span = CarvedSpan::new(id, base, capacity, self.mask.as_ref());
        self.free_objects += capacity as usize;
        self.spans.insert(id, span);
        self.nonempty.insert(id);
    }

    fn fetch_from_spans(&mut self) -> Option<usize> {
        let id = *self.nonempty.first()?;
        let mask = Arc::clone(&self.mask);
        let object_size = self.object_size;
        let span = self.spans.get_mut(&id)?;

        let stored = span.free.pop()?;
        let slot = mask.unmask(stored, id.index());
        if slot >= span.capacity || span.is_live(slot) {
            fatal(HeapViolation::CorruptFreeList { span: id, stored });
        }
        span.toggle(slot);
        span.refcount += 1;
        let addr = span.base + slot as usize * object_size;
        if span.free.is_empty() {
            self.nonempty.remove(&id);
        }
        self.free_objects -= 1;
        Some(addr)
    }

    /// Give one object back to its span. Returns the span id if the span is
    /// now entirely free and has been dropped from this list.
    fn release_to_spans(
        &mut self,
        addr: usize,
        pagemap: &PageMap,
    ) -> Result<Option<SpanId>, HeapViolation> {
        let entry = pagemap
            .lookup(addr)
            .filter(|e| e.size_class == self.size_class)
            .ok_or(HeapViolation::NotOwned { addr })?;
        let id = entry.span;
        let object_size = self.object_size;
        let mask = Arc::clone(&self.mask);
        let Some(span) = self.spans.get_mut(&id) else {
            return Err(HeapViolation::NotOwned { addr });
        };

        let delta = addr
            .checked_sub(span.base)
            .ok_or(HeapViolation::NotOwned { addr })?;
        let slot = delta / object_size;
        if delta % object_size != 0 || slot >= span.capacity as usize {
            return Err(HeapViolation::NotOwned { addr });
        }
        let slot = slot as u32;
        if !span.is_live(slot) {
            return Err(HeapViolation::DoubleFree { addr });
        }

        span.toggle(slot);
        span.refcount -= 1;
        let was_full = span.free.is_empty();
        span.free.push(mask.mask(slot, id.index()));
        self.free_objects += 1;

        if span.refcount == 0 {
            let capacity = span.capacity as usize;
            self.spans.remove(&id);
            self.nonempty.remove(&id);
            self.free_objects -= capacity;
            return Ok(Some(id));
        }
        if was_full {
            self.nonempty.insert(id);
        }
        Ok(None)
    }

    fn check(&self) -> Result<(), HeapViolation> {
        let mut free = 0;
        for (&id, span) in &self.spans {
            let live: u32 = span.live.iter().map(|w| w.count_ones()).sum();
            if live != span.refcount || span.refcount as usize + span.free.len() != span.capacity as usize {
                return Err(self.violation(format!(
                    "span {id:?}: {live} live bits, refcount {}, {} free of {}",
                    span.refcount,
                    span.free.len(),
                    span.capacity
                )));
            }
            if span.free.is_empty() == self.nonempty.contains(&id) {
                return Err(self.violation(format!("span {id:?} on the wrong list")));
            }
            for &stored in &span.free {
                let slot = self.mask.unmask(stored, id.index());
                if slot >= span.capacity || span.is_live(slot) {
                    return Err(HeapViolation::CorruptFreeList { span: id, stored });
                }
            }
            free += span.free.len();
        }
        if free != self.free_objects {
            return Err(self.violation(format!(
                "counter says {} free objects, spans hold {free}",
                self.free_objects
            )));
        }
        if self.nonempty.iter().any(|id| !self.spans.contains_key(id)) {
            return Err(self.violation("nonempty set names a foreign span".into()));
        }
        Ok(())
    }

    /// Spans currently owned, and how many of them have no free object.
    pub fn span_counts(&self) -> (usize, usize) {
        (self.spans.len(), self.spans.len() - self.nonempty.len())
    }
}

/// The array of central free lists.
pub struct CentralCache {
    lists: Box<[SpinMutex<CentralFreeList>]>,
    /// Round-robin victim for slot eviction. Races are harmless.
    evict_cursor: AtomicUsize,
}

impl CentralCache {
    pub fn new(sizes: &SizeClassTable, mask: Arc<dyn SlotMask>) -> Self {
        Self {
            lists: (0..sizes.len())
                .map(|cls| SpinMutex::new(CentralFreeList::new(sizes, cls, Arc::clone(&mask))))
                .collect(),
            evict_cursor: AtomicUsize::new(0),
        }
    }

    /// Return `objects` of class `size_class` to the central list.
    pub fn insert_range(&self, size_class: usize, objects: Vec<usize>, pages: &SharedPageHeap) {
        if objects.is_empty() {
            return;
        }
        let mut list = self.lists[size_class].lock();
        if objects.len() == list.batch_size && self.make_cache_space(size_class, &mut list, pages) {
            list.transfer.push(objects);
            return;
        }
        Self::release_list_to_spans(&mut list, objects, pages);
    }

    /// Take up to `n` objects of class `size_class`. Returns at least one
    /// object or an error.
    pub fn remove_range(
        &self,
        size_class: usize,
        n: usize,
        pages: &SharedPageHeap,
    ) -> Result<Vec<usize>, AllocError> {
        let mut list = self.lists[size_class].lock();
        if n == list.batch_size {
            if let Some(batch) = list.transfer.pop() {
                return Ok(batch);
            }
        }

        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match list.fetch_from_spans() {
                Some(addr) => out.push(addr),
                None if out.is_empty() => Self::populate(&mut list, pages)?,
                None => break,
            }
        }
        Ok(out)
    }

    /// Carve a fresh span for the list. The class lock is dropped while the
    /// page heap is busy.
    fn populate(
        list: &mut SpinMutexGuard<'_, CentralFreeList>,
        pages: &SharedPageHeap,
    ) -> Result<(), AllocError> {
        let (size_class, span_pages) = (list.size_class, list.pages_per_span);
        let (id, base) =
            SpinMutexGuard::unlocked(list, || pages.new_small_span(size_class, span_pages))?;
        list.insert_span(id, base);
        Ok(())
    }

    fn release_list_to_spans(
        list: &mut SpinMutexGuard<'_, CentralFreeList>,
        objects: Vec<usize>,
        pages: &SharedPageHeap,
    ) {
        for addr in objects {
            match list.release_to_spans(addr, pages.pagemap()) {
                Ok(None) => {}
                Ok(Some(id)) => SpinMutexGuard::unlocked(list, || pages.return_span(id)),
                Err(violation) => fatal(violation),
            }
        }
    }

    /// Find room for one more transfer cache entry in `size_class`,
    /// stealing a slot from another class if needed.
    fn make_cache_space(
        &self,
        size_class: usize,
        list: &mut SpinMutexGuard<'_, CentralFreeList>,
        pages: &SharedPageHeap,
    ) -> bool {
        if list.transfer.has_space() {
            return true;
        }
        if !list.transfer.can_grow() {
            return false;
        }
        let stolen = SpinMutexGuard::unlocked(list, || {
            self.evict_random_size_class(size_class, false, pages)
                || self.evict_random_size_class(size_class, true, pages)
        });
        if !stolen {
            return false;
        }
        if list.transfer.can_grow() {
            list.transfer.grow();
        }
        list.transfer.has_space()
    }

    /// Ask the next class in turn to give up a slot. Called with no class
    /// lock held.
    fn evict_random_size_class(&self, locked: usize, force: bool, pages: &SharedPageHeap) -> bool {
        let n = self.lists.len();
        let victim = self.evict_cursor.fetch_add(1, Ordering::Relaxed) % n;
        if victim == locked || victim == 0 {
            return false;
        }
        self.shrink_cache(victim, force, pages)
    }

    fn shrink_cache(&self, size_class: usize, force: bool, pages: &SharedPageHeap) -> bool {
        let mut list = self.lists[size_class].lock();
        match list.transfer.shrink(force) {
            Shrink::Refused => false,
            Shrink::Freed => true,
            Shrink::Evicted(batch) => {
                log::trace!("tcalloc: evicted a batch of class {size_class} from the transfer cache");
                Self::release_list_to_spans(&mut list, batch, pages);
                true
            }
        }
    }

    /// Hand every parked transfer batch back to its spans, so that emptied
    /// spans reach the page heap.
    pub fn drain_transfer_caches(&self, pages: &SharedPageHeap) {
        for l in self.lists.iter().skip(1) {
            let mut list = l.lock();
            while let Some(batch) = list.transfer.pop() {
                Self::release_list_to_spans(&mut list, batch, pages);
            }
        }
    }

    /// Bytes parked in central lists, spans and transfer caches combined.
    pub fn free_bytes(&self) -> usize {
        self.lists
            .iter()
            .skip(1)
            .map(|l| {
                let list = l.lock();
                (list.free_objects + list.transfer.object_count()) * list.object_size
            })
            .sum()
    }

    /// Transfer cache slots (capacity, used) of one class.
    pub fn transfer_slots(&self, size_class: usize) -> (usize, usize) {
        let list = self.lists[size_class].lock();
        (list.transfer.capacity(), list.transfer.used())
    }

    pub fn span_counts(&self, size_class: usize) -> (usize, usize) {
        self.lists[size_class].lock().span_counts()
    }

    pub fn check(&self) -> Result<(), HeapViolation> {
        self.lists.iter().try_for_each(|l| l.lock().check())
    }
}
