//! Page heap: span allocation, coalescing and the commit state of free pages.
//!
//! Free spans shorter than [`MAX_PAGES`] sit on exact-length lists, longer
//! ones on a single `large` list searched best fit. Each length has two
//! lists: `normal` (committed) and `returned` (decommitted).
//!
//! All state is behind one spin lock in [`SharedPageHeap`]. The scavenger
//! pulls spans off the lists into the `Releasing` state and decommits them
//! with the lock dropped.

use crate::error::{AllocError, HeapViolation, fatal};
use crate::pagemap::{PageClassCache, PageEntry, PageMap};
use crate::platform::SystemMemory;
use crate::scavenger::ScavengerWake;
use crate::span::{PageId, SpanArena, SpanId, SpanList, SpanLocation};
use crate::sync::{SpinMutex, SpinMutexGuard};
use crate::{PAGE_SHIFT, PAGE_SIZE};
use core::ptr::NonNull;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Spans of this many pages or more live on the `large` list.
pub const MAX_PAGES: usize = 128;

/// Smallest request made to the OS, in pages (1 MiB).
pub const MIN_SYSTEM_ALLOC: usize = MAX_PAGES;

/// Lists longer than this are drained completely by the scavenger; shorter
/// ones only by half.
const MIN_SPAN_LISTS_WITH_SPANS: usize = crate::config::MIN_SPAN_LISTS_WITH_SPANS;

const CHECKS: bool = cfg!(any(debug_assertions, feature = "debug"));

#[derive(Debug, Default)]
struct SpanListPair {
    normal: SpanList,
    returned: SpanList,
}

/// Page heap counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageHeapStats {
    /// Bytes reserved from the OS.
    pub system_bytes: usize,
    /// Bytes on the free lists, committed or not.
    pub free_bytes: usize,
    pub free_committed_bytes: usize,
    /// Free bytes handed back to the OS.
    pub returned_bytes: usize,
}

impl PageHeapStats {
    pub fn committed_bytes(&self) -> usize {
        self.system_bytes - self.returned_bytes
    }
}

/// How a freed span treats neighbours in a different commit state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Merge {
    /// Decommit the committed side and merge.
    Reconcile,
    /// Leave them apart; no OS call is made.
    SameState,
}

/// A span taken off the free lists for decommit.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Releasing {
    id: SpanId,
    addr: usize,
    bytes: usize,
}

pub struct PageHeap {
    memory: Arc<dyn SystemMemory>,
    pagemap: Arc<PageMap>,
    class_cache: Arc<PageClassCache>,
    spans: SpanArena,
    /// Index is the span length; slot 0 is unused.
    free: Vec<SpanListPair>,
    large: SpanListPair,
    /// OS regions: start page -> pages.
    regions: BTreeMap<PageId, usize>,
    system_pages: usize,
    free_pages: usize,
    free_committed_pages: usize,
    min_free_committed_since_scavenge: usize,
    releasing_pages: usize,
}

impl PageHeap {
    pub fn new(
        memory: Arc<dyn SystemMemory>,
        pagemap: Arc<PageMap>,
        class_cache: Arc<PageClassCache>,
    ) -> Self {
        Self {
            memory,
            pagemap,
            class_cache,
            spans: SpanArena::new(),
            free: (0..MAX_PAGES).map(|_| SpanListPair::default()).collect(),
            large: SpanListPair::default(),
            regions: BTreeMap::new(),
            system_pages: 0,
            free_pages: 0,
            free_committed_pages: 0,
            min_free_committed_since_scavenge: 0,
            releasing_pages: 0,
        }
    }

    #[inline]
    pub fn spans(&self) -> &SpanArena {
        &self.spans
    }

    /// Allocate a run of `n` pages. The returned span is in use with
    /// size class 0 and every page registered in the page map.
    pub fn new_span(&mut self, n: usize) -> Result<SpanId, AllocError> {
        debug_assert!(n > 0);
        let id = match self.search_free_and_large(n)? {
            Some(id) => id,
            None => {
                self.grow_heap(n)?;
                self.search_free_and_large(n)?
                    .ok_or(AllocError::OutOfMemory {
                        requested: n.saturating_mul(PAGE_SIZE),
                    })?
            }
        };
        self.register_size_class(id, 0);
        self.check_if_enabled();
        Ok(id)
    }

    fn search_free_and_large(&mut self, n: usize) -> Result<Option<SpanId>, AllocError> {
        for len in n..MAX_PAGES {
            if let Some(id) = self.free[len].normal.first() {
                return self.carve(id, n).map(Some);
            }
            if let Some(id) = self.free[len].returned.first() {
                return self.carve(id, n).map(Some);
            }
        }
        self.alloc_large(n)
    }

    /// Best fit over the large lists: smallest length, then lowest address.
    fn alloc_large(&mut self, n: usize) -> Result<Option<SpanId>, AllocError> {
        let mut best: Option<(usize, PageId, SpanId)> = None;
        let candidates = self
            .large
            .normal
            .iter(&self.spans)
            .chain(self.large.returned.iter(&self.spans));
        for id in candidates {
            let span = self.spans.span(id);
            if span.length < n {
                continue;
            }
            let key = (span.length, span.start, id);
            if best.is_none_or(|b| (key.0, key.1) < (b.0, b.1)) {
                best = Some(key);
            }
        }
        match best {
            Some((_, _, id)) => self.carve(id, n).map(Some),
            None => Ok(None),
        }
    }

    /// Take `n` pages from the front of free span `id`, putting the rest back
    /// on a normal list.
    fn carve(&mut self, id: SpanId, n: usize) -> Result<SpanId, AllocError> {
        let (addr, bytes, decommitted) = {
            let span = self.spans.span(id);
            debug_assert!(span.is_free() && span.length >= n);
            (span.start_addr(), span.byte_len(), span.decommitted)
        };
        if decommitted {
            // Commit before touching any bookkeeping so a failure leaves the
            // span where it was.
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                if let Err(e) = self.memory.commit(ptr, bytes) {
                    log::warn!("tcalloc: commit of {bytes} bytes at {addr:#x} failed: {e}");
                    return Err(AllocError::OutOfMemory { requested: bytes });
                }
            }
        }

        self.remove_free(id);
        let length = {
            let span = self.spans.span_mut(id);
            span.location = SpanLocation::InUse;
            span.decommitted = false;
            span.length
        };
        if length > n {
            let rest = self.split(id, n);
            self.insert_free(rest);
        }
        Ok(id)
    }

    /// Shrink in-use span `id` to `n` pages and return a new in-use span for
    /// the remaining tail.
    pub fn split(&mut self, id: SpanId, n: usize) -> SpanId {
        let (start, length) = {
            let span = self.spans.span(id);
            debug_assert_eq!(span.location, SpanLocation::InUse);
            (span.start, span.length)
        };
        debug_assert!(n > 0 && n < length);
        let tail = self.spans.new_span(start + n, length - n);
        self.spans.span_mut(id).length = n;
        self.record_span(id);
        self.record_span(tail);
        tail
    }

    /// Give an in-use span back, merging it with free neighbours.
    pub fn delete_span(&mut self, id: SpanId) {
        {
            let span = self.spans.span_mut(id);
            debug_assert_eq!(span.location, SpanLocation::InUse);
            span.size_class = 0;
        }
        self.coalesce_and_insert(id, Merge::Reconcile);
        self.check_if_enabled();
    }

    /// Tag every page of in-use span `id` with `size_class`.
    pub fn register_size_class(&mut self, id: SpanId, size_class: usize) {
        let (start, length) = {
            let span = self.spans.span_mut(id);
            span.size_class = size_class;
            (span.start, span.length)
        };
        for offset in 0..length {
            self.pagemap.set(
                start + offset,
                Some(PageEntry {
                    span: id,
                    size_class,
                    offset,
                }),
            );
            self.class_cache.put(start + offset, size_class);
        }
    }

    /// Point the first and last page of `id` at it.
    fn record_span(&mut self, id: SpanId) {
        let span = self.spans.span(id);
        let entry = |offset| {
            Some(PageEntry {
                span: id,
                size_class: span.size_class,
                offset,
            })
        };
        self.pagemap.set(span.start, entry(0));
        if span.length > 1 {
            self.pagemap.set(span.last_page(), entry(span.length - 1));
        }
    }

    /// The free span ending at `page`, if it may merge with the span
    /// holding `other`.
    fn free_neighbour(&self, page: PageId, other: PageId) -> Option<SpanId> {
        let entry = self.pagemap.get(page)?;
        let span = self.spans.get(entry.span)?;
        let covers = span.start <= page && page <= span.last_page();
        (span.is_free() && covers && self.may_merge(page, other)).then_some(entry.span)
    }

    /// `VirtualFree` decommits and releases within one reservation only, so
    /// on Windows spans never cross an OS region.
    fn may_merge(&self, a: PageId, b: PageId) -> bool {
        if !cfg!(windows) {
            return true;
        }
        match self.regions.range(..=a).next_back() {
            Some((&start, &len)) => b >= start && b < start + len,
            None => false,
        }
    }

    fn decommit_span(&self, id: SpanId) -> bool {
        let span = self.spans.span(id);
        let (addr, bytes) = (span.start_addr(), span.byte_len());
        let Some(ptr) = NonNull::new(addr as *mut u8) else {
            return false;
        };
        match self.memory.decommit(ptr, bytes) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("tcalloc: decommit of {bytes} bytes at {addr:#x} failed: {e}");
                false
            }
        }
    }

    /// Merge `id` (not on any list) with free neighbours and insert the
    /// result. Under [`Merge::Reconcile`] a merge with a decommitted side
    /// decommits the other side.
    fn coalesce_and_insert(&mut self, id: SpanId, merge: Merge) {
        let (start, length) = {
            let span = self.spans.span(id);
            (span.start, span.length)
        };

        if start > 0 {
            if let Some(left) = self.free_neighbour(start - 1, start) {
                if self.reconcile_commit(id, left, merge) {
                    let (lstart, llen) = {
                        let l = self.spans.span(left);
                        (l.start, l.length)
                    };
                    self.remove_free(left);
                    self.spans.delete_span(left);
                    let span = self.spans.span_mut(id);
                    span.start = lstart;
                    span.length += llen;
                }
            }
        }

        let end = start + length;
        if let Some(right) = self.free_neighbour(end, end - 1) {
            if self.reconcile_commit(id, right, merge) {
                let rlen = self.spans.span(right).length;
                self.remove_free(right);
                self.spans.delete_span(right);
                self.spans.span_mut(id).length += rlen;
            }
        }

        self.record_span(id);
        self.insert_free(id);
    }

    /// Bring `id` and free neighbour `other` to the same commit state before
    /// merging. Returns false if they must stay apart.
    fn reconcile_commit(&mut self, id: SpanId, other: SpanId, merge: Merge) -> bool {
        let ours = self.spans.span(id).decommitted;
        let theirs = self.spans.span(other).decommitted;
        if ours != theirs && merge == Merge::SameState {
            return false;
        }
        match (ours, theirs) {
            (false, true) => {
                if !self.decommit_span(id) {
                    return false;
                }
                self.spans.span_mut(id).decommitted = true;
                true
            }
            (true, false) => {
                if !self.decommit_span(other) {
                    return false;
                }
                // Move it to the returned list so the counters follow.
                self.remove_free(other);
                self.spans.span_mut(other).decommitted = true;
                self.insert_free(other);
                true
            }
            _ => true,
        }
    }

    fn list_for(&mut self, length: usize, decommitted: bool) -> (&mut SpanList, &mut SpanArena) {
        let pair = if length < MAX_PAGES {
            &mut self.free[length]
        } else {
            &mut self.large
        };
        let list = if decommitted {
            &mut pair.returned
        } else {
            &mut pair.normal
        };
        (list, &mut self.spans)
    }

    fn insert_free(&mut self, id: SpanId) {
        let (length, decommitted) = {
            let span = self.spans.span_mut(id);
            span.location = if span.decommitted {
                SpanLocation::Returned
            } else {
                SpanLocation::Normal
            };
            (span.length, span.decommitted)
        };
        let (list, spans) = self.list_for(length, decommitted);
        list.prepend(spans, id);
        self.free_pages += length;
        if !decommitted {
            self.free_committed_pages += length;
        }
    }

    fn remove_free(&mut self, id: SpanId) {
        let (length, decommitted) = {
            let span = self.spans.span(id);
            debug_assert!(span.is_free());
            (span.length, span.decommitted)
        };
        let (list, spans) = self.list_for(length, decommitted);
        list.remove(spans, id);
        self.free_pages -= length;
        if !decommitted {
            self.free_committed_pages -= length;
            self.min_free_committed_since_scavenge = self
                .min_free_committed_since_scavenge
                .min(self.free_committed_pages);
        }
    }

    /// Map at least `n` more pages from the OS and add them as a free span.
    pub fn grow_heap(&mut self, n: usize) -> Result<(), AllocError> {
        let ask = n.max(MIN_SYSTEM_ALLOC);
        let oom = |pages: usize| AllocError::OutOfMemory {
            requested: pages.saturating_mul(PAGE_SIZE),
        };
        let bytes_for = |pages: usize| pages.checked_mul(PAGE_SIZE).ok_or(oom(pages));

        let (ptr, pages) = match self.memory.reserve(bytes_for(ask)?, PAGE_SIZE) {
            Ok(ptr) => (ptr, ask),
            Err(e) if ask > n => {
                log::warn!("tcalloc: reserving {ask} pages failed ({e}), retrying with {n}");
                match self.memory.reserve(bytes_for(n)?, PAGE_SIZE) {
                    Ok(ptr) => (ptr, n),
                    Err(e) => {
                        log::warn!("tcalloc: reserving {n} pages failed: {e}");
                        return Err(oom(n));
                    }
                }
            }
            Err(e) => {
                log::warn!("tcalloc: reserving {n} pages failed: {e}");
                return Err(oom(n));
            }
        };

        let start = ptr.as_ptr() as usize >> PAGE_SHIFT;
        // One page either side so coalescing looks can read neighbours.
        if !self.pagemap.ensure(start.saturating_sub(1), pages + 2) {
            if let Err(e) = self.memory.release(ptr, pages << PAGE_SHIFT) {
                log::warn!("tcalloc: releasing unusable region failed: {e}");
            }
            return Err(oom(pages));
        }

        log::debug!(
            "tcalloc: grew heap by {} pages at {:#x}",
            pages,
            ptr.as_ptr() as usize
        );
        self.regions.insert(start, pages);
        self.system_pages += pages;

        let id = self.spans.new_span(start, pages);
        self.record_span(id);
        self.coalesce_and_insert(id, Merge::Reconcile);
        Ok(())
    }

    #[inline]
    pub fn should_scavenge(&self, min_free_committed_pages: usize) -> bool {
        self.free_committed_pages > min_free_committed_pages
    }

    /// Pull spans off the normal lists until the committed free pages drop
    /// to the scavenge target, longest lists first.
    pub(crate) fn select_for_scavenge(
        &mut self,
        min_free_committed_pages: usize,
        percentage: f64,
    ) -> Vec<Releasing> {
        let to_release = (self.min_free_committed_since_scavenge as f64 * percentage) as usize;
        let target = min_free_committed_pages
            .max(self.free_committed_pages.saturating_sub(to_release));
        let mut out = Vec::new();

        for len in (1..=MAX_PAGES).rev() {
            if self.free_committed_pages <= target {
                break;
            }
            let list_len = if len == MAX_PAGES {
                self.large.normal.len()
            } else {
                self.free[len].normal.len()
            };
            let take = if len > MIN_SPAN_LISTS_WITH_SPANS {
                list_len
            } else {
                list_len / 2
            };
            for _ in 0..take {
                if self.free_committed_pages <= target {
                    break;
                }
                let tail = if len == MAX_PAGES {
                    self.large.normal.last()
                } else {
                    self.free[len].normal.last()
                };
                let Some(id) = tail else { break };
                out.push(self.begin_release(id));
            }
        }

        self.min_free_committed_since_scavenge = self.free_committed_pages;
        out
    }

    /// Pull every committed free span off the lists.
    pub(crate) fn select_all_for_release(&mut self) -> Vec<Releasing> {
        let mut out = Vec::new();
        for len in (1..=MAX_PAGES).rev() {
            loop {
                let tail = if len == MAX_PAGES {
                    self.large.normal.last()
                } else {
                    self.free[len].normal.last()
                };
                let Some(id) = tail else { break };
                out.push(self.begin_release(id));
            }
        }
        self.min_free_committed_since_scavenge = self.free_committed_pages;
        out
    }

    fn begin_release(&mut self, id: SpanId) -> Releasing {
        self.remove_free(id);
        let span = self.spans.span_mut(id);
        span.location = SpanLocation::Releasing;
        self.releasing_pages += span.length;
        Releasing {
            id,
            addr: span.start_addr(),
            bytes: span.byte_len(),
        }
    }

    /// Put a span back after its decommit attempt. Runs with the lock
    /// retaken, so neighbours freed meanwhile in the other commit state stay
    /// unmerged.
    pub(crate) fn finish_release(&mut self, release: Releasing, decommitted: bool) {
        {
            let span = self.spans.span_mut(release.id);
            debug_assert_eq!(span.location, SpanLocation::Releasing);
            span.decommitted = decommitted;
            self.releasing_pages -= span.length;
        }
        self.coalesce_and_insert(release.id, Merge::SameState);
    }

    pub fn stats(&self) -> PageHeapStats {
        PageHeapStats {
            system_bytes: self.system_pages << PAGE_SHIFT,
            free_bytes: self.free_pages << PAGE_SHIFT,
            free_committed_bytes: self.free_committed_pages << PAGE_SHIFT,
            returned_bytes: (self.free_pages - self.free_committed_pages) << PAGE_SHIFT,
        }
    }

    #[inline]
    fn check_if_enabled(&self) {
        if CHECKS {
            if let Err(violation) = self.check() {
                fatal(violation);
            }
        }
    }

    /// Verify list membership, lengths, page map boundaries and counters.
    pub fn check(&self) -> Result<(), HeapViolation> {
        let bad = |msg: String| Err(HeapViolation::SpanBookkeeping(msg));
        let mut free_pages = 0;
        let mut committed = 0;

        let lists = self
            .free
            .iter()
            .enumerate()
            .skip(1)
            .map(|(len, pair)| (Some(len), pair))
            .chain(core::iter::once((None, &self.large)));
        for (exact, pair) in lists {
            for (list, returned) in [(&pair.normal, false), (&pair.returned, true)] {
                let mut count = 0;
                for id in list.iter(&self.spans) {
                    count += 1;
                    let span = self.spans.span(id);
                    let want = if returned {
                        SpanLocation::Returned
                    } else {
                        SpanLocation::Normal
                    };
                    if span.location != want || span.decommitted != returned {
                        return bad(format!("span {id:?} on wrong list: {:?}", span.location));
                    }
                    let len_ok = match exact {
                        Some(len) => span.length == len,
                        None => span.length >= MAX_PAGES,
                    };
                    if !len_ok {
                        return bad(format!("span {id:?} of {} pages on list {exact:?}", span.length));
                    }
                    for page in [span.start, span.last_page()] {
                        if self.pagemap.get(page).map(|e| e.span) != Some(id) {
                            return bad(format!("page {page:#x} does not map to {id:?}"));
                        }
                    }
                    free_pages += span.length;
                    if !returned {
                        committed += span.length;
                    }
                }
                if count != list.len() {
                    return bad(format!("list length {} but {count} members", list.len()));
                }
            }
        }

        if free_pages != self.free_pages || committed != self.free_committed_pages {
            return bad(format!(
                "counters free={} committed={} but lists hold {free_pages}/{committed}",
                self.free_pages, self.free_committed_pages
            ));
        }
        Ok(())
    }
}

impl Drop for PageHeap {
    fn drop(&mut self) {
        for (&start, &pages) in &self.regions {
            if let Some(ptr) = NonNull::new((start << PAGE_SHIFT) as *mut u8) {
                if let Err(e) = self.memory.release(ptr, pages << PAGE_SHIFT) {
                    log::warn!("tcalloc: unmapping region at {:#x} failed: {e}", start << PAGE_SHIFT);
                }
            }
        }
    }
}

/// The page heap behind its lock, plus the lock-free lookup structures.
pub struct SharedPageHeap {
    heap: SpinMutex<PageHeap>,
    pagemap: Arc<PageMap>,
    class_cache: Arc<PageClassCache>,
    memory: Arc<dyn SystemMemory>,
    wake: Arc<ScavengerWake>,
    min_free_committed_pages: usize,
    scavenge_percentage: f64,
}

impl SharedPageHeap {
    pub fn new(
        memory: Arc<dyn SystemMemory>,
        wake: Arc<ScavengerWake>,
        min_free_committed_pages: usize,
        scavenge_percentage: f64,
    ) -> Self {
        let pagemap = Arc::new(PageMap::new());
        let class_cache = Arc::new(PageClassCache::new());
        let heap = PageHeap::new(
            Arc::clone(&memory),
            Arc::clone(&pagemap),
            Arc::clone(&class_cache),
        );
        Self {
            heap: SpinMutex::new(heap),
            pagemap,
            class_cache,
            memory,
            wake,
            min_free_committed_pages,
            scavenge_percentage,
        }
    }

    #[inline]
    pub fn pagemap(&self) -> &PageMap {
        &self.pagemap
    }

    #[inline]
    pub fn class_cache(&self) -> &PageClassCache {
        &self.class_cache
    }

    /// A span of `pages` pages tagged with `size_class`; returns its id and
    /// base address.
    pub fn new_small_span(
        &self,
        size_class: usize,
        pages: usize,
    ) -> Result<(SpanId, usize), AllocError> {
        let mut heap = self.heap.lock();
        let id = heap.new_span(pages)?;
        heap.register_size_class(id, size_class);
        log::trace!("tcalloc: span {id:?} of {pages} pages for class {size_class}");
        Ok((id, heap.spans().span(id).start_addr()))
    }

    /// Allocate `pages` pages for one large object.
    pub fn allocate_large(&self, pages: usize) -> Result<NonNull<u8>, AllocError> {
        let mut heap = self.heap.lock();
        let id = heap.new_span(pages)?;
        let addr = heap.spans().span(id).start_addr();
        NonNull::new(addr as *mut u8).ok_or(AllocError::OutOfMemory {
            requested: pages << PAGE_SHIFT,
        })
    }

    /// Free the large object at `addr`.
    pub fn free_large(&self, addr: usize) -> Result<(), HeapViolation> {
        if addr & (PAGE_SIZE - 1) != 0 {
            return Err(HeapViolation::NotOwned { addr });
        }
        let page = addr >> PAGE_SHIFT;
        let mut heap = self.heap.lock();
        let Some(entry) = self.pagemap.get(page) else {
            return Err(HeapViolation::NotOwned { addr });
        };
        match heap.spans().get(entry.span) {
            Some(span)
                if span.start == page
                    && span.location == SpanLocation::InUse
                    && span.size_class == 0 => {}
            Some(span) if span.start == page && span.is_free() => {
                return Err(HeapViolation::DoubleFree { addr });
            }
            _ => return Err(HeapViolation::NotOwned { addr }),
        }
        heap.delete_span(entry.span);
        self.unlock_and_maybe_wake(heap);
        Ok(())
    }

    /// Bytes in the large object starting at `addr`, if there is one.
    pub fn large_size(&self, addr: usize) -> Option<usize> {
        let page = addr >> PAGE_SHIFT;
        let heap = self.heap.lock();
        let entry = self.pagemap.get(page)?;
        let span = heap.spans().get(entry.span)?;
        (span.location == SpanLocation::InUse && span.size_class == 0 && span.start == page)
            .then(|| span.byte_len())
    }

    /// Take back a span a central free list has emptied.
    pub fn return_span(&self, id: SpanId) {
        let mut heap = self.heap.lock();
        match heap.spans().get(id) {
            Some(span) if span.location == SpanLocation::InUse && span.size_class != 0 => {}
            other => fatal(HeapViolation::SpanBookkeeping(format!(
                "returned span {id:?} is not a small in-use span: {other:?}"
            ))),
        }
        heap.delete_span(id);
        self.unlock_and_maybe_wake(heap);
    }

    fn unlock_and_maybe_wake(&self, heap: SpinMutexGuard<'_, PageHeap>) {
        let wake = heap.should_scavenge(self.min_free_committed_pages);
        drop(heap);
        if wake {
            self.wake.signal();
        }
    }

    pub fn should_scavenge(&self) -> bool {
        self.heap.lock().should_scavenge(self.min_free_committed_pages)
    }

    /// One scavenger pass. The lock is dropped around the decommit calls.
    pub fn scavenge(&self) {
        let mut heap = self.heap.lock();
        let batch = heap.select_for_scavenge(self.min_free_committed_pages, self.scavenge_percentage);
        if batch.is_empty() {
            return;
        }
        let bytes: usize = batch.iter().map(|r| r.bytes).sum();
        let results = SpinMutexGuard::unlocked(&mut heap, || self.decommit_all(&batch));
        for (release, ok) in batch.into_iter().zip(results) {
            heap.finish_release(release, ok);
        }
        heap.check_if_enabled();
        drop(heap);
        log::debug!("tcalloc: scavenged {bytes} bytes");
    }

    /// Decommit every committed free page now.
    pub fn release_free_pages(&self) {
        let mut heap = self.heap.lock();
        let batch = heap.select_all_for_release();
        let results = SpinMutexGuard::unlocked(&mut heap, || self.decommit_all(&batch));
        for (release, ok) in batch.into_iter().zip(results) {
            heap.finish_release(release, ok);
        }
        heap.check_if_enabled();
    }

    fn decommit_all(&self, batch: &[Releasing]) -> Vec<bool> {
        batch
            .iter()
            .map(|r| {
                let Some(ptr) = NonNull::new(r.addr as *mut u8) else {
                    return false;
                };
                match self.memory.decommit(ptr, r.bytes) {
                    Ok(()) => true,
                    Err(e) => {
                        log::warn!("tcalloc: decommit of {} bytes at {:#x} failed: {e}", r.bytes, r.addr);
                        false
                    }
                }
            })
            .collect()
    }

    pub fn stats(&self) -> PageHeapStats {
        self.heap.lock().stats()
    }

    pub fn check(&self) -> Result<(), HeapViolation> {
        self.heap.lock().check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::OsMemory;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_heap() -> PageHeap {
        PageHeap::new(
            Arc::new(OsMemory),
            Arc::new(PageMap::new()),
            Arc::new(PageClassCache::new()),
        )
    }

    #[test]
    fn test_first_span_grows_by_min_system_alloc() {
        let mut heap = make_heap();
        let id = heap.new_span(1).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.system_bytes, MIN_SYSTEM_ALLOC * PAGE_SIZE);
        assert_eq!(stats.free_bytes, (MIN_SYSTEM_ALLOC - 1) * PAGE_SIZE);
        assert_eq!(heap.spans().span(id).length, 1);
        heap.check().unwrap();

        heap.delete_span(id);
        assert_eq!(heap.stats().free_bytes, MIN_SYSTEM_ALLOC * PAGE_SIZE);
        assert_eq!(heap.spans().live(), 1);
    }

    #[test]
    fn test_split_then_free_coalesces() {
        let mut heap = make_heap();
        let id = heap.new_span(MAX_PAGES).unwrap();
        let start = heap.spans().span(id).start;
        let tail = heap.split(id, 64);
        assert_eq!(heap.spans().span(tail).start, start + 64);
        assert_eq!(heap.spans().span(tail).length, MAX_PAGES - 64);

        heap.delete_span(id);
        heap.delete_span(tail);
        heap.check().unwrap();
        assert_eq!(heap.spans().live(), 1);
        let only = heap.large.normal.first().unwrap();
        assert_eq!(heap.spans().span(only).start, start);
        assert_eq!(heap.spans().span(only).length, MAX_PAGES);
    }

    #[test]
    fn test_exact_list_preferred_over_larger() {
        let mut heap = make_heap();
        let a = heap.new_span(3).unwrap();
        let a_start = heap.spans().span(a).start;
        let guard = heap.new_span(1).unwrap();
        heap.delete_span(a);
        // The 3-page hole is reused rather than the big remainder.
        let b = heap.new_span(3).unwrap();
        assert_eq!(heap.spans().span(b).start, a_start);
        heap.delete_span(b);
        heap.delete_span(guard);
        heap.check().unwrap();
    }

    #[test]
    fn test_large_best_fit_lowest_address() {
        let mut heap = make_heap();
        // Three separate regions of exactly 200 pages each.
        let spans: Vec<_> = (0..3).map(|_| heap.new_span(200).unwrap()).collect();
        let lowest = spans
            .iter()
            .map(|&id| heap.spans().span(id).start)
            .min()
            .unwrap();
        for &id in &spans {
            heap.delete_span(id);
        }
        let got = heap.new_span(150).unwrap();
        assert_eq!(heap.spans().span(got).start, lowest);
        // The 50-page remainder lands on its exact list.
        assert_eq!(heap.free[50].normal.len(), 1);
        assert_eq!(heap.large.normal.len(), 2);
        heap.check().unwrap();
    }

    #[test]
    fn test_release_all_then_reuse_recommits() {
        let mut heap = make_heap();
        let id = heap.new_span(8).unwrap();
        heap.delete_span(id);
        let batch = heap.select_all_for_release();
        assert!(!batch.is_empty());
        for r in batch {
            heap.finish_release(r, true);
        }
        let stats = heap.stats();
        assert_eq!(stats.free_committed_bytes, 0);
        assert_eq!(stats.returned_bytes, stats.system_bytes);
        assert_eq!(stats.committed_bytes(), 0);

        let again = heap.new_span(8).unwrap();
        let span = heap.spans().span(again);
        assert!(!span.decommitted);
        // Remainder of the recommitted span went back to a normal list.
        assert_eq!(heap.stats().free_committed_bytes, (MIN_SYSTEM_ALLOC - 8) * PAGE_SIZE);
        heap.check().unwrap();
    }

    #[test]
    fn test_free_next_to_returned_span_decommits() {
        let mut heap = make_heap();
        let a = heap.new_span(4).unwrap();
        for r in heap.select_all_for_release() {
            heap.finish_release(r, true);
        }
        heap.delete_span(a);
        let stats = heap.stats();
        assert_eq!(stats.free_committed_bytes, 0);
        assert_eq!(heap.spans().live(), 1);
        heap.check().unwrap();
    }

    #[test]
    fn test_scavenge_respects_minimum() {
        let mut heap = make_heap();
        let id = heap.new_span(1).unwrap();
        heap.delete_span(id);
        // No window has passed yet: nothing counts as idle.
        assert!(heap.select_for_scavenge(0, 1.0).is_empty());

        // The whole region stayed idle for a full window.
        let batch = heap.select_for_scavenge(16, 1.0);
        assert!(!batch.is_empty());
        for r in batch {
            heap.finish_release(r, true);
        }
        // A single 128-page span is released whole.
        assert_eq!(heap.stats().free_committed_bytes, 0);
        assert_eq!(heap.stats().returned_bytes, MIN_SYSTEM_ALLOC * PAGE_SIZE);
        heap.check().unwrap();
    }

    /// Counts decommit calls.
    #[derive(Default)]
    struct CountingMemory {
        decommits: AtomicUsize,
    }

    impl SystemMemory for CountingMemory {
        fn reserve(&self, size: usize, align: usize) -> io::Result<NonNull<u8>> {
            OsMemory.reserve(size, align)
        }
        fn commit(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()> {
            OsMemory.commit(ptr, size)
        }
        fn decommit(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()> {
            self.decommits.fetch_add(1, Ordering::Relaxed);
            OsMemory.decommit(ptr, size)
        }
        fn release(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()> {
            OsMemory.release(ptr, size)
        }
    }

    #[test]
    fn test_finish_release_leaves_committed_neighbour_alone() {
        let memory = Arc::new(CountingMemory::default());
        let mut heap = PageHeap::new(
            memory.clone(),
            Arc::new(PageMap::new()),
            Arc::new(PageClassCache::new()),
        );
        let x = heap.new_span(4).unwrap();
        let y = heap.new_span(4).unwrap();
        let rest = heap.new_span(MIN_SYSTEM_ALLOC - 8).unwrap();
        assert_eq!(heap.spans().span(y).start, heap.spans().span(x).start + 4);

        heap.delete_span(x);
        let batch = heap.select_all_for_release();
        assert_eq!(batch.len(), 1);
        // Freed while `x` is out for decommit: nothing to merge with.
        heap.delete_span(y);
        assert_eq!(heap.spans().span(y).location, SpanLocation::Normal);

        for r in batch {
            let ptr = NonNull::new(r.addr as *mut u8).unwrap();
            memory.decommit(ptr, r.bytes).unwrap();
            heap.finish_release(r, true);
        }
        // Only the unlocked decommit above reached the OS.
        assert_eq!(memory.decommits.load(Ordering::Relaxed), 1);
        assert_eq!(heap.spans().span(x).location, SpanLocation::Returned);
        assert_eq!(heap.spans().span(y).location, SpanLocation::Normal);
        assert_eq!(heap.stats().free_committed_bytes, 4 * PAGE_SIZE);
        assert_eq!(heap.stats().returned_bytes, 4 * PAGE_SIZE);
        assert_eq!(heap.spans().live(), 3);
        heap.check().unwrap();
        heap.delete_span(rest);
        heap.check().unwrap();
    }

    /// Hands out consecutive slices of one mapping, so regions touch.
    struct ContiguousMemory {
        base: usize,
        len: usize,
        next: AtomicUsize,
    }

    impl ContiguousMemory {
        fn new(len: usize) -> Self {
            let base = OsMemory.reserve(len, PAGE_SIZE).unwrap().as_ptr() as usize;
            Self {
                base,
                len,
                next: AtomicUsize::new(0),
            }
        }
    }

    impl SystemMemory for ContiguousMemory {
        fn reserve(&self, size: usize, _align: usize) -> io::Result<NonNull<u8>> {
            let offset = self.next.fetch_add(size, Ordering::Relaxed);
            if offset + size > self.len {
                return Err(io::Error::from(io::ErrorKind::OutOfMemory));
            }
            NonNull::new((self.base + offset) as *mut u8)
                .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
        }
        fn commit(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()> {
            OsMemory.commit(ptr, size)
        }
        fn decommit(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()> {
            OsMemory.decommit(ptr, size)
        }
        fn release(&self, _ptr: NonNull<u8>, _size: usize) -> io::Result<()> {
            Ok(())
        }
    }

    impl Drop for ContiguousMemory {
        fn drop(&mut self) {
            if let Some(ptr) = NonNull::new(self.base as *mut u8) {
                let _ = OsMemory.release(ptr, self.len);
            }
        }
    }

    #[cfg(not(windows))]
    #[test]
    fn test_adjacent_regions_merge() {
        let memory = Arc::new(ContiguousMemory::new(4 * MIN_SYSTEM_ALLOC * PAGE_SIZE));
        let mut heap = PageHeap::new(
            memory.clone(),
            Arc::new(PageMap::new()),
            Arc::new(PageClassCache::new()),
        );
        let a = heap.new_span(MIN_SYSTEM_ALLOC).unwrap();
        let b = heap.new_span(MIN_SYSTEM_ALLOC).unwrap();
        assert_eq!(
            heap.spans().span(b).start,
            heap.spans().span(a).start + MIN_SYSTEM_ALLOC
        );
        heap.delete_span(a);
        heap.delete_span(b);
        assert_eq!(heap.spans().live(), 1);
        let only = heap.large.normal.first().unwrap();
        assert_eq!(heap.spans().span(only).length, 2 * MIN_SYSTEM_ALLOC);
        heap.check().unwrap();
        drop(heap);
    }

    /// Refuses any reservation above `limit` bytes.
    struct CappedMemory {
        limit: usize,
        refusals: AtomicUsize,
    }

    impl SystemMemory for CappedMemory {
        fn reserve(&self, size: usize, align: usize) -> io::Result<NonNull<u8>> {
            if size > self.limit {
                self.refusals.fetch_add(1, Ordering::Relaxed);
                return Err(io::Error::from(io::ErrorKind::OutOfMemory));
            }
            OsMemory.reserve(size, align)
        }
        fn commit(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()> {
            OsMemory.commit(ptr, size)
        }
        fn decommit(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()> {
            OsMemory.decommit(ptr, size)
        }
        fn release(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()> {
            OsMemory.release(ptr, size)
        }
    }

    #[test]
    fn test_grow_retries_at_exact_size() {
        let memory = Arc::new(CappedMemory {
            limit: 4 * PAGE_SIZE,
            refusals: AtomicUsize::new(0),
        });
        let mut heap = PageHeap::new(
            memory.clone(),
            Arc::new(PageMap::new()),
            Arc::new(PageClassCache::new()),
        );
        let id = heap.new_span(4).unwrap();
        assert_eq!(memory.refusals.load(Ordering::Relaxed), 1);
        assert_eq!(heap.stats().system_bytes, 4 * PAGE_SIZE);
        heap.delete_span(id);

        let err = heap.new_span(5).unwrap_err();
        assert_eq!(
            err,
            AllocError::OutOfMemory {
                requested: 5 * PAGE_SIZE
            }
        );
        heap.check().unwrap();
    }
}
