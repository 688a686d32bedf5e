//! Page map: a 3-level radix tree mapping page numbers to spans.
//!
//! Writers hold the page heap lock. Readers do not lock: each page is one
//! atomic word, so a racing reader sees either no entry or a complete one.
//! Interior nodes are only ever added, never removed, while the map lives.

use crate::PAGE_SHIFT;
use crate::span::{PageId, SpanId};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use static_assertions::const_assert;

#[cfg(target_pointer_width = "64")]
const ADDRESS_BITS: usize = 48;
#[cfg(target_pointer_width = "64")]
const ROOT_BITS: usize = 12;
#[cfg(target_pointer_width = "64")]
const MID_BITS: usize = 12;

#[cfg(not(target_pointer_width = "64"))]
const ADDRESS_BITS: usize = 32;
#[cfg(not(target_pointer_width = "64"))]
const ROOT_BITS: usize = 4;
#[cfg(not(target_pointer_width = "64"))]
const MID_BITS: usize = 5;

const PAGE_BITS: usize = ADDRESS_BITS - PAGE_SHIFT;
const LEAF_BITS: usize = PAGE_BITS - ROOT_BITS - MID_BITS;

const ROOT_LEN: usize = 1 << ROOT_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;

#[cfg(target_pointer_width = "64")]
const_assert!(LEAF_BITS == 11);
#[cfg(not(target_pointer_width = "64"))]
const_assert!(LEAF_BITS == 10);

// Entry layout: | span id + 1 (32) | page offset (24) | size class (8) |
const CLASS_BITS: u32 = 8;
const OFFSET_BITS: u32 = 24;
const OFFSET_MAX: usize = (1 << OFFSET_BITS) - 1;

/// Decoded page map entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageEntry {
    pub span: SpanId,
    pub size_class: usize,
    /// Page index within the span. Saturates for pages past 2^24 - 1.
    pub offset: usize,
}

impl PageEntry {
    fn pack(self) -> u64 {
        debug_assert!(self.size_class < (1 << CLASS_BITS));
        let id = self.span.index() as u64 + 1;
        let offset = self.offset.min(OFFSET_MAX) as u64;
        (id << (OFFSET_BITS + CLASS_BITS)) | (offset << CLASS_BITS) | self.size_class as u64
    }

    fn unpack(word: u64) -> Option<PageEntry> {
        let id = word >> (OFFSET_BITS + CLASS_BITS);
        if id == 0 {
            return None;
        }
        Some(PageEntry {
            span: SpanId::from_index((id - 1) as u32),
            size_class: (word & ((1 << CLASS_BITS) - 1)) as usize,
            offset: ((word >> CLASS_BITS) as usize) & OFFSET_MAX,
        })
    }
}

struct Leaf {
    entries: Box<[AtomicU64]>,
}

struct Mid {
    leaves: Box<[AtomicPtr<Leaf>]>,
}

fn null_slots<T>(len: usize) -> Box<[AtomicPtr<T>]> {
    (0..len).map(|_| AtomicPtr::new(ptr::null_mut())).collect()
}

pub struct PageMap {
    root: Box<[AtomicPtr<Mid>]>,
}

// SAFETY: nodes are reached only through atomics and freed only in Drop.
unsafe impl Send for PageMap {}
unsafe impl Sync for PageMap {}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PageMap {
    pub fn new() -> Self {
        Self {
            root: null_slots(ROOT_LEN),
        }
    }

    #[inline]
    fn split(page: PageId) -> Option<(usize, usize, usize)> {
        if page >> PAGE_BITS != 0 {
            return None;
        }
        let i1 = page >> (MID_BITS + LEAF_BITS);
        let i2 = (page >> LEAF_BITS) & (MID_LEN - 1);
        let i3 = page & (LEAF_LEN - 1);
        Some((i1, i2, i3))
    }

    #[inline]
    fn leaf(&self, page: PageId) -> Option<(&Leaf, usize)> {
        let (i1, i2, i3) = Self::split(page)?;
        let mid = self.root[i1].load(Ordering::Acquire);
        if mid.is_null() {
            return None;
        }
        // SAFETY: published nodes stay alive until the map is dropped.
        let leaf = unsafe { (*mid).leaves[i2].load(Ordering::Acquire) };
        if leaf.is_null() {
            return None;
        }
        Some((unsafe { &*leaf }, i3))
    }

    /// Make sure nodes exist for pages `[start, start + n)`. Returns false if
    /// the range leaves the address space. Caller holds the page heap lock.
    pub fn ensure(&self, start: PageId, n: usize) -> bool {
        let Some(end) = start.checked_add(n) else {
            return false;
        };
        let mut page = start;
        while page < end {
            let Some((i1, i2, _)) = Self::split(page) else {
                return false;
            };

            let mut mid = self.root[i1].load(Ordering::Acquire);
            if mid.is_null() {
                mid = Box::into_raw(Box::new(Mid {
                    leaves: null_slots(MID_LEN),
                }));
                self.root[i1].store(mid, Ordering::Release);
            }

            // SAFETY: `mid` was just published or already live.
            let slot = unsafe { &(*mid).leaves[i2] };
            if slot.load(Ordering::Acquire).is_null() {
                let leaf = Box::new(Leaf {
                    entries: (0..LEAF_LEN).map(|_| AtomicU64::new(0)).collect(),
                });
                slot.store(Box::into_raw(leaf), Ordering::Release);
            }

            // Next leaf boundary.
            page = ((page >> LEAF_BITS) + 1) << LEAF_BITS;
        }
        true
    }

    #[inline]
    pub fn get(&self, page: PageId) -> Option<PageEntry> {
        let (leaf, i3) = self.leaf(page)?;
        PageEntry::unpack(leaf.entries[i3].load(Ordering::Acquire))
    }

    /// Look up the page holding `addr`.
    #[inline]
    pub fn lookup(&self, addr: usize) -> Option<PageEntry> {
        self.get(addr >> PAGE_SHIFT)
    }

    /// Store or clear an entry. The node must exist ([`PageMap::ensure`]).
    /// Caller holds the page heap lock.
    pub fn set(&self, page: PageId, entry: Option<PageEntry>) {
        match self.leaf(page) {
            Some((leaf, i3)) => {
                let word = entry.map_or(0, PageEntry::pack);
                leaf.entries[i3].store(word, Ordering::Release);
            }
            None => debug_assert!(entry.is_none(), "page {page:#x} has no page map node"),
        }
    }
}

impl Drop for PageMap {
    fn drop(&mut self) {
        for slot in self.root.iter() {
            let mid = slot.load(Ordering::Relaxed);
            if mid.is_null() {
                continue;
            }
            // SAFETY: every node was created by Box::into_raw in `ensure`
            // and nothing else can reach it once we are dropping.
            let mid = unsafe { Box::from_raw(mid) };
            for leaf in mid.leaves.iter() {
                let leaf = leaf.load(Ordering::Relaxed);
                if !leaf.is_null() {
                    drop(unsafe { Box::from_raw(leaf) });
                }
            }
        }
    }
}

const CACHE_BITS: usize = 16;
const CACHE_LEN: usize = 1 << CACHE_BITS;

/// Direct-mapped page -> size class hint cache.
///
/// Slots are read and written with relaxed atomics and may be stale. A hit
/// only says which class the page had when it was last registered.
pub struct PageClassCache {
    slots: Box<[AtomicU64]>,
}

impl Default for PageClassCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PageClassCache {
    pub fn new() -> Self {
        Self {
            slots: (0..CACHE_LEN).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    pub fn get(&self, page: PageId) -> Option<usize> {
        let word = self.slots[page & (CACHE_LEN - 1)].load(Ordering::Relaxed);
        if word >> CLASS_BITS == page as u64 + 1 {
            Some((word & 0xFF) as usize)
        } else {
            None
        }
    }

    #[inline]
    pub fn put(&self, page: PageId, size_class: usize) {
        let word = ((page as u64 + 1) << CLASS_BITS) | (size_class as u64 & 0xFF);
        self.slots[page & (CACHE_LEN - 1)].store(word, Ordering::Relaxed);
    }
}
