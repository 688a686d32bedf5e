//! Top-level allocator: ties all tiers together.
//!
//! A [`Heap`] owns its page heap, central lists, thread registry and
//! scavenger. Thread caches live in a thread-local table keyed by heap id,
//! so one thread can use several heaps side by side. [`global`] is the
//! process-wide heap configured from the environment, and [`TcAlloc`] puts
//! it behind `#[global_allocator]`.
//!
//! Metadata (span records, free list vectors, page map nodes) is allocated
//! through the Rust global allocator. While a thread runs heap code it is
//! marked as inside the heap, and the [`GlobalAlloc`] impls serve requests
//! made meanwhile from [`System`]. Frees are routed by the page map: blocks
//! it does not know go back to `System`.

use crate::central_free_list::CentralCache;
use crate::config::Config;
use crate::error::{AllocError, HeapViolation, fatal};
use crate::hardening::{SlotMask, Unmasked, XorMask};
use crate::page_heap::{PageHeapStats, SharedPageHeap};
use crate::platform::{OsMemory, SystemMemory};
use crate::scavenger::{Scavenger, ScavengerWake};
use crate::size_class::SizeClassTable;
use crate::thread_cache::{ThreadCache, ThreadCacheStats, ThreadRegistry};
use crate::{PAGE_SHIFT, PAGE_SIZE};
use core::alloc::{GlobalAlloc, Layout};
use core::cell::{Cell, RefCell};
use core::ptr::{self, NonNull};
use once_cell::sync::OnceCell;
use std::alloc::System;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_HEAP_ID: AtomicUsize = AtomicUsize::new(1);

/// Shared state of one heap. Thread caches keep it alive past the `Heap`
/// handle until they are flushed.
struct HeapCore {
    id: usize,
    config: Config,
    sizes: &'static SizeClassTable,
    pages: Arc<SharedPageHeap>,
    central: CentralCache,
    threads: ThreadRegistry,
}

/// One thread's cache for one heap.
struct LocalCache {
    core: Arc<HeapCore>,
    cache: ThreadCache,
    stats: Arc<ThreadCacheStats>,
}

impl Drop for LocalCache {
    fn drop(&mut self) {
        let _inside = InsideHeap::enter();
        self.cache.cleanup(&self.core.central, &self.core.pages);
        self.core.threads.unregister(&self.stats);
    }
}

thread_local! {
    static CACHES: RefCell<Vec<LocalCache>> = const { RefCell::new(Vec::new()) };
    static FORBIDDEN: Cell<bool> = const { Cell::new(false) };
    static INSIDE: Cell<bool> = const { Cell::new(false) };
}

/// Marks the calling thread as running heap code until dropped.
pub(crate) struct InsideHeap {
    nested: bool,
}

impl InsideHeap {
    #[inline]
    pub(crate) fn enter() -> Self {
        // No TLS left: assume the worst.
        let nested = INSIDE.try_with(|f| f.replace(true)).unwrap_or(true);
        Self { nested }
    }

    /// The thread was already inside the heap.
    #[inline]
    pub(crate) fn nested(&self) -> bool {
        self.nested
    }
}

impl Drop for InsideHeap {
    #[inline]
    fn drop(&mut self) {
        if !self.nested {
            let _ = INSIDE.try_with(|f| f.set(false));
        }
    }
}

#[inline]
fn inside_heap() -> bool {
    INSIDE.try_with(Cell::get).unwrap_or(true)
}

/// Forbid allocation on the calling thread until [`allow`].
pub fn forbid() {
    let _ = FORBIDDEN.try_with(|f| f.set(true));
}

pub fn allow() {
    let _ = FORBIDDEN.try_with(|f| f.set(false));
}

pub fn is_forbidden() -> bool {
    FORBIDDEN.try_with(Cell::get).unwrap_or(false)
}

/// Heap-wide memory counters.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Address space reserved from the OS.
    pub reserved_bytes: usize,
    /// Reserved bytes not handed back to the OS.
    pub committed_bytes: usize,
    /// Free objects held in thread caches and central lists.
    pub free_list_bytes: usize,
}

/// A thread-caching allocator instance.
pub struct Heap {
    core: Arc<HeapCore>,
    scavenger: Option<Scavenger>,
}

static GLOBAL: OnceCell<Heap> = OnceCell::new();

/// The process-wide heap, configured from `TCALLOC_*` on first use.
pub fn global() -> &'static Heap {
    if let Some(heap) = GLOBAL.get() {
        return heap;
    }
    // Allocations made while building the heap must not come back here.
    let _inside = InsideHeap::enter();
    GLOBAL.get_or_init(|| {
        let config = Config::from_env().unwrap_or_else(|e| {
            log::warn!("tcalloc: {e}; using default configuration");
            Config::default()
        });
        Heap::new(config)
    })
}

impl Heap {
    pub fn new(config: Config) -> Self {
        Self::with_memory(config, Arc::new(OsMemory))
    }

    /// A heap drawing pages from `memory`.
    pub fn with_memory(config: Config, memory: Arc<dyn SystemMemory>) -> Self {
        let _inside = InsideHeap::enter();
        let sizes = SizeClassTable::global();
        let wake = Arc::new(ScavengerWake::new());
        let pages = Arc::new(SharedPageHeap::new(
            memory,
            Arc::clone(&wake),
            config.min_free_committed_pages,
            config.scavenge_percentage,
        ));
        let mask: Arc<dyn SlotMask> = if config.hardening {
            Arc::new(XorMask::random())
        } else {
            Arc::new(Unmasked)
        };

        let scavenger = if config.background_scavenger {
            match Scavenger::spawn(Arc::clone(&pages), wake, config.scavenge_delay) {
                Ok(s) => Some(s),
                Err(e) => {
                    log::warn!("tcalloc: could not start scavenger thread: {e}");
                    None
                }
            }
        } else {
            None
        };

        let core = Arc::new(HeapCore {
            id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
            central: CentralCache::new(sizes, mask),
            threads: ThreadRegistry::new(&config),
            config,
            sizes,
            pages,
        });
        Self { core, scavenger }
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// Run `f` on this thread's cache, creating it if `create` is set.
    /// Returns `None` when no cache is available (thread shutting down,
    /// re-entrant use, or `create` unset and no cache yet).
    #[inline]
    fn with_cache<R>(&self, create: bool, f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
        CACHES
            .try_with(|cell| {
                let mut caches = cell.try_borrow_mut().ok()?;
                let idx = match caches.iter().position(|c| c.core.id == self.core.id) {
                    Some(i) => i,
                    None if create => {
                        caches.push(self.new_local_cache());
                        caches.len() - 1
                    }
                    None => return None,
                };
                Some(f(&mut caches[idx].cache))
            })
            .ok()
            .flatten()
    }

    #[cold]
    fn new_local_cache(&self) -> LocalCache {
        let core = Arc::clone(&self.core);
        let (stats, budget) = core.threads.register(std::thread::current().id());
        let cache = ThreadCache::new(
            core.sizes,
            core.config.max_free_list_length,
            core.config.hardening,
            budget,
            Arc::clone(&stats),
        );
        LocalCache { core, cache, stats }
    }

    #[inline]
    fn check_allowed() {
        if is_forbidden() {
            fatal(HeapViolation::AllocationForbidden);
        }
    }

    fn allocate_small(&self, size_class: usize) -> Result<usize, AllocError> {
        Self::check_allowed();
        let core = &*self.core;
        match self.with_cache(true, |tc| tc.allocate(size_class, &core.central, &core.pages)) {
            Some(result) => result,
            None => {
                let objs = core.central.remove_range(size_class, 1, &core.pages)?;
                objs.first().copied().ok_or(AllocError::OutOfMemory {
                    requested: core.sizes.byte_size(size_class),
                })
            }
        }
    }

    fn allocate_pages(&self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        Self::check_allowed();
        let pages = bytes.div_ceil(PAGE_SIZE);
        self.core.pages.allocate_large(pages)
    }

    /// Allocate `size` bytes, or report why not.
    pub fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let _inside = InsideHeap::enter();
        let size_class = self.core.sizes.classify(size);
        if size_class == 0 {
            return self.allocate_pages(size);
        }
        let addr = self.allocate_small(size_class)?;
        NonNull::new(addr as *mut u8).ok_or(AllocError::OutOfMemory { requested: size })
    }

    /// Allocate `size` bytes. Aborts on failure.
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        self.try_allocate(size)
            .unwrap_or_else(|e| fatal(HeapViolation::Exhausted(e)))
    }

    pub fn try_allocate_zeroed(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let p = self.try_allocate(size)?;
        // SAFETY: the block holds at least `size` bytes.
        unsafe { p.as_ptr().write_bytes(0, size) };
        Ok(p)
    }

    pub fn allocate_zeroed(&self, size: usize) -> NonNull<u8> {
        self.try_allocate_zeroed(size)
            .unwrap_or_else(|e| fatal(HeapViolation::Exhausted(e)))
    }

    /// Zeroed room for `count` elements of `size` bytes.
    pub fn try_allocate_array(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = count
            .checked_mul(size)
            .ok_or(AllocError::SizeOverflow { count, size })?;
        self.try_allocate_zeroed(total)
    }

    pub fn allocate_array(&self, count: usize, size: usize) -> NonNull<u8> {
        self.try_allocate_array(count, size)
            .unwrap_or_else(|e| fatal(HeapViolation::Exhausted(e)))
    }

    /// Free a block from this heap. Null is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block returned by this heap, and must not
    /// be used afterwards. Foreign pointers and double frees are detected on
    /// a best-effort basis and abort the process.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let _inside = InsideHeap::enter();
        let addr = ptr as usize;
        let core = &*self.core;
        let Some(entry) = core.pages.pagemap().lookup(addr) else {
            fatal(HeapViolation::NotOwned { addr });
        };

        if entry.size_class == 0 {
            if let Err(violation) = core.pages.free_large(addr) {
                fatal(violation);
            }
            return;
        }

        let size_class = entry.size_class;
        let base = ((addr >> PAGE_SHIFT) - entry.offset) << PAGE_SHIFT;
        if (addr - base) % core.sizes.byte_size(size_class) != 0 {
            fatal(HeapViolation::NotOwned { addr });
        }
        let cached = self.with_cache(false, |tc| {
            tc.deallocate(addr, size_class, &core.central, &core.pages)
        });
        if cached.is_none() {
            core.central.insert_range(size_class, vec![addr], &core.pages);
        }
    }

    /// Bytes usable in the block at `ptr`; 0 for null or foreign pointers.
    pub fn usable_size(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let addr = ptr as usize;
        let core = &*self.core;
        if let Some(size_class) = core.pages.class_cache().get(addr >> PAGE_SHIFT) {
            if size_class != 0 {
                return core.sizes.byte_size(size_class);
            }
        }
        match core.pages.pagemap().lookup(addr) {
            Some(entry) if entry.size_class != 0 => core.sizes.byte_size(entry.size_class),
            Some(_) => core.pages.large_size(addr).unwrap_or(0),
            None => 0,
        }
    }

    /// The size a request for `size` bytes actually receives.
    pub fn good_size(&self, size: usize) -> usize {
        match self.core.sizes.classify(size) {
            0 => size.div_ceil(PAGE_SIZE).saturating_mul(PAGE_SIZE),
            size_class => self.core.sizes.byte_size(size_class),
        }
    }

    /// Resize the block at `ptr`. Null allocates; `new_size == 0` frees and
    /// returns null.
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::free`]. On success the old pointer must not
    /// be used unless it was returned unchanged.
    pub unsafe fn try_reallocate(&self, ptr: *mut u8, new_size: usize) -> Result<*mut u8, AllocError> {
        if ptr.is_null() {
            return self.try_allocate(new_size).map(NonNull::as_ptr);
        }
        if new_size == 0 {
            unsafe { self.free(ptr) };
            return Ok(ptr::null_mut());
        }

        let old_size = self.usable_size(ptr);
        if old_size == 0 {
            fatal(HeapViolation::NotOwned { addr: ptr as usize });
        }
        if new_size > old_size || self.good_size(new_size) < old_size {
            let new = self.try_allocate(new_size)?;
            // SAFETY: both blocks are live and hold at least the copied length.
            unsafe {
                ptr::copy_nonoverlapping(ptr, new.as_ptr(), old_size.min(new_size));
                self.free(ptr);
            }
            return Ok(new.as_ptr());
        }
        Ok(ptr)
    }

    /// [`Heap::try_reallocate`] that aborts on failure.
    ///
    /// # Safety
    ///
    /// See [`Heap::try_reallocate`].
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        unsafe { self.try_reallocate(ptr, new_size) }
            .unwrap_or_else(|e| fatal(HeapViolation::Exhausted(e)))
    }

    /// Flush the calling thread's cache and the transfer caches, then
    /// decommit all free pages.
    pub fn release_free_memory(&self) {
        let _inside = InsideHeap::enter();
        let core = &*self.core;
        self.with_cache(false, |tc| tc.cleanup(&core.central, &core.pages));
        core.central.drain_transfer_caches(&core.pages);
        core.pages.release_free_pages();
    }

    pub fn statistics(&self) -> Statistics {
        let core = &*self.core;
        let pages = core.pages.stats();
        Statistics {
            reserved_bytes: pages.system_bytes,
            committed_bytes: pages.committed_bytes(),
            free_list_bytes: core.central.free_bytes() + core.threads.cached_bytes(),
        }
    }

    /// Page heap counters behind [`Heap::statistics`].
    pub fn page_heap_stats(&self) -> PageHeapStats {
        self.core.pages.stats()
    }

    /// Flush and drop the calling thread's cache for this heap.
    pub fn thread_exit(&self) {
        let _inside = InsideHeap::enter();
        let removed = CACHES
            .try_with(|cell| {
                let mut caches = cell.try_borrow_mut().ok()?;
                let idx = caches.iter().position(|c| c.core.id == self.core.id)?;
                Some(caches.swap_remove(idx))
            })
            .ok()
            .flatten();
        // Flushes outside the table borrow.
        drop(removed);
    }

    /// Run the exhaustive consistency checks now.
    pub fn verify(&self) -> Result<(), HeapViolation> {
        let _inside = InsideHeap::enter();
        self.core.pages.check()?;
        self.core.central.check()
    }

    /// Thread caches currently registered.
    pub fn live_thread_caches(&self) -> usize {
        self.core.threads.live()
    }

    /// Current per-thread cache budget in bytes.
    pub fn thread_cache_budget(&self) -> usize {
        self.core.threads.per_thread_budget()
    }

    /// Whether `ptr` lies in a page this heap hands out.
    #[inline]
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.core.pages.pagemap().lookup(ptr as usize).is_some()
    }

    fn allocate_layout(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let (size, align) = (layout.size(), layout.align());
        if align <= 8 {
            return self.try_allocate(size);
        }
        if align > PAGE_SIZE {
            return Err(AllocError::OutOfMemory { requested: size });
        }
        let effective = size.max(align);
        let sizes = self.core.sizes;
        let first = sizes.classify(effective);
        if first != 0 {
            // Smallest class whose objects all land on the alignment.
            if let Some(size_class) = (first..sizes.len()).find(|&c| sizes.byte_size(c) % align == 0) {
                let addr = self.allocate_small(size_class)?;
                return NonNull::new(addr as *mut u8)
                    .ok_or(AllocError::OutOfMemory { requested: size });
            }
        }
        // Spans start on a page boundary.
        self.allocate_pages(effective.max(PAGE_SIZE))
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let _inside = InsideHeap::enter();
        self.thread_exit();
        if let Some(mut scavenger) = self.scavenger.take() {
            scavenger.shutdown();
        }
    }
}

/// Requests made from inside the heap are served by [`System`], and blocks
/// the page map does not know are handed back to it.
unsafe impl GlobalAlloc for Heap {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let inside = InsideHeap::enter();
        if inside.nested() {
            return unsafe { System.alloc(layout) };
        }
        self.allocate_layout(layout)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if self.owns(ptr) {
            unsafe { self.free(ptr) }
        } else {
            unsafe { System.dealloc(ptr, layout) }
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let inside = InsideHeap::enter();
        if inside.nested() {
            return unsafe { System.alloc_zeroed(layout) };
        }
        let ptr = self
            .allocate_layout(layout)
            .map_or(ptr::null_mut(), NonNull::as_ptr);
        if !ptr.is_null() && layout.size() > 0 {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if !self.owns(ptr) {
            return unsafe { System.realloc(ptr, layout, new_size) };
        }
        let _inside = InsideHeap::enter();
        if layout.align() <= 8 && new_size > 0 {
            return unsafe { self.try_reallocate(ptr, new_size) }.unwrap_or(ptr::null_mut());
        }
        // Over-aligned: the new block must keep the alignment.
        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        let new_ptr = self
            .allocate_layout(new_layout)
            .map_or(ptr::null_mut(), NonNull::as_ptr);
        if !new_ptr.is_null() {
            unsafe {
                ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                self.free(ptr);
            }
        }
        new_ptr
    }
}

/// The process-wide heap as the Rust global allocator.
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: tcalloc::TcAlloc = tcalloc::TcAlloc;
/// ```
pub struct TcAlloc;

unsafe impl GlobalAlloc for TcAlloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if inside_heap() {
            return unsafe { System.alloc(layout) };
        }
        unsafe { global().alloc(layout) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        match GLOBAL.get() {
            Some(heap) => unsafe { heap.dealloc(ptr, layout) },
            None => unsafe { System.dealloc(ptr, layout) },
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if inside_heap() {
            return unsafe { System.alloc_zeroed(layout) };
        }
        unsafe { global().alloc_zeroed(layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        match GLOBAL.get() {
            Some(heap) => unsafe { heap.realloc(ptr, layout, new_size) },
            None => unsafe { System.realloc(ptr, layout, new_size) },
        }
    }
}
