//! Thread Cache (front-end): per-thread free lists for lock-free allocation.
//!
//! Each thread gets its own ThreadCache per heap. The fast path (thread cache
//! hit) requires zero synchronization. When a list is empty or too long the
//! cache moves whole batches to or from the central free list.
//!
//! The per-thread byte budget is an even share of the overall budget among
//! live caches, kept by the [`ThreadRegistry`].

use crate::central_free_list::CentralCache;
use crate::config::Config;
use crate::error::{AllocError, HeapViolation, fatal};
use crate::page_heap::SharedPageHeap;
use crate::size_class::SizeClassTable;
use crate::sync::SpinMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;

const CHECKS: bool = cfg!(any(debug_assertions, feature = "debug"));

/// Per-size-class free list within the thread cache.
#[derive(Debug, Default)]
struct FreeList {
    /// LIFO of object addresses.
    objects: Vec<usize>,
    /// Shortest length seen since the last scavenge.
    lowater: usize,
}

impl FreeList {
    #[inline]
    fn pop(&mut self) -> Option<usize> {
        let obj = self.objects.pop()?;
        self.lowater = self.lowater.min(self.objects.len());
        Some(obj)
    }

    #[inline]
    fn push(&mut self, obj: usize) {
        self.objects.push(obj);
    }

    #[inline]
    fn len(&self) -> usize {
        self.objects.len()
    }

    /// Pop up to `count` objects, most recently pushed first.
    fn pop_batch(&mut self, count: usize) -> Vec<usize> {
        let keep = self.objects.len().saturating_sub(count);
        let out = self.objects.split_off(keep);
        self.lowater = self.lowater.min(self.objects.len());
        out
    }
}

/// Published view of one thread cache, read by statistics.
#[derive(Debug)]
pub struct ThreadCacheStats {
    pub thread: ThreadId,
    cached_bytes: AtomicUsize,
}

impl ThreadCacheStats {
    pub fn cached_bytes(&self) -> usize {
        self.cached_bytes.load(Ordering::Relaxed)
    }
}

/// Per-thread cache holding free lists for each size class.
pub struct ThreadCache {
    sizes: &'static SizeClassTable,
    lists: Vec<FreeList>,
    /// Total bytes cached across all size classes.
    size: usize,
    max_list_length: usize,
    /// Scan the class list on every free.
    find_double_frees: bool,
    budget: Arc<AtomicUsize>,
    stats: Arc<ThreadCacheStats>,
}

impl ThreadCache {
    /// A hardened cache checks every free against its own list in release
    /// builds too.
    pub fn new(
        sizes: &'static SizeClassTable,
        max_list_length: usize,
        hardened: bool,
        budget: Arc<AtomicUsize>,
        stats: Arc<ThreadCacheStats>,
    ) -> Self {
        Self {
            sizes,
            lists: (0..sizes.len()).map(|_| FreeList::default()).collect(),
            size: 0,
            max_list_length,
            find_double_frees: CHECKS || hardened,
            budget,
            stats,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.budget.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn list_len(&self, size_class: usize) -> usize {
        self.lists[size_class].len()
    }

    #[inline]
    fn publish(&self) {
        self.stats.cached_bytes.store(self.size, Ordering::Relaxed);
    }

    /// Allocate an object of the given size class.
    #[inline]
    pub fn allocate(
        &mut self,
        size_class: usize,
        central: &CentralCache,
        pages: &SharedPageHeap,
    ) -> Result<usize, AllocError> {
        if let Some(obj) = self.lists[size_class].pop() {
            self.size -= self.sizes.byte_size(size_class);
            self.publish();
            return Ok(obj);
        }
        // Slow path: fetch from central cache
        self.fetch_from_central(size_class, central, pages)
    }

    /// Deallocate an object of the given size class.
    #[inline]
    pub fn deallocate(
        &mut self,
        obj: usize,
        size_class: usize,
        central: &CentralCache,
        pages: &SharedPageHeap,
    ) {
        let list = &mut self.lists[size_class];
        if self.find_double_frees && list.objects.contains(&obj) {
            fatal(HeapViolation::DoubleFree { addr: obj });
        }
        list.push(obj);
        let over_length = list.len() > self.max_list_length;
        self.size += self.sizes.byte_size(size_class);

        if over_length {
            let batch = self.sizes.batch_size(size_class);
            self.release_to_central(size_class, batch, central, pages);
        }
        if self.size >= self.max_size() {
            self.scavenge(central, pages);
        }
        self.publish();
    }

    /// Slow path: fetch a batch of objects from the central free list.
    #[cold]
    fn fetch_from_central(
        &mut self,
        size_class: usize,
        central: &CentralCache,
        pages: &SharedPageHeap,
    ) -> Result<usize, AllocError> {
        let batch = self.sizes.batch_size(size_class);
        let mut objs = central.remove_range(size_class, batch, pages)?;
        // Hand out the lowest address, keep the rest in pop order.
        objs.reverse();
        let Some(result) = objs.pop() else {
            return Err(AllocError::OutOfMemory {
                requested: self.sizes.byte_size(size_class),
            });
        };
        self.size += objs.len() * self.sizes.byte_size(size_class);
        self.lists[size_class].objects.extend(objs);
        self.publish();
        Ok(result)
    }

    /// Release `count` objects of one class back to the central cache, in
    /// batch-sized chunks.
    fn release_to_central(
        &mut self,
        size_class: usize,
        count: usize,
        central: &CentralCache,
        pages: &SharedPageHeap,
    ) {
        let mut objs = self.lists[size_class].pop_batch(count);
        if objs.is_empty() {
            return;
        }
        self.size -= objs.len() * self.sizes.byte_size(size_class);

        let batch = self.sizes.batch_size(size_class);
        while objs.len() > batch {
            let rest = objs.split_off(batch);
            central.insert_range(size_class, objs, pages);
            objs = rest;
        }
        central.insert_range(size_class, objs, pages);
    }

    /// Trim lists that stayed partly unused since the last pass, then halve
    /// the biggest lists until the cache fits its budget.
    pub fn scavenge(&mut self, central: &CentralCache, pages: &SharedPageHeap) {
        for cls in 1..self.lists.len() {
            let lowater = self.lists[cls].lowater;
            if lowater > 0 {
                let drop = (lowater / 2).max(1);
                self.release_to_central(cls, drop, central, pages);
            }
            let list = &mut self.lists[cls];
            list.lowater = list.len();
        }

        let max_size = self.max_size();
        while self.size > max_size {
            let biggest = (1..self.lists.len())
                .filter(|&cls| self.lists[cls].len() > 0)
                .max_by_key(|&cls| self.lists[cls].len() * self.sizes.byte_size(cls));
            let Some(cls) = biggest else { break };
            let half = self.lists[cls].len().div_ceil(2);
            self.release_to_central(cls, half, central, pages);
            let list = &mut self.lists[cls];
            list.lowater = list.lowater.min(list.len());
        }
        self.publish();
    }

    /// Return everything to the central lists.
    pub fn cleanup(&mut self, central: &CentralCache, pages: &SharedPageHeap) {
        for cls in 1..self.lists.len() {
            let len = self.lists[cls].len();
            self.release_to_central(cls, len, central, pages);
            self.lists[cls].lowater = 0;
        }
        debug_assert_eq!(self.size, 0);
        self.publish();
    }
}

/// Live thread caches of one heap and their shared budget.
pub struct ThreadRegistry {
    entries: SpinMutex<Vec<Arc<ThreadCacheStats>>>,
    budget: Arc<AtomicUsize>,
    overall: usize,
    min: usize,
    max: usize,
}

impl ThreadRegistry {
    pub fn new(config: &Config) -> Self {
        let registry = Self {
            entries: SpinMutex::new(Vec::new()),
            budget: Arc::new(AtomicUsize::new(0)),
            overall: config.overall_thread_cache_bytes,
            min: config.min_thread_cache_bytes,
            max: config.max_thread_cache_bytes,
        };
        registry.recompute(0);
        registry
    }

    fn recompute(&self, live: usize) {
        let share = (self.overall / live.max(1)).clamp(self.min, self.max);
        self.budget.store(share, Ordering::Relaxed);
    }

    /// Add a cache for `thread`. Returns its stats record and the shared
    /// budget cell.
    pub fn register(&self, thread: ThreadId) -> (Arc<ThreadCacheStats>, Arc<AtomicUsize>) {
        let stats = Arc::new(ThreadCacheStats {
            thread,
            cached_bytes: AtomicUsize::new(0),
        });
        let mut entries = self.entries.lock();
        entries.push(Arc::clone(&stats));
        self.recompute(entries.len());
        (stats, Arc::clone(&self.budget))
    }

    pub fn unregister(&self, stats: &Arc<ThreadCacheStats>) {
        let mut entries = self.entries.lock();
        entries.retain(|e| !Arc::ptr_eq(e, stats));
        self.recompute(entries.len());
    }

    pub fn per_thread_budget(&self) -> usize {
        self.budget.load(Ordering::Relaxed)
    }

    pub fn live(&self) -> usize {
        self.entries.lock().len()
    }

    /// Bytes held by all thread caches, as last published.
    pub fn cached_bytes(&self) -> usize {
        self.entries.lock().iter().map(|e| e.cached_bytes()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardening::Unmasked;
    use crate::platform::OsMemory;
    use crate::scavenger::ScavengerWake;

    fn make_test_env(config: &Config) -> (CentralCache, SharedPageHeap, ThreadRegistry) {
        let sizes = SizeClassTable::global();
        let pages = SharedPageHeap::new(Arc::new(OsMemory), Arc::new(ScavengerWake::new()), 0, 0.5);
        (
            CentralCache::new(sizes, Arc::new(Unmasked)),
            pages,
            ThreadRegistry::new(config),
        )
    }

    fn make_cache(config: &Config, registry: &ThreadRegistry) -> ThreadCache {
        let (stats, budget) = registry.register(std::thread::current().id());
        ThreadCache::new(
            SizeClassTable::global(),
            config.max_free_list_length,
            config.hardening,
            budget,
            stats,
        )
    }

    #[test]
    fn test_allocate_and_deallocate() {
        let config = Config::default();
        let (central, pages, registry) = make_test_env(&config);
        let mut tc = make_cache(&config, &registry);

        let obj = tc.allocate(1, &central, &pages).unwrap();
        assert_ne!(obj, 0);
        tc.deallocate(obj, 1, &central, &pages);
        tc.cleanup(&central, &pages);
        central.check().unwrap();
    }

    #[test]
    fn test_reuse_from_cache() {
        let config = Config::default();
        let (central, pages, registry) = make_test_env(&config);
        let mut tc = make_cache(&config, &registry);

        // Allocate and free to populate thread cache
        let a = tc.allocate(2, &central, &pages).unwrap();
        tc.deallocate(a, 2, &central, &pages);
        // Next allocation should come from thread cache (same object)
        let b = tc.allocate(2, &central, &pages).unwrap();
        assert_eq!(a, b);
        tc.deallocate(b, 2, &central, &pages);
    }

    #[test]
    fn test_allocate_many_distinct() {
        let config = Config::default();
        let (central, pages, registry) = make_test_env(&config);
        let mut tc = make_cache(&config, &registry);
        let cls = SizeClassTable::global().classify(32);

        let mut objs: Vec<usize> = (0..1000)
            .map(|_| tc.allocate(cls, &central, &pages).unwrap())
            .collect();
        objs.sort_unstable();
        objs.dedup();
        assert_eq!(objs.len(), 1000);

        for obj in objs {
            tc.deallocate(obj, cls, &central, &pages);
        }
        // Long lists drain batches as they grow.
        assert!(tc.list_len(cls) <= config.max_free_list_length);
        tc.cleanup(&central, &pages);
        assert_eq!(tc.size(), 0);
        central.check().unwrap();
    }

    #[test]
    fn test_mixed_sizes() {
        let config = Config::default();
        let (central, pages, registry) = make_test_env(&config);
        let mut tc = make_cache(&config, &registry);

        let mut allocs: Vec<(usize, usize)> = Vec::new();
        for cls in [1, 4, 8, 12, 16, 20, 24] {
            for _ in 0..50 {
                allocs.push((cls, tc.allocate(cls, &central, &pages).unwrap()));
            }
        }
        for (cls, obj) in allocs {
            tc.deallocate(obj, cls, &central, &pages);
        }
        tc.cleanup(&central, &pages);
        central.check().unwrap();
    }

    #[test]
    fn test_cache_bound_after_scavenge() {
        let config = Config::builder()
            .overall_thread_cache_bytes(256 * 1024)
            .min_thread_cache_bytes(64 * 1024)
            .max_thread_cache_bytes(128 * 1024)
            .build()
            .unwrap();
        let (central, pages, registry) = make_test_env(&config);
        let mut tc = make_cache(&config, &registry);
        assert_eq!(tc.max_size(), 128 * 1024);

        let sizes = SizeClassTable::global();
        let cls = sizes.classify(4096);
        let objs: Vec<usize> = (0..64)
            .map(|_| tc.allocate(cls, &central, &pages).unwrap())
            .collect();
        for obj in objs {
            tc.deallocate(obj, cls, &central, &pages);
            assert!(tc.size() <= tc.max_size());
        }
        tc.scavenge(&central, &pages);
        assert!(tc.size() <= tc.max_size());
        tc.cleanup(&central, &pages);
    }

    #[test]
    fn test_scavenge_trims_by_low_water() {
        let config = Config::default();
        let (central, pages, registry) = make_test_env(&config);
        let mut tc = make_cache(&config, &registry);
        let cls = SizeClassTable::global().classify(64);

        let obj = tc.allocate(cls, &central, &pages).unwrap();
        tc.deallocate(obj, cls, &central, &pages);
        let before = tc.list_len(cls);
        assert!(before > 1);

        // First pass only records the low-water mark.
        tc.scavenge(&central, &pages);
        // Nothing was taken since, so half of the idle list goes.
        tc.scavenge(&central, &pages);
        assert_eq!(tc.list_len(cls), before - before / 2);
    }

    #[test]
    fn test_registry_budget_recomputed() {
        let config = Config::builder()
            .overall_thread_cache_bytes(4 << 20)
            .min_thread_cache_bytes(256 << 10)
            .max_thread_cache_bytes(2 << 20)
            .build()
            .unwrap();
        let registry = ThreadRegistry::new(&config);
        assert_eq!(registry.per_thread_budget(), 2 << 20);

        let id = std::thread::current().id();
        let handles: Vec<_> = (0..8).map(|_| registry.register(id).0).collect();
        assert_eq!(registry.live(), 8);
        assert_eq!(registry.per_thread_budget(), 512 << 10);

        for h in &handles[..7] {
            registry.unregister(h);
        }
        assert_eq!(registry.live(), 1);
        assert_eq!(registry.per_thread_budget(), 2 << 20);
        registry.unregister(&handles[7]);
        assert_eq!(registry.live(), 0);
    }
}
