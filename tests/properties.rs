//! Property-based tests for size classification and heap bookkeeping.

use proptest::prelude::*;
use tcalloc::size_class::{MAX_SMALL_SIZE, SizeClassTable};
use tcalloc::{Config, Heap, PAGE_SIZE};

fn small_size() -> impl Strategy<Value = usize> {
    0usize..=MAX_SMALL_SIZE
}

/// Mixture of tiny, small and multi-page requests.
fn request_size() -> impl Strategy<Value = usize> {
    prop_oneof![
        4 => 1usize..=256,
        3 => 257usize..=MAX_SMALL_SIZE,
        1 => (MAX_SMALL_SIZE + 1)..=(64 * PAGE_SIZE),
    ]
}

fn test_heap() -> Heap {
    Heap::new(
        Config::builder()
            .background_scavenger(false)
            .build()
            .unwrap(),
    )
}

proptest! {
    /// The chosen class fits the request and no smaller class would.
    #[test]
    fn classify_picks_smallest_fitting_class(size in small_size()) {
        let table = SizeClassTable::global();
        let cls = table.classify(size);
        prop_assert!(cls >= 1);
        prop_assert!(table.byte_size(cls) >= size);
        if cls > 1 {
            prop_assert!(table.byte_size(cls - 1) < size);
        }
    }

    /// Bigger requests never land in a smaller class.
    #[test]
    fn classify_is_monotonic(a in small_size(), b in small_size()) {
        let table = SizeClassTable::global();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(table.classify(lo) <= table.classify(hi));
    }

    /// Live blocks never overlap.
    #[test]
    fn live_blocks_are_disjoint(sizes in prop::collection::vec(request_size(), 1..200)) {
        let heap = test_heap();
        let mut blocks: Vec<(usize, usize)> = sizes
            .iter()
            .map(|&size| {
                let p = heap.allocate(size);
                (p.as_ptr() as usize, heap.usable_size(p.as_ptr()))
            })
            .collect();
        for (&(_, usable), &size) in blocks.iter().zip(&sizes) {
            prop_assert!(usable >= size);
        }

        blocks.sort_unstable();
        for pair in blocks.windows(2) {
            let (a, a_len) = pair[0];
            let (b, _) = pair[1];
            prop_assert!(a + a_len <= b, "{:#x}+{} overlaps {:#x}", a, a_len, b);
        }
        for (addr, _) in blocks {
            unsafe { heap.free(addr as *mut u8) };
        }
        heap.thread_exit();
        prop_assert!(heap.verify().is_ok());
    }

    /// Freeing everything in any order gives every reserved page back to
    /// the page heap.
    #[test]
    fn free_in_any_order_coalesces(
        sizes in prop::collection::vec(request_size(), 1..100),
        order in any::<prop::sample::Index>(),
    ) {
        let heap = test_heap();
        let mut ptrs: Vec<_> = sizes.iter().map(|&s| heap.allocate(s)).collect();
        let pivot = order.index(ptrs.len());
        ptrs.rotate_left(pivot);
        for (i, p) in ptrs.iter().enumerate() {
            if i % 2 == 0 {
                unsafe { heap.free(p.as_ptr()) };
            }
        }
        prop_assert!(heap.verify().is_ok());
        for (i, p) in ptrs.iter().enumerate() {
            if i % 2 == 1 {
                unsafe { heap.free(p.as_ptr()) };
            }
        }
        heap.thread_exit();
        prop_assert!(heap.verify().is_ok());

        heap.release_free_memory();
        let stats = heap.statistics();
        let pages = heap.page_heap_stats();
        prop_assert_eq!(stats.free_list_bytes, 0);
        prop_assert_eq!(pages.free_bytes, pages.system_bytes);
        prop_assert_eq!(pages.system_bytes, stats.reserved_bytes);
        prop_assert!(stats.committed_bytes <= stats.reserved_bytes);
        prop_assert!(heap.verify().is_ok());
    }
}
