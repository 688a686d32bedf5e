//! Multi-threaded stress tests against a shared heap.

use std::collections::HashSet;
use std::sync::{Arc, Barrier, Mutex, mpsc};
use std::thread;
use tcalloc::{Config, Heap};

fn shared_heap() -> Arc<Heap> {
    Arc::new(Heap::new(
        Config::builder()
            .background_scavenger(false)
            .build()
            .unwrap(),
    ))
}

/// Raw addresses are plain integers so they can cross threads.
#[derive(Clone, Copy)]
struct Block(usize);

impl Block {
    fn ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

const THREADS: usize = 4;
const ALLOCS_PER_THREAD: usize = 25_000;

#[test]
fn test_multithreaded_alloc_disjoint() {
    let heap = shared_heap();
    let live = Arc::new(Mutex::new(HashSet::new()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let heap = Arc::clone(&heap);
            let live = Arc::clone(&live);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let fill = t as u8 + 1;
                let mut mine = Vec::new();
                for i in 0..ALLOCS_PER_THREAD {
                    let p = heap.allocate(16);
                    unsafe { p.as_ptr().write_bytes(fill, 16) };
                    let addr = p.as_ptr() as usize;
                    assert!(live.lock().unwrap().insert(addr), "{addr:#x} handed out twice");
                    mine.push(Block(addr));

                    // Free roughly a third, from varying positions.
                    if i % 3 == 2 {
                        let b = mine.swap_remove((i * 7919) % mine.len());
                        let bytes = unsafe { std::slice::from_raw_parts(b.ptr(), 16) };
                        assert!(bytes.iter().all(|&x| x == fill), "block overwritten");
                        assert!(live.lock().unwrap().remove(&b.0));
                        unsafe { heap.free(b.ptr()) };
                    }
                }
                for b in mine {
                    let bytes = unsafe { std::slice::from_raw_parts(b.ptr(), 16) };
                    assert!(bytes.iter().all(|&x| x == fill), "block overwritten");
                    assert!(live.lock().unwrap().remove(&b.0));
                    unsafe { heap.free(b.ptr()) };
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert!(live.lock().unwrap().is_empty());
    assert_eq!(heap.live_thread_caches(), 0);
    heap.verify().unwrap();
}

#[test]
fn test_cross_thread_free() {
    let heap = shared_heap();
    let (tx, rx) = mpsc::channel::<Vec<Block>>();

    let producer = {
        let heap = Arc::clone(&heap);
        thread::spawn(move || {
            for round in 0..50 {
                let batch: Vec<_> = (0..100)
                    .map(|i| {
                        let size = 8 + (i % 32) * 8;
                        let p = heap.allocate(size);
                        unsafe { p.as_ptr().write_bytes(round as u8, size) };
                        Block(p.as_ptr() as usize)
                    })
                    .collect();
                tx.send(batch).unwrap();
            }
        })
    };

    let consumer = {
        let heap = Arc::clone(&heap);
        thread::spawn(move || {
            for batch in rx {
                for b in batch {
                    unsafe { heap.free(b.ptr()) };
                }
            }
        })
    };

    producer.join().unwrap();
    consumer.join().unwrap();
    assert_eq!(heap.live_thread_caches(), 0);
    heap.verify().unwrap();
}

#[test]
fn test_thread_exit_flushes_cache() {
    let heap = shared_heap();
    let worker = {
        let heap = Arc::clone(&heap);
        thread::spawn(move || {
            let ptrs: Vec<_> = (0..500).map(|_| heap.allocate(96)).collect();
            for p in ptrs {
                unsafe { heap.free(p.as_ptr()) };
            }
            assert_eq!(heap.live_thread_caches(), 1);
            assert!(heap.statistics().free_list_bytes > 0);
        })
    };
    worker.join().unwrap();

    assert_eq!(heap.live_thread_caches(), 0);
    // Everything the worker cached went back to the central lists.
    let stats = heap.statistics();
    assert!(stats.free_list_bytes <= stats.committed_bytes);
    heap.verify().unwrap();
}

#[test]
fn test_budget_follows_live_threads() {
    let config = Config::builder()
        .background_scavenger(false)
        .overall_thread_cache_bytes(8 << 20)
        .min_thread_cache_bytes(256 << 10)
        .max_thread_cache_bytes(4 << 20)
        .build()
        .unwrap();
    let heap = Arc::new(Heap::new(config));
    assert_eq!(heap.thread_cache_budget(), 4 << 20);

    let ready = Arc::new(Barrier::new(5));
    let done = Arc::new(Barrier::new(5));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let heap = Arc::clone(&heap);
            let ready = Arc::clone(&ready);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let p = heap.allocate(32);
                ready.wait();
                done.wait();
                unsafe { heap.free(p.as_ptr()) };
            })
        })
        .collect();

    ready.wait();
    assert_eq!(heap.live_thread_caches(), 4);
    assert_eq!(heap.thread_cache_budget(), 2 << 20);
    done.wait();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(heap.live_thread_caches(), 0);
    assert_eq!(heap.thread_cache_budget(), 4 << 20);
}

#[test]
fn test_arc_shared_heap_many_threads() {
    let heap = shared_heap();
    thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let heap = &*heap;
                s.spawn(move || {
                    let mut held = Vec::new();
                    for i in 0..2000usize {
                        let size = 1 + (i * 37 + t * 11) % 2048;
                        held.push(heap.allocate(size));
                        if i % 3 == 0 {
                            let p = held.swap_remove(i % held.len());
                            unsafe { heap.free(p.as_ptr()) };
                        }
                    }
                    for p in held {
                        unsafe { heap.free(p.as_ptr()) };
                    }
                    heap.thread_exit();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    });
    assert_eq!(heap.live_thread_caches(), 0);
    heap.verify().unwrap();
}

#[test]
fn test_mixed_sizes_multithreaded() {
    let heap = shared_heap();
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                for round in 0..20 {
                    let sizes = [16, 200, 3000, 20_000, 40_000, 300_000];
                    let ptrs: Vec<_> = sizes
                        .iter()
                        .map(|&size| {
                            let p = heap.allocate(size);
                            unsafe { p.as_ptr().write_bytes((t + round) as u8, size) };
                            (p, size)
                        })
                        .collect();
                    for (p, size) in ptrs {
                        assert!(heap.usable_size(p.as_ptr()) >= size);
                        unsafe { heap.free(p.as_ptr()) };
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    heap.release_free_memory();
    heap.verify().unwrap();
}
