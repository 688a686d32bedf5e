//! tcalloc: a thread-caching, size-class based memory allocator.
//!
//! Implements the tcmalloc architecture with three tiers:
//! - Thread-local caches (fast path, no locks)
//! - Central free lists (per-size-class locking)
//! - Page heap (span management, OS interface)
//!
//! plus a background scavenger that hands idle pages back to the OS.
//!
//! All state lives in a [`Heap`], so several isolated allocators can exist in
//! one process. Object memory comes straight from the OS; allocator metadata
//! comes from [`std::alloc::System`] whenever the heap is the global
//! allocator.
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: tcalloc::TcAlloc = tcalloc::TcAlloc;
//! ```
//!
//! or, for a private heap:
//!
//! ```ignore
//! let heap = tcalloc::Heap::new(tcalloc::Config::default());
//! let p = heap.allocate(64);
//! unsafe { heap.free(p.as_ptr()) };
//! ```

pub mod allocator;
pub mod central_free_list;
pub mod config;
pub mod error;
#[cfg(feature = "ffi")]
pub mod ffi;
pub mod hardening;
pub mod page_heap;
pub mod pagemap;
pub mod platform;
pub mod scavenger;
pub mod size_class;
pub mod span;
pub mod sync;
pub mod thread_cache;
pub mod transfer_cache;

/// Page size used by the allocator (8 KiB).
pub const PAGE_SHIFT: usize = 13;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

pub use allocator::{Heap, Statistics, TcAlloc, allow, forbid, global, is_forbidden};
pub use config::Config;
pub use error::{AllocError, ConfigError, HeapViolation};
