//! Error types.
//!
//! Two families: [`AllocError`] is returned to callers that can recover
//! (the `try_` entry points), [`HeapViolation`] describes conditions after
//! which the heap can no longer be trusted and is always fed to [`fatal`].

use crate::span::SpanId;
use thiserror::Error;

/// Recoverable allocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The OS refused to map more memory, even after the reduced retry.
    #[error("out of memory: could not obtain {requested} bytes")]
    OutOfMemory { requested: usize },
    /// `count * size` does not fit in `usize`.
    #[error("allocation size overflow: {count} elements of {size} bytes")]
    SizeOverflow { count: usize, size: usize },
}

/// Rejected [`Config`](crate::Config) values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("minimum thread cache size {min} exceeds maximum {max}")]
    ThreadCacheBounds { min: usize, max: usize },
    #[error("scavenge percentage {0} is outside [0, 1]")]
    ScavengePercentage(f64),
    #[error("free list length cap must be at least 1")]
    FreeListLength,
    #[error("invalid value {value:?} for {name}")]
    Env { name: &'static str, value: String },
}

/// Broken heap invariants and caller misuse. Never recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapViolation {
    #[error("pointer {addr:#x} was not allocated by this heap")]
    NotOwned { addr: usize },
    #[error("double free of {addr:#x}")]
    DoubleFree { addr: usize },
    #[error("corrupted free list in span {span:?}: slot word {stored:#x}")]
    CorruptFreeList { span: SpanId, stored: u32 },
    #[error("allocation attempted while allocation is forbidden on this thread")]
    AllocationForbidden,
    #[error("size class table: {0}")]
    SizeClassTable(String),
    #[error("span bookkeeping: {0}")]
    SpanBookkeeping(String),
    #[error("central free list for class {class}: {detail}")]
    CentralList { class: usize, detail: String },
    #[error("unrecoverable allocation failure: {0}")]
    Exhausted(AllocError),
}

/// Print a diagnostic and abort the process.
#[cold]
#[inline(never)]
pub fn fatal(violation: HeapViolation) -> ! {
    log::error!("tcalloc: fatal: {violation}");
    eprintln!("tcalloc: fatal: {violation}");
    std::process::abort()
}
