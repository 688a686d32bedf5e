//! Size class table and lookup functions.
//!
//! Objects are bucketed into size classes to reduce fragmentation and enable
//! free list management. The table covers sizes from 8 bytes up to 32 KiB and
//! is computed once, at first use, from the alignment schedule below.

use crate::error::{HeapViolation, fatal};
use crate::{PAGE_SHIFT, PAGE_SIZE};
use once_cell::sync::Lazy;

/// Information about a single size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClassInfo {
    /// Allocation size for this class (bytes). All allocations in this class
    /// are rounded up to this size.
    pub size: usize,
    /// Number of pages per span for this class.
    pub pages: usize,
    /// Number of objects to transfer between thread cache and central cache at once.
    pub batch_size: usize,
}

impl SizeClassInfo {
    pub const fn objects_per_span(&self) -> usize {
        (self.pages * PAGE_SIZE) / self.size
    }
}

/// Maximum allocation size that goes through size classes.
/// Anything larger is a "large" allocation handled directly by the page heap.
pub const MAX_SMALL_SIZE: usize = 32 * 1024;

/// Sizes up to here are looked up with 8-byte granularity, above with 128.
const MAX_FINE_SIZE: usize = 1024;

const ALIGN_SHIFT: u32 = 3;
const ALIGNMENT: usize = 1 << ALIGN_SHIFT;
/// Alignment stops growing at 256 bytes.
const MAX_ALIGN_SHIFT: u32 = 8;

/// Target bytes moved per batch between thread and central caches.
const BATCH_BYTES: usize = 64 * 1024;
const MIN_BATCH: usize = 2;
const MAX_BATCH: usize = 32;

const CLASS_ARRAY_LEN: usize = class_index(MAX_SMALL_SIZE) + 1;

/// Flattened index into the class array: `ceil(s / 8)` for small sizes,
/// `ceil(s / 128)` shifted past them for larger ones.
#[inline]
const fn class_index(size: usize) -> usize {
    if size <= MAX_FINE_SIZE {
        (size + 7) >> 3
    } else {
        (size + 127 + (120 << 7)) >> 7
    }
}

fn batch_size_for(size: usize) -> usize {
    (BATCH_BYTES / size).clamp(MIN_BATCH, MAX_BATCH)
}

/// The computed table. Index 0 is the sentinel for page-level objects.
#[derive(Debug)]
pub struct SizeClassTable {
    classes: Vec<SizeClassInfo>,
    class_array: Vec<u8>,
}

static TABLE: Lazy<SizeClassTable> = Lazy::new(|| match SizeClassTable::build() {
    Ok(table) => table,
    Err(violation) => fatal(violation),
});

impl SizeClassTable {
    /// The process-wide table, built on first access.
    pub fn global() -> &'static SizeClassTable {
        &TABLE
    }

    /// Compute the classes and verify them.
    pub fn build() -> Result<SizeClassTable, HeapViolation> {
        let mut classes = vec![SizeClassInfo {
            size: 0,
            pages: 0,
            batch_size: 0,
        }];

        let mut align_shift = ALIGN_SHIFT;
        let mut last_lg = 0u32;
        let mut size = ALIGNMENT;
        while size <= MAX_SMALL_SIZE {
            let lg = size.ilog2();
            if lg > last_lg {
                // Doubling the alignment with the size from 128 bytes on
                // keeps rounding waste at or below 16/128.
                if lg >= 7 && align_shift < MAX_ALIGN_SHIFT {
                    align_shift += 1;
                }
                last_lg = lg;
            }

            // Enough pages that the tail left after carving is at most 1/8.
            let mut span_bytes = PAGE_SIZE;
            while span_bytes % size > span_bytes >> 3 {
                span_bytes += PAGE_SIZE;
            }
            let pages = span_bytes >> PAGE_SHIFT;

            let prev = classes[classes.len() - 1];
            if classes.len() > 1
                && prev.pages == pages
                && (pages << PAGE_SHIFT) / size == (prev.pages << PAGE_SHIFT) / prev.size
            {
                // Same span shape: widen the previous class instead.
                let last = classes.len() - 1;
                classes[last].size = size;
                classes[last].batch_size = batch_size_for(size);
            } else {
                classes.push(SizeClassInfo {
                    size,
                    pages,
                    batch_size: batch_size_for(size),
                });
            }

            size += 1 << align_shift;
        }

        if classes.len() > u8::MAX as usize {
            return Err(HeapViolation::SizeClassTable(format!(
                "{} classes do not fit the u8 class array",
                classes.len()
            )));
        }

        let mut class_array = vec![0u8; CLASS_ARRAY_LEN];
        let mut next_size = 0;
        for (cls, info) in classes.iter().enumerate().skip(1) {
            let mut s = next_size;
            while s <= info.size {
                class_array[class_index(s)] = cls as u8;
                s += ALIGNMENT;
            }
            next_size = info.size + ALIGNMENT;
        }

        let table = SizeClassTable {
            classes,
            class_array,
        };
        table.verify()?;
        Ok(table)
    }

    /// Every size maps to the smallest class that holds it.
    fn verify(&self) -> Result<(), HeapViolation> {
        for size in 0..=MAX_SMALL_SIZE {
            let cls = self.class_array[class_index(size)] as usize;
            if cls == 0 || cls >= self.classes.len() {
                return Err(HeapViolation::SizeClassTable(format!(
                    "bad class {cls} for size {size}"
                )));
            }
            if cls > 1 && size <= self.classes[cls - 1].size {
                return Err(HeapViolation::SizeClassTable(format!(
                    "size {size} given class {cls} though class {} fits",
                    cls - 1
                )));
            }
            if self.classes[cls].size < size {
                return Err(HeapViolation::SizeClassTable(format!(
                    "class {cls} ({} bytes) too small for size {size}",
                    self.classes[cls].size
                )));
            }
        }
        for (cls, info) in self.classes.iter().enumerate().skip(1) {
            if info.objects_per_span() == 0 || info.batch_size == 0 {
                return Err(HeapViolation::SizeClassTable(format!(
                    "class {cls} has an empty span or batch"
                )));
            }
        }
        Ok(())
    }

    /// Number of classes including the sentinel.
    #[inline]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.classes.len() <= 1
    }

    /// Map an allocation size to its class. Size 0 maps to the smallest
    /// class, sizes above [`MAX_SMALL_SIZE`] to the page-level class 0.
    #[inline]
    pub fn classify(&self, size: usize) -> usize {
        if size > MAX_SMALL_SIZE {
            return 0;
        }
        self.class_array[class_index(size)] as usize
    }

    #[inline]
    pub fn byte_size(&self, cls: usize) -> usize {
        self.classes[cls].size
    }

    #[inline]
    pub fn pages_per_span(&self, cls: usize) -> usize {
        self.classes[cls].pages
    }

    #[inline]
    pub fn batch_size(&self, cls: usize) -> usize {
        self.classes[cls].batch_size
    }

    #[inline]
    pub fn info(&self, cls: usize) -> &SizeClassInfo {
        &self.classes[cls]
    }
}

/// Map an allocation size to its size class index in the global table.
#[inline]
pub fn size_to_class(size: usize) -> usize {
    TABLE.classify(size)
}

/// Get the allocation size for a given size class.
#[inline]
pub fn class_to_size(cls: usize) -> usize {
    TABLE.byte_size(cls)
}

/// Get the size class info for a given class index.
#[inline]
pub fn class_info(cls: usize) -> &'static SizeClassInfo {
    TABLE.info(cls)
}

/// Number of size classes, sentinel included.
#[inline]
pub fn num_size_classes() -> usize {
    TABLE.len()
}
