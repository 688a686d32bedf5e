//! Free list hardening.
//!
//! Span free lists store slot indices rather than pointers. A [`SlotMask`]
//! encodes each index before it is written and decodes it on the way out, so
//! a stray write into metadata decodes to an out-of-range slot and is caught
//! instead of being followed.

use core::fmt::Debug;
use std::time::{SystemTime, UNIX_EPOCH};

pub trait SlotMask: Send + Sync + Debug {
    /// Encode `slot` for storage in the free list of `span`.
    fn mask(&self, slot: u32, span: usize) -> u32;

    /// Inverse of [`SlotMask::mask`].
    fn unmask(&self, stored: u32, span: usize) -> u32;
}

/// Stores indices as they are.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unmasked;

impl SlotMask for Unmasked {
    #[inline]
    fn mask(&self, slot: u32, _span: usize) -> u32 {
        slot
    }

    #[inline]
    fn unmask(&self, stored: u32, _span: usize) -> u32 {
        stored
    }
}

/// XORs each index with a per-heap random key mixed with the span id.
#[derive(Debug, Clone, Copy)]
pub struct XorMask {
    key: u32,
}

impl XorMask {
    pub fn new(key: u32) -> Self {
        Self { key: key.max(1) }
    }

    /// Key drawn from the clock and the stack address.
    pub fn random() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let local = 0u8;
        let addr = &local as *const u8 as u64;
        let mut x = nanos ^ addr.rotate_left(29) ^ 0x9E37_79B9_7F4A_7C15;
        // splitmix64 finalizer
        x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        x ^= x >> 31;
        Self::new((x ^ (x >> 32)) as u32)
    }

    #[inline]
    fn key_for(&self, span: usize) -> u32 {
        self.key ^ (span as u32).wrapping_mul(0x9E37_79B9)
    }
}

impl SlotMask for XorMask {
    #[inline]
    fn mask(&self, slot: u32, span: usize) -> u32 {
        slot ^ self.key_for(span)
    }

    #[inline]
    fn unmask(&self, stored: u32, span: usize) -> u32 {
        stored ^ self.key_for(span)
    }
}
