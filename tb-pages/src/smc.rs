use std::sync::atomic::{AtomicU32, Ordering};

/// Number of writes to a page without an SMC bitmap before one is
/// lazily built. Below this threshold a plain-range-overlap check
/// against the page's TB list is cheaper than maintaining a bitmap.
pub const SMC_BUILD_THRESHOLD: u32 = 10;

/// One bit per guest byte in a page, set wherever some TB's compiled
/// range covers that byte. A write that only touches clear bits can
/// skip invalidation entirely.
pub struct SmcBitmap {
    words: Vec<u64>,
}

impl SmcBitmap {
    pub fn new(page_bytes: usize) -> Self {
        let words = (page_bytes + 63) / 64;
        Self {
            words: vec![0u64; words],
        }
    }

    #[inline]
    fn split(bit: usize) -> (usize, u64) {
        (bit / 64, 1u64 << (bit % 64))
    }

    pub fn set_range(&mut self, start: usize, len: usize) {
        for bit in start..start + len {
            let (w, mask) = Self::split(bit);
            self.words[w] |= mask;
        }
    }

    /// `true` if any byte in `[start, start+len)` is covered by code.
    pub fn test_range(&self, start: usize, len: usize) -> bool {
        for bit in start..start + len {
            let (w, mask) = Self::split(bit);
            if self.words[w] & mask != 0 {
                return true;
            }
        }
        false
    }
}

/// Write-count threshold counter deciding when a page earns a bitmap.
#[derive(Default)]
pub struct SmcWriteCount(AtomicU32);

impl SmcWriteCount {
    pub fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_covered_bytes() {
        let mut bm = SmcBitmap::new(4096);
        assert!(!bm.test_range(100, 8));
        bm.set_range(100, 8);
        assert!(bm.test_range(100, 8));
        assert!(bm.test_range(104, 1));
        assert!(!bm.test_range(200, 8));
    }

    #[test]
    fn write_count_reaches_threshold() {
        let wc = SmcWriteCount::default();
        let mut last = 0;
        for _ in 0..SMC_BUILD_THRESHOLD {
            last = wc.bump();
        }
        assert_eq!(last, SMC_BUILD_THRESHOLD);
    }
}
