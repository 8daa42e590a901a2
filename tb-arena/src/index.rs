use std::collections::BTreeMap;
use std::sync::Mutex;

use tb_core::TbId;

/// Host-code-pointer → TB index, consulted by fault handlers that only
/// have a raw host PC and need to know which block it falls inside.
/// A `BTreeMap` keyed by the block's starting arena offset gives an
/// O(log n) "largest key <= host_pc" query via `range(..=host_pc).next_back()`.
#[derive(Default)]
pub struct ArenaTbIndex {
    by_start: Mutex<BTreeMap<usize, (TbId, usize)>>,
}

impl ArenaTbIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, start: usize, len: usize, tb: TbId) {
        self.by_start.lock().unwrap().insert(start, (tb, len));
    }

    pub fn remove(&self, start: usize) {
        self.by_start.lock().unwrap().remove(&start);
    }

    /// Find the TB whose `[start, start+len)` contains `host_pc`.
    pub fn lookup(&self, host_pc: usize) -> Option<TbId> {
        let map = self.by_start.lock().unwrap();
        let (&start, &(tb, len)) = map.range(..=host_pc).next_back()?;
        if host_pc < start + len {
            Some(tb)
        } else {
            None
        }
    }

    /// # Safety
    /// Caller must hold the flush lock and guarantee every entry here
    /// refers to arena memory that is about to be reclaimed.
    pub unsafe fn clear(&self) {
        self.by_start.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_the_containing_block() {
        let idx = ArenaTbIndex::new();
        idx.insert(0x1000, 0x40, TbId(1));
        idx.insert(0x2000, 0x40, TbId(2));
        assert_eq!(idx.lookup(0x1010), Some(TbId(1)));
        assert_eq!(idx.lookup(0x2030), Some(TbId(2)));
        assert_eq!(idx.lookup(0x1500), None);
    }
}
