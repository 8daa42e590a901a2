//! TB storage and the concurrent fingerprint hash table.
//!
//! Storage follows the same lock-free-read / mutex-write split the
//! rest of this workspace uses for hot paths: TBs are appended to a
//! pre-sized `Vec` under `UnsafeCell`, with an `AtomicUsize` length
//! published with `Release` once a new entry is fully initialized so
//! `Acquire` readers never observe a partially-written TB. The hash
//! table itself is lock-striped across a fixed number of shards so
//! insert/remove/lookup on unrelated fingerprints don't contend.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tb_core::tagged::{PageSlot, TaggedLink};
use tb_core::{Fingerprint, TbId, TbPageLinks, TranslationBlock};

/// Hard cap on live TBs; storage is preallocated to this size so the
/// backing `Vec` never reallocates (which would invalidate indices
/// concurrent readers might be holding).
const MAX_TBS: usize = 1 << 18;

/// Number of lock stripes the hash table is split across.
const NUM_SHARDS: usize = 256;
const BUCKETS_PER_SHARD: usize = tb_core::fingerprint::TB_HASH_SIZE / NUM_SHARDS;

/// Outcome of inserting a freshly-built TB.
pub enum InsertOutcome {
    /// This TB is now the one reachable for its fingerprint.
    Inserted,
    /// Another thread already published a TB with the same fingerprint
    /// first; callers must discard their own and use this one (rolling
    /// back whatever arena space and page-list entries they already
    /// created for the loser).
    LostRace(TbId),
}

pub struct TbTable {
    tbs: UnsafeCell<Vec<TranslationBlock>>,
    len: AtomicUsize,
    shards: Vec<Mutex<Vec<Option<TbId>>>>,
}

// SAFETY: `tbs` is only ever appended to (never reallocated past
// capacity, never removed from) under the shard mutex that corresponds
// to the new entry's fingerprint bucket, and `len` publishes each
// append with `Release`; readers use `Acquire` and only ever index
// `< len`, which is always fully initialized.
unsafe impl Sync for TbTable {}
unsafe impl Send for TbTable {}

impl TbTable {
    pub fn new() -> Self {
        let mut v = Vec::with_capacity(MAX_TBS);
        v.clear();
        let shards = (0..NUM_SHARDS)
            .map(|_| Mutex::new(vec![None; BUCKETS_PER_SHARD]))
            .collect();
        Self {
            tbs: UnsafeCell::new(v),
            len: AtomicUsize::new(0),
            shards,
        }
    }

    fn shard_and_local(bucket: usize) -> (usize, usize) {
        (bucket % NUM_SHARDS, bucket / NUM_SHARDS)
    }

    /// Allocate storage for a new TB. The table itself does not
    /// serialize allocation beyond the atomic append below — callers
    /// translating concurrently still need the generation-level
    /// translate lock the driver holds for code emission, but two
    /// allocations racing here merely get distinct indices.
    ///
    /// # Safety
    /// Caller must ensure no other thread is appending concurrently
    /// (i.e. holds whatever external translate-serialization this
    /// workspace's driver uses).
    pub unsafe fn alloc(&self, tb: TranslationBlock) -> TbId {
        let tbs = &mut *self.tbs.get();
        let idx = tbs.len();
        assert!(idx < MAX_TBS, "TB table full");
        tbs.push(tb);
        self.len.store(tbs.len(), Ordering::Release);
        TbId(idx as u32)
    }

    pub fn get(&self, id: TbId) -> &TranslationBlock {
        let len = self.len.load(Ordering::Acquire);
        assert!(id.index() < len, "TbId out of bounds");
        // SAFETY: id.index() < len, and that entry was fully written
        // before len was published.
        unsafe { &(&*self.tbs.get())[id.index()] }
    }

    /// # Safety
    /// Caller must ensure exclusive access to this TB's mutable fields
    /// (e.g. holds the translate lock for immutable-after-publish
    /// fields, or the TB's own `jmp` mutex for jump-graph fields).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, id: TbId) -> &mut TranslationBlock {
        let len = self.len.load(Ordering::Acquire);
        assert!(id.index() < len, "TbId out of bounds");
        &mut (&mut *self.tbs.get())[id.index()]
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a live TB by fingerprint.
    pub fn lookup(&self, fp: &Fingerprint) -> Option<TbId> {
        let bucket = fp.bucket();
        let (shard, local) = Self::shard_and_local(bucket);
        let chain = self.shards[shard].lock().unwrap();
        let mut cur = chain[local];
        drop(chain);
        while let Some(id) = cur {
            let tb = self.get(id);
            if !tb.is_invalid() && tb.fingerprint() == *fp {
                return Some(id);
            }
            cur = tb.hash_next;
        }
        None
    }

    /// Insert `tb` into the hash table under its own fingerprint,
    /// atomically against concurrent inserts of the same fingerprint.
    ///
    /// # Safety
    /// Caller must hold whatever external serialization protects
    /// `hash_next` writes (the translate lock).
    pub unsafe fn insert(&self, tb: TbId) -> InsertOutcome {
        let fp = self.get(tb).fingerprint();
        let bucket = fp.bucket();
        let (shard, local) = Self::shard_and_local(bucket);
        let mut chain = self.shards[shard].lock().unwrap();

        let mut cur = chain[local];
        while let Some(id) = cur {
            let existing = self.get(id);
            if !existing.is_invalid() && existing.fingerprint() == fp {
                return InsertOutcome::LostRace(id);
            }
            cur = existing.hash_next;
        }

        self.get_mut(tb).hash_next = chain[local];
        chain[local] = Some(tb);
        InsertOutcome::Inserted
    }

    /// Remove `tb` from the hash table. Returns `false` if it was
    /// already gone (a concurrent invalidation finished first) so the
    /// caller can treat its own invalidation as already-complete.
    pub fn remove(&self, tb: TbId) -> bool {
        let fp = self.get(tb).fingerprint();
        let bucket = fp.bucket();
        let (shard, local) = Self::shard_and_local(bucket);
        let mut chain = self.shards[shard].lock().unwrap();

        let mut prev: Option<TbId> = None;
        let mut cur = chain[local];
        while let Some(id) = cur {
            if id == tb {
                let next = self.get(id).hash_next;
                match prev {
                    // SAFETY: hash_next is only mutated here, under
                    // this shard's lock.
                    Some(p) => unsafe { self.get_mut(p).hash_next = next },
                    None => chain[local] = next,
                }
                // SAFETY: see above.
                unsafe { self.get_mut(id).hash_next = None };
                return true;
            }
            prev = cur;
            cur = self.get(id).hash_next;
        }
        false
    }

    /// Drop every TB and empty every shard. Storage capacity is kept
    /// so future allocation never reallocates.
    ///
    /// # Safety
    /// Caller must guarantee no other thread holds a `TbId` it intends
    /// to dereference past this call (the exclusive-context flush
    /// requirement).
    pub unsafe fn flush(&self) {
        let tbs = &mut *self.tbs.get();
        tbs.clear();
        self.len.store(0, Ordering::Release);
        for shard in &self.shards {
            shard.lock().unwrap().iter_mut().for_each(|e| *e = None);
        }
    }
}

impl Default for TbTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TbPageLinks for TbTable {
    fn page_addr(&self, id: TbId, slot: PageSlot) -> Option<u64> {
        self.get(id).page_addr[slot.0 as usize]
    }

    fn page_next(&self, id: TbId, slot: PageSlot) -> TaggedLink {
        self.get(id).page_next[slot.0 as usize]
    }

    fn set_page_next(&self, id: TbId, slot: PageSlot, next: TaggedLink) {
        // SAFETY: page_next writes are always made under the owning
        // page's lock, which serializes every caller that could touch
        // this slot concurrently.
        unsafe { self.get_mut(id).page_next[slot.0 as usize] = next };
    }

    fn mark_invalid(&self, id: TbId) {
        self.get(id).mark_invalid();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(pc: u64) -> Fingerprint {
        Fingerprint {
            phys_pc_0: pc,
            guest_pc: pc,
            flags: 0,
            cflags_hash_mask: 0,
            trace_mask: 0,
            phys_page_0: pc & !0xfff,
            phys_page_1: None,
        }
    }

    fn tb_with(pc: u64) -> TranslationBlock {
        let mut tb = TranslationBlock::new(pc, 0, 0, 0, 0);
        tb.phys_pc = pc;
        tb.page_addr[0] = Some(pc & !0xfff);
        tb
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let table = TbTable::new();
        // SAFETY: single-threaded test.
        let id = unsafe { table.alloc(tb_with(0x1000)) };
        // SAFETY: single-threaded test.
        assert!(matches!(unsafe { table.insert(id) }, InsertOutcome::Inserted));
        assert_eq!(table.lookup(&fp(0x1000)), Some(id));
    }

    #[test]
    fn second_insert_of_same_fingerprint_loses_the_race() {
        let table = TbTable::new();
        // SAFETY: single-threaded test.
        let a = unsafe { table.alloc(tb_with(0x2000)) };
        let b = unsafe { table.alloc(tb_with(0x2000)) };
        assert!(matches!(unsafe { table.insert(a) }, InsertOutcome::Inserted));
        match unsafe { table.insert(b) } {
            InsertOutcome::LostRace(winner) => assert_eq!(winner, a),
            InsertOutcome::Inserted => panic!("expected a race loss"),
        }
    }

    #[test]
    fn remove_is_idempotent() {
        let table = TbTable::new();
        let id = unsafe { table.alloc(tb_with(0x3000)) };
        unsafe { table.insert(id) };
        assert!(table.remove(id));
        assert!(!table.remove(id));
        assert_eq!(table.lookup(&fp(0x3000)), None);
    }

    #[test]
    fn flush_empties_everything() {
        let table = TbTable::new();
        let id = unsafe { table.alloc(tb_with(0x4000)) };
        unsafe { table.insert(id) };
        unsafe { table.flush() };
        assert!(table.is_empty());
        assert_eq!(table.lookup(&fp(0x4000)), None);
    }
}
