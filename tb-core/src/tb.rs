use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::fingerprint::Fingerprint;
use crate::tagged::{PageSlot, TaggedLink, TbId};

/// Compile flags for `TranslationBlock.cflags`.
pub mod cflags {
    /// Mask for the instruction count limit (0 = architectural default).
    pub const CF_COUNT_MASK: u32 = 0x0000_FFFF;
    /// Last I/O instruction in the TB.
    pub const CF_LAST_IO: u32 = 0x0001_0000;
    /// TB is being single-stepped.
    pub const CF_SINGLE_STEP: u32 = 0x0002_0000;
    /// Use icount (deterministic execution).
    pub const CF_USE_ICOUNT: u32 = 0x0004_0000;
    /// One-shot block: never entered into the hash table or any page
    /// list, freed right after its single execution.
    pub const CF_NOCACHE: u32 = 0x0008_0000;
    /// Sticky once set: the block has begun (or finished) invalidation.
    /// Never cleared.
    pub const CF_INVALID: u32 = 0x0010_0000;
}

/// State guarding the incoming side of the jump graph for one TB: the
/// list of TBs that jump directly into this one. Guarded by the TB's
/// own `jmp_lock`; see `tb-exec::jumpgraph` for the link/unlink
/// protocol that holds this lock around both the incoming list here
/// and the outgoing `jmp_dest` slots of other TBs.
#[derive(Default)]
pub struct JmpLinks {
    /// Head of the doubly-tagged incoming list: every `(src, slot)`
    /// pair here names a TB whose `jmp_dest[slot]` points at us.
    pub incoming: Vec<(TbId, PageSlot)>,
    /// This TB's own two outgoing direct-jump targets. `TaggedLink`'s
    /// niche (`NULL`) plays the role the "frozen" tag bit plays in the
    /// design this is modeled on: once unlinked, a slot is left `NULL`
    /// rather than reused, so a racing linker sees "already gone"
    /// instead of silently attaching to a half-torn-down edge.
    pub outgoing: [TaggedLink; 2],
}

/// A cached translated code block: the mapping from a guest code
/// region to the host machine code compiled for it, plus everything
/// needed to find, chain, and invalidate it safely while other CPUs
/// may be executing it concurrently.
pub struct TranslationBlock {
    pub guest_pc: u64,
    pub cs_base: u64,
    pub flags: u32,
    pub cflags: AtomicU32,
    pub trace_mask: u32,

    /// Guest bytes covered by this block.
    pub guest_size: u32,
    /// Guest instructions compiled into this block.
    pub insn_count: u32,

    /// Offset into the arena's code buffer where host code starts.
    pub host_code_ptr: usize,
    /// Size of the generated host code, in bytes.
    pub host_code_size: u32,
    /// Offset (within the arena) where the packed reverse-map for this
    /// block begins, set once `generate` has packed it.
    pub revmap_offset: usize,
    pub revmap_len: u32,

    /// The one or two physical pages this block covers. `None` in slot
    /// 1 means the block fits in a single page.
    pub page_addr: [Option<u64>; 2],
    /// Per-page intrusive list links threaded through every TB that
    /// covers the same page (see `TbPageLinks`).
    pub page_next: [TaggedLink; 2],

    /// Offset of the `goto_tb` jump instruction for each exit slot.
    pub jmp_insn_offset: [Option<u32>; 2],
    /// Offset right after the `goto_tb` instruction, used to reset the
    /// jump back to "exit the block" when unlinking.
    pub jmp_reset_offset: [Option<u32>; 2],

    /// Jump-graph state, guarded by `jmp_lock`.
    pub jmp: Mutex<JmpLinks>,

    pub phys_pc: u64,
    pub hash_next: Option<TbId>,

    /// Fast-path mirror of `cflags & CF_INVALID`, checked by lock-free
    /// readers (jump cache, hash table probes) that must not take
    /// `jmp` just to find out a block is dead.
    pub invalid: AtomicBool,
}

impl TranslationBlock {
    pub fn new(guest_pc: u64, cs_base: u64, flags: u32, cflags: u32, trace_mask: u32) -> Self {
        Self {
            guest_pc,
            cs_base,
            flags,
            cflags: AtomicU32::new(cflags),
            trace_mask,
            guest_size: 0,
            insn_count: 0,
            host_code_ptr: 0,
            host_code_size: 0,
            revmap_offset: 0,
            revmap_len: 0,
            page_addr: [None, None],
            page_next: [TaggedLink::NULL; 2],
            jmp_insn_offset: [None; 2],
            jmp_reset_offset: [None; 2],
            jmp: Mutex::new(JmpLinks::default()),
            phys_pc: 0,
            hash_next: None,
            invalid: AtomicBool::new(false),
        }
    }

    pub fn is_nocache(&self) -> bool {
        self.cflags.load(Ordering::Relaxed) & cflags::CF_NOCACHE != 0
    }

    /// Sets the sticky invalid bit. Idempotent: callers that race to
    /// invalidate the same block all see the same end state.
    pub fn mark_invalid(&self) {
        self.cflags.fetch_or(cflags::CF_INVALID, Ordering::AcqRel);
        self.invalid.store(true, Ordering::Release);
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    pub fn set_jmp_insn_offset(&mut self, n: usize, offset: u32) {
        assert!(n < 2);
        self.jmp_insn_offset[n] = Some(offset);
    }

    pub fn set_jmp_reset_offset(&mut self, n: usize, offset: u32) {
        assert!(n < 2);
        self.jmp_reset_offset[n] = Some(offset);
    }

    /// Maximum number of guest instructions this block may contain,
    /// derived from the architectural default and the block's own
    /// count-limit cflags.
    pub fn max_insns(cflags: u32, architectural_cap: u32) -> u32 {
        let count = cflags & cflags::CF_COUNT_MASK;
        let cap = if count == 0 { architectural_cap } else { count };
        if cflags & cflags::CF_SINGLE_STEP != 0 {
            1
        } else {
            cap.max(1)
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            phys_pc_0: self.phys_pc,
            guest_pc: self.guest_pc,
            flags: self.flags,
            cflags_hash_mask: self.cflags.load(Ordering::Relaxed) & cflags::CF_COUNT_MASK,
            trace_mask: self.trace_mask,
            phys_page_0: self.page_addr[0].unwrap_or(self.phys_pc),
            phys_page_1: self.page_addr[1],
        }
    }
}

/// Accessor trait bridging the page-descriptor / page-collection code
/// (which must not depend on wherever `TranslationBlock`s actually
/// live) to whatever owns TB storage. `tb-cache::TbTable` implements
/// this; `tb-pages` is written purely against the trait.
pub trait TbPageLinks {
    fn page_addr(&self, id: TbId, slot: PageSlot) -> Option<u64>;
    fn page_next(&self, id: TbId, slot: PageSlot) -> TaggedLink;
    fn set_page_next(&self, id: TbId, slot: PageSlot, next: TaggedLink);
    fn mark_invalid(&self, id: TbId);
}

/// Per-CPU direct-mapped TB lookup hint. Each slot is a single-word
/// atomic (SPEC_FULL.md §5.3/§6: "jump cache reads/writes are
/// single-word atomics") rather than plain storage behind `&mut self`,
/// since invalidation must be able to clear a CPU's cached slot from a
/// thread that doesn't own that CPU. Stale entries are otherwise
/// harmless because every hit re-validates the fingerprint before the
/// cached TB is executed.
pub const TB_JMP_CACHE_SIZE: usize = 1 << 12;
/// Number of contiguous slots a single page's worth of `guest_pc`
/// values can land in; used by `clear_page` to zero every slot a page
/// of code could plausibly have populated without walking the guest
/// address space.
pub const TB_JMP_PAGE_SIZE: usize = 1 << 6;

/// Sentinel stored in an empty slot. `TbId`'s own niche (`u32::MAX`,
/// the same value `TaggedLink::NULL` uses) would overflow nothing here
/// since jump-cache slots are raw `TbId`s, not tagged links.
const JC_EMPTY: u32 = u32::MAX;

pub struct JumpCache {
    entries: Box<[AtomicU32]>,
}

impl JumpCache {
    pub fn new() -> Self {
        let mut v = Vec::with_capacity(TB_JMP_CACHE_SIZE);
        v.resize_with(TB_JMP_CACHE_SIZE, || AtomicU32::new(JC_EMPTY));
        Self {
            entries: v.into_boxed_slice(),
        }
    }

    fn index(pc: u64) -> usize {
        (pc as usize >> 2) & (TB_JMP_CACHE_SIZE - 1)
    }

    pub fn lookup(&self, pc: u64) -> Option<TbId> {
        match self.entries[Self::index(pc)].load(Ordering::Acquire) {
            JC_EMPTY => None,
            id => Some(TbId(id)),
        }
    }

    pub fn insert(&self, pc: u64, tb: TbId) {
        self.entries[Self::index(pc)].store(tb.0, Ordering::Release);
    }

    pub fn remove(&self, pc: u64) {
        self.entries[Self::index(pc)].store(JC_EMPTY, Ordering::Release);
    }

    /// Clear every slot that a TB starting on `page` could have
    /// populated.
    pub fn clear_page(&self, page: u64) {
        let base = Self::index(page << 2) & !(TB_JMP_PAGE_SIZE - 1);
        for slot in &self.entries[base..base + TB_JMP_PAGE_SIZE] {
            slot.store(JC_EMPTY, Ordering::Release);
        }
    }

    pub fn clear_all(&self) {
        for slot in self.entries.iter() {
            slot.store(JC_EMPTY, Ordering::Release);
        }
    }

    /// Clear every slot currently pointing at `tb`. Invalidation calls
    /// this on each CPU's cache instead of `remove`, since it doesn't
    /// know which `guest_pc` slot(s) a given TB landed in.
    pub fn clear_matching(&self, tb: TbId) {
        for slot in self.entries.iter() {
            let _ = slot.compare_exchange(tb.0, JC_EMPTY, Ordering::AcqRel, Ordering::Relaxed);
        }
    }
}

impl Default for JumpCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_cache_round_trips() {
        let jc = JumpCache::new();
        assert_eq!(jc.lookup(0x4000), None);
        jc.insert(0x4000, TbId(7));
        assert_eq!(jc.lookup(0x4000), Some(TbId(7)));
        jc.remove(0x4000);
        assert_eq!(jc.lookup(0x4000), None);
    }

    #[test]
    fn invalid_is_sticky() {
        let tb = TranslationBlock::new(0x1000, 0, 0, 0, 0);
        assert!(!tb.is_invalid());
        tb.mark_invalid();
        assert!(tb.is_invalid());
        tb.mark_invalid();
        assert!(tb.is_invalid());
    }

    #[test]
    fn max_insns_respects_single_step() {
        assert_eq!(TranslationBlock::max_insns(0, 512), 512);
        assert_eq!(TranslationBlock::max_insns(cflags::CF_SINGLE_STEP, 512), 1);
        assert_eq!(TranslationBlock::max_insns(16, 512), 16);
    }
}
