//! Invalidation: tearing down a single block, reacting to a guest
//! write that lands inside a translated page, and the "precise SMC"
//! case where that write hits the block a CPU is executing right now.
//!
//! `invalidate_phys_range` only ever holds the written page's lock long
//! enough to collect which blocks it must kill; each kill then re-locks
//! whatever page(s) that particular block covers through
//! `invalidate_tb`. This trades one extra lock/unlock pair per victim
//! for never holding two unrelated TBs' page sets open at once, which
//! keeps this path compliant with the same ascending-lock-order
//! discipline `PageCollection` documents rather than inventing a second
//! one just for the multi-victim case.

use tb_arena::arena::HostReserve;
use tb_arena::HostCodeGen;
use tb_core::tagged::PageSlot;
use tb_core::{JumpCache, TbId, TranslationBlock};
use tb_pages::desc::GUEST_PAGE_SIZE;

use crate::revmap::{self, InsnRecord};
use crate::{CpuHooks, Engine};

fn page_index(addr: u64) -> u64 {
    addr / GUEST_PAGE_SIZE as u64
}

/// Guest state recovered because a write hit the TB that is currently
/// executing on the CPU making that write — the "precise SMC" case.
/// The caller (the CPU loop, out of scope here) is responsible for
/// actually restoring registers from `restored` and forcing re-entry
/// at a single-instruction granularity rather than resuming the block
/// that was just invalidated out from under it.
pub struct PreciseSmcRestore {
    pub restored: InsnRecord,
}

/// Tear down `id`: sticky-mark it invalid, unhook it from the jump
/// graph, splice it out of every page list it's on, drop it from the
/// hash table, forget its arena fault-index entry, and clear every
/// slot in `jump_caches` that points at it (each CPU's jump cache is a
/// lookup hint the owning CPU normally maintains itself, but a block
/// being invalidated from another thread has no other way to reach
/// it). Idempotent — safe to call on a block another thread is
/// concurrently invalidating.
pub fn invalidate_tb<R: HostReserve, B: HostCodeGen>(
    engine: &Engine<R, B>,
    id: TbId,
    jump_caches: &[&JumpCache],
) {
    let tb = engine.tbs.get(id);
    if tb.is_invalid() {
        return;
    }
    tb.mark_invalid();

    crate::jumpgraph::unlink_all_incoming(engine, id);
    for slot in [PageSlot::FIRST, PageSlot::SECOND] {
        crate::jumpgraph::unlink_outgoing(engine, id, slot);
    }

    engine.tbs.remove(id);
    engine.index.remove(tb.host_code_ptr);

    for jc in jump_caches {
        jc.clear_matching(id);
    }

    let pages: Vec<(u64, PageSlot)> = tb
        .page_addr
        .iter()
        .enumerate()
        .filter_map(|(i, a)| a.map(|addr| (page_index(addr), PageSlot(i as u8))))
        .collect();

    for (page, slot) in pages {
        let mut collection = tb_pages::collection::lock_range(&engine.pages, page, page);
        if let Some(state) = collection.state_mut(page) {
            tb_pages::list::remove(&engine.tbs, state, id, slot);
        }
    }
}

fn recover_state<R: HostReserve, B: HostCodeGen>(
    engine: &Engine<R, B>,
    tb: &TranslationBlock,
    host_pc: usize,
) -> InsnRecord {
    let data = &engine.arena.as_slice()[tb.revmap_offset..tb.revmap_offset + tb.revmap_len as usize];
    let host_offset = (host_pc - tb.host_code_ptr) as u32;
    revmap::lookup(tb.guest_pc, data, host_offset)
}

/// Check whether the write being invalidated lands inside the TB
/// currently executing on the faulting CPU (`current_host_pc`, if the
/// caller is itself the CPU that issued the write). If so, capture that
/// TB's guest state via the reverse-map at the current host PC before
/// it's torn down, so the caller can restart execution precisely at
/// the next instruction instead of resuming code that's about to stop
/// existing.
fn precise_smc_check<R: HostReserve, B: HostCodeGen>(
    engine: &Engine<R, B>,
    victims: &[TbId],
    current_host_pc: Option<usize>,
) -> Option<PreciseSmcRestore> {
    let host_pc = current_host_pc?;
    let id = engine.index.lookup(host_pc)?;
    if !victims.contains(&id) {
        return None;
    }
    let tb = engine.tbs.get(id);
    if tb.is_invalid() {
        return None;
    }
    Some(PreciseSmcRestore {
        restored: recover_state(engine, tb, host_pc),
    })
}

/// React to a guest write covering `[start, end)` (physical addresses,
/// end exclusive): invalidate every live block whose compiled range
/// overlaps it, and retire the written pages' SMC bitmaps so they get
/// rebuilt against whatever remains.
///
/// `current_host_pc`, when `Some`, is the host PC of the store
/// instruction that triggered this call, used to detect the precise-SMC
/// case (see `precise_smc_check`); pass `None` when the write isn't
/// attributable to a specific executing CPU (e.g. a DMA write, or a
/// debugger poke).
///
/// This is the fallback path once a caller has already decided full
/// invalidation is necessary; `note_guest_write` is the fast-path entry
/// point that consults the SMC bitmap first and only reaches here when
/// the bitmap says the write might actually matter.
pub fn invalidate_phys_range<R: HostReserve, B: HostCodeGen, H: CpuHooks>(
    engine: &Engine<R, B>,
    hooks: &H,
    start: u64,
    end: u64,
    current_host_pc: Option<usize>,
    jump_caches: &[&JumpCache],
) -> Option<PreciseSmcRestore> {
    let first_page = page_index(start);
    let last_page = page_index(end.saturating_sub(1).max(start));

    let mut victims: Vec<TbId> = Vec::new();
    let mut emptied: Vec<u64> = Vec::new();
    {
        let mut collection = tb_pages::collection::lock_range(&engine.pages, first_page, last_page);
        for page in first_page..=last_page {
            if let Some(state) = collection.state_mut(page) {
                tb_pages::list::for_each(&engine.tbs, state, |id, _slot| {
                    let tb = engine.tbs.get(id);
                    if tb.is_invalid() {
                        return;
                    }
                    let lo = tb.phys_pc;
                    let hi = tb.phys_pc + tb.guest_size as u64;
                    if lo < end && hi > start && !victims.contains(&id) {
                        victims.push(id);
                    }
                });
            }
        }
    }

    let precise_hit = precise_smc_check(engine, &victims, current_host_pc);

    for id in &victims {
        invalidate_tb(engine, *id, jump_caches);
    }

    {
        let mut collection = tb_pages::collection::lock_range(&engine.pages, first_page, last_page);
        for page in first_page..=last_page {
            if let Some(state) = collection.state_mut(page) {
                if state.first_tb.is_null() {
                    emptied.push(page);
                }
            }
        }
    }
    let leaves_iter = first_page..=last_page;
    for page in leaves_iter {
        if let Some(leaf) = engine.pages.find(page) {
            let idx = tb_pages::PageTable::desc_index(page);
            leaf[idx].reset_write_count();
        }
    }
    for page in emptied {
        hooks.tlb_unprotect_code(page * GUEST_PAGE_SIZE as u64);
    }

    precise_hit
}

fn clip_to_page(tb: &TranslationBlock, page: u64) -> (usize, usize) {
    let page_start = page * GUEST_PAGE_SIZE as u64;
    let page_end = page_start + GUEST_PAGE_SIZE as u64;
    let lo = tb.phys_pc.max(page_start);
    let hi = (tb.phys_pc + tb.guest_size as u64).min(page_end);
    if hi <= lo {
        (0, 0)
    } else {
        ((lo - page_start) as usize, (hi - page_start) as usize)
    }
}

/// Fast-path entry point for a guest write of `len` bytes at `addr`:
/// bumps the page's write count, lazily builds its SMC bitmap once the
/// count crosses `SMC_BUILD_THRESHOLD`, and — once a bitmap exists —
/// skips invalidation entirely when the written bytes don't overlap any
/// compiled range (SPEC_FULL.md's documented fast path: "a subsequent
/// small write ... tests only the relevant bits; if clear, the write
/// need not invalidate anything"). Falls through to
/// `invalidate_phys_range` whenever there's no bitmap yet (below
/// threshold, so a cheap bitmap test isn't available) or the bitmap
/// says the write might matter.
pub fn note_guest_write<R: HostReserve, B: HostCodeGen, H: CpuHooks>(
    engine: &Engine<R, B>,
    hooks: &H,
    addr: u64,
    len: usize,
    current_host_pc: Option<usize>,
    jump_caches: &[&JumpCache],
) -> Option<PreciseSmcRestore> {
    let page = page_index(addr);
    let offset_in_page = (addr - page * GUEST_PAGE_SIZE as u64) as usize;

    let leaf = match engine.pages.find(page) {
        None => return None, // nothing was ever compiled from this page
        Some(leaf) => leaf,
    };
    let idx = tb_pages::PageTable::desc_index(page);
    let desc = &leaf[idx];
    let crossed_threshold = desc.note_write();

    let needs_invalidate = {
        let mut collection = tb_pages::collection::lock_range(&engine.pages, page, page);
        let state = collection.state_mut(page).expect("page was just found above");

        if crossed_threshold {
            let mut ids = Vec::new();
            tb_pages::list::for_each(&engine.tbs, &*state, |id, _| ids.push(id));
            let bitmap = state.build_bitmap();
            for id in ids {
                let tb = engine.tbs.get(id);
                if tb.is_invalid() {
                    continue;
                }
                let (lo, hi) = clip_to_page(tb, page);
                if hi > lo {
                    bitmap.set_range(lo, hi - lo);
                }
            }
        }

        match &state.smc_bitmap {
            Some(bm) => bm.test_range(offset_in_page, len),
            None => true, // no bitmap yet: can't rule the write out cheaply
        }
    };

    if !needs_invalidate {
        return None;
    }

    invalidate_phys_range(engine, hooks, addr, addr + len as u64, current_host_pc, jump_caches)
}
