//! The translator driver: `generate` (allocate, emit, pack the
//! reverse-map, link, insert) and `link_page` (the page-list + hash
//! table half of insertion, split out because invalidation's
//! bookkeeping reuses the same page-locking shape).

use tb_arena::arena::HostReserve;
use tb_arena::HostCodeGen;
use tb_core::tagged::PageSlot;
use tb_core::{cflags, JumpCache, TbId, TranslationBlock};
use tb_cache::InsertOutcome;
use tb_pages::desc::GUEST_PAGE_SIZE;

use crate::{CodeEmitter, CpuHooks, EmitOutcome, Engine, GuestCpu, TbError};

/// Upper bound on a single block's host code plus its packed
/// reverse-map. Chosen generously relative to the architectural
/// instruction cap; a block that still doesn't fit even at
/// `max_insns == 1` is a `BlockTooLarge` driver/emitter bug, not a
/// transient arena-exhaustion condition.
pub const MAX_TB_CODE_BUDGET: usize = 64 * 1024;

pub enum LinkOutcome {
    Linked,
    /// Another thread published a TB with the same fingerprint first.
    LostRace(TbId),
}

/// Compile and install the block at the current guest PC, populating
/// `jump_cache` (the calling CPU's own, not shared with other CPUs) on
/// success so its next lookup at this PC hits the fast path.
///
/// Serializes against every other caller of `generate` on the same
/// `Engine` via `translate_lock`, exactly as code generation is
/// serialized in the single-threaded driver this is adapted from;
/// lookups and invalidation remain lock-free / page-locked and so stay
/// concurrent with it.
pub fn generate<R, B, C, E, H>(
    engine: &Engine<R, B>,
    cpu: &C,
    hooks: &H,
    emitter: &mut E,
    jump_cache: &JumpCache,
    mut cflags: u32,
    trace_mask: u32,
) -> Result<TbId, TbError>
where
    R: HostReserve,
    B: HostCodeGen,
    C: GuestCpu,
    E: CodeEmitter,
    H: CpuHooks,
{
    let _guard = engine.translate_lock.lock().unwrap();

    let guest_pc = cpu.get_pc();
    let cs_base = cpu.get_cs_base();
    let flags = cpu.get_flags();
    let phys_pc = hooks.guest_to_phys(guest_pc);
    let nocache = phys_pc.is_none();
    if nocache {
        cflags |= self::cflags::CF_NOCACHE;
    }

    // Re-read on every attempt: a concurrent flush (driven from outside
    // `translate_lock`, e.g. a memory-pressure reclaim) invalidates
    // whatever arena region we reserved below, so a translator that
    // started before one discards its work and starts over rather than
    // publish a TB pointing at memory that no longer belongs to it.
    loop {
        let flush_gen = engine.arena.flush_count();

        if engine.arena.remaining() < crate::MIN_ARENA_REMAINING {
            return Err(TbError::ArenaExhausted);
        }

        let start = engine.arena.bump(MAX_TB_CODE_BUDGET)?;
        engine.arena.set_writable().map_err(|_| TbError::ArenaExhausted)?;

        let mut max_insns = if nocache {
            1
        } else {
            TranslationBlock::max_insns(cflags, engine.architectural_max_insns)
        };

        // Halve-and-retry: a block that doesn't fit at the current
        // instruction cap is shrunk and re-emitted into the same
        // reservation rather than surfaced as an error, exactly as the
        // single-threaded driver this is adapted from retries within
        // its own overflow handler. Only once `max_insns == 1` itself
        // overflows is this a real `BlockTooLarge` condition.
        let emitted = loop {
            // SAFETY: [start, start+MAX_TB_CODE_BUDGET) was just
            // reserved by the `bump` above and nothing else writes the
            // arena while `translate_lock` is held.
            let dst = unsafe { &mut engine.arena.as_mut_slice()[start..start + MAX_TB_CODE_BUDGET] };
            match emitter.emit(cpu, dst, max_insns) {
                EmitOutcome::Emitted(e) => break e,
                EmitOutcome::ArenaOverflow | EmitOutcome::BlockTooLarge => {
                    if max_insns == 1 {
                        // SAFETY: no allocation has happened since
                        // `start` under this same `translate_lock` hold.
                        unsafe { engine.arena.rollback_to(start) };
                        return Err(TbError::BlockTooLarge);
                    }
                    max_insns = (max_insns / 2).max(1);
                }
            }
        };

        if engine.arena.flush_count() != flush_gen {
            // A flush landed mid-emit; our reservation is gone. Discard
            // this attempt's work entirely and start over — the bump
            // pointer itself was already reset to zero by the flush, so
            // there is nothing to roll back.
            continue;
        }

        let revmap = crate::revmap::encode(guest_pc, &emitted.insns);
        let total = emitted.host_len + revmap.len();
        if total > MAX_TB_CODE_BUDGET {
            // SAFETY: see above.
            unsafe { engine.arena.rollback_to(start) };
            return Err(TbError::ArenaExhausted);
        }
        let dst = unsafe { &mut engine.arena.as_mut_slice()[start..start + MAX_TB_CODE_BUDGET] };
        dst[emitted.host_len..total].copy_from_slice(&revmap);
        // SAFETY: shrinking our own just-made reservation to what we
        // actually used; nothing else has bumped past `start` meanwhile.
        unsafe { engine.arena.rollback_to(start + total) };
        engine.arena.set_executable().ok();

        let mut tb = TranslationBlock::new(guest_pc, cs_base, flags, cflags, trace_mask);
        tb.phys_pc = phys_pc.unwrap_or(guest_pc);
        tb.guest_size = emitted.guest_len;
        tb.insn_count = emitted.insns.len() as u32;
        tb.host_code_ptr = start;
        tb.host_code_size = emitted.host_len as u32;
        tb.revmap_offset = start + emitted.host_len;
        tb.revmap_len = revmap.len() as u32;
        // `emitted.goto_tb` offsets are relative to the destination slice
        // the emitter wrote into, i.e. relative to `start`; `jmp_insn_offset`
        // / `jmp_reset_offset` are absolute arena offsets since that's what
        // `jumpgraph::patch` indexes the whole arena with.
        for (slot, edge) in emitted.goto_tb.iter().enumerate() {
            if let Some((jmp_off, reset_off)) = edge {
                tb.set_jmp_insn_offset(slot, start as u32 + *jmp_off);
                tb.set_jmp_reset_offset(slot, start as u32 + *reset_off);
            }
        }

        if nocache {
            // SAFETY: `translate_lock` held; no concurrent allocator.
            let id = unsafe { engine.tbs.alloc(tb) };
            engine.index.insert(start, total, id);
            jump_cache.insert(guest_pc, id);
            return Ok(id);
        }

        let page_bytes = GUEST_PAGE_SIZE as u64;
        let page0 = tb.phys_pc / page_bytes;
        let last_byte = tb.phys_pc + (emitted.guest_len as u64).saturating_sub(1);
        let page1 = last_byte / page_bytes;
        tb.page_addr[0] = Some(page0 * page_bytes);
        if page1 != page0 {
            tb.page_addr[1] = Some(page1 * page_bytes);
        }

        // SAFETY: `translate_lock` held.
        let id = unsafe { engine.tbs.alloc(tb) };
        let second_page = if page1 != page0 { Some(page1) } else { None };

        return match link_page(engine, hooks, id, page0, second_page) {
            LinkOutcome::Linked => {
                engine.index.insert(start, total, id);
                jump_cache.insert(guest_pc, id);
                Ok(id)
            }
            LinkOutcome::LostRace(winner) => {
                // SAFETY: nothing has bumped past `start` since we
                // reserved it, still under the same `translate_lock`
                // hold.
                unsafe { engine.arena.rollback_to(start) };
                jump_cache.insert(guest_pc, winner);
                Ok(winner)
            }
        };
    }
}

/// Lock the one or two pages a block covers, splice it onto each
/// page's TB list, and publish it in the hash table. If the hash
/// insert loses a race to an identical fingerprint, the page-list
/// splices are undone before returning.
pub fn link_page<R, B, H>(
    engine: &Engine<R, B>,
    hooks: &H,
    id: TbId,
    page0: u64,
    page1: Option<u64>,
) -> LinkOutcome
where
    R: HostReserve,
    B: HostCodeGen,
    H: CpuHooks,
{
    let mut collection = tb_pages::collection::lock_range(&engine.pages, page0, page0);
    if let Some(p1) = page1 {
        tb_pages::collection::lock_extra(&mut collection, p1);
    }

    let mut armed = Vec::new();
    if let Some(state) = collection.state_mut(page0) {
        if state.first_tb.is_null() {
            armed.push(page0);
        }
        tb_pages::list::add(&engine.tbs, state, id, PageSlot::FIRST);
    }
    if let Some(p1) = page1 {
        if let Some(state) = collection.state_mut(p1) {
            if state.first_tb.is_null() {
                armed.push(p1);
            }
            tb_pages::list::add(&engine.tbs, state, id, PageSlot::SECOND);
        }
    }

    // SAFETY: `translate_lock` is held by `generate`, the only caller.
    let outcome = unsafe { engine.tbs.insert(id) };
    let result = match outcome {
        InsertOutcome::Inserted => LinkOutcome::Linked,
        InsertOutcome::LostRace(winner) => {
            if let Some(state) = collection.state_mut(page0) {
                tb_pages::list::remove(&engine.tbs, state, id, PageSlot::FIRST);
            }
            if let Some(p1) = page1 {
                if let Some(state) = collection.state_mut(p1) {
                    tb_pages::list::remove(&engine.tbs, state, id, PageSlot::SECOND);
                }
            }
            LinkOutcome::LostRace(winner)
        }
    };
    drop(collection);

    if matches!(result, LinkOutcome::Linked) {
        for page in armed {
            hooks.tlb_protect_code(page * GUEST_PAGE_SIZE as u64);
        }
    }
    result
}
