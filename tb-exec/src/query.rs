//! The handful of externally-facing operations that don't belong to
//! `generate`/`lookup`/`invalidate_*`: recovering guest state from a
//! faulting host PC, checking whether a host PC is inside compiled
//! code at all, and walking every live TB. Each composes pieces that
//! already exist elsewhere in this crate — the arena-to-TB fault index,
//! the packed reverse-map decoder, the per-page intrusive lists — they
//! just weren't wired into their own entry points yet.

use tb_arena::arena::HostReserve;
use tb_arena::HostCodeGen;
use tb_core::{TbId, TranslationBlock};

use crate::revmap::{self, InsnRecord};
use crate::Engine;

/// Recover the guest instruction a faulting host PC belongs to.
///
/// Used by a host signal handler / fault path that only has a raw
/// `host_pc` (and, for icount-driven CPUs, whether the fault happened
/// on the exit edge, `will_exit`) and needs enough guest state to
/// restore CPU registers before re-entering the dispatcher. Composes
/// `ArenaTbIndex::lookup` (find which TB owns this host PC) with
/// `revmap::lookup` (decode that TB's packed reverse-map to the
/// enclosing guest instruction). Returns `None` if `host_pc` isn't
/// inside any live TB's compiled range.
///
/// `will_exit` doesn't change which row is returned — it's a hint this
/// workspace passes through for the caller's own bookkeeping about
/// whether to keep running the current TB's epilogue or leave
/// immediately; restoring the state itself is the same either way.
pub fn cpu_restore_state<R: HostReserve, B: HostCodeGen>(
    engine: &Engine<R, B>,
    host_pc: usize,
    will_exit: bool,
) -> Option<InsnRecord> {
    let id = engine.index.lookup(host_pc)?;
    let tb = engine.tbs.get(id);
    if tb.is_invalid() {
        return None;
    }
    let _ = will_exit;
    Some(restore_from_tb(engine, tb, host_pc))
}

fn restore_from_tb<R: HostReserve, B: HostCodeGen>(
    engine: &Engine<R, B>,
    tb: &TranslationBlock,
    host_pc: usize,
) -> InsnRecord {
    let revmap_data = &engine.arena.as_slice()[tb.revmap_offset..tb.revmap_offset + tb.revmap_len as usize];
    let host_offset = (host_pc - tb.host_code_ptr) as u32;
    revmap::lookup(tb.guest_pc, revmap_data, host_offset)
}

/// Whether `host_pc` falls inside a live, compiled TB — used to tell a
/// watchpoint trap that landed in generated code apart from one that
/// didn't come from this subsystem at all.
pub fn tb_check_watchpoint<R: HostReserve, B: HostCodeGen>(engine: &Engine<R, B>, host_pc: usize) -> bool {
    match engine.index.lookup(host_pc) {
        Some(id) => !engine.tbs.get(id).is_invalid(),
        None => false,
    }
}

/// Invoke `f` with every live (non-invalidated) TB currently held by
/// this engine, in storage order. Used by bulk operations (dumping
/// stats, a debugger walking all compiled code) that need to see every
/// block rather than just one page's worth.
pub fn for_each_tb<R: HostReserve, B: HostCodeGen>(
    engine: &Engine<R, B>,
    mut f: impl FnMut(TbId, &TranslationBlock),
) {
    for i in 0..engine.tbs.len() {
        let id = TbId(i as u32);
        let tb = engine.tbs.get(id);
        if !tb.is_invalid() {
            f(id, tb);
        }
    }
}
