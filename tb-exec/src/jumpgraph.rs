//! Link and unlink operations for the inter-TB jump graph.
//!
//! Each of the three operations below takes at most one TB's `jmp`
//! lock at a time — never two nested — which is what keeps this
//! deadlock-free against every other site that touches the graph: a
//! thread reads or clears its own side of an edge under its own lock,
//! releases it, then separately locks the other side. The result is
//! the same bidirectional-consistency guarantee a single atomic
//! tagged-pointer CAS would give (a late linker either sees the
//! now-`NULL` slot and gives up, or wins before the unlinker clears
//! it), without ever waiting while holding a second TB's lock.

use tb_arena::arena::HostReserve;
use tb_arena::HostCodeGen;
use tb_core::tagged::{PageSlot, TaggedLink};
use tb_core::TbId;

use crate::Engine;

fn patch<R: HostReserve, B: HostCodeGen>(engine: &Engine<R, B>, jump_offset: usize, target_offset: usize) {
    engine.arena.set_writable().ok();
    engine.backend.patch_jump(&engine.arena, jump_offset, target_offset);
    engine.arena.set_executable().ok();
}

/// Link `a`'s outgoing slot `slot` to `b`: patch the host jump site and
/// record both sides of the edge. No-op if `b` is (or becomes, in a
/// race) invalid.
pub fn link<R: HostReserve, B: HostCodeGen>(engine: &Engine<R, B>, a: TbId, slot: PageSlot, b: TbId) {
    if engine.tbs.get(b).is_invalid() {
        return;
    }
    if let Some(jmp_off) = engine.tbs.get(a).jmp_insn_offset[slot.0 as usize] {
        patch(engine, jmp_off as usize, engine.tbs.get(b).host_code_ptr);
    }
    {
        let mut a_jmp = engine.tbs.get(a).jmp.lock().unwrap();
        a_jmp.outgoing[slot.0 as usize] = TaggedLink::new(b, slot);
    }

    let mut b_jmp = engine.tbs.get(b).jmp.lock().unwrap();
    if engine.tbs.get(b).is_invalid() {
        // Invalidation raced with us between the check above and here;
        // back out the outgoing slot we just set so `a` doesn't point
        // at a dead block with no corresponding incoming entry.
        drop(b_jmp);
        let mut a_jmp = engine.tbs.get(a).jmp.lock().unwrap();
        a_jmp.outgoing[slot.0 as usize] = TaggedLink::NULL;
        return;
    }
    b_jmp.incoming.push((a, slot));
}

/// Unlink `a`'s outgoing slot `slot` from whatever it currently points
/// at, if anything. Called for both of a block's slots when `a` itself
/// is invalidated.
pub fn unlink_outgoing<R: HostReserve, B: HostCodeGen>(engine: &Engine<R, B>, a: TbId, slot: PageSlot) {
    let dest = {
        let mut a_jmp = engine.tbs.get(a).jmp.lock().unwrap();
        let d = a_jmp.outgoing[slot.0 as usize];
        a_jmp.outgoing[slot.0 as usize] = TaggedLink::NULL;
        d
    };
    let Some((b, _)) = dest.unpack() else {
        return;
    };
    let mut b_jmp = engine.tbs.get(b).jmp.lock().unwrap();
    b_jmp.incoming.retain(|&(src, s)| !(src == a && s == slot));
}

/// Unlink every block that jumps directly into `b`, rewriting each
/// one's host jump site back to its self-exit reset offset so it will
/// leave the dispatcher loop instead of jumping into dead code. Called
/// when `b` itself is invalidated.
pub fn unlink_all_incoming<R: HostReserve, B: HostCodeGen>(engine: &Engine<R, B>, b: TbId) {
    let incoming = {
        let mut b_jmp = engine.tbs.get(b).jmp.lock().unwrap();
        std::mem::take(&mut b_jmp.incoming)
    };
    for (a, slot) in incoming {
        if let (Some(jmp_off), Some(reset_off)) = (
            engine.tbs.get(a).jmp_insn_offset[slot.0 as usize],
            engine.tbs.get(a).jmp_reset_offset[slot.0 as usize],
        ) {
            patch(engine, jmp_off as usize, reset_off as usize);
        }
        let mut a_jmp = engine.tbs.get(a).jmp.lock().unwrap();
        a_jmp.outgoing[slot.0 as usize] = TaggedLink::NULL;
    }
}
