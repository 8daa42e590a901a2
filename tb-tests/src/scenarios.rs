use std::sync::{Arc, Barrier};
use std::thread;

use tb_arena::arena::PosixMmap;
use tb_arena::hostgen::X86_64JumpPatcher;
use tb_core::tagged::PageSlot;
use tb_core::JumpCache;
use tb_exec::driver::{generate, LinkOutcome};
use tb_exec::{driver, invalidate, jumpgraph, Engine, GuestCpu, PerCpuState, TbError};
use tb_pages::desc::GUEST_PAGE_SIZE;

use crate::fakes::{FakeCpu, FakeEmitter, FakeHooks};

type TestEngine = Engine<PosixMmap, X86_64JumpPatcher>;

fn new_engine() -> TestEngine {
    Engine::new(1024 * 1024, X86_64JumpPatcher).unwrap()
}

#[test]
fn translate_then_execute_hits_the_jump_cache_on_the_second_lookup() {
    let engine = new_engine();
    let hooks = FakeHooks::default();
    let cpu = FakeCpu::new(0x8000);
    let mut emitter = FakeEmitter::new(4);
    let jump_cache = JumpCache::new();

    let id = generate(&engine, &cpu, &hooks, &mut emitter, &jump_cache, 0, 0).unwrap();
    assert_eq!(
        jump_cache.lookup(cpu.get_pc()),
        Some(id),
        "generate must populate the calling CPU's jump cache on success"
    );

    let found = engine.lookup(&jump_cache, &cpu, 0x8000, None, 0, 0);
    assert_eq!(found, Some(id));
    assert!(!engine.tb(id).is_invalid());
}

#[test]
fn self_modifying_write_invalidates_the_covering_block_and_its_jump_cache_slot() {
    let engine = new_engine();
    let hooks = FakeHooks::default();
    let cpu = FakeCpu::new(0x1000);
    let mut emitter = FakeEmitter::new(4);
    let jump_cache = JumpCache::new();

    let id = generate(&engine, &cpu, &hooks, &mut emitter, &jump_cache, 0, 0).unwrap();
    assert!(!engine.tb(id).is_invalid());
    assert_eq!(jump_cache.lookup(cpu.get_pc()), Some(id));

    invalidate::invalidate_phys_range(&engine, &hooks, 0x1000, 0x1004, None, &[&jump_cache]);

    assert!(engine.tb(id).is_invalid());
    assert_eq!(jump_cache.lookup(cpu.get_pc()), None, "jump-cache slot must be cleared");
    assert_eq!(engine.lookup(&jump_cache, &cpu, 0x1000, None, 0, 0), None);
    assert_eq!(hooks.unprotected.lock().unwrap().as_slice(), &[0x1000]);
}

#[test]
fn a_small_write_that_misses_every_compiled_range_does_not_invalidate() {
    let engine = new_engine();
    let hooks = FakeHooks::default();
    let cpu = FakeCpu::new(0x5000);
    let mut emitter = FakeEmitter::new(4);
    let jump_cache = JumpCache::new();

    let id = generate(&engine, &cpu, &hooks, &mut emitter, &jump_cache, 0, 0).unwrap();

    // Push the page's write count past the bitmap-build threshold with
    // writes that land outside the block's compiled bytes [0x5000,
    // 0x5004); once the bitmap exists, `note_guest_write` must consult
    // it and skip invalidating a block the write never touched.
    for _ in 0..12 {
        invalidate::note_guest_write(&engine, &hooks, 0x5800, 1, None, &[&jump_cache]);
    }

    assert!(!engine.tb(id).is_invalid(), "write outside the block's range must not invalidate it");
}

#[test]
fn a_write_landing_on_the_currently_executing_tb_reports_precise_smc_state() {
    let engine = new_engine();
    let hooks = FakeHooks::default();
    let cpu = FakeCpu::new(0x6000);
    let mut emitter = FakeEmitter::new(4);
    let jump_cache = JumpCache::new();

    let id = generate(&engine, &cpu, &hooks, &mut emitter, &jump_cache, 0, 0).unwrap();
    let tb = engine.tb(id);
    let host_pc = tb.host_code_ptr + 1;

    let hit = invalidate::invalidate_phys_range(&engine, &hooks, 0x6000, 0x6004, Some(host_pc), &[&jump_cache]);

    assert!(engine.tb(id).is_invalid());
    let hit = hit.expect("write into the currently-executing TB must report precise-SMC state");
    assert_eq!(hit.restored.guest_pc, 0x6000);
}

#[test]
fn cross_page_block_registers_on_both_pages() {
    let engine = new_engine();
    let hooks = FakeHooks::default();
    let page_bytes = GUEST_PAGE_SIZE as u64;
    let straddle_pc = page_bytes - 2;
    let cpu = FakeCpu::new(straddle_pc);
    let mut emitter = FakeEmitter::new(4);
    let jump_cache = JumpCache::new();

    let id = generate(&engine, &cpu, &hooks, &mut emitter, &jump_cache, 0, 0).unwrap();
    let tb = engine.tb(id);
    assert!(tb.page_addr[0].is_some());
    assert!(tb.page_addr[1].is_some());
    assert_ne!(tb.page_addr[0], tb.page_addr[1]);

    let leaf0 = engine.pages.find(0).expect("first page touched");
    let idx0 = tb_pages::PageTable::desc_index(0);
    assert!(!leaf0[idx0].lock().first_tb.is_null());

    let leaf1 = engine.pages.find(1).expect("second page touched");
    let idx1 = tb_pages::PageTable::desc_index(1);
    assert!(!leaf1[idx1].lock().first_tb.is_null());
}

#[test]
fn jump_chain_is_torn_down_when_the_destination_is_invalidated() {
    let engine = new_engine();
    let hooks = FakeHooks::default();
    let jump_cache = JumpCache::new();

    let cpu_a = FakeCpu::new(0x2000);
    let mut emitter_a = FakeEmitter::new(4);
    emitter_a.chain_to_next = true;
    let a = generate(&engine, &cpu_a, &hooks, &mut emitter_a, &jump_cache, 0, 0).unwrap();

    let cpu_b = FakeCpu::new(0x3000);
    let mut emitter_b = FakeEmitter::new(4);
    let b = generate(&engine, &cpu_b, &hooks, &mut emitter_b, &jump_cache, 0, 0).unwrap();

    jumpgraph::link(&engine, a, PageSlot::FIRST, b);
    assert!(!engine.tb(a).jmp.lock().unwrap().outgoing[0].is_null());
    assert_eq!(engine.tb(b).jmp.lock().unwrap().incoming, vec![(a, PageSlot::FIRST)]);

    invalidate::invalidate_tb(&engine, b, &[&jump_cache]);

    assert!(engine.tb(a).jmp.lock().unwrap().outgoing[0].is_null());
    assert!(engine.tb(b).is_invalid());
}

#[test]
fn arena_overflow_is_reported_and_flush_recovers() {
    let engine = new_engine();
    let hooks = FakeHooks::default();
    let cpu = FakeCpu::new(0x9000);
    let mut emitter = FakeEmitter::new(4);
    let jump_cache = JumpCache::new();

    let cap = engine.arena.capacity();
    let leave = 1024;
    engine.arena.bump(cap - leave).unwrap();

    match generate(&engine, &cpu, &hooks, &mut emitter, &jump_cache, 0, 0) {
        Err(TbError::ArenaExhausted) => {}
        other => panic!("expected ArenaExhausted, got {:?}", other.map(|_| ())),
    }

    let mut per_cpu = PerCpuState::new();
    let mut slots: Vec<&mut PerCpuState> = vec![&mut per_cpu];
    // SAFETY: no concurrent CPU holds a TbId across this test's flush.
    unsafe { engine.flush(&mut slots) };

    let id = generate(&engine, &cpu, &hooks, &mut emitter, &jump_cache, 0, 0).unwrap();
    assert!(!engine.tb(id).is_invalid());
}

#[test]
fn a_block_too_large_even_at_one_instruction_is_reported_after_halving() {
    let engine = new_engine();
    let hooks = FakeHooks::default();
    let cpu = FakeCpu::new(0x7000);
    // Never fits, no matter how far `max_insns` is halved.
    let mut emitter = FakeEmitter::new(4);
    emitter.never_fits = true;
    let jump_cache = JumpCache::new();

    match generate(&engine, &cpu, &hooks, &mut emitter, &jump_cache, 0, 0) {
        Err(TbError::BlockTooLarge) => {}
        other => panic!("expected BlockTooLarge, got {:?}", other.map(|_| ())),
    }
    assert!(
        emitter.attempts > 1,
        "driver must have halved max_insns and retried before giving up"
    );
}

#[test]
fn an_oversized_block_shrinks_until_it_fits() {
    let engine = new_engine();
    let hooks = FakeHooks::default();
    let cpu = FakeCpu::new(0x7800);
    let mut emitter = FakeEmitter::new(4);
    emitter.fits_only_below_insns = Some(2);
    let jump_cache = JumpCache::new();

    let id = generate(&engine, &cpu, &hooks, &mut emitter, &jump_cache, 0, 0).unwrap();
    assert!(!engine.tb(id).is_invalid());
    assert!(emitter.attempts > 1, "driver must have retried at a smaller max_insns");
}

#[test]
fn two_generates_on_the_identical_fingerprint_keep_only_one() {
    let engine = new_engine();
    let hooks = FakeHooks::default();
    let cpu = FakeCpu::new(0xa000);
    let mut emitter = FakeEmitter::new(4);
    let jump_cache = JumpCache::new();

    let first = generate(&engine, &cpu, &hooks, &mut emitter, &jump_cache, 0, 0).unwrap();
    let second = generate(&engine, &cpu, &hooks, &mut emitter, &jump_cache, 0, 0).unwrap();

    assert_eq!(first, second, "losing translation must defer to the winner");
}

#[test]
fn concurrent_generates_on_the_identical_fingerprint_converge_to_one_winner() {
    let engine = Arc::new(new_engine());
    let hooks = Arc::new(FakeHooks::default());
    const THREADS: usize = 8;
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let hooks = Arc::clone(&hooks);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let cpu = FakeCpu::new(0xc000);
                let mut emitter = FakeEmitter::new(4);
                let jump_cache = JumpCache::new();
                barrier.wait();
                generate(&engine, &cpu, hooks.as_ref(), &mut emitter, &jump_cache, 0, 0).unwrap()
            })
        })
        .collect();

    let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winner = ids[0];
    assert!(
        ids.iter().all(|&id| id == winner),
        "every racing thread must converge on the same TB: {ids:?}"
    );
}

#[test]
fn link_page_rolls_back_page_lists_on_a_lost_race() {
    let engine = new_engine();
    let hooks = FakeHooks::default();
    let cpu = FakeCpu::new(0xb000);
    let mut emitter = FakeEmitter::new(4);
    let jump_cache = JumpCache::new();

    let winner = generate(&engine, &cpu, &hooks, &mut emitter, &jump_cache, 0, 0).unwrap();

    let mut loser_tb = tb_core::TranslationBlock::new(0xb000, 0, 0, 0, 0);
    loser_tb.phys_pc = 0xb000;
    loser_tb.page_addr[0] = Some(0xb000 & !0xfff);
    // SAFETY: test-only, single-threaded storage append.
    let loser = unsafe { engine.tbs.alloc(loser_tb) };

    let outcome = driver::link_page(&engine, &hooks, loser, 0xb000 / GUEST_PAGE_SIZE as u64, None);
    assert!(matches!(outcome, LinkOutcome::LostRace(w) if w == winner));

    let leaf = engine.pages.find(0xb000 / GUEST_PAGE_SIZE as u64).unwrap();
    let idx = tb_pages::PageTable::desc_index(0xb000 / GUEST_PAGE_SIZE as u64);
    let state = leaf[idx].lock();
    let mut seen = Vec::new();
    tb_pages::list::for_each(&engine.tbs, &state, |id, _| seen.push(id));
    assert_eq!(seen, vec![winner]);
}

#[test]
fn cpu_restore_state_recovers_the_enclosing_guest_instruction() {
    let engine = new_engine();
    let hooks = FakeHooks::default();
    let cpu = FakeCpu::new(0xd000);
    let mut emitter = FakeEmitter::new(4);
    let jump_cache = JumpCache::new();

    let id = generate(&engine, &cpu, &hooks, &mut emitter, &jump_cache, 0, 0).unwrap();
    let tb = engine.tb(id);
    let host_pc = tb.host_code_ptr + tb.host_code_size as usize - 1;

    let record = tb_exec::cpu_restore_state(&engine, host_pc, false).expect("host_pc is inside this TB");
    assert_eq!(record.guest_pc, 0xd000);
    assert!(tb_exec::tb_check_watchpoint(&engine, host_pc));
    assert!(!tb_exec::tb_check_watchpoint(&engine, host_pc + 10_000));
}

#[test]
fn for_each_tb_visits_every_live_block_and_skips_invalidated_ones() {
    let engine = new_engine();
    let hooks = FakeHooks::default();
    let jump_cache = JumpCache::new();

    let cpu_a = FakeCpu::new(0xe000);
    let mut emitter_a = FakeEmitter::new(4);
    let a = generate(&engine, &cpu_a, &hooks, &mut emitter_a, &jump_cache, 0, 0).unwrap();

    let cpu_b = FakeCpu::new(0xf000);
    let mut emitter_b = FakeEmitter::new(4);
    let b = generate(&engine, &cpu_b, &hooks, &mut emitter_b, &jump_cache, 0, 0).unwrap();

    invalidate::invalidate_tb(&engine, a, &[&jump_cache]);

    let mut seen = Vec::new();
    tb_exec::for_each_tb(&engine, |id, _tb| seen.push(id));
    assert_eq!(seen, vec![b]);
}
