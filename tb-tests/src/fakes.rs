//! Test doubles standing in for the guest decoder/emitter and the
//! CPU/TLB hooks this workspace only defines trait boundaries for.

use std::cell::Cell;
use std::sync::Mutex;

use tb_exec::{CodeEmitter, CpuHooks, EmitOutcome, EmittedBlock, GuestCpu};
use tb_exec::InsnRecord;

/// Minimal guest register file: just enough for the driver to pick a
/// translation context.
pub struct FakeCpu {
    pub pc: Cell<u64>,
}

impl FakeCpu {
    pub fn new(pc: u64) -> Self {
        Self { pc: Cell::new(pc) }
    }
}

impl GuestCpu for FakeCpu {
    fn get_pc(&self) -> u64 {
        self.pc.get()
    }
    fn get_cs_base(&self) -> u64 {
        0
    }
    fn get_flags(&self) -> u32 {
        0
    }
}

/// Identity guest-to-phys mapping (flat, unpaged address space), with
/// protect/unprotect calls recorded so tests can assert on them.
#[derive(Default)]
pub struct FakeHooks {
    pub protected: Mutex<Vec<u64>>,
    pub unprotected: Mutex<Vec<u64>>,
    pub unmapped: Mutex<Vec<u64>>,
}

impl CpuHooks for FakeHooks {
    fn guest_to_phys(&self, guest_pc: u64) -> Option<u64> {
        if self.unmapped.lock().unwrap().contains(&guest_pc) {
            None
        } else {
            Some(guest_pc)
        }
    }
    fn tlb_protect_code(&self, phys_page: u64) {
        self.protected.lock().unwrap().push(phys_page);
    }
    fn tlb_unprotect_code(&self, phys_page: u64) {
        self.unprotected.lock().unwrap().push(phys_page);
    }
}

/// Emits a fixed-shape stub for every block: a 5-byte placeholder jump
/// (patched by the jump-chaining protocol exactly like a real `goto_tb`
/// exit) followed by a 1-byte trap standing in for "leave the
/// dispatcher loop". `guest_len` is the only thing callers usually need
/// to vary between blocks.
///
/// `never_fits` and `fits_only_below_insns` let tests drive the
/// driver's halve-and-retry loop: the former always reports overflow
/// (exercising the give-up-at-`max_insns == 1` path), the latter only
/// succeeds once the driver has shrunk `max_insns` to or below the
/// given bound. `attempts` counts every `emit` call so tests can assert
/// the driver actually retried instead of failing immediately.
pub struct FakeEmitter {
    pub guest_len: u32,
    pub chain_to_next: bool,
    pub never_fits: bool,
    pub fits_only_below_insns: Option<u32>,
    pub attempts: u32,
}

impl FakeEmitter {
    pub fn new(guest_len: u32) -> Self {
        Self {
            guest_len,
            chain_to_next: false,
            never_fits: false,
            fits_only_below_insns: None,
            attempts: 0,
        }
    }
}

impl CodeEmitter for FakeEmitter {
    fn emit(&mut self, cpu: &dyn GuestCpu, dst: &mut [u8], max_insns: u32) -> EmitOutcome {
        self.attempts += 1;
        if self.never_fits {
            return EmitOutcome::BlockTooLarge;
        }
        if let Some(limit) = self.fits_only_below_insns {
            if max_insns > limit {
                return EmitOutcome::ArenaOverflow;
            }
        }
        const STUB_LEN: usize = 6;
        if dst.len() < STUB_LEN {
            return EmitOutcome::ArenaOverflow;
        }
        dst[0] = 0xE9;
        dst[1..5].fill(0);
        dst[5] = 0xCC;
        let goto_tb = if self.chain_to_next {
            [Some((0u32, 5u32)), None]
        } else {
            [None, None]
        };
        EmitOutcome::Emitted(EmittedBlock {
            host_len: STUB_LEN,
            guest_len: self.guest_len,
            insns: vec![InsnRecord {
                guest_pc: cpu.get_pc(),
                host_end_offset: STUB_LEN as u32,
            }],
            goto_tb,
        })
    }
}
