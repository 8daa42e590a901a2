//! Ties the arena, page bookkeeping, and hash table together into the
//! translator driver and invalidation engine, and defines the trait
//! boundary to everything this workspace treats as an external
//! collaborator: the guest decoder/emitter, the CPU loop, and the
//! TLB/physical-memory subsystem.

pub mod driver;
pub mod invalidate;
pub mod jumpgraph;
pub mod query;
pub mod revmap;

use std::fmt;
use std::sync::Mutex;

use tb_arena::{Arena, ArenaError, ArenaTbIndex, HostCodeGen};
use tb_core::tb::TB_JMP_CACHE_SIZE;
use tb_core::{JumpCache, TbId, TranslationBlock};
use tb_arena::arena::HostReserve;
use tb_cache::TbTable;
use tb_pages::PageTable;

pub use driver::{generate, link_page, LinkOutcome, MAX_TB_CODE_BUDGET};
pub use query::{cpu_restore_state, for_each_tb, tb_check_watchpoint};
pub use revmap::InsnRecord;

/// Caller-visible recoverable errors. `LostInsertionRace` and
/// `AlreadyInvalidated` are deliberately absent here: they are internal
/// control flow (`InsertOutcome`, `TbTable::remove`'s `bool`), never
/// surfaced as an error per the contract that only `generate` itself
/// may fail and only for these two reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TbError {
    ArenaExhausted,
    BlockTooLarge,
    UnresolvableGuestPc,
}

impl fmt::Display for TbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TbError::ArenaExhausted => write!(f, "arena exhausted, flush required"),
            TbError::BlockTooLarge => write!(f, "block exceeds arena capacity"),
            TbError::UnresolvableGuestPc => write!(f, "guest pc has no backing physical page"),
        }
    }
}

impl std::error::Error for TbError {}

impl From<ArenaError> for TbError {
    fn from(e: ArenaError) -> Self {
        match e {
            ArenaError::Exhausted => TbError::ArenaExhausted,
            ArenaError::BlockTooLarge => TbError::BlockTooLarge,
        }
    }
}

/// Guest CPU register state the driver needs to pick a translation
/// context. The guest decoder itself is out of scope; this is just
/// enough surface for `generate`/`lookup` to do their job.
pub trait GuestCpu {
    fn get_pc(&self) -> u64;
    fn get_cs_base(&self) -> u64;
    fn get_flags(&self) -> u32;
}

/// Physical-memory / TLB hooks this subsystem calls into but does not
/// implement.
pub trait CpuHooks {
    /// Resolve a guest virtual PC to a physical address, or `None` if
    /// it is not backed by RAM (MMIO, unmapped — triggers a one-shot
    /// `NOCACHE` translation).
    fn guest_to_phys(&self, guest_pc: u64) -> Option<u64>;
    /// Mark a physical page read-only so writes to it trap.
    fn tlb_protect_code(&self, phys_page: u64);
    /// Remove write protection once no TB covers a page any more.
    fn tlb_unprotect_code(&self, phys_page: u64);
}

/// Result of asking the external emitter to compile one block.
pub enum EmitOutcome {
    Emitted(EmittedBlock),
    /// The block's code (plus reverse-map) did not fit in the budget
    /// handed to the emitter at the requested `max_insns`. `generate`
    /// reacts by halving `max_insns` and re-emitting into the same
    /// reservation, never by surfacing this past itself.
    ArenaOverflow,
    /// Same reaction as `ArenaOverflow` from the driver's point of
    /// view — distinguished only so an emitter can say "this shape of
    /// block in particular doesn't fit" for its own diagnostics. Only
    /// once `generate`'s halving loop reaches `max_insns == 1` and
    /// still gets one of these does it become a real `TbError::BlockTooLarge`.
    BlockTooLarge,
}

/// What `gen_intermediate_code` + `tcg_gen_code` hand back once a block
/// has been compiled into the destination slice the driver gave them.
pub struct EmittedBlock {
    pub host_len: usize,
    pub guest_len: u32,
    /// Per-instruction reverse-map rows, in program order.
    pub insns: Vec<InsnRecord>,
    /// `(jump_offset, reset_offset)` for each of up to two `goto_tb`
    /// exits recorded during this compile, relative to the start of the
    /// `dst` slice passed to `emit` (the driver rebases these to
    /// absolute arena offsets before storing them on the `TranslationBlock`).
    pub goto_tb: [Option<(u32, u32)>; 2],
}

/// The out-of-scope guest decoder + host emitter, modeled as a single
/// hook: given a destination slice and an instruction budget, produce
/// compiled code plus the bookkeeping `generate` needs. A real
/// implementation issues IR (`gen_intermediate_code`) and then lowers
/// it (`tcg_gen_code`); this workspace does not implement either, only
/// the trait boundary and a small test double.
pub trait CodeEmitter {
    fn emit(&mut self, cpu: &dyn GuestCpu, dst: &mut [u8], max_insns: u32) -> EmitOutcome;
}

/// Execution statistics, mirroring the dump-to-`Display` convention
/// used everywhere else diagnostics are surfaced in this workspace —
/// no logging crate, just a struct with a `Display` impl callers print
/// when they want a report.
#[derive(Default)]
pub struct ExecStats {
    pub jc_hit: u64,
    pub ht_hit: u64,
    pub translate: u64,
    pub invalidate_count: u64,
    pub flush_count: u64,
    pub lost_insertion_races: u64,
}

impl fmt::Display for ExecStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.jc_hit + self.ht_hit + self.translate;
        writeln!(f, "=== TB Cache Stats ===")?;
        writeln!(f, "  jc hit:      {} ({:.1}%)", self.jc_hit, pct(self.jc_hit, total))?;
        writeln!(f, "  ht hit:      {} ({:.1}%)", self.ht_hit, pct(self.ht_hit, total))?;
        writeln!(f, "  translate:   {} ({:.1}%)", self.translate, pct(self.translate, total))?;
        writeln!(f, "  invalidated: {}", self.invalidate_count)?;
        writeln!(f, "  flushes:     {}", self.flush_count)?;
        writeln!(f, "  lost races:  {}", self.lost_insertion_races)
    }
}

fn pct(n: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        n as f64 / total as f64 * 100.0
    }
}

/// Per-CPU state: not shared across threads, unlike `Engine`.
pub struct PerCpuState {
    pub jump_cache: JumpCache,
    pub stats: ExecStats,
}

impl PerCpuState {
    pub fn new() -> Self {
        Self {
            jump_cache: JumpCache::new(),
            stats: ExecStats::default(),
        }
    }
}

impl Default for PerCpuState {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimum remaining arena bytes before `generate` refuses to start a
/// new translation and asks the caller to flush instead.
pub const MIN_ARENA_REMAINING: usize = 4096;

/// Shared, cross-CPU state: the TB table, the executable arena, the
/// page descriptor radix, the arena-to-TB fault index, and the backend
/// hook used to patch chained jumps. One `translate_lock` serializes
/// code generation exactly as it does in the single-threaded driver
/// this is adapted from; page locks and the TB hash table are what
/// let lookups and invalidation stay concurrent with it.
pub struct Engine<R: HostReserve, B: HostCodeGen> {
    pub tbs: TbTable,
    pub arena: Arena<R>,
    pub pages: PageTable,
    pub index: ArenaTbIndex,
    pub backend: B,
    pub translate_lock: Mutex<()>,
    pub architectural_max_insns: u32,
}

impl<R: HostReserve, B: HostCodeGen> Engine<R, B> {
    pub fn new(arena_size: usize, backend: B) -> std::io::Result<Self> {
        Ok(Self {
            tbs: TbTable::new(),
            arena: Arena::new(arena_size)?,
            pages: PageTable::new(),
            index: ArenaTbIndex::new(),
            backend,
            translate_lock: Mutex::new(()),
            architectural_max_insns: 512,
        })
    }

    /// Look up a cached TB by full context: first the calling CPU's own
    /// `jump_cache` (validated against the fingerprint, since a stale
    /// slot is only ever a missed optimization, never a correctness
    /// problem), then the shared hash table on a miss. A hash-table hit
    /// repopulates `jump_cache` so the next lookup at this PC takes the
    /// fast path too — the same `tb_find`'s fast/slow split the driver
    /// this is modeled on keeps, just composed into one call instead of
    /// split across the caller. `phys_pc` is the caller's
    /// already-resolved `guest_to_phys(cpu.get_pc())`. `phys_page_1`
    /// must match whatever the original `generate` call recorded for
    /// this block (`None` unless it straddles a page boundary) since it
    /// is part of the fingerprint identity.
    pub fn lookup(
        &self,
        jump_cache: &JumpCache,
        cpu: &dyn GuestCpu,
        phys_pc: u64,
        phys_page_1: Option<u64>,
        cflags: u32,
        trace_mask: u32,
    ) -> Option<TbId> {
        let guest_pc = cpu.get_pc();
        let fp = tb_core::Fingerprint {
            phys_pc_0: phys_pc,
            guest_pc,
            flags: cpu.get_flags(),
            cflags_hash_mask: cflags & tb_core::cflags::CF_COUNT_MASK,
            trace_mask,
            phys_page_0: phys_pc & !0xfff,
            phys_page_1,
        };

        if let Some(id) = jump_cache.lookup(guest_pc) {
            let tb = self.tbs.get(id);
            if !tb.is_invalid() && tb.fingerprint() == fp {
                return Some(id);
            }
        }

        let found = self.tbs.lookup(&fp);
        if let Some(id) = found {
            jump_cache.insert(guest_pc, id);
        }
        found
    }

    pub fn tb(&self, id: TbId) -> &TranslationBlock {
        self.tbs.get(id)
    }

    /// Full flush: reset the arena, drop every TB, and forget every
    /// page's TB list and every passed-in CPU's jump cache hints.
    ///
    /// # Safety
    /// Caller must hold the exclusive context (no CPU concurrently
    /// executing compiled code or reading a `TbId` past this call).
    pub unsafe fn flush(&self, per_cpu: &mut [&mut PerCpuState]) {
        self.tbs.flush();
        self.pages.clear();
        self.index.clear();
        self.arena.flush();
        for cpu in per_cpu.iter_mut() {
            cpu.jump_cache.clear_all();
            cpu.stats.flush_count += 1;
        }
    }
}

const _: () = assert!(TB_JMP_CACHE_SIZE > 0);
