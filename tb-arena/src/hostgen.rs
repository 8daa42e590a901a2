use crate::arena::{Arena, HostReserve};

/// Host-architecture hook the jump-chaining protocol patches through.
/// Only the single operation the TB cache needs from a real code
/// generator is modeled here — everything else (register allocation,
/// instruction selection) is the out-of-scope emitter's business.
pub trait HostCodeGen {
    /// Patch the direct jump at `jump_offset` in `arena` to land at
    /// `target_offset`. Must be safe to call concurrently with other
    /// `patch_jump` calls on unrelated offsets (multi-threaded chaining
    /// across vCPUs), and safe to call concurrently with a CPU
    /// executing the surrounding code, since the write is a single
    /// naturally aligned store.
    fn patch_jump<R: HostReserve>(&self, arena: &Arena<R>, jump_offset: usize, target_offset: usize);
}

/// x86-64 rel32 direct jump patcher: a 5-byte `E9 rel32` whose
/// displacement is relative to the byte following the instruction.
pub struct X86_64JumpPatcher;

impl HostCodeGen for X86_64JumpPatcher {
    fn patch_jump<R: HostReserve>(&self, arena: &Arena<R>, jump_offset: usize, target_offset: usize) {
        let disp = target_offset as i64 - (jump_offset as i64 + 5);
        assert!(
            (i32::MIN as i64..=i32::MAX as i64).contains(&disp),
            "jump displacement out of i32 range"
        );
        // SAFETY: the arena is writable during chaining (see
        // `Arena::set_writable`); offset+4 is checked by the slice
        // bounds below.
        let bytes = unsafe { arena.as_mut_slice() };
        let at = jump_offset + 1;
        bytes[at..at + 4].copy_from_slice(&(disp as u32).to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patches_a_forward_jump() {
        let arena: Arena = Arena::new(crate::arena::MIN_ARENA_SIZE).unwrap();
        arena.set_writable().unwrap();
        let jump_off = arena.bump(5).unwrap();
        let target_off = arena.bump(16).unwrap();
        X86_64JumpPatcher.patch_jump(&arena, jump_off, target_off);
        let bytes = arena.as_slice();
        let disp = i32::from_le_bytes(bytes[jump_off + 1..jump_off + 5].try_into().unwrap());
        assert_eq!(disp as i64, target_off as i64 - (jump_off as i64 + 5));
    }
}
