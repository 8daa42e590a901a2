use std::fmt;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Default arena size: 16 MiB, matching the code-buffer default this
/// is adapted from.
pub const DEFAULT_ARENA_SIZE: usize = 16 * 1024 * 1024;
/// Floor below which `reserve` refuses to shrink the requested size.
pub const MIN_ARENA_SIZE: usize = 1024 * 1024;
/// Ceiling chosen to stay well inside an `i32` rel32 branch range on
/// every host this workspace targets.
pub const MAX_ARENA_SIZE: usize = 2 * 1024 * 1024 * 1024 - (64 * 1024 * 1024);

/// Recoverable conditions the translator driver must react to by
/// retrying, never by surfacing an error to its own caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    /// Not enough room for the requested allocation; caller should
    /// request a flush and retry.
    Exhausted,
    /// A single block's emitted code plus its reverse-map would not
    /// fit even in an empty arena.
    BlockTooLarge,
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaError::Exhausted => write!(f, "arena exhausted"),
            ArenaError::BlockTooLarge => write!(f, "block too large for arena"),
        }
    }
}

impl std::error::Error for ArenaError {}

/// Reservation strategy for the arena's backing memory. The workspace
/// ships only the POSIX `mmap` variant; a static-buffer or
/// `VirtualAlloc` host would implement this trait without touching any
/// caller of `Arena`.
pub trait HostReserve {
    fn reserve(size: usize) -> io::Result<(*mut u8, usize)>;
    fn release(ptr: *mut u8, size: usize);
    fn protect_exec(ptr: *mut u8, size: usize) -> io::Result<()>;
    fn protect_write(ptr: *mut u8, size: usize) -> io::Result<()>;
}

/// `mmap`/`mprotect`-backed reservation. The only `HostReserve`
/// implementation in this workspace.
pub struct PosixMmap;

impl HostReserve for PosixMmap {
    fn reserve(size: usize) -> io::Result<(*mut u8, usize)> {
        let page = page_size();
        let size = (size + page - 1) & !(page - 1);
        // SAFETY: anonymous, non-file-backed mapping; no aliasing with
        // any other allocation.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok((ptr as *mut u8, size))
    }

    fn release(ptr: *mut u8, size: usize) {
        // SAFETY: ptr/size came from a matching `reserve` call.
        unsafe {
            libc::munmap(ptr as *mut libc::c_void, size);
        }
    }

    fn protect_exec(ptr: *mut u8, size: usize) -> io::Result<()> {
        // SAFETY: ptr/size are within a live mapping owned by the
        // caller; no other thread writes to it past this call.
        let ret = unsafe {
            libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_EXEC)
        };
        if ret != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn protect_write(ptr: *mut u8, size: usize) -> io::Result<()> {
        // SAFETY: see `protect_exec`.
        let ret = unsafe {
            libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_WRITE)
        };
        if ret != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Bump-pointer executable memory region.
///
/// Writers call `reserve_writable`, emit code through the returned
/// slice bounds, then `commit`. The region is read+write while code is
/// being emitted and read+exec otherwise; it is never both at once.
/// `flush_count` lets translators that started before a concurrent
/// flush discover they must discard their partial work (invariant I6 /
/// I7: the bump pointer never runs past the high-water mark, and every
/// live pointer into the arena is gone before any CPU resumes
/// executing compiled code).
pub struct Arena<R: HostReserve = PosixMmap> {
    ptr: *mut u8,
    size: usize,
    offset: AtomicUsize,
    flush_count: AtomicU64,
    _reserve: std::marker::PhantomData<R>,
}

// SAFETY: the arena's mapping is exclusively owned; offset/flush_count
// are the only mutable state and are atomics.
unsafe impl<R: HostReserve> Send for Arena<R> {}
unsafe impl<R: HostReserve> Sync for Arena<R> {}

impl<R: HostReserve> Arena<R> {
    pub fn new(requested_size: usize) -> io::Result<Self> {
        let size = requested_size.clamp(MIN_ARENA_SIZE, MAX_ARENA_SIZE);
        let (ptr, size) = R::reserve(size)?;
        Ok(Self {
            ptr,
            size,
            offset: AtomicUsize::new(0),
            flush_count: AtomicU64::new(0),
            _reserve: std::marker::PhantomData,
        })
    }

    pub fn with_default_size() -> io::Result<Self> {
        Self::new(DEFAULT_ARENA_SIZE)
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn offset(&self) -> usize {
        self.offset.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> usize {
        self.size - self.offset()
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::Acquire)
    }

    pub fn base_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    pub fn ptr_at(&self, offset: usize) -> *const u8 {
        assert!(offset <= self.size);
        // SAFETY: offset <= size, within the mapped region.
        unsafe { self.ptr.add(offset) as *const u8 }
    }

    /// Reserve `len` bytes for the caller to fill in directly (the
    /// translator driver writes code through the backend, not through
    /// this type). Returns the starting offset, or `ArenaExhausted` if
    /// it would not fit, or `BlockTooLarge` if it could never fit even
    /// in a freshly flushed arena.
    pub fn bump(&self, len: usize) -> Result<usize, ArenaError> {
        if len > self.size {
            return Err(ArenaError::BlockTooLarge);
        }
        let mut cur = self.offset.load(Ordering::Acquire);
        loop {
            let next = cur.checked_add(len).filter(|&n| n <= self.size);
            let next = match next {
                Some(n) => n,
                None => return Err(ArenaError::Exhausted),
            };
            match self
                .offset
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(cur),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Roll the bump pointer back to `offset`, used when a translator
    /// loses an insertion race and must discard the code it just
    /// emitted (I6: never leave the pointer past what's actually live).
    ///
    /// # Safety
    /// Caller must guarantee no other allocation has happened past
    /// `offset` since the rollback target was captured — i.e. this is
    /// only safe immediately after the losing `bump` call, under the
    /// same serialization the driver already holds for code generation.
    pub unsafe fn rollback_to(&self, offset: usize) {
        self.offset.store(offset, Ordering::Release);
    }

    pub fn set_writable(&self) -> io::Result<()> {
        R::protect_write(self.ptr, self.size)
    }

    pub fn set_executable(&self) -> io::Result<()> {
        R::protect_exec(self.ptr, self.size)
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: [0, offset) has been written by a prior `bump` holder.
        unsafe { std::slice::from_raw_parts(self.ptr, self.offset()) }
    }

    /// Mutable view of the whole backing region; callers index with
    /// offsets returned from `bump`. Requires `set_writable` first.
    ///
    /// # Safety
    /// Caller must hold whatever external serialization prevents two
    /// writers from touching overlapping offsets concurrently, and must
    /// not read/write while the mapping is executable-only.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.size)
    }

    /// Global flush: reset the bump pointer to zero and bump the
    /// generation counter so in-flight translators discard their work.
    ///
    /// # Safety
    /// Caller must hold the exclusive/flush lock and guarantee no CPU
    /// is currently executing code out of this arena.
    pub unsafe fn flush(&self) {
        self.offset.store(0, Ordering::Release);
        self.flush_count.fetch_add(1, Ordering::AcqRel);
    }
}

impl<R: HostReserve> Drop for Arena<R> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            R::release(self.ptr, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_then_rollback_frees_the_space() {
        let arena: Arena = Arena::new(MIN_ARENA_SIZE).unwrap();
        let a = arena.bump(64).unwrap();
        assert_eq!(a, 0);
        // SAFETY: no other allocation happened since.
        unsafe { arena.rollback_to(a) };
        let b = arena.bump(64).unwrap();
        assert_eq!(b, 0);
    }

    #[test]
    fn exhaustion_is_reported_and_flush_recovers() {
        let arena: Arena = Arena::new(MIN_ARENA_SIZE).unwrap();
        let cap = arena.capacity();
        assert!(arena.bump(cap).is_ok());
        assert_eq!(arena.bump(1), Err(ArenaError::Exhausted));
        let gen_before = arena.flush_count();
        // SAFETY: test-only, single-threaded.
        unsafe { arena.flush() };
        assert_eq!(arena.flush_count(), gen_before + 1);
        assert!(arena.bump(cap).is_ok());
    }

    #[test]
    fn oversized_block_is_too_large_not_exhausted() {
        let arena: Arena = Arena::new(MIN_ARENA_SIZE).unwrap();
        let cap = arena.capacity();
        assert_eq!(arena.bump(cap + 1), Err(ArenaError::BlockTooLarge));
    }
}
