//! Executable-memory arena backing compiled translation blocks.
//!
//! Bump-allocates host code under W^X discipline (mmap + mprotect, the
//! only allocation strategy this workspace implements — see
//! `HostReserve` for where a static-buffer or `VirtualAlloc` variant
//! would plug in), tracks a flush generation so in-flight translators
//! can detect a concurrent flush and discard their work, and maintains
//! the host-code-pointer → TB index fault handlers need.

pub mod arena;
pub mod hostgen;
pub mod index;

pub use arena::{Arena, ArenaError};
pub use hostgen::HostCodeGen;
pub use index::ArenaTbIndex;
