//! Core data model for the translation block cache.
//!
//! Holds the types every other crate in the workspace shares: the
//! `TranslationBlock` record itself, the `Fingerprint` lookup key, the
//! per-CPU `JumpCache`, and the small `TbId`/tagged-slot vocabulary used
//! to thread intrusive lists through arena-owned storage without Rust
//! ownership.

pub mod fingerprint;
pub mod tagged;
pub mod tb;

pub use fingerprint::Fingerprint;
pub use tagged::{PageSlot, TbId};
pub use tb::{cflags, JumpCache, TbPageLinks, TranslationBlock};
