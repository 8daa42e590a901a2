//! Physical-page bookkeeping: which translation blocks cover which
//! guest page, the self-modifying-code bitmap for each page, and the
//! ascending-lock-order algorithm that lets the invalidation engine
//! safely hold several pages at once.

pub mod collection;
pub mod desc;
pub mod list;
pub mod radix;
pub mod smc;

pub use collection::PageCollection;
pub use desc::PageDesc;
pub use radix::PageTable;
