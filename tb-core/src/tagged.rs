//! Index-based handles used in place of owning pointers.
//!
//! The jump graph and the per-page TB lists are cyclic and arena-owned:
//! nothing here ever frees a single node, only a whole-arena flush does.
//! Modeling that with `Rc`/`Arc` would fight the allocator instead of
//! describing it, so every link is a plain index into `TbTable`'s
//! storage plus, where a link also needs to remember *which* of a TB's
//! two page/jump slots it refers to, one extra bit folded into the same
//! word.

/// Handle to a `TranslationBlock` inside a `TbTable`. Never dangles on
/// its own — validity is only meaningful relative to a particular
/// table generation (see `TbTable::flush`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TbId(pub u32);

impl TbId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which of a TB's two page (or jump) slots a link refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSlot(pub u8);

impl PageSlot {
    pub const FIRST: PageSlot = PageSlot(0);
    pub const SECOND: PageSlot = PageSlot(1);
}

/// A `(TbId, PageSlot)` pair packed into one `u32`, used for intrusive
/// list heads/links so a page descriptor or a jump-list head costs a
/// single word instead of an `Option<(TbId, PageSlot)>` (which would
/// still be one word here thanks to niche optimization, but the packed
/// form matches the bit-tagged pointers the on-disk original used and
/// is what callers that need to CAS a link reach for).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedLink(u32);

const SLOT_BIT: u32 = 1 << 31;

impl TaggedLink {
    pub const NULL: TaggedLink = TaggedLink(u32::MAX);

    #[inline]
    pub fn new(id: TbId, slot: PageSlot) -> Self {
        debug_assert!(id.0 < SLOT_BIT, "TbId overflows tag bit");
        let bit = if slot.0 != 0 { SLOT_BIT } else { 0 };
        TaggedLink(id.0 | bit)
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == u32::MAX
    }

    #[inline]
    pub fn unpack(self) -> Option<(TbId, PageSlot)> {
        if self.is_null() {
            None
        } else {
            let slot = if self.0 & SLOT_BIT != 0 { 1 } else { 0 };
            Some((TbId(self.0 & !SLOT_BIT), PageSlot(slot)))
        }
    }

    #[inline]
    pub fn from_option(v: Option<(TbId, PageSlot)>) -> Self {
        match v {
            Some((id, slot)) => Self::new(id, slot),
            None => Self::NULL,
        }
    }
}

impl Default for TaggedLink {
    fn default() -> Self {
        TaggedLink::NULL
    }
}
