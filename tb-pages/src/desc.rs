use std::sync::Mutex;

use tb_core::tagged::TaggedLink;

use crate::smc::{SmcBitmap, SmcWriteCount, SMC_BUILD_THRESHOLD};

pub const GUEST_PAGE_SIZE: usize = 4096;

/// Mutable state protected by a single page's lock: the head of the
/// intrusive TB list covering this page, and its lazily-built SMC
/// bitmap.
#[derive(Default)]
pub struct PageDescState {
    pub first_tb: TaggedLink,
    pub smc_bitmap: Option<SmcBitmap>,
}

/// Per-physical-page record. One of these exists for every guest page
/// that has ever held compiled code.
pub struct PageDesc {
    state: Mutex<PageDescState>,
    write_count: SmcWriteCount,
}

impl Default for PageDesc {
    fn default() -> Self {
        Self {
            state: Mutex::new(PageDescState::default()),
            write_count: SmcWriteCount::default(),
        }
    }
}

impl PageDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, PageDescState> {
        self.state.lock().unwrap()
    }

    pub fn try_lock(&self) -> Option<std::sync::MutexGuard<'_, PageDescState>> {
        self.state.try_lock().ok()
    }

    /// Records a write into this page; returns `true` once the write
    /// count first crosses the bitmap-building threshold so the caller
    /// knows to build one while it already holds the page lock.
    pub fn note_write(&self) -> bool {
        self.write_count.bump() == SMC_BUILD_THRESHOLD
    }

    pub fn reset_write_count(&self) {
        self.write_count.reset();
    }
}

impl PageDescState {
    /// Discard the SMC bitmap: called whenever the TB list structurally
    /// changes, since the bitmap is only valid for the set of TBs it
    /// was built from.
    pub fn invalidate_bitmap(&mut self) {
        self.smc_bitmap = None;
    }

    pub fn build_bitmap(&mut self) -> &mut SmcBitmap {
        self.smc_bitmap
            .get_or_insert_with(|| SmcBitmap::new(GUEST_PAGE_SIZE))
    }
}
