/// The full lookup key for a translation block.
///
/// Two blocks with an identical fingerprint are indistinguishable to
/// every caller; the hash table keeps at most one of them alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub phys_pc_0: u64,
    pub guest_pc: u64,
    pub flags: u32,
    pub cflags_hash_mask: u32,
    pub trace_mask: u32,
    pub phys_page_0: u64,
    pub phys_page_1: Option<u64>,
}

/// Number of buckets in the global TB hash table.
pub const TB_HASH_SIZE: usize = 1 << 15;

impl Fingerprint {
    /// Bucket index for this fingerprint in a `TB_HASH_SIZE`-bucket
    /// table. Mixes every field so that blocks which differ only in
    /// `cflags`/`trace_mask` (the common re-translation-under-a-new-mode
    /// case) land in different buckets.
    pub fn bucket(&self) -> usize {
        let mut h = self.guest_pc.wrapping_mul(0x9e3779b97f4a7c15);
        h ^= self.phys_pc_0.wrapping_mul(0xff51afd7ed558ccd);
        h ^= (self.flags as u64) << 1;
        h ^= (self.cflags_hash_mask as u64) << 17;
        h ^= (self.trace_mask as u64) << 33;
        h ^= self.phys_page_0.rotate_left(13);
        if let Some(p1) = self.phys_page_1 {
            h ^= p1.rotate_left(29) ^ 0x1;
        }
        (h as usize) & (TB_HASH_SIZE - 1)
    }
}
