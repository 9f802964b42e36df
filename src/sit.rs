//! In-memory view of the segment information table.
//!
//! `SitInfo` is shared between the allocator, the writeback path and the
//! garbage collector; all access goes through the single entry lock
//! (`sentry_lock`). The collector is strictly a reader of validity bits;
//! it never flips them itself.

use parking_lot::{Mutex, MutexGuard};

use crate::layout::Geometry;
use crate::types::SegNo;

/// Per-segment entry: modification time, validity bitmap and counts.
#[derive(Debug, Clone)]
pub struct SegEntry {
    /// Last modification time of the segment, in seconds.
    pub mtime: u64,
    /// Number of blocks currently valid.
    pub valid_blocks: u32,
    /// Number of blocks valid as of the last checkpoint.
    pub ckpt_valid_blocks: u32,
    valid_map: Box<[u64]>,
}

impl SegEntry {
    /// Create an empty entry for a segment of `blocks_per_seg` blocks.
    pub fn new(blocks_per_seg: u32) -> Self {
        let words = (blocks_per_seg as usize).div_ceil(64);
        Self {
            mtime: 0,
            valid_blocks: 0,
            ckpt_valid_blocks: 0,
            valid_map: vec![0u64; words].into_boxed_slice(),
        }
    }

    /// Whether block `off` is valid.
    pub fn is_valid(&self, off: u32) -> bool {
        self.valid_map[(off / 64) as usize] & (1 << (off % 64)) != 0
    }

    /// Mark block `off` valid; returns false if it already was.
    pub fn mark_valid(&mut self, off: u32) -> bool {
        let word = &mut self.valid_map[(off / 64) as usize];
        let bit = 1u64 << (off % 64);
        if *word & bit != 0 {
            return false;
        }
        *word |= bit;
        self.valid_blocks += 1;
        true
    }

    /// Mark block `off` invalid; returns false if it already was.
    pub fn mark_invalid(&mut self, off: u32) -> bool {
        let word = &mut self.valid_map[(off / 64) as usize];
        let bit = 1u64 << (off % 64);
        if *word & bit == 0 {
            return false;
        }
        *word &= !bit;
        self.valid_blocks -= 1;
        true
    }
}

/// Entry table plus the observed modification-time range, guarded by
/// `sentry_lock`.
#[derive(Debug)]
pub struct SitInner {
    segs_per_sec: u32,
    entries: Vec<SegEntry>,
    /// Oldest segment mtime seen; widened on the fly when an entry drifts
    /// below it (the clock may have been set back).
    pub min_mtime: u64,
    /// Newest segment mtime seen.
    pub max_mtime: u64,
}

impl SitInner {
    /// Entry for `segno`.
    pub fn entry(&self, segno: SegNo) -> &SegEntry {
        &self.entries[segno as usize]
    }

    /// Mutable entry for `segno`.
    pub fn entry_mut(&mut self, segno: SegNo) -> &mut SegEntry {
        &mut self.entries[segno as usize]
    }

    /// Valid blocks of `segno`, or of its whole section.
    pub fn valid_blocks(&self, segno: SegNo, whole_section: bool) -> u32 {
        if !whole_section || self.segs_per_sec == 1 {
            return self.entry(segno).valid_blocks;
        }
        let start = (segno / self.segs_per_sec) * self.segs_per_sec;
        (start..start + self.segs_per_sec)
            .map(|s| self.entry(s).valid_blocks)
            .sum()
    }
}

/// Shared segment-information table.
#[derive(Debug)]
pub struct SitInfo {
    blocks_per_seg: u32,
    inner: Mutex<SitInner>,
}

impl SitInfo {
    /// Create a table sized for `geo`, all segments empty.
    pub fn new(geo: &Geometry) -> Self {
        let entries = (0..geo.main_segs)
            .map(|_| SegEntry::new(geo.blocks_per_seg()))
            .collect();
        Self {
            blocks_per_seg: geo.blocks_per_seg(),
            inner: Mutex::new(SitInner {
                segs_per_sec: geo.segs_per_sec,
                entries,
                min_mtime: u64::MAX,
                max_mtime: 0,
            }),
        }
    }

    /// Blocks per segment the table was sized for.
    pub fn blocks_per_seg(&self) -> u32 {
        self.blocks_per_seg
    }

    /// Take the entry lock.
    pub fn lock(&self) -> MutexGuard<'_, SitInner> {
        self.inner.lock()
    }

    /// Whether block `off` of `segno` is valid right now.
    ///
    /// The answer can go stale the moment the lock drops; relocation paths
    /// re-run this after pinning the page they are about to move.
    pub fn check_valid_map(&self, segno: SegNo, off: u32) -> bool {
        self.inner.lock().entry(segno).is_valid(off)
    }

    /// Valid blocks of `segno`, or of its whole section.
    pub fn valid_blocks(&self, segno: SegNo, whole_section: bool) -> u32 {
        self.inner.lock().valid_blocks(segno, whole_section)
    }
}
