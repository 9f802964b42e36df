//! Per-segment reclamation cost under the two shipped models.

use crate::layout::Geometry;
use crate::sit::SitInner;
use crate::types::SegNo;
use crate::victim::{AllocMode, GcMode, VictimSelPolicy};

/// Worst possible cost under `p`'s model; candidates at this cost are
/// not worth reclaiming.
pub(crate) fn max_cost(geo: &Geometry, p: &VictimSelPolicy) -> u32 {
    // Slack-space recycling allocates in segment units.
    if p.alloc_mode == AllocMode::Ssr {
        return geo.blocks_per_seg();
    }
    match p.gc_mode {
        GcMode::Greedy => geo.blocks_per_seg() * p.ofs_unit,
        GcMode::CostBenefit => u32::MAX,
    }
}

/// Cost of reclaiming the section (or segment, for slack-space reuse)
/// containing `segno`. Lower is better.
pub(crate) fn gc_cost(sit: &mut SitInner, geo: &Geometry, segno: SegNo, p: &VictimSelPolicy) -> u32 {
    if p.alloc_mode == AllocMode::Ssr {
        return sit.entry(segno).ckpt_valid_blocks;
    }
    match p.gc_mode {
        GcMode::Greedy => sit.valid_blocks(segno, true),
        GcMode::CostBenefit => cb_cost(sit, geo, segno),
    }
}

/// Cost-benefit ranking: prefer old sections with little live data.
///
/// Utilisation `u` and age are both expressed as percentages; the final
/// value is the complement of `(100 - u) * age / (100 + u)` so that a
/// plain minimum search still applies.
fn cb_cost(sit: &mut SitInner, geo: &Geometry, segno: SegNo) -> u32 {
    let secno = geo.secno(segno);
    let start = geo.sec_start_seg(secno);

    let mut mtime: u64 = 0;
    for i in 0..geo.segs_per_sec {
        mtime += sit.entry(start + i).mtime;
    }
    let vblocks = u64::from(sit.valid_blocks(segno, true));

    let mtime = mtime / u64::from(geo.segs_per_sec);
    let vblocks = vblocks / u64::from(geo.segs_per_sec);

    let u = (vblocks * 100) >> geo.log_blocks_per_seg;

    // The clock may have been set by the user; widen the observed range
    // instead of trusting it.
    if mtime < sit.min_mtime {
        sit.min_mtime = mtime;
    }
    if mtime > sit.max_mtime {
        sit.max_mtime = mtime;
    }
    let age = if sit.max_mtime != sit.min_mtime {
        100 - (100 * (mtime - sit.min_mtime)) / (sit.max_mtime - sit.min_mtime)
    } else {
        0
    };

    u32::MAX - ((100 * (100 - u) * age) / (100 + u)) as u32
}
