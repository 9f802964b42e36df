//! Victim selection: pick the segment (or section) to reclaim next.
//!
//! Candidates come from the dirty-segment bitmaps. The scan is bounded;
//! where it stops, a per-model cursor is recorded so the next call
//! resumes there instead of rescanning the front of the map. Foreground
//! log-structured passes first drain sections that earlier background
//! passes vetted as cheap.

mod cost;
mod policy;

pub use policy::{select_gc_mode, AllocMode, GcKind, GcMode, VictimPolicy, NR_GC_MODES};

use crate::dirty::{DirtyInner, DirtyType};
use crate::fs::GcTarget;
use crate::gc::GcManager;
use crate::sit::SitInner;
use crate::types::SegNo;

/// Working state of one selection call.
#[derive(Debug)]
pub(crate) struct VictimSelPolicy {
    pub(crate) alloc_mode: AllocMode,
    pub(crate) gc_mode: GcMode,
    pub(crate) dirty_type: DirtyType,
    pub(crate) max_search: u32,
    pub(crate) offset: SegNo,
    pub(crate) ofs_unit: u32,
    pub(crate) min_cost: u32,
    pub(crate) min_segno: Option<SegNo>,
}

fn select_policy<F: GcTarget>(
    mgr: &GcManager<F>,
    dirty: &DirtyInner,
    gc_kind: GcKind,
    ty: DirtyType,
    alloc_mode: AllocMode,
) -> VictimSelPolicy {
    let (gc_mode, dirty_type, max_search, ofs_unit) = match alloc_mode {
        AllocMode::Ssr => (GcMode::Greedy, ty, dirty.nr_dirty(ty), 1),
        AllocMode::Lfs => (
            select_gc_mode(mgr.tuning().gc_idle(), gc_kind),
            DirtyType::Dirty,
            dirty.nr_dirty(DirtyType::Dirty),
            mgr.fs().geometry().segs_per_sec,
        ),
    };

    let max_search = max_search.min(mgr.tuning().max_victim_search());

    VictimSelPolicy {
        alloc_mode,
        gc_mode,
        dirty_type,
        max_search,
        offset: mgr.last_victim(gc_mode),
        ofs_unit,
        min_cost: 0,
        min_segno: None,
    }
}

/// Drain one section vetted by background passes, if any is usable.
fn check_bg_victims<F: GcTarget>(mgr: &GcManager<F>, dirty: &mut DirtyInner) -> Option<SegNo> {
    let geo = mgr.fs().geometry();
    let mut secno = 0;
    while let Some(found) = dirty.victim_secmap.next_set_bit(secno, geo.main_secs()) {
        if mgr.sec_usage_check(found) {
            secno = found + 1;
            continue;
        }
        dirty.victim_secmap.clear(found);
        return Some(geo.sec_start_seg(found));
    }
    None
}

/// The shipped selection policy.
///
/// Runs under `seglist_lock` with the caller already holding the entry
/// lock. Returns the chosen segment aligned to the allocation unit, or
/// `None` when the dirty set has nothing usable.
pub(crate) fn get_victim_by_default<F: GcTarget>(
    mgr: &GcManager<F>,
    sit: &mut SitInner,
    gc_kind: GcKind,
    ty: DirtyType,
    alloc_mode: AllocMode,
) -> Option<SegNo> {
    let geo = *mgr.fs().geometry();
    let mut dirty = mgr.fs().dirty_seglist().lock();

    let mut p = select_policy(mgr, &dirty, gc_kind, ty, alloc_mode);
    let max_cost = cost::max_cost(&geo, &p);
    p.min_cost = max_cost;

    if p.max_search == 0 {
        return None;
    }

    let mut from_secmap = false;
    if p.alloc_mode == AllocMode::Lfs && gc_kind == GcKind::Foreground {
        if let Some(segno) = check_bg_victims(mgr, &mut dirty) {
            p.min_segno = Some(segno);
            from_secmap = true;
        }
    }

    if !from_secmap {
        let mut last_segment = geo.main_segs;
        let mut nsearched = 0u32;

        loop {
            let segno = match dirty.segmap(p.dirty_type).next_set_bit(p.offset, last_segment) {
                Some(segno) => segno,
                None => {
                    // Wrap once: rescan the stretch before the recorded
                    // cursor, then give up.
                    let resume = mgr.last_victim(p.gc_mode);
                    if resume != 0 {
                        last_segment = resume;
                        mgr.set_last_victim(p.gc_mode, 0);
                        p.offset = 0;
                        continue;
                    }
                    break;
                }
            };

            p.offset = segno + p.ofs_unit;
            if p.ofs_unit > 1 {
                p.offset -= segno % p.ofs_unit;
            }

            let secno = geo.secno(segno);
            if mgr.sec_usage_check(secno) {
                continue;
            }
            if gc_kind == GcKind::Background && dirty.victim_secmap.test(secno) {
                continue;
            }

            let cost = cost::gc_cost(sit, &geo, segno, &p);

            if p.min_cost > cost {
                p.min_segno = Some(segno);
                p.min_cost = cost;
            } else if cost == max_cost {
                // Worst-case candidates are not worth tracking, and they
                // do not count against the search bound either.
                continue;
            }

            if nsearched >= p.max_search {
                mgr.set_last_victim(p.gc_mode, segno);
                break;
            }
            nsearched += 1;
        }
    }

    let min_segno = p.min_segno?;
    if p.alloc_mode == AllocMode::Lfs {
        let secno = geo.secno(min_segno);
        match gc_kind {
            GcKind::Foreground => mgr.set_cur_victim_sec(Some(secno)),
            GcKind::Background => {
                dirty.victim_secmap.set(secno);
            }
        }
    }
    Some((min_segno / p.ofs_unit) * p.ofs_unit)
}
