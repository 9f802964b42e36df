//! Reclamation orchestration.
//!
//! One [`GcManager`] exists per mounted filesystem. It owns the global
//! GC lock, the victim bookkeeping shared between foreground and
//! background passes, and the per-call loop that walks a victim section
//! segment by segment and cooperates with the checkpoint writer.

mod data_seg;
mod inode_list;
mod liveness;
mod node_seg;

#[cfg(test)]
mod tests;

pub use data_seg::ClassifyPolicy;
pub use inode_list::GcInodeList;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::{GcConfig, GcTuning};
use crate::dirty::DirtyType;
use crate::fs::GcTarget;
use crate::stats::GcStats;
use crate::status::GcStatus;
use crate::summary::SummaryKind;
use crate::types::{SecNo, SegNo, NULL_SECNO, NULL_SEGNO};
use crate::victim::{self, AllocMode, GcKind, GcMode, VictimPolicy, NR_GC_MODES};

/// Garbage-collection state for one filesystem instance.
pub struct GcManager<F: GcTarget> {
    fs: Arc<F>,
    tuning: GcTuning,
    stats: GcStats,
    policy: VictimPolicy,
    /// Serialises whole reclamation calls, from either entry point.
    gc_mutex: Mutex<()>,
    /// Section a foreground pass is working on right now.
    cur_victim_sec: AtomicU32,
    /// Per-cost-model scan cursors; selection resumes where the bounded
    /// scan last stopped.
    last_victim: [AtomicU32; NR_GC_MODES],
}

impl<F: GcTarget> GcManager<F> {
    /// Create a manager with the default victim-selection policy
    /// installed.
    pub fn new(fs: Arc<F>, config: GcConfig) -> Self {
        Self {
            fs,
            tuning: GcTuning::from_config(&config),
            stats: GcStats::new(),
            policy: VictimPolicy::default(),
            gc_mutex: Mutex::new(()),
            cur_victim_sec: AtomicU32::new(NULL_SECNO),
            last_victim: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    /// Host filesystem.
    pub fn fs(&self) -> &Arc<F> {
        &self.fs
    }

    /// Live tuning knobs.
    pub fn tuning(&self) -> &GcTuning {
        &self.tuning
    }

    /// Activity counters.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Section currently claimed by a foreground pass, if any.
    pub fn cur_victim_sec(&self) -> Option<SecNo> {
        match self.cur_victim_sec.load(Ordering::Acquire) {
            NULL_SECNO => None,
            secno => Some(secno),
        }
    }

    pub(crate) fn set_cur_victim_sec(&self, secno: Option<SecNo>) {
        self.cur_victim_sec
            .store(secno.unwrap_or(NULL_SECNO), Ordering::Release);
    }

    /// Scan cursor recorded for one cost model.
    pub fn last_victim(&self, gc_mode: GcMode) -> SegNo {
        self.last_victim[gc_mode as usize].load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_victim(&self, gc_mode: GcMode, segno: SegNo) {
        self.last_victim[gc_mode as usize].store(segno, Ordering::Relaxed);
    }

    /// Whether `secno` must not be selected: it holds an append target or
    /// a foreground pass is already on it.
    pub(crate) fn sec_usage_check(&self, secno: SecNo) -> bool {
        self.fs.is_current_sec(secno) || self.cur_victim_sec() == Some(secno)
    }

    /// Try to take the global GC lock without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.gc_mutex.try_lock()
    }

    /// Select a victim segment for slack-space recycling of `ty`
    /// segments. Exposed to the allocator.
    pub fn ssr_victim(&self, ty: DirtyType) -> Option<SegNo> {
        let mut sit = self.fs.sit().lock();
        self.get_victim(&mut sit, GcKind::Background, ty, AllocMode::Ssr)
    }

    fn get_victim(
        &self,
        sit: &mut crate::sit::SitInner,
        gc_kind: GcKind,
        ty: DirtyType,
        alloc_mode: AllocMode,
    ) -> Option<SegNo> {
        match self.policy {
            VictimPolicy::Default => {
                victim::get_victim_by_default(self, sit, gc_kind, ty, alloc_mode)
            }
        }
    }

    /// Pick the next section to reclaim, holding the entry lock across
    /// the whole selection.
    fn lfs_victim(&self, gc_kind: GcKind) -> Option<SegNo> {
        let mut sit = self.fs.sit().lock();
        self.get_victim(&mut sit, gc_kind, DirtyType::Dirty, AllocMode::Lfs)
    }

    /// Run one garbage-collection call.
    ///
    /// `sync` forces a foreground pass and reports [`GcStatus::Again`]
    /// when no section could be freed. Asynchronous calls run in
    /// background mode, escalating to foreground themselves when free
    /// space is short.
    pub fn run(&self, sync: bool) -> GcStatus {
        let guard = self.gc_mutex.lock();
        self.run_locked(sync, guard)
    }

    /// Body of [`run`](Self::run); the worker enters here after its own
    /// staged checks so the lock is only taken once per tick.
    pub(crate) fn run_locked(&self, sync: bool, guard: MutexGuard<'_, ()>) -> GcStatus {
        let fs = &self.fs;
        let segs_per_sec = fs.geometry().segs_per_sec;

        let mut gc_kind = if sync {
            GcKind::Foreground
        } else {
            GcKind::Background
        };
        let mut sec_freed = 0u32;
        let mut victim_selected = false;
        let mut gc_list = GcInodeList::new();

        loop {
            if !fs.is_active() || fs.checkpoint_error() {
                break;
            }

            let mut segno = NULL_SEGNO;
            if gc_kind == GcKind::Background && fs.has_not_enough_free_secs(sec_freed) {
                // Escalate, and checkpoint first so prefree segments
                // left by earlier passes become usable.
                gc_kind = GcKind::Foreground;
                segno = self.lfs_victim(GcKind::Foreground).unwrap_or(NULL_SEGNO);
                if segno != NULL_SEGNO || fs.prefree_segments() > 0 {
                    if let Err(err) = fs.write_checkpoint() {
                        warn!(%err, "checkpoint before foreground pass failed");
                        self.set_cur_victim_sec(None);
                        break;
                    }
                }
            }

            if segno == NULL_SEGNO {
                segno = match self.lfs_victim(gc_kind) {
                    Some(segno) => segno,
                    None => break,
                };
            }
            victim_selected = true;
            debug!(segno, gc_kind = gc_kind.as_str(), "collecting section");

            if segs_per_sec > 1 {
                fs.readahead_summaries(segno, segs_per_sec);
            }

            let mut done = 0u32;
            for i in 0..segs_per_sec {
                let nfree = self.do_garbage_collect(segno + i, &mut gc_list, gc_kind);
                // Halt on the first failed segment of a foreground pass
                // rather than stretch the stall over the whole section.
                if nfree == 0 && gc_kind == GcKind::Foreground {
                    break;
                }
                done += 1;
            }
            if done == segs_per_sec && gc_kind == GcKind::Foreground {
                sec_freed += 1;
            }

            if gc_kind == GcKind::Foreground {
                self.set_cur_victim_sec(None);
            }

            if !sync {
                if fs.has_not_enough_free_secs(sec_freed) {
                    continue;
                }
                if gc_kind == GcKind::Foreground {
                    if let Err(err) = fs.write_checkpoint() {
                        warn!(%err, "checkpoint after foreground pass failed");
                    }
                }
            }
            break;
        }

        drop(guard);
        gc_list.release();
        self.stats.add_sections_freed(u64::from(sec_freed));

        if sync {
            if sec_freed > 0 {
                GcStatus::Ok
            } else {
                GcStatus::Again
            }
        } else if victim_selected {
            GcStatus::Ok
        } else {
            GcStatus::NoVictim
        }
    }

    /// Reclaim one segment: read its summary and hand it to the matching
    /// relocator. Returns 1 when a foreground pass emptied the segment.
    pub(crate) fn do_garbage_collect(
        &self,
        segno: SegNo,
        gc_list: &mut GcInodeList,
        gc_kind: GcKind,
    ) -> u32 {
        let fs = &self.fs;

        // Snapshot the summary before touching any segment-entry state.
        // The block replacement path takes the entry lock and then the
        // summary page; holding the summary across check_valid_map below
        // would invert that order.
        let sum = match fs.read_summary(segno) {
            Ok(sum) => sum,
            Err(err) => {
                warn!(segno, %err, "summary read failed, skipping segment");
                return 0;
            }
        };

        let nfree = match sum.kind() {
            SummaryKind::Node => node_seg::gc_node_segment(self, &sum, segno, gc_kind),
            SummaryKind::Data => {
                let classify = match gc_kind {
                    GcKind::Foreground => ClassifyPolicy::ClassifyByCacheState,
                    GcKind::Background => ClassifyPolicy::AlwaysMove,
                };
                data_seg::gc_data_segment(self, &sum, gc_list, segno, gc_kind, classify)
            }
        };

        self.stats.inc_seg_count(sum.kind(), gc_kind);
        self.stats.inc_call_count();
        nfree
    }
}
