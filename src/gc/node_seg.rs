//! Node-segment relocation.
//!
//! Two passes over the summary: the first streams readahead for every
//! valid node page, the second pins each page, revalidates it and marks
//! it dirty so writeback re-logs it. Foreground passes flush the dirty
//! node set synchronously and report whether the segment emptied.

use crate::fs::GcTarget;
use crate::gc::GcManager;
use crate::summary::SummaryBlock;
use crate::types::SegNo;
use crate::victim::GcKind;

pub(crate) fn gc_node_segment<F: GcTarget>(
    mgr: &GcManager<F>,
    sum: &SummaryBlock,
    segno: SegNo,
    gc_kind: GcKind,
) -> u32 {
    let fs = mgr.fs();
    let geo = fs.geometry();
    let start_addr = geo.start_block(segno);
    let mut moved = 0u64;

    for phase in 0..2 {
        for off in 0..geo.blocks_per_seg() {
            let entry = sum.entry(off);

            // Stop background work once free sections run short.
            if gc_kind == GcKind::Background && fs.has_not_enough_free_secs(0) {
                return 0;
            }

            if !fs.sit().check_valid_map(segno, off) {
                continue;
            }

            if phase == 0 {
                fs.readahead_node_page(entry.nid);
                continue;
            }

            let node_page = match fs.node_page(entry.nid) {
                Ok(page) => page,
                Err(_) => continue,
            };

            // The block may have been invalidated while the page was read.
            if !fs.sit().check_valid_map(segno, off) {
                continue;
            }

            let ni = match fs.node_info(entry.nid) {
                Ok(ni) => ni,
                Err(_) => continue,
            };
            if ni.blk_addr != start_addr.offset(off) {
                continue;
            }

            match gc_kind {
                GcKind::Foreground => {
                    node_page.wait_on_writeback();
                    node_page.set_dirty();
                }
                GcKind::Background => {
                    if !node_page.is_writeback() {
                        node_page.set_dirty();
                    }
                }
            }
            moved += 1;
        }
    }

    mgr.stats().add_node_blocks(moved);

    if gc_kind == GcKind::Foreground {
        fs.sync_node_pages();

        // Report success only if the flush actually emptied the segment.
        if fs.sit().valid_blocks(segno, false) == 0 {
            return 1;
        }
    }
    0
}
