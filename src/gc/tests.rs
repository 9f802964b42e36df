//! End-to-end reclamation tests over the in-memory host.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::*;
use crate::config::GcConfig;
use crate::fs::mem::MemFs;
use crate::fs::{CacheState, GcTarget};
use crate::layout::Geometry;
use crate::status::GcStatus;
use crate::victim::{GcKind, GcMode};

/// Selection-only geometry: 512-block segments, one segment per section.
fn selector_fs() -> Arc<MemFs> {
    MemFs::new(Geometry::new(9, 1, 64))
}

/// Relocation geometry: 8-block segments so every block is laid out by
/// hand.
fn reloc_fs() -> Arc<MemFs> {
    MemFs::new(Geometry::new(3, 1, 16))
}

fn manager(fs: &Arc<MemFs>) -> GcManager<MemFs> {
    GcManager::new(Arc::clone(fs), GcConfig::default())
}

// ---- victim selection ----

#[test]
fn test_greedy_picks_first_minimum() {
    let fs = selector_fs();
    for (seg, valid) in [(10, 100), (20, 50), (30, 50)] {
        fs.mark_dirty(seg);
        fs.set_valid_blocks(seg, valid);
    }
    let gc = manager(&fs);

    // Segments 20 and 30 tie; the first minimum seen wins.
    assert_eq!(gc.lfs_victim(GcKind::Foreground), Some(20));
    assert_eq!(gc.cur_victim_sec(), Some(20));
}

#[test]
fn test_cost_benefit_prefers_older_section() {
    let fs = selector_fs();
    for seg in [10, 20] {
        fs.mark_dirty(seg);
        fs.set_valid_blocks(seg, 256);
    }
    fs.set_seg_mtime(10, 200);
    fs.set_seg_mtime(20, 100);
    fs.set_mtime_range(0, 1000);
    let gc = manager(&fs);

    assert_eq!(gc.lfs_victim(GcKind::Background), Some(20));
    // Background selection parks its pick for foreground consumption.
    assert!(fs.dirty_seglist().is_bg_victim(20));
}

#[test]
fn test_foreground_fast_path_consumes_bg_victims() {
    let fs = selector_fs();
    // Cheap candidates a scan would prefer over section 5.
    for seg in [1, 2, 3] {
        fs.mark_dirty(seg);
        fs.set_valid_blocks(seg, 1);
    }
    fs.mark_dirty(5);
    fs.set_valid_blocks(5, 400);
    fs.mark_bg_victim(5);
    let gc = manager(&fs);

    assert_eq!(gc.lfs_victim(GcKind::Foreground), Some(5));
    assert!(!fs.dirty_seglist().is_bg_victim(5));
    assert_eq!(gc.cur_victim_sec(), Some(5));
}

#[test]
fn test_bounded_scan_records_cursor() {
    let fs = selector_fs();
    for seg in [1, 2, 3, 4, 5] {
        fs.mark_dirty(seg);
        fs.set_valid_blocks(seg, 1);
    }
    let gc = GcManager::new(
        Arc::clone(&fs),
        GcConfig::new().with_max_victim_search(2),
    );

    assert_eq!(gc.lfs_victim(GcKind::Foreground), Some(1));
    // The scan stopped at segment 3 and left a cursor there.
    assert_eq!(gc.last_victim(GcMode::Greedy), 3);
}

#[test]
fn test_scan_wraps_once_from_cursor() {
    let fs = selector_fs();
    fs.mark_dirty(10);
    fs.set_valid_blocks(10, 5);
    let gc = manager(&fs);
    gc.set_last_victim(GcMode::Greedy, 25);

    assert_eq!(gc.lfs_victim(GcKind::Foreground), Some(10));
    assert_eq!(gc.last_victim(GcMode::Greedy), 0);
}

#[test]
fn test_worst_case_candidates_are_skipped() {
    let fs = selector_fs();
    // Segment 10 is fully valid: reclaiming it buys nothing.
    fs.mark_dirty(10);
    fs.set_valid_blocks(10, 512);
    fs.mark_dirty(20);
    fs.set_valid_blocks(20, 100);
    let gc = GcManager::new(
        Arc::clone(&fs),
        GcConfig::new().with_max_victim_search(1),
    );

    // The full segment neither wins nor consumes the search bound.
    assert_eq!(gc.lfs_victim(GcKind::Foreground), Some(20));
}

#[test]
fn test_current_section_excluded() {
    let fs = selector_fs();
    // Segment 62 is the data append target.
    fs.mark_dirty(62);
    fs.set_valid_blocks(62, 1);
    fs.mark_dirty(20);
    fs.set_valid_blocks(20, 100);
    let gc = manager(&fs);

    assert_eq!(gc.lfs_victim(GcKind::Foreground), Some(20));
}

#[test]
fn test_background_does_not_requeue_marked_sections() {
    let fs = selector_fs();
    fs.set_mtime_range(0, 1000);
    for seg in [10, 20] {
        fs.mark_dirty(seg);
        fs.set_valid_blocks(seg, 64);
        fs.set_seg_mtime(seg, 500);
    }
    fs.mark_bg_victim(10);
    let gc = manager(&fs);

    assert_eq!(gc.lfs_victim(GcKind::Background), Some(20));
}

#[test]
fn test_no_victim_on_empty_dirty_set() {
    let fs = selector_fs();
    let gc = manager(&fs);
    assert_eq!(gc.lfs_victim(GcKind::Foreground), None);
    assert_eq!(gc.run(false), GcStatus::NoVictim);
    assert_eq!(gc.run(true), GcStatus::Again);
}

#[test]
fn test_ssr_victim_minimises_checkpointed_count() {
    let fs = selector_fs();
    fs.mark_dirty_typed(crate::dirty::DirtyType::HotData, 7);
    fs.set_ckpt_valid_blocks(7, 3);
    fs.mark_dirty_typed(crate::dirty::DirtyType::HotData, 9);
    fs.set_ckpt_valid_blocks(9, 1);
    let gc = manager(&fs);

    assert_eq!(gc.ssr_victim(crate::dirty::DirtyType::HotData), Some(9));
    // Slack-space selection claims nothing and marks nothing.
    assert_eq!(gc.cur_victim_sec(), None);
    assert!(!fs.dirty_seglist().is_bg_victim(9));
}

#[test]
fn test_gc_lock_is_exclusive() {
    let fs = selector_fs();
    let gc = manager(&fs);
    let guard = gc.try_lock().unwrap();
    assert!(gc.try_lock().is_none());
    drop(guard);
    assert!(gc.try_lock().is_some());
}

// ---- data-segment relocation ----

#[test]
fn test_stale_summary_version_skips_block() {
    let fs = reloc_fs();
    fs.add_inode(1, true, false);
    fs.add_node(42, 1, 0, 8);
    fs.set_nat_version(42, 3);
    fs.place_data_block(2, 7, 42, 7);
    fs.mark_dirty(2);
    // The node was reallocated since the summary was written.
    fs.set_nat_version(42, 4);

    let gc = manager(&fs);
    let mut list = GcInodeList::new();
    let nfree = gc.do_garbage_collect(2, &mut list, GcKind::Foreground);
    list.release();

    assert_eq!(nfree, 0);
    assert!(fs.sit().check_valid_map(2, 7));
    // Readahead went out in the first pass, but no relocation I/O of any
    // kind was issued.
    assert!(fs.node_readaheads() >= 1);
    assert_eq!(fs.data_writes(), 0);
    assert_eq!(fs.data_remaps(), 0);
    assert_eq!(fs.page_writes(), 0);
}

#[test]
fn test_background_skips_pages_under_writeback() {
    let fs = reloc_fs();
    fs.add_inode(1, true, false);
    fs.add_node(100, 1, 0, 8);
    let b0 = fs.place_data_block(2, 0, 100, 0);
    fs.mark_dirty(2);
    fs.set_seg_mtime(2, 100);
    fs.set_mtime_range(0, 1000);
    fs.cache_data_page(1, b0, false);
    fs.set_data_page_writeback(1, b0, true);

    let gc = manager(&fs);
    assert_eq!(gc.run(false), GcStatus::Ok);

    // The page stayed clean; a background pass will not touch a page with
    // writeback in flight.
    let inode = fs.iget(1).unwrap();
    assert_eq!(fs.data_cache_state(inode.as_ref(), b0), CacheState::Clean);
    assert_eq!(fs.data_writes(), 0);
}

#[test]
fn test_section_reclaim_spans_all_segments() {
    // Two segments per section; the whole section moves or nothing does.
    let fs = MemFs::new(Geometry::new(3, 2, 16));
    fs.add_inode(1, true, false);
    fs.add_node(100, 1, 0, 16);
    let b0 = fs.place_data_block(4, 0, 100, 0);
    let b1 = fs.place_data_block(5, 0, 100, 1);
    fs.mark_dirty(4);
    fs.mark_dirty(5);
    fs.cache_data_page(1, b0, true);
    fs.cache_data_page(1, b1, true);

    let gc = manager(&fs);
    assert_eq!(gc.run(true), GcStatus::Ok);

    assert_eq!(fs.sit().valid_blocks(4, true), 0);
    assert_eq!(fs.data_writes(), 2);
    // Both summaries were prefetched before the per-segment walk.
    assert_eq!(fs.summary_readaheads(), 2);
    assert_eq!(gc.stats().sections_freed.load(Ordering::Relaxed), 1);
}

#[test]
fn test_foreground_reclaims_dirty_cached_blocks() {
    let fs = reloc_fs();
    fs.add_inode(1, true, false);
    fs.add_node(100, 1, 0, 8);
    let b0 = fs.place_data_block(2, 0, 100, 0);
    let b1 = fs.place_data_block(2, 1, 100, 1);
    fs.mark_dirty(2);
    fs.cache_data_page(1, b0, true);
    fs.cache_data_page(1, b1, true);

    let gc = manager(&fs);
    let inode = fs.inode(1).unwrap();
    let refs_before = Arc::strong_count(&inode);

    assert_eq!(gc.run(true), GcStatus::Ok);

    assert_eq!(fs.sit().valid_blocks(2, false), 0);
    assert_eq!(fs.data_writes(), 2);
    assert!(fs.merged_submits() >= 1);
    assert_eq!(gc.stats().sections_freed.load(Ordering::Relaxed), 1);
    assert_eq!(gc.stats().data_blocks_moved.load(Ordering::Relaxed), 2);
    assert_eq!(gc.cur_victim_sec(), None);
    // Every reference taken during the pass was dropped again.
    assert_eq!(Arc::strong_count(&inode), refs_before);
    assert!(inode.appended());
    assert!(inode.first_block_written());
}

#[test]
fn test_foreground_classifies_clean_blocks_as_remap() {
    let fs = reloc_fs();
    fs.add_inode(1, true, false);
    fs.add_node(100, 1, 0, 8);
    let b0 = fs.place_data_block(2, 0, 100, 0);
    let _b1 = fs.place_data_block(2, 1, 100, 1);
    fs.mark_dirty(2);
    // b0 is dirty in cache, b1 is not cached at all.
    fs.cache_data_page(1, b0, true);

    let gc = manager(&fs);
    assert_eq!(gc.run(true), GcStatus::Ok);

    assert_eq!(fs.sit().valid_blocks(2, false), 0);
    assert_eq!(fs.data_writes(), 1);
    assert_eq!(fs.data_remaps(), 1);
}

#[test]
fn test_background_defers_rewrites_to_writeback() {
    let fs = reloc_fs();
    fs.add_inode(1, true, false);
    fs.add_node(100, 1, 0, 8);
    let b0 = fs.place_data_block(2, 0, 100, 0);
    let b1 = fs.place_data_block(2, 1, 100, 1);
    fs.mark_dirty(2);
    fs.set_seg_mtime(2, 100);
    fs.set_mtime_range(0, 1000);

    let gc = manager(&fs);
    assert_eq!(gc.run(false), GcStatus::Ok);

    // Pages were only dirtied; the blocks have not moved yet.
    assert_eq!(fs.data_writes(), 0);
    assert_eq!(fs.sit().valid_blocks(2, false), 2);
    let inode = fs.iget(1).unwrap();
    assert_eq!(fs.data_cache_state(inode.as_ref(), b0), CacheState::Dirty);
    assert_eq!(fs.data_cache_state(inode.as_ref(), b1), CacheState::Dirty);
    assert_eq!(gc.stats().data_blocks_moved.load(Ordering::Relaxed), 2);
    assert!(fs.dirty_seglist().is_bg_victim(2));
    assert_eq!(fs.checkpoints(), 0);
}

#[test]
fn test_encrypted_blocks_move_through_meta_mapping() {
    let fs = reloc_fs();
    fs.add_inode(9, true, true);
    fs.add_node(200, 9, 0, 8);
    fs.place_data_block(2, 0, 200, 5);
    fs.mark_dirty(2);

    let gc = manager(&fs);
    assert_eq!(gc.run(true), GcStatus::Ok);

    assert_eq!(fs.sit().valid_blocks(2, false), 0);
    // Ciphertext staged and submitted directly, never the write path.
    assert!(fs.page_reads() >= 1);
    assert_eq!(fs.page_writes(), 1);
    assert_eq!(fs.extent_updates(), 1);
    assert_eq!(fs.data_writes(), 0);
    assert!(fs.inode(9).unwrap().appended());
}

// ---- node-segment relocation ----

#[test]
fn test_foreground_reclaims_node_segment() {
    let fs = reloc_fs();
    fs.add_inode(1, true, false);
    fs.add_node(7, 1, 0, 8);
    fs.add_node(8, 1, 1, 8);
    fs.place_node_block(3, 0, 7);
    fs.place_node_block(3, 1, 8);
    fs.mark_dirty(3);

    let gc = manager(&fs);
    assert_eq!(gc.run(true), GcStatus::Ok);

    assert_eq!(fs.sit().valid_blocks(3, false), 0);
    assert_eq!(gc.stats().node_blocks_moved.load(Ordering::Relaxed), 2);
    assert_eq!(gc.stats().sections_freed.load(Ordering::Relaxed), 1);
    // Both nodes now live in the node append segment.
    let geo = *fs.geometry();
    assert_eq!(geo.seg_of_block(fs.node_info(7).unwrap().blk_addr).0, 15);
    assert_eq!(geo.seg_of_block(fs.node_info(8).unwrap().blk_addr).0, 15);
}

#[test]
fn test_stale_node_address_skips_block() {
    let fs = reloc_fs();
    fs.add_inode(1, true, false);
    fs.add_node(7, 1, 0, 8);
    fs.place_node_block(3, 0, 7);
    // The node moved to segment 4; segment 3 still carries the old copy's
    // summary and validity bit.
    fs.place_node_block(4, 0, 7);
    fs.mark_dirty(3);

    let gc = manager(&fs);
    let mut list = GcInodeList::new();
    let nfree = gc.do_garbage_collect(3, &mut list, GcKind::Foreground);
    list.release();

    assert_eq!(nfree, 0);
    assert_eq!(gc.stats().node_blocks_moved.load(Ordering::Relaxed), 0);
    assert!(fs.sit().check_valid_map(3, 0));
}

// ---- orchestration ----

#[test]
fn test_inactive_fs_stops_immediately() {
    let fs = reloc_fs();
    fs.add_inode(1, true, false);
    fs.add_node(100, 1, 0, 8);
    fs.place_data_block(2, 0, 100, 0);
    fs.mark_dirty(2);
    fs.set_active(false);

    let gc = manager(&fs);
    assert_eq!(gc.run(true), GcStatus::Again);
    assert_eq!(gc.stats().call_count.load(Ordering::Relaxed), 0);
    assert_eq!(fs.checkpoints(), 0);
}

#[test]
fn test_checkpoint_error_stops_immediately() {
    let fs = reloc_fs();
    fs.add_inode(1, true, false);
    fs.add_node(100, 1, 0, 8);
    fs.place_data_block(2, 0, 100, 0);
    fs.mark_dirty(2);
    fs.set_cp_error(true);

    let gc = manager(&fs);
    assert_eq!(gc.run(false), GcStatus::NoVictim);
    assert_eq!(gc.stats().call_count.load(Ordering::Relaxed), 0);
}

#[test]
fn test_background_escalates_under_pressure() {
    let fs = reloc_fs();
    fs.add_inode(1, true, false);
    fs.add_node(100, 1, 0, 8);
    let b0 = fs.place_data_block(2, 0, 100, 0);
    fs.mark_dirty(2);
    fs.cache_data_page(1, b0, true);
    fs.set_reserved_sections(100);

    let gc = manager(&fs);
    assert_eq!(gc.run(false), GcStatus::Ok);

    // The pass went foreground: checkpoint first, then a real move.
    assert!(fs.checkpoints() >= 1);
    assert_eq!(fs.data_writes(), 1);
    assert_eq!(fs.sit().valid_blocks(2, false), 0);
    assert_eq!(gc.stats().sections_freed.load(Ordering::Relaxed), 1);
}

#[test]
fn test_checkpoint_failure_aborts_escalation() {
    let fs = reloc_fs();
    fs.add_inode(1, true, false);
    fs.add_node(100, 1, 0, 8);
    fs.place_data_block(2, 0, 100, 0);
    fs.mark_dirty(2);
    fs.set_reserved_sections(100);
    fs.set_checkpoint_failing(true);

    let gc = manager(&fs);
    assert_eq!(gc.run(false), GcStatus::NoVictim);
    assert_eq!(gc.stats().call_count.load(Ordering::Relaxed), 0);
    assert_eq!(fs.data_writes(), 0);
}

#[test]
fn test_unreadable_summary_fails_the_section() {
    let fs = reloc_fs();
    // Dirty by accounting, but no summary was ever written.
    fs.mark_dirty(5);
    fs.set_valid_blocks(5, 3);

    let gc = manager(&fs);
    assert_eq!(gc.run(true), GcStatus::Again);
}
