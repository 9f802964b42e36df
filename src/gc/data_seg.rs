//! Data-segment relocation.
//!
//! Four passes over the summary, each one readahead level deeper than the
//! last: parent node pages first, then the owning inodes, then the data
//! pages themselves, and finally the moves. Splitting the dependent reads
//! this way keeps every level streaming instead of stalling block by
//! block.

use std::sync::Arc;

use tracing::debug;

use crate::fs::{CacheState, GcInode, GcTarget};
use crate::gc::inode_list::GcInodeList;
use crate::gc::liveness::is_alive;
use crate::gc::GcManager;
use crate::layout::start_bidx_of_node;
use crate::summary::{SummaryBlock, SummaryEntry};
use crate::types::SegNo;
use crate::victim::GcKind;

/// How surviving blocks are routed to their new log positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifyPolicy {
    /// Rewrite every block through the normal write path.
    AlwaysMove,
    /// Route by cache residency: dirty pages are rewritten, clean and
    /// uncached blocks are remapped without touching the payload.
    ClassifyByCacheState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockClass {
    Move,
    Remap,
}

pub(crate) fn gc_data_segment<F: GcTarget>(
    mgr: &GcManager<F>,
    sum: &SummaryBlock,
    gc_list: &mut GcInodeList,
    segno: SegNo,
    gc_kind: GcKind,
    classify: ClassifyPolicy,
) -> u32 {
    let fs = mgr.fs();
    let geo = fs.geometry();
    let start_addr = geo.start_block(segno);
    let mut classes = vec![BlockClass::Move; geo.blocks_per_seg() as usize];
    let mut moved = 0u64;

    for phase in 0..4 {
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

            let Some((dni, nofs)) = is_alive(fs.as_ref(), entry, start_addr.offset(off)) else {
                continue;
            };

            if phase == 1 {
                fs.readahead_node_page(dni.ino);
                continue;
            }

            let ofs_in_node = entry.ofs_in_node;

            if phase == 2 {
                let inode = match fs.iget(dni.ino) {
                    Ok(inode) => inode,
                    Err(_) => continue,
                };
                if inode.is_bad() {
                    continue;
                }

                // Encrypted payloads are staged through the meta mapping
                // in phase 3; nothing to warm up here.
                if inode.is_encrypted() && inode.is_regular() {
                    gc_list.add(inode);
                    continue;
                }

                let start_bidx = start_bidx_of_node(nofs, inode.addrs_per_inode());
                let bidx = start_bidx + u64::from(ofs_in_node);

                if classify == ClassifyPolicy::ClassifyByCacheState {
                    classes[off as usize] = match fs.data_cache_state(inode.as_ref(), bidx) {
                        CacheState::Dirty => BlockClass::Move,
                        CacheState::Clean | CacheState::Uncached => BlockClass::Remap,
                    };
                }

                fs.readahead_data_page(inode.as_ref(), bidx);
                gc_list.add(inode);
                continue;
            }

            // Phase 3: the inode is pinned if phase 2 got this far.
            let Some(inode) = gc_list.find(dni.ino) else {
                continue;
            };
            let inode = Arc::clone(inode);
            let bidx = start_bidx_of_node(nofs, inode.addrs_per_inode()) + u64::from(ofs_in_node);

            if inode.is_encrypted() && inode.is_regular() {
                move_encrypted_block(fs.as_ref(), inode.as_ref(), bidx);
            } else {
                match classes[off as usize] {
                    BlockClass::Move => move_data_page(fs.as_ref(), inode.as_ref(), bidx, gc_kind),
                    BlockClass::Remap => remap_data_page(fs.as_ref(), inode.as_ref(), bidx),
                }
            }
            moved += 1;
        }
    }

    mgr.stats().add_data_blocks(moved);

    if gc_kind == GcKind::Foreground {
        fs.submit_merged_data_io();

        // Report success only if the segment actually emptied.
        if fs.sit().valid_blocks(segno, false) == 0 {
            return 1;
        }
    }
    0
}

/// Rewrite one block through the normal data write path.
///
/// Background passes only dirty the page and leave the rewrite to the
/// flusher, and they skip pages already under writeback rather than
/// stall on them.
fn move_data_page<F: GcTarget>(fs: &F, inode: &dyn GcInode, bidx: u64, gc_kind: GcKind) {
    let page = match fs.locked_data_page(inode, bidx) {
        Ok(page) => page,
        Err(_) => return,
    };

    match gc_kind {
        GcKind::Background => {
            if page.is_writeback() {
                return;
            }
            page.set_dirty();
            page.set_cold(true);
        }
        GcKind::Foreground => {
            page.set_dirty();
            page.wait_on_writeback();
            let _ = page.clear_dirty_for_io();
            page.set_cold(true);
            if let Err(err) = fs.write_data_page(inode, bidx, page.as_ref()) {
                debug!(ino = inode.ino(), bidx, %err, "data block rewrite failed");
            }
            page.set_cold(false);
        }
    }
}

/// Reassign a clean block to a new log position without re-reading or
/// re-submitting the payload.
fn remap_data_page<F: GcTarget>(fs: &F, inode: &dyn GcInode, bidx: u64) {
    let page = match fs.grab_cache_page(inode, bidx) {
        Ok(page) => page,
        Err(_) => return,
    };

    let _ = page.clear_dirty_for_io();
    page.set_cold(true);
    if let Err(err) = fs.remap_data_page(inode, bidx, page.as_ref()) {
        debug!(ino = inode.ino(), bidx, %err, "data block remap failed");
    }
    page.set_cold(false);
}

/// Relocate one encrypted block without decrypting it.
///
/// The ciphertext is read into the meta mapping and submitted straight to
/// the new address, so the block keeps its encryption context and the
/// file's own mapping never sees plaintext staging.
fn move_encrypted_block<F: GcTarget>(fs: &F, inode: &dyn GcInode, bidx: u64) {
    // Pin the file page without reading it; only the cipher copy moves.
    let page = match fs.grab_cache_page(inode, bidx) {
        Ok(page) => page,
        Err(_) => return,
    };

    let mut dn = match fs.dnode_of_data(inode, bidx) {
        Ok(dn) => dn,
        Err(_) => return,
    };

    // Truncated under us.
    if dn.data_blkaddr().is_null() {
        page.clear_uptodate();
        return;
    }

    // Do not stage ciphertext until earlier dirty data for this page has
    // reached the device.
    page.wait_on_writeback();

    let ni = match fs.node_info(dn.nid()) {
        Ok(ni) => ni,
        Err(_) => return,
    };
    let summary = SummaryEntry::new(dn.nid(), ni.version, dn.ofs_in_node());
    let old_addr = dn.data_blkaddr();

    let enc_page = match fs.meta_page(old_addr) {
        Ok(page) => page,
        Err(_) => return,
    };
    if fs.submit_page_read(enc_page.as_ref(), old_addr).is_err() {
        return;
    }
    if !enc_page.is_uptodate() {
        return;
    }

    enc_page.set_dirty();
    enc_page.wait_on_writeback();
    let _ = enc_page.clear_dirty_for_io();

    dn.wait_node_writeback();
    let new_addr = fs.allocate_data_block(old_addr, summary);
    fs.submit_page_write(enc_page.as_ref(), new_addr);

    dn.set_data_blkaddr(new_addr);
    fs.update_extent_cache(inode, bidx, new_addr);
    fs.mark_data_written(inode, bidx);
}
