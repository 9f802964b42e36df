//! In-memory host filesystem.
//!
//! A complete [`GcTarget`] implementation holding segments, the node
//! address table and a toy page cache in plain maps. It backs the test
//! suite; population helpers let a test lay out victim segments block by
//! block, and atomic counters expose every cooperation point the
//! collector is expected to hit.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dirty::{DirtySeglist, DirtyType};
use crate::error::{GcError, GcResult};
use crate::fs::{CacheState, Dnode, GcInode, GcTarget, NodeInfo, NodePage, Page};
use crate::layout::{start_bidx_of_node, Geometry, DEF_ADDRS_PER_INODE};
use crate::sit::SitInfo;
use crate::summary::{SummaryBlock, SummaryEntry, SummaryKind};
use crate::types::{BlockAddr, Ino, Nid, SecNo, SegNo};

#[derive(Debug, Default)]
struct PageFlags {
    uptodate: AtomicBool,
    dirty: AtomicBool,
    writeback: AtomicBool,
    cold: AtomicBool,
}

struct MemPage {
    flags: Arc<PageFlags>,
}

impl Page for MemPage {
    fn is_uptodate(&self) -> bool {
        self.flags.uptodate.load(Ordering::Acquire)
    }
    fn clear_uptodate(&self) {
        self.flags.uptodate.store(false, Ordering::Release);
    }
    fn is_dirty(&self) -> bool {
        self.flags.dirty.load(Ordering::Acquire)
    }
    fn set_dirty(&self) {
        self.flags.dirty.store(true, Ordering::Release);
    }
    fn clear_dirty_for_io(&self) -> bool {
        self.flags.dirty.swap(false, Ordering::AcqRel)
    }
    fn is_writeback(&self) -> bool {
        self.flags.writeback.load(Ordering::Acquire)
    }
    fn wait_on_writeback(&self) {
        self.flags.writeback.store(false, Ordering::Release);
    }
    fn set_cold(&self, cold: bool) {
        self.flags.cold.store(cold, Ordering::Release);
    }
}

struct MemNode {
    ino: Ino,
    node_ofs: u32,
    addrs: Mutex<Vec<BlockAddr>>,
    flags: PageFlags,
}

struct MemNodePage {
    node: Arc<MemNode>,
}

impl Page for MemNodePage {
    fn is_uptodate(&self) -> bool {
        true
    }
    fn clear_uptodate(&self) {}
    fn is_dirty(&self) -> bool {
        self.node.flags.dirty.load(Ordering::Acquire)
    }
    fn set_dirty(&self) {
        self.node.flags.dirty.store(true, Ordering::Release);
    }
    fn clear_dirty_for_io(&self) -> bool {
        self.node.flags.dirty.swap(false, Ordering::AcqRel)
    }
    fn is_writeback(&self) -> bool {
        self.node.flags.writeback.load(Ordering::Acquire)
    }
    fn wait_on_writeback(&self) {
        self.node.flags.writeback.store(false, Ordering::Release);
    }
    fn set_cold(&self, _cold: bool) {}
}

impl NodePage for MemNodePage {
    fn node_ofs(&self) -> u32 {
        self.node.node_ofs
    }
    fn data_block_addr(&self, ofs_in_node: u32) -> BlockAddr {
        self.node
            .addrs
            .lock()
            .get(ofs_in_node as usize)
            .copied()
            .unwrap_or(BlockAddr::NULL)
    }
}

/// Inode held by [`MemFs`].
pub struct MemInode {
    ino: Ino,
    regular: bool,
    encrypted: bool,
    bad: bool,
    // bidx -> dnode slot, so the write path can find the mapping to move
    blocks: Mutex<HashMap<u64, (Nid, u32)>>,
    appended: AtomicBool,
    first_block_written: AtomicBool,
}

impl MemInode {
    /// Whether a collected block was re-appended for this inode.
    pub fn appended(&self) -> bool {
        self.appended.load(Ordering::Acquire)
    }

    /// Whether block index 0 was rewritten.
    pub fn first_block_written(&self) -> bool {
        self.first_block_written.load(Ordering::Acquire)
    }
}

impl GcInode for MemInode {
    fn ino(&self) -> Ino {
        self.ino
    }
    fn is_regular(&self) -> bool {
        self.regular
    }
    fn is_encrypted(&self) -> bool {
        self.encrypted
    }
    fn is_bad(&self) -> bool {
        self.bad
    }
    fn addrs_per_inode(&self) -> u32 {
        DEF_ADDRS_PER_INODE
    }
}

struct MemDnode {
    node: Arc<MemNode>,
    nid: Nid,
    ofs_in_node: u32,
}

impl Dnode for MemDnode {
    fn nid(&self) -> Nid {
        self.nid
    }
    fn ofs_in_node(&self) -> u32 {
        self.ofs_in_node
    }
    fn data_blkaddr(&self) -> BlockAddr {
        self.node
            .addrs
            .lock()
            .get(self.ofs_in_node as usize)
            .copied()
            .unwrap_or(BlockAddr::NULL)
    }
    fn set_data_blkaddr(&mut self, addr: BlockAddr) {
        let mut addrs = self.node.addrs.lock();
        if let Some(slot) = addrs.get_mut(self.ofs_in_node as usize) {
            *slot = addr;
        }
    }
    fn wait_node_writeback(&self) {
        self.node.flags.writeback.store(false, Ordering::Release);
    }
}

struct MemState {
    summaries: HashMap<SegNo, SummaryBlock>,
    nat: HashMap<Nid, NodeInfo>,
    nodes: HashMap<Nid, Arc<MemNode>>,
    inodes: HashMap<Ino, Arc<MemInode>>,
    pages: HashMap<(Ino, u64), Arc<PageFlags>>,
    meta_pages: HashMap<u32, Arc<PageFlags>>,
    cur_data_seg: SegNo,
    cur_data_off: u32,
    cur_node_seg: SegNo,
    cur_node_off: u32,
    free_segs: HashSet<SegNo>,
    prefree_segs: HashSet<SegNo>,
}

/// In-memory filesystem suitable as a collector host in tests.
///
/// The last two segments of the main area start out as the data and node
/// append targets; everything else starts free.
pub struct MemFs {
    geo: Geometry,
    sit: SitInfo,
    dirty: DirtySeglist,
    state: Mutex<MemState>,

    active: AtomicBool,
    cp_error: AtomicBool,
    frozen: AtomicBool,
    idle: AtomicBool,
    enough_invalid: AtomicBool,
    checkpoint_failing: AtomicBool,
    reserved_sections: AtomicU32,

    checkpoints: AtomicU64,
    merged_submits: AtomicU64,
    balance_calls: AtomicU64,
    node_readaheads: AtomicU64,
    summary_readaheads: AtomicU64,
    data_writes: AtomicU64,
    data_remaps: AtomicU64,
    page_reads: AtomicU64,
    page_writes: AtomicU64,
    extent_updates: AtomicU64,
}

impl MemFs {
    /// Create an empty filesystem with the given geometry.
    pub fn new(geo: Geometry) -> Arc<MemFs> {
        assert!(geo.main_segs >= 2, "need room for the append targets");
        let cur_data_seg = geo.main_segs - 2;
        let cur_node_seg = geo.main_segs - 1;

        let mut free_segs: HashSet<SegNo> = (0..geo.main_segs).collect();
        free_segs.remove(&cur_data_seg);
        free_segs.remove(&cur_node_seg);

        Arc::new(MemFs {
            sit: SitInfo::new(&geo),
            dirty: DirtySeglist::new(&geo),
            state: Mutex::new(MemState {
                summaries: HashMap::new(),
                nat: HashMap::new(),
                nodes: HashMap::new(),
                inodes: HashMap::new(),
                pages: HashMap::new(),
                meta_pages: HashMap::new(),
                cur_data_seg,
                cur_data_off: 0,
                cur_node_seg,
                cur_node_off: 0,
                free_segs,
                prefree_segs: HashSet::new(),
            }),
            geo,
            active: AtomicBool::new(true),
            cp_error: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            enough_invalid: AtomicBool::new(false),
            checkpoint_failing: AtomicBool::new(false),
            reserved_sections: AtomicU32::new(0),
            checkpoints: AtomicU64::new(0),
            merged_submits: AtomicU64::new(0),
            balance_calls: AtomicU64::new(0),
            node_readaheads: AtomicU64::new(0),
            summary_readaheads: AtomicU64::new(0),
            data_writes: AtomicU64::new(0),
            data_remaps: AtomicU64::new(0),
            page_reads: AtomicU64::new(0),
            page_writes: AtomicU64::new(0),
            extent_updates: AtomicU64::new(0),
        })
    }

    // ---- fixture knobs ----

    /// Flip the device-idle signal.
    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Release);
    }

    /// Freeze or thaw writes.
    pub fn set_frozen(&self, frozen: bool) {
        self.frozen.store(frozen, Ordering::Release);
    }

    /// Mark the filesystem active or shut down.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Poison the filesystem with a checkpoint error.
    pub fn set_cp_error(&self, err: bool) {
        self.cp_error.store(err, Ordering::Release);
    }

    /// Pretend enough invalid blocks have piled up for eager background
    /// collection.
    pub fn set_enough_invalid_blocks(&self, enough: bool) {
        self.enough_invalid.store(enough, Ordering::Release);
    }

    /// Sections the space accounting insists on keeping free.
    pub fn set_reserved_sections(&self, reserved: u32) {
        self.reserved_sections.store(reserved, Ordering::Release);
    }

    /// Make `write_checkpoint` fail until cleared.
    pub fn set_checkpoint_failing(&self, failing: bool) {
        self.checkpoint_failing.store(failing, Ordering::Release);
    }

    // ---- fixture population ----

    /// Register an inode.
    pub fn add_inode(&self, ino: Ino, regular: bool, encrypted: bool) {
        self.state.lock().inodes.insert(
            ino,
            Arc::new(MemInode {
                ino,
                regular,
                encrypted,
                bad: false,
                blocks: Mutex::new(HashMap::new()),
                appended: AtomicBool::new(false),
                first_block_written: AtomicBool::new(false),
            }),
        );
    }

    /// Register a node page with `slots` empty dnode slots and a fresh
    /// node-table entry.
    pub fn add_node(&self, nid: Nid, ino: Ino, node_ofs: u32, slots: u32) {
        let mut state = self.state.lock();
        state.nodes.insert(
            nid,
            Arc::new(MemNode {
                ino,
                node_ofs,
                addrs: Mutex::new(vec![BlockAddr::NULL; slots as usize]),
                flags: PageFlags::default(),
            }),
        );
        state.nat.insert(
            nid,
            NodeInfo {
                nid,
                ino,
                blk_addr: BlockAddr::NULL,
                version: 0,
            },
        );
    }

    /// Overwrite the node-table version of `nid`.
    pub fn set_nat_version(&self, nid: Nid, version: u8) {
        if let Some(entry) = self.state.lock().nat.get_mut(&nid) {
            entry.version = version;
        }
    }

    /// Put the node block for `nid` at `(segno, off)`: summary entry,
    /// node-table address and validity bit.
    pub fn place_node_block(&self, segno: SegNo, off: u32, nid: Nid) {
        let addr = self.geo.start_block(segno).offset(off);
        let mut state = self.state.lock();
        state.free_segs.remove(&segno);

        let version = state.nat.get(&nid).map(|ni| ni.version).unwrap_or(0);
        let blocks_per_seg = self.geo.blocks_per_seg();
        state
            .summaries
            .entry(segno)
            .or_insert_with(|| SummaryBlock::new(SummaryKind::Node, blocks_per_seg))
            .set_entry(off, SummaryEntry::new(nid, version, 0));
        if let Some(entry) = state.nat.get_mut(&nid) {
            entry.blk_addr = addr;
        }
        self.sit.lock().entry_mut(segno).mark_valid(off);
    }

    /// Put a data block at `(segno, off)`, wired to slot `ofs_in_node` of
    /// node `nid`. Returns the file block index the slot covers.
    pub fn place_data_block(&self, segno: SegNo, off: u32, nid: Nid, ofs_in_node: u32) -> u64 {
        let addr = self.geo.start_block(segno).offset(off);
        let mut state = self.state.lock();
        state.free_segs.remove(&segno);

        let version = state.nat.get(&nid).map(|ni| ni.version).unwrap_or(0);
        let blocks_per_seg = self.geo.blocks_per_seg();
        state
            .summaries
            .entry(segno)
            .or_insert_with(|| SummaryBlock::new(SummaryKind::Data, blocks_per_seg))
            .set_entry(off, SummaryEntry::new(nid, version, ofs_in_node));

        let node = state.nodes.get(&nid).cloned().expect("node not registered");
        node.addrs.lock()[ofs_in_node as usize] = addr;

        let inode = state
            .inodes
            .get(&node.ino)
            .cloned()
            .expect("inode not registered");
        let bidx =
            start_bidx_of_node(node.node_ofs, inode.addrs_per_inode()) + u64::from(ofs_in_node);
        inode.blocks.lock().insert(bidx, (nid, ofs_in_node));

        self.sit.lock().entry_mut(segno).mark_valid(off);
        bidx
    }

    /// Put `segno` on the union dirty list.
    pub fn mark_dirty(&self, segno: SegNo) {
        self.state.lock().free_segs.remove(&segno);
        self.dirty.lock().set_dirty(DirtyType::Dirty, segno);
    }

    /// Put `segno` on one of the typed dirty lists.
    pub fn mark_dirty_typed(&self, ty: DirtyType, segno: SegNo) {
        self.state.lock().free_segs.remove(&segno);
        self.dirty.lock().set_dirty(ty, segno);
    }

    /// Mark section `secno` as a vetted background victim.
    pub fn mark_bg_victim(&self, secno: SecNo) {
        self.dirty.lock().victim_secmap.set(secno);
    }

    /// Set the raw valid-block count of `segno` (selection tests only;
    /// the validity bitmap is left alone).
    pub fn set_valid_blocks(&self, segno: SegNo, count: u32) {
        self.sit.lock().entry_mut(segno).valid_blocks = count;
    }

    /// Set the checkpointed valid-block count of `segno`.
    pub fn set_ckpt_valid_blocks(&self, segno: SegNo, count: u32) {
        self.sit.lock().entry_mut(segno).ckpt_valid_blocks = count;
    }

    /// Set the modification time of `segno`.
    pub fn set_seg_mtime(&self, segno: SegNo, mtime: u64) {
        self.sit.lock().entry_mut(segno).mtime = mtime;
    }

    /// Pin the observed mtime range.
    pub fn set_mtime_range(&self, min: u64, max: u64) {
        let mut sit = self.sit.lock();
        sit.min_mtime = min;
        sit.max_mtime = max;
    }

    /// Install a cached page for `(ino, bidx)`.
    pub fn cache_data_page(&self, ino: Ino, bidx: u64, dirty: bool) {
        let flags = Arc::new(PageFlags::default());
        flags.uptodate.store(true, Ordering::Release);
        flags.dirty.store(dirty, Ordering::Release);
        self.state.lock().pages.insert((ino, bidx), flags);
    }

    /// Simulate in-flight writeback on a cached data page.
    pub fn set_data_page_writeback(&self, ino: Ino, bidx: u64, writeback: bool) {
        if let Some(flags) = self.state.lock().pages.get(&(ino, bidx)) {
            flags.writeback.store(writeback, Ordering::Release);
        }
    }

    /// Shared inode handle, for asserting on its flags.
    pub fn inode(&self, ino: Ino) -> Option<Arc<MemInode>> {
        self.state.lock().inodes.get(&ino).cloned()
    }

    // ---- counters ----

    /// Checkpoints written.
    pub fn checkpoints(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    /// Merged data I/O flushes.
    pub fn merged_submits(&self) -> u64 {
        self.merged_submits.load(Ordering::Relaxed)
    }

    /// Background balance invocations.
    pub fn balance_calls(&self) -> u64 {
        self.balance_calls.load(Ordering::Relaxed)
    }

    /// Node-page readahead hints.
    pub fn node_readaheads(&self) -> u64 {
        self.node_readaheads.load(Ordering::Relaxed)
    }

    /// Summary readahead hints.
    pub fn summary_readaheads(&self) -> u64 {
        self.summary_readaheads.load(Ordering::Relaxed)
    }

    /// Blocks rewritten through the normal write path.
    pub fn data_writes(&self) -> u64 {
        self.data_writes.load(Ordering::Relaxed)
    }

    /// Blocks moved by pointer remap.
    pub fn data_remaps(&self) -> u64 {
        self.data_remaps.load(Ordering::Relaxed)
    }

    /// Raw page reads submitted.
    pub fn page_reads(&self) -> u64 {
        self.page_reads.load(Ordering::Relaxed)
    }

    /// Raw page writes submitted.
    pub fn page_writes(&self) -> u64 {
        self.page_writes.load(Ordering::Relaxed)
    }

    /// Extent cache updates.
    pub fn extent_updates(&self) -> u64 {
        self.extent_updates.load(Ordering::Relaxed)
    }

    /// Fully free sections.
    pub fn free_sections(&self) -> u32 {
        let state = self.state.lock();
        (0..self.geo.main_secs())
            .filter(|&secno| {
                let start = self.geo.sec_start_seg(secno);
                (start..start + self.geo.segs_per_sec).all(|seg| state.free_segs.contains(&seg))
            })
            .count() as u32
    }

    // ---- internals ----

    fn alloc_block(
        &self,
        state: &mut MemState,
        kind: SummaryKind,
        summary: SummaryEntry,
    ) -> BlockAddr {
        let blocks_per_seg = self.geo.blocks_per_seg();

        let (mut seg, mut off) = match kind {
            SummaryKind::Data => (state.cur_data_seg, state.cur_data_off),
            SummaryKind::Node => (state.cur_node_seg, state.cur_node_off),
        };
        if off == blocks_per_seg {
            // Current segment is full; open the lowest free one.
            let next = state
                .free_segs
                .iter()
                .min()
                .copied()
                .expect("main area exhausted");
            state.free_segs.remove(&next);
            seg = next;
            off = 0;
        }
        match kind {
            SummaryKind::Data => {
                state.cur_data_seg = seg;
                state.cur_data_off = off + 1;
            }
            SummaryKind::Node => {
                state.cur_node_seg = seg;
                state.cur_node_off = off + 1;
            }
        }

        state
            .summaries
            .entry(seg)
            .or_insert_with(|| SummaryBlock::new(kind, blocks_per_seg))
            .set_entry(off, summary);
        self.sit.lock().entry_mut(seg).mark_valid(off);
        self.geo.start_block(seg).offset(off)
    }

    fn invalidate_block(&self, state: &mut MemState, addr: BlockAddr) {
        if addr.is_null() || addr.is_new() {
            return;
        }
        let (seg, off) = self.geo.seg_of_block(addr);
        let emptied = {
            let mut sit = self.sit.lock();
            let entry = sit.entry_mut(seg);
            entry.mark_invalid(off) && entry.valid_blocks == 0
        };
        if emptied {
            let mut dirty = self.dirty.lock();
            dirty.clear_dirty(DirtyType::Dirty, seg);
            dirty.set_dirty(DirtyType::Prefree, seg);
            state.prefree_segs.insert(seg);
        }
    }

    fn relocate_mapping(&self, ino: Ino, bidx: u64) -> GcResult<()> {
        let mut state = self.state.lock();
        let inode = state
            .inodes
            .get(&ino)
            .cloned()
            .ok_or_else(|| GcError::Io(format!("no inode {ino}")))?;
        let (nid, ofs_in_node) = inode
            .blocks
            .lock()
            .get(&bidx)
            .copied()
            .ok_or_else(|| GcError::Io(format!("unmapped block {bidx} of inode {ino}")))?;
        let info = state
            .nat
            .get(&nid)
            .copied()
            .ok_or_else(|| GcError::Io(format!("no nat entry for node {nid}")))?;
        let node = state
            .nodes
            .get(&nid)
            .cloned()
            .ok_or_else(|| GcError::Io(format!("no node {nid}")))?;

        let old = node
            .addrs
            .lock()
            .get(ofs_in_node as usize)
            .copied()
            .unwrap_or(BlockAddr::NULL);
        if old.is_null() {
            // Truncated while queued; nothing to move.
            return Ok(());
        }

        let new = self.alloc_block(
            &mut state,
            SummaryKind::Data,
            SummaryEntry::new(nid, info.version, ofs_in_node),
        );
        node.addrs.lock()[ofs_in_node as usize] = new;
        self.invalidate_block(&mut state, old);

        inode.appended.store(true, Ordering::Release);
        if bidx == 0 {
            inode.first_block_written.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn page_flags(&self, ino: Ino, bidx: u64, read: bool) -> GcResult<Arc<PageFlags>> {
        let mut state = self.state.lock();
        if !state.inodes.contains_key(&ino) {
            return Err(GcError::Io(format!("no inode {ino}")));
        }
        let flags = state
            .pages
            .entry((ino, bidx))
            .or_insert_with(|| Arc::new(PageFlags::default()));
        if read {
            flags.uptodate.store(true, Ordering::Release);
        }
        Ok(Arc::clone(flags))
    }
}

impl GcTarget for MemFs {
    fn geometry(&self) -> &Geometry {
        &self.geo
    }

    fn sit(&self) -> &SitInfo {
        &self.sit
    }

    fn dirty_seglist(&self) -> &DirtySeglist {
        &self.dirty
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn checkpoint_error(&self) -> bool {
        self.cp_error.load(Ordering::Acquire)
    }

    fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    fn has_enough_invalid_blocks(&self) -> bool {
        self.enough_invalid.load(Ordering::Acquire)
    }

    fn has_not_enough_free_secs(&self, freed: u32) -> bool {
        self.free_sections() + freed < self.reserved_sections.load(Ordering::Acquire)
    }

    fn free_segments(&self) -> u32 {
        self.state.lock().free_segs.len() as u32
    }

    fn prefree_segments(&self) -> u32 {
        self.state.lock().prefree_segs.len() as u32
    }

    fn is_current_sec(&self, secno: SecNo) -> bool {
        let state = self.state.lock();
        secno == self.geo.secno(state.cur_data_seg) || secno == self.geo.secno(state.cur_node_seg)
    }

    fn read_summary(&self, segno: SegNo) -> GcResult<SummaryBlock> {
        self.state
            .lock()
            .summaries
            .get(&segno)
            .cloned()
            .ok_or_else(|| GcError::Io(format!("no summary for segment {segno}")))
    }

    fn readahead_summaries(&self, _segno: SegNo, count: u32) {
        self.summary_readaheads
            .fetch_add(u64::from(count), Ordering::Relaxed);
    }

    fn readahead_node_page(&self, _nid: Nid) {
        self.node_readaheads.fetch_add(1, Ordering::Relaxed);
    }

    fn node_page(&self, nid: Nid) -> GcResult<Box<dyn NodePage>> {
        self.state
            .lock()
            .nodes
            .get(&nid)
            .cloned()
            .map(|node| Box::new(MemNodePage { node }) as Box<dyn NodePage>)
            .ok_or_else(|| GcError::Io(format!("no node page {nid}")))
    }

    fn node_info(&self, nid: Nid) -> GcResult<NodeInfo> {
        self.state
            .lock()
            .nat
            .get(&nid)
            .copied()
            .ok_or_else(|| GcError::Io(format!("no nat entry for node {nid}")))
    }

    fn sync_node_pages(&self) {
        let mut state = self.state.lock();
        let dirty_nids: Vec<Nid> = state
            .nodes
            .iter()
            .filter(|(_, node)| node.flags.dirty.load(Ordering::Acquire))
            .map(|(&nid, _)| nid)
            .collect();

        for nid in dirty_nids {
            let Some(node) = state.nodes.get(&nid).cloned() else {
                continue;
            };
            let Some(info) = state.nat.get(&nid).copied() else {
                continue;
            };
            let new = self.alloc_block(
                &mut state,
                SummaryKind::Node,
                SummaryEntry::new(nid, info.version, 0),
            );
            if let Some(entry) = state.nat.get_mut(&nid) {
                entry.blk_addr = new;
            }
            self.invalidate_block(&mut state, info.blk_addr);
            node.flags.dirty.store(false, Ordering::Release);
        }
    }

    fn iget(&self, ino: Ino) -> GcResult<Arc<dyn GcInode>> {
        self.state
            .lock()
            .inodes
            .get(&ino)
            .cloned()
            .map(|inode| inode as Arc<dyn GcInode>)
            .ok_or_else(|| GcError::Io(format!("no inode {ino}")))
    }

    fn data_cache_state(&self, inode: &dyn GcInode, bidx: u64) -> CacheState {
        match self.state.lock().pages.get(&(inode.ino(), bidx)) {
            None => CacheState::Uncached,
            Some(flags) => {
                if flags.dirty.load(Ordering::Acquire) {
                    CacheState::Dirty
                } else {
                    CacheState::Clean
                }
            }
        }
    }

    fn locked_data_page(&self, inode: &dyn GcInode, bidx: u64) -> GcResult<Box<dyn Page>> {
        let flags = self.page_flags(inode.ino(), bidx, true)?;
        Ok(Box::new(MemPage { flags }))
    }

    fn grab_cache_page(&self, inode: &dyn GcInode, bidx: u64) -> GcResult<Box<dyn Page>> {
        let flags = self.page_flags(inode.ino(), bidx, false)?;
        Ok(Box::new(MemPage { flags }))
    }

    fn write_data_page(&self, inode: &dyn GcInode, bidx: u64, _page: &dyn Page) -> GcResult<()> {
        self.relocate_mapping(inode.ino(), bidx)?;
        self.data_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn remap_data_page(&self, inode: &dyn GcInode, bidx: u64, _page: &dyn Page) -> GcResult<()> {
        self.relocate_mapping(inode.ino(), bidx)?;
        self.data_remaps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn mark_data_written(&self, inode: &dyn GcInode, bidx: u64) {
        if let Some(inode) = self.state.lock().inodes.get(&inode.ino()) {
            inode.appended.store(true, Ordering::Release);
            if bidx == 0 {
                inode.first_block_written.store(true, Ordering::Release);
            }
        }
    }

    fn dnode_of_data(&self, inode: &dyn GcInode, bidx: u64) -> GcResult<Box<dyn Dnode>> {
        let state = self.state.lock();
        let meminode = state
            .inodes
            .get(&inode.ino())
            .ok_or_else(|| GcError::Io(format!("no inode {}", inode.ino())))?;
        let (nid, ofs_in_node) = meminode
            .blocks
            .lock()
            .get(&bidx)
            .copied()
            .ok_or_else(|| GcError::Io(format!("unmapped block {bidx}")))?;
        let node = state
            .nodes
            .get(&nid)
            .cloned()
            .ok_or_else(|| GcError::Io(format!("no node {nid}")))?;
        Ok(Box::new(MemDnode {
            node,
            nid,
            ofs_in_node,
        }))
    }

    fn meta_page(&self, addr: BlockAddr) -> GcResult<Box<dyn Page>> {
        let mut state = self.state.lock();
        let flags = state
            .meta_pages
            .entry(addr.get())
            .or_insert_with(|| Arc::new(PageFlags::default()));
        Ok(Box::new(MemPage {
            flags: Arc::clone(flags),
        }))
    }

    fn submit_page_read(&self, _page: &dyn Page, addr: BlockAddr) -> GcResult<()> {
        if let Some(flags) = self.state.lock().meta_pages.get(&addr.get()) {
            flags.uptodate.store(true, Ordering::Release);
        }
        self.page_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn submit_page_write(&self, page: &dyn Page, _addr: BlockAddr) {
        // Writeback completes immediately here.
        let _ = page.clear_dirty_for_io();
        self.page_writes.fetch_add(1, Ordering::Relaxed);
    }

    fn allocate_data_block(&self, old: BlockAddr, summary: SummaryEntry) -> BlockAddr {
        let mut state = self.state.lock();
        let new = self.alloc_block(&mut state, SummaryKind::Data, summary);
        self.invalidate_block(&mut state, old);
        new
    }

    fn update_extent_cache(&self, _inode: &dyn GcInode, _bidx: u64, _addr: BlockAddr) {
        self.extent_updates.fetch_add(1, Ordering::Relaxed);
    }

    fn submit_merged_data_io(&self) {
        self.merged_submits.fetch_add(1, Ordering::Relaxed);
    }

    fn write_checkpoint(&self) -> GcResult<()> {
        if self.checkpoint_failing.load(Ordering::Acquire) {
            return Err(GcError::Checkpoint("injected failure".into()));
        }
        let mut state = self.state.lock();
        let prefree: Vec<SegNo> = state.prefree_segs.drain().collect();
        {
            let mut dirty = self.dirty.lock();
            for &seg in &prefree {
                dirty.clear_dirty(DirtyType::Prefree, seg);
            }
        }
        for seg in prefree {
            state.free_segs.insert(seg);
        }
        // Checkpointed counts catch up with the live ones.
        {
            let mut sit = self.sit.lock();
            for segno in 0..self.geo.main_segs {
                let entry = sit.entry_mut(segno);
                entry.ckpt_valid_blocks = entry.valid_blocks;
            }
        }
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn balance_fs_bg(&self) {
        self.balance_calls.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_geo() -> Geometry {
        Geometry::new(3, 1, 16)
    }

    #[test]
    fn test_new_fs_layout() {
        let fs = MemFs::new(small_geo());
        assert_eq!(fs.free_segments(), 14);
        assert_eq!(fs.prefree_segments(), 0);
        assert!(fs.is_current_sec(14));
        assert!(fs.is_current_sec(15));
        assert!(!fs.is_current_sec(0));
    }

    #[test]
    fn test_place_and_read_summary() {
        let fs = MemFs::new(small_geo());
        fs.add_inode(1, true, false);
        fs.add_node(100, 1, 0, 8);
        let bidx = fs.place_data_block(2, 0, 100, 3);
        assert_eq!(bidx, 3);

        let sum = fs.read_summary(2).unwrap();
        assert_eq!(sum.kind(), SummaryKind::Data);
        assert_eq!(sum.entry(0).nid, 100);
        assert_eq!(sum.entry(0).ofs_in_node, 3);
        assert!(fs.sit().check_valid_map(2, 0));
        assert!(fs.read_summary(5).is_err());
    }

    #[test]
    fn test_relocation_moves_validity() {
        let fs = MemFs::new(small_geo());
        fs.add_inode(1, true, false);
        fs.add_node(100, 1, 0, 8);
        let bidx = fs.place_data_block(2, 0, 100, 0);
        fs.mark_dirty(2);

        let inode = fs.iget(1).unwrap();
        let page = fs.locked_data_page(inode.as_ref(), bidx).unwrap();
        fs.write_data_page(inode.as_ref(), bidx, page.as_ref()).unwrap();

        // Old block invalid, segment emptied into prefree.
        assert!(!fs.sit().check_valid_map(2, 0));
        assert_eq!(fs.prefree_segments(), 1);
        assert_eq!(fs.data_writes(), 1);
        assert!(fs.inode(1).unwrap().appended());

        // The new copy landed in the data append segment.
        assert_eq!(fs.sit().valid_blocks(14, false), 1);
    }

    #[test]
    fn test_checkpoint_frees_prefree() {
        let fs = MemFs::new(small_geo());
        fs.add_inode(1, true, false);
        fs.add_node(100, 1, 0, 8);
        let bidx = fs.place_data_block(2, 0, 100, 0);

        let inode = fs.iget(1).unwrap();
        let page = fs.locked_data_page(inode.as_ref(), bidx).unwrap();
        fs.write_data_page(inode.as_ref(), bidx, page.as_ref()).unwrap();
        assert_eq!(fs.prefree_segments(), 1);

        let free_before = fs.free_segments();
        fs.write_checkpoint().unwrap();
        assert_eq!(fs.prefree_segments(), 0);
        assert_eq!(fs.free_segments(), free_before + 1);
        assert_eq!(fs.checkpoints(), 1);
    }

    #[test]
    fn test_checkpoint_failure_injection() {
        let fs = MemFs::new(small_geo());
        fs.set_checkpoint_failing(true);
        assert!(fs.write_checkpoint().is_err());
        fs.set_checkpoint_failing(false);
        assert!(fs.write_checkpoint().is_ok());
    }

    #[test]
    fn test_sync_node_pages_relocates_dirty_nodes() {
        let fs = MemFs::new(small_geo());
        fs.add_inode(1, true, false);
        fs.add_node(7, 1, 0, 8);
        fs.place_node_block(3, 0, 7);
        fs.mark_dirty(3);

        let page = fs.node_page(7).unwrap();
        page.set_dirty();
        drop(page);
        fs.sync_node_pages();

        let info = fs.node_info(7).unwrap();
        // Moved into the node append segment, old copy invalidated.
        assert_eq!(fs.geo.seg_of_block(info.blk_addr).0, 15);
        assert!(!fs.sit().check_valid_map(3, 0));
        assert_eq!(fs.sit().valid_blocks(15, false), 1);
    }

    #[test]
    fn test_cache_state_probe() {
        let fs = MemFs::new(small_geo());
        fs.add_inode(1, true, false);
        let inode = fs.iget(1).unwrap();

        assert_eq!(fs.data_cache_state(inode.as_ref(), 0), CacheState::Uncached);
        fs.cache_data_page(1, 0, false);
        assert_eq!(fs.data_cache_state(inode.as_ref(), 0), CacheState::Clean);
        fs.cache_data_page(1, 1, true);
        assert_eq!(fs.data_cache_state(inode.as_ref(), 1), CacheState::Dirty);
    }

    #[test]
    fn test_free_section_accounting() {
        let fs = MemFs::new(small_geo());
        assert_eq!(fs.free_sections(), 14);
        fs.mark_dirty(0);
        assert_eq!(fs.free_sections(), 13);
        assert!(!fs.has_not_enough_free_secs(0));
        fs.set_reserved_sections(20);
        assert!(fs.has_not_enough_free_secs(0));
        assert!(!fs.has_not_enough_free_secs(7));
    }
}
