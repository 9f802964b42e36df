//! Host filesystem interface.
//!
//! The collector reaches everything outside its own state through
//! [`GcTarget`] and the page/inode/dnode handles it hands out. Node
//! address table lookups, page cache access, block I/O submission and
//! checkpointing all live on the host side of this seam; the collector
//! reads segment state and produces writes through the normal log paths.

pub mod mem;

use std::sync::Arc;

use crate::dirty::DirtySeglist;
use crate::error::GcResult;
use crate::layout::Geometry;
use crate::sit::SitInfo;
use crate::summary::{SummaryBlock, SummaryEntry};
use crate::types::{BlockAddr, Ino, Nid, SecNo, SegNo};

/// Node address table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node id.
    pub nid: Nid,
    /// Inode owning the node.
    pub ino: Ino,
    /// Current on-disk address of the node block.
    pub blk_addr: BlockAddr,
    /// Node version; bumped when the node is reallocated.
    pub version: u8,
}

/// Cache residency of a data block, probed without blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Not present in the page cache.
    Uncached,
    /// Cached and clean.
    Clean,
    /// Cached with pending modifications.
    Dirty,
}

/// A pinned page. The handle owns a reference from creation until drop.
pub trait Page {
    /// Whether the page contents match the on-disk block.
    fn is_uptodate(&self) -> bool;

    /// Drop the uptodate state, e.g. after discovering the block was
    /// truncated.
    fn clear_uptodate(&self);

    /// Whether the page has unwritten modifications.
    fn is_dirty(&self) -> bool;

    /// Mark the page dirty so writeback will pick it up.
    fn set_dirty(&self);

    /// Transition dirty -> about-to-write; returns true if the page was
    /// dirty.
    fn clear_dirty_for_io(&self) -> bool;

    /// Whether writeback is in flight for this page.
    fn is_writeback(&self) -> bool;

    /// Block until in-flight writeback completes.
    fn wait_on_writeback(&self);

    /// Steer the page's next allocation towards or away from the cold
    /// data log.
    fn set_cold(&self, cold: bool);
}

/// A pinned node page.
pub trait NodePage: Page {
    /// Offset of this node within its inode's node tree.
    fn node_ofs(&self) -> u32;

    /// Data block address recorded at `ofs_in_node`.
    fn data_block_addr(&self, ofs_in_node: u32) -> BlockAddr;
}

/// A referenced inode. Dropping the handle releases the reference.
pub trait GcInode: Send + Sync {
    /// Inode number.
    fn ino(&self) -> Ino;

    /// Whether this is a regular file.
    fn is_regular(&self) -> bool;

    /// Whether file contents are encrypted.
    fn is_encrypted(&self) -> bool;

    /// Whether the inode failed validation when read.
    fn is_bad(&self) -> bool;

    /// Data block addresses stored inline in the inode block.
    fn addrs_per_inode(&self) -> u32;
}

/// A resolved dnode slot: the direct node entry addressing one data
/// block.
pub trait Dnode {
    /// Id of the direct node.
    fn nid(&self) -> Nid;

    /// Slot index within the direct node.
    fn ofs_in_node(&self) -> u32;

    /// Data block address currently recorded in the slot.
    fn data_blkaddr(&self) -> BlockAddr;

    /// Point the slot at a new address.
    fn set_data_blkaddr(&mut self, addr: BlockAddr);

    /// Block until writeback of the node page holding the slot completes.
    fn wait_node_writeback(&self);
}

/// Everything the collector needs from the host filesystem.
///
/// Methods with default bodies are hints or optional cooperation points;
/// hosts without the corresponding machinery can leave them alone.
pub trait GcTarget: Send + Sync + 'static {
    /// Main-area geometry.
    fn geometry(&self) -> &Geometry;

    /// Shared segment-information table.
    fn sit(&self) -> &SitInfo;

    /// Shared dirty-segment lists.
    fn dirty_seglist(&self) -> &DirtySeglist;

    /// Whether the filesystem is mounted and writable.
    fn is_active(&self) -> bool;

    /// Whether a previous checkpoint failed, poisoning further writes.
    fn checkpoint_error(&self) -> bool;

    /// Whether writes are frozen at the superblock level.
    fn is_frozen(&self) -> bool;

    /// Whether the I/O subsystem is quiet: no writeback pages and an
    /// empty device request queue.
    fn is_idle(&self) -> bool;

    /// Whether enough invalid blocks have accumulated to make background
    /// reclamation worthwhile.
    fn has_enough_invalid_blocks(&self) -> bool;

    /// Whether free sections are running short, counting `freed` sections
    /// already reclaimed this call but not yet checkpointed.
    fn has_not_enough_free_secs(&self, freed: u32) -> bool;

    /// Number of free segments.
    fn free_segments(&self) -> u32;

    /// Number of prefree segments (freed, awaiting checkpoint).
    fn prefree_segments(&self) -> u32;

    /// Whether `secno` holds a current append target.
    fn is_current_sec(&self, secno: SecNo) -> bool;

    /// Device major and minor numbers, used to name the pacing worker.
    fn device_id(&self) -> (u32, u32) {
        (0, 0)
    }

    /// Read the summary of `segno`.
    fn read_summary(&self, segno: SegNo) -> GcResult<SummaryBlock>;

    /// Hint that the summaries of `count` segments starting at `segno`
    /// will be read shortly.
    fn readahead_summaries(&self, _segno: SegNo, _count: u32) {}

    /// Hint that the node page for `nid` will be read shortly.
    fn readahead_node_page(&self, nid: Nid);

    /// Read and pin the node page for `nid`.
    fn node_page(&self, nid: Nid) -> GcResult<Box<dyn NodePage>>;

    /// Look up `nid` in the node address table.
    fn node_info(&self, nid: Nid) -> GcResult<NodeInfo>;

    /// Write every dirty node page to its new log position and wait for
    /// completion.
    fn sync_node_pages(&self);

    /// Reference the inode `ino`.
    fn iget(&self, ino: Ino) -> GcResult<Arc<dyn GcInode>>;

    /// Probe the cache residency of one data block.
    fn data_cache_state(&self, inode: &dyn GcInode, bidx: u64) -> CacheState;

    /// Hint that the data block at `bidx` will be needed shortly.
    fn readahead_data_page(&self, _inode: &dyn GcInode, _bidx: u64) {}

    /// Pin the data page at `bidx`, reading it if necessary.
    fn locked_data_page(&self, inode: &dyn GcInode, bidx: u64) -> GcResult<Box<dyn Page>>;

    /// Pin the data page at `bidx` without reading its contents.
    fn grab_cache_page(&self, inode: &dyn GcInode, bidx: u64) -> GcResult<Box<dyn Page>>;

    /// Rewrite one data block through the normal write path: allocate a
    /// new log position, update the dnode and extent tree, submit the
    /// payload through merged I/O.
    fn write_data_page(&self, inode: &dyn GcInode, bidx: u64, page: &dyn Page) -> GcResult<()>;

    /// Move one clean, unmodified data block by assigning a new address
    /// and repointing the dnode and extent tree without re-reading or
    /// re-submitting the payload.
    ///
    /// Hosts that cannot honour a logical remap fall back to the full
    /// rewrite; the result is the same, minus the saved I/O.
    fn remap_data_page(&self, inode: &dyn GcInode, bidx: u64, page: &dyn Page) -> GcResult<()> {
        self.write_data_page(inode, bidx, page)
    }

    /// Record that `bidx` of `inode` was rewritten by an append
    /// (append-write flag, plus first-block marking for index 0).
    fn mark_data_written(&self, inode: &dyn GcInode, bidx: u64);

    /// Resolve the dnode slot addressing `bidx` of `inode`.
    fn dnode_of_data(&self, inode: &dyn GcInode, bidx: u64) -> GcResult<Box<dyn Dnode>>;

    /// Pin the meta-mapping page for a raw block address. Used to stage
    /// ciphertext without going through the file's own mapping.
    fn meta_page(&self, addr: BlockAddr) -> GcResult<Box<dyn Page>>;

    /// Synchronously read the block at `addr` into `page`.
    fn submit_page_read(&self, page: &dyn Page, addr: BlockAddr) -> GcResult<()>;

    /// Queue `page` for write at `addr` through merged I/O.
    fn submit_page_write(&self, page: &dyn Page, addr: BlockAddr);

    /// Allocate a new cold-data block for the contents currently at
    /// `old`, recording `summary` for the new position. Validity bits
    /// move from the old to the new address.
    fn allocate_data_block(&self, old: BlockAddr, summary: SummaryEntry) -> BlockAddr;

    /// Update the extent cache after `bidx` of `inode` moved to `addr`.
    fn update_extent_cache(&self, inode: &dyn GcInode, bidx: u64, addr: BlockAddr);

    /// Flush any batched data writes to the device.
    fn submit_merged_data_io(&self);

    /// Write a checkpoint, turning prefree segments into free ones.
    fn write_checkpoint(&self) -> GcResult<()>;

    /// Opportunistic metadata balancing run after background passes.
    fn balance_fs_bg(&self) {}
}
