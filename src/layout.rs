//! Main-area geometry and node-tree index arithmetic.

use crate::types::{BlockAddr, SecNo, SegNo};

/// Data block addresses held by one direct node block.
pub const ADDRS_PER_BLOCK: u32 = 1018;

/// Node ids held by one indirect node block.
pub const NIDS_PER_BLOCK: u32 = 1018;

/// Data block addresses held directly by an inode without extended
/// attributes consuming inline space.
pub const DEF_ADDRS_PER_INODE: u32 = 923;

/// Shape of the main storage area.
///
/// Segments are runs of `1 << log_blocks_per_seg` blocks; sections group
/// `segs_per_sec` consecutive segments and are the unit of reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// log2 of blocks per segment.
    pub log_blocks_per_seg: u32,
    /// Segments per section.
    pub segs_per_sec: u32,
    /// Number of segments in the main area.
    pub main_segs: u32,
    /// Block address of the first main-area block.
    pub main_blkaddr: u32,
}

impl Geometry {
    /// Create a geometry with the main area starting at block 0.
    pub const fn new(log_blocks_per_seg: u32, segs_per_sec: u32, main_segs: u32) -> Self {
        Self {
            log_blocks_per_seg,
            segs_per_sec,
            main_segs,
            main_blkaddr: 0,
        }
    }

    /// Blocks per segment.
    pub const fn blocks_per_seg(&self) -> u32 {
        1 << self.log_blocks_per_seg
    }

    /// Number of sections in the main area.
    pub const fn main_secs(&self) -> u32 {
        self.main_segs / self.segs_per_sec
    }

    /// Section containing `segno`.
    pub const fn secno(&self, segno: SegNo) -> SecNo {
        segno / self.segs_per_sec
    }

    /// First segment of section `secno`.
    pub const fn sec_start_seg(&self, secno: SecNo) -> SegNo {
        secno * self.segs_per_sec
    }

    /// Address of the first block of `segno`.
    pub const fn start_block(&self, segno: SegNo) -> BlockAddr {
        BlockAddr::new(self.main_blkaddr + segno * self.blocks_per_seg())
    }

    /// Map a main-area block address back to its segment and in-segment
    /// offset.
    pub const fn seg_of_block(&self, addr: BlockAddr) -> (SegNo, u32) {
        let rel = addr.get() - self.main_blkaddr;
        (rel >> self.log_blocks_per_seg, rel & (self.blocks_per_seg() - 1))
    }
}

/// First data block index covered by the direct node at offset `node_ofs`
/// in an inode's node tree.
///
/// `node_ofs` counts node blocks in tree order: the inode itself is 0,
/// followed by two direct nodes, two indirect nodes (each fronting
/// `NIDS_PER_BLOCK` direct children), and a double-indirect node whose
/// indirect children each front another `NIDS_PER_BLOCK` direct nodes.
/// Only offsets that denote the inode or a direct node are meaningful;
/// passing an indirect offset is a caller bug.
pub fn start_bidx_of_node(node_ofs: u32, addrs_per_inode: u32) -> u64 {
    debug_assert!(is_direct_node_ofs(node_ofs), "node_ofs {node_ofs} is not a direct node");

    let indirect_blks = 2 * NIDS_PER_BLOCK + 4;

    if node_ofs == 0 {
        return 0;
    }

    let bidx = if node_ofs <= 2 {
        node_ofs - 1
    } else if node_ofs <= indirect_blks {
        let dec = (node_ofs - 4) / (NIDS_PER_BLOCK + 1);
        node_ofs - 2 - dec
    } else {
        let dec = (node_ofs - indirect_blks - 3) / (NIDS_PER_BLOCK + 1);
        node_ofs - 5 - dec
    };
    u64::from(bidx) * u64::from(ADDRS_PER_BLOCK) + u64::from(addrs_per_inode)
}

/// Whether `node_ofs` denotes the inode or a direct node block.
pub fn is_direct_node_ofs(node_ofs: u32) -> bool {
    let n = NIDS_PER_BLOCK;
    match node_ofs {
        0..=2 => true,
        3 => false,
        ofs if ofs <= n + 3 => true,
        ofs if ofs == n + 4 => false,
        ofs if ofs <= 2 * n + 4 => true,
        ofs if ofs == 2 * n + 5 => false,
        ofs => {
            // Under the double indirect, every run of NIDS_PER_BLOCK direct
            // nodes is fronted by one indirect node.
            (ofs - (2 * n + 6)) % (n + 1) != 0
        }
    }
}
