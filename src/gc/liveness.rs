//! Block liveness: is the block at a given log position still the one
//! its parent node points at?

use crate::fs::{GcTarget, NodeInfo};
use crate::summary::SummaryEntry;
use crate::types::BlockAddr;

/// Revalidate a summary entry against the node address table and the
/// parent node itself.
///
/// Returns the node-table entry and the parent's node offset when the
/// block at `blkaddr` is still referenced. A stale summary version or a
/// parent that meanwhile points elsewhere are normal outcomes, not
/// errors; so are read failures on the parent node.
pub(crate) fn is_alive<F: GcTarget>(
    fs: &F,
    entry: &SummaryEntry,
    blkaddr: BlockAddr,
) -> Option<(NodeInfo, u32)> {
    let node_page = fs.node_page(entry.nid).ok()?;
    let dni = fs.node_info(entry.nid).ok()?;

    if entry.version != dni.version {
        return None;
    }

    let nofs = node_page.node_ofs();
    let source = node_page.data_block_addr(entry.ofs_in_node);
    drop(node_page);

    if source != blkaddr {
        return None;
    }
    Some((dni, nofs))
}
