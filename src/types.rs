//! Core identifier types for the main storage area.

use std::fmt;

/// Segment number inside the main area.
pub type SegNo = u32;

/// Section number; a section is a run of `segs_per_sec` segments.
pub type SecNo = u32;

/// Node identifier (index into the node address table).
pub type Nid = u32;

/// Inode number.
pub type Ino = u32;

/// Sentinel segment number meaning "no segment".
pub const NULL_SEGNO: SegNo = u32::MAX;

/// Sentinel section number meaning "no section".
pub const NULL_SECNO: SecNo = u32::MAX;

/// Logical block address in the main area.
///
/// Address `0` is the null address (a hole or truncated block); `u32::MAX`
/// marks a block that has been reserved but not yet placed in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlockAddr(u32);

impl BlockAddr {
    /// The null block address.
    pub const NULL: BlockAddr = BlockAddr(0);

    /// Address of a block that is reserved but not yet written.
    pub const NEW: BlockAddr = BlockAddr(u32::MAX);

    /// Create a block address from a raw value.
    pub const fn new(addr: u32) -> Self {
        BlockAddr(addr)
    }

    /// Raw address value.
    pub const fn get(&self) -> u32 {
        self.0
    }

    /// Whether this is the null address.
    pub const fn is_null(&self) -> bool {
        self.0 == Self::NULL.0
    }

    /// Whether this block is reserved but unwritten.
    pub const fn is_new(&self) -> bool {
        self.0 == Self::NEW.0
    }

    /// Address `off` blocks past this one.
    pub const fn offset(&self, off: u32) -> BlockAddr {
        BlockAddr(self.0 + off)
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else if self.is_new() {
            write!(f, "new")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_addr_sentinels() {
        assert!(BlockAddr::NULL.is_null());
        assert!(BlockAddr::NEW.is_new());
        assert!(!BlockAddr::new(17).is_null());
        assert!(!BlockAddr::new(17).is_new());
    }

    #[test]
    fn test_block_addr_offset() {
        let base = BlockAddr::new(0x1000);
        assert_eq!(base.offset(7).get(), 0x1007);
        assert_eq!(base.offset(0), base);
    }

    #[test]
    fn test_block_addr_display() {
        assert_eq!(format!("{}", BlockAddr::NULL), "null");
        assert_eq!(format!("{}", BlockAddr::NEW), "new");
        assert_eq!(format!("{}", BlockAddr::new(0x40)), "0x40");
    }
}
