//! Inode references pinned across one reclamation call.
//!
//! Data-segment relocation touches the same inode once per surviving
//! block; the list keeps each inode referenced exactly once so phase 3
//! can look it up cheaply and the whole set can be dropped together when
//! the call finishes. The map gives O(1) insert-uniqueness, the vector
//! preserves release order; both hold the same entries.

use std::collections::HashMap;
use std::sync::Arc;

use crate::fs::GcInode;
use crate::types::Ino;

/// Inodes referenced by the current reclamation call.
#[derive(Default)]
pub struct GcInodeList {
    map: HashMap<Ino, usize>,
    list: Vec<Arc<dyn GcInode>>,
}

impl GcInodeList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a pinned inode by number.
    pub fn find(&self, ino: Ino) -> Option<&Arc<dyn GcInode>> {
        self.map.get(&ino).map(|&idx| &self.list[idx])
    }

    /// Pin `inode` unless it is already held; a duplicate reference is
    /// dropped immediately.
    pub fn add(&mut self, inode: Arc<dyn GcInode>) {
        let ino = inode.ino();
        if self.map.contains_key(&ino) {
            return;
        }
        self.map.insert(ino, self.list.len());
        self.list.push(inode);
    }

    /// Release every pinned inode, in the order they were added.
    pub fn release(&mut self) {
        for inode in self.list.drain(..) {
            self.map.remove(&inode.ino());
            drop(inode);
        }
    }

    /// Number of pinned inodes.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Whether the list holds no inodes.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}
