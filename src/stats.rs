//! Collector statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::summary::SummaryKind;
use crate::victim::GcKind;

/// Atomic counters covering the collector's activity since mount.
#[derive(Debug, Default)]
pub struct GcStats {
    /// Background passes attempted by the pacing worker.
    pub bg_passes: AtomicU64,
    /// Segment reclamation attempts (one per segment handed to a
    /// relocator).
    pub call_count: AtomicU64,
    /// Node blocks redirected into the log.
    pub node_blocks_moved: AtomicU64,
    /// Data blocks redirected into the log.
    pub data_blocks_moved: AtomicU64,
    /// Node segments processed by foreground passes.
    pub fg_node_segments: AtomicU64,
    /// Data segments processed by foreground passes.
    pub fg_data_segments: AtomicU64,
    /// Node segments processed by background passes.
    pub bg_node_segments: AtomicU64,
    /// Data segments processed by background passes.
    pub bg_data_segments: AtomicU64,
    /// Sections fully freed by foreground passes.
    pub sections_freed: AtomicU64,
}

impl GcStats {
    /// Create zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_bg_passes(&self) {
        self.bg_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_call_count(&self) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_node_blocks(&self, n: u64) {
        self.node_blocks_moved.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_data_blocks(&self, n: u64) {
        self.data_blocks_moved.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn inc_seg_count(&self, kind: SummaryKind, gc_kind: GcKind) {
        let counter = match (gc_kind, kind) {
            (GcKind::Foreground, SummaryKind::Node) => &self.fg_node_segments,
            (GcKind::Foreground, SummaryKind::Data) => &self.fg_data_segments,
            (GcKind::Background, SummaryKind::Node) => &self.bg_node_segments,
            (GcKind::Background, SummaryKind::Data) => &self.bg_data_segments,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_sections_freed(&self, n: u64) {
        self.sections_freed.fetch_add(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = GcStats::new();
        stats.inc_bg_passes();
        stats.inc_call_count();
        stats.add_node_blocks(3);
        stats.add_data_blocks(5);
        stats.add_sections_freed(1);
        assert_eq!(stats.bg_passes.load(Ordering::Relaxed), 1);
        assert_eq!(stats.call_count.load(Ordering::Relaxed), 1);
        assert_eq!(stats.node_blocks_moved.load(Ordering::Relaxed), 3);
        assert_eq!(stats.data_blocks_moved.load(Ordering::Relaxed), 5);
        assert_eq!(stats.sections_freed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_seg_count_split() {
        let stats = GcStats::new();
        stats.inc_seg_count(SummaryKind::Node, GcKind::Foreground);
        stats.inc_seg_count(SummaryKind::Data, GcKind::Background);
        stats.inc_seg_count(SummaryKind::Data, GcKind::Background);
        assert_eq!(stats.fg_node_segments.load(Ordering::Relaxed), 1);
        assert_eq!(stats.bg_data_segments.load(Ordering::Relaxed), 2);
        assert_eq!(stats.fg_data_segments.load(Ordering::Relaxed), 0);
        assert_eq!(stats.bg_node_segments.load(Ordering::Relaxed), 0);
    }
}
