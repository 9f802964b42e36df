//! Selection modes and the victim-policy dispatch tag.

/// Reclamation urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    /// Synchronous reclaim-now pass; free space is needed immediately.
    Foreground,
    /// Opportunistic paced pass.
    Background,
}

impl GcKind {
    /// Get the kind as a string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            GcKind::Foreground => "foreground",
            GcKind::Background => "background",
        }
    }
}

/// How the reclaimed space will be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// Log-structured: the whole section is emptied and appended to
    /// fresh.
    Lfs,
    /// Slack-space recycling: a single segment's holes are reused in
    /// place.
    Ssr,
}

/// Victim cost model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum GcMode {
    /// Minimise valid blocks: cheapest to move right now.
    Greedy = 0,
    /// Balance utilisation against segment age.
    CostBenefit = 1,
}

/// Number of cost models; sizes the per-mode scan cursors.
pub const NR_GC_MODES: usize = 2;

/// Resolve the cost model for a log-structured pass.
///
/// Background passes default to cost-benefit and foreground passes to
/// greedy; a nonzero `gc_idle` override forces one model for both.
pub fn select_gc_mode(gc_idle: u8, gc_kind: GcKind) -> GcMode {
    match gc_idle {
        1 => GcMode::CostBenefit,
        2 => GcMode::Greedy,
        _ => match gc_kind {
            GcKind::Background => GcMode::CostBenefit,
            GcKind::Foreground => GcMode::Greedy,
        },
    }
}

/// Victim-selection policy, dispatched by tag.
///
/// One policy ships today; the indirection keeps room for alternatives
/// without touching the callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VictimPolicy {
    /// Bounded bitmap scan with greedy or cost-benefit ranking.
    #[default]
    Default,
}
