//! Result types returned by repositories.
//!
//! Keep these focused on what a query reports. Policy belongs in the engine
//! components.

/// Outcome of a write guarded by a revision or status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalWrite {
    Applied,
    /// The stored row moved on; `actual` is the revision found.
    Stale { actual: i64 },
    /// The event stopped accepting decisions before the write landed.
    WindowClosed,
}

impl ConditionalWrite {
    pub fn applied(&self) -> bool {
        matches!(self, ConditionalWrite::Applied)
    }
}
