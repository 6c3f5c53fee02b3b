use serde::{Deserialize, Serialize};
use std::fmt;

/// Aggregate coverage of a corpus, as reported by the coverage oracle.
///
/// Ordering is lexicographic on `(lines, branches)`: a vector with more covered
/// lines always wins, and branches only break ties between equal line counts.
/// The field order below is what the derived `Ord` relies on, so it must not be
/// rearranged.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CoverageVector {
    /// Number of covered source lines.
    pub lines: u64,
    /// Number of covered branches.
    pub branches: u64,
}

impl CoverageVector {
    /// The vector of an input set that reaches nothing.
    pub const ZERO: CoverageVector = CoverageVector {
        lines: 0,
        branches: 0,
    };

    pub const fn new(lines: u64, branches: u64) -> Self {
        Self { lines, branches }
    }

    /// Signed per-component difference `self - previous`, for progress display.
    pub fn delta(&self, previous: &CoverageVector) -> (i64, i64) {
        (
            self.lines as i64 - previous.lines as i64,
            self.branches as i64 - previous.branches as i64,
        )
    }
}

impl fmt::Display for CoverageVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} lines, {} branches", self.lines, self.branches)
    }
}
