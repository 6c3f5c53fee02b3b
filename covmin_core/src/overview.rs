use crate::corpus::{CorpusSize, CorpusStore};
use crate::coverage::CoverageVector;
use crate::oracle::Oracle;
use crate::phase::ReduceError;
use serde::Serialize;
use std::fmt::Write;

/// Corpus size and coverage at one point in time.
///
/// The CLI keeps the previous snapshot and passes it back in to show what an
/// action changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Overview {
    pub corpus: CorpusSize,
    pub coverage: CoverageVector,
}

/// Signed change between two overviews.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OverviewDiff {
    pub files: i64,
    pub bytes: i64,
    pub lines: i64,
    pub branches: i64,
}

impl Overview {
    pub fn take(store: &CorpusStore, oracle: &mut dyn Oracle) -> Result<Self, ReduceError> {
        let corpus = store.size()?;
        let coverage = oracle.measure(store.path())?;
        Ok(Self { corpus, coverage })
    }

    pub fn diff(&self, previous: &Overview) -> OverviewDiff {
        let (files, bytes) = self.corpus.delta(&previous.corpus);
        let (lines, branches) = self.coverage.delta(&previous.coverage);
        OverviewDiff {
            files,
            bytes,
            lines,
            branches,
        }
    }

    /// Two-line summary; with a previous snapshot every count gets its signed change.
    pub fn render(&self, corpus_name: &str, previous: Option<&Overview>) -> String {
        let diff = previous.map(|previous| self.diff(previous));
        let change = |value: fn(&OverviewDiff) -> i64| match &diff {
            Some(diff) => format!(" ({})", format_signed(value(diff))),
            None => String::new(),
        };

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Corpus: {corpus_name}, {} files{}, {} bytes{}",
            self.corpus.files,
            change(|d| d.files),
            self.corpus.bytes,
            change(|d| d.bytes)
        );
        let _ = write!(
            out,
            "Coverage: {} lines{}, {} branches{}",
            self.coverage.lines,
            change(|d| d.lines),
            self.coverage.branches,
            change(|d| d.branches)
        );
        out
    }
}

/// `+3`, `-12`, `+0`.
pub fn format_signed(value: i64) -> String {
    format!("{value:+}")
}
