use crate::cancel::CancellationToken;
use crate::corpus::{CorpusError, CorpusSize, CorpusStore};
use crate::coverage::CoverageVector;
use crate::merge::MergeError;
use crate::oracle::{Oracle, OracleError};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Failure that aborts the running phase. Cancellation is not an error; it is
/// reported through [`PhaseOutcome::Cancelled`].
#[derive(Error, Debug)]
pub enum ReduceError {
    #[error("Coverage measurement failed: {0}")]
    Oracle(#[from] OracleError),
    #[error("Corpus operation failed: {0}")]
    Corpus(#[from] CorpusError),
    #[error("Structural merge failed: {0}")]
    Merge(#[from] MergeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Merge,
    Additive,
    Subtractive,
    Length,
}

impl Phase {
    /// Execution order of the reduction pipeline.
    pub const ALL: [Phase; 4] = [
        Phase::Merge,
        Phase::Additive,
        Phase::Subtractive,
        Phase::Length,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Merge => "merge",
            Phase::Additive => "additive",
            Phase::Subtractive => "subtractive",
            Phase::Length => "length",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseOutcome {
    Completed,
    Cancelled,
}

/// What a phase did to the corpus.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    pub before: CorpusSize,
    pub after: CorpusSize,
    pub files_removed: usize,
    pub bytes_saved: u64,
    /// Whole-corpus coverage captured at phase entry; `None` for phases that
    /// never consult the oracle.
    pub target: Option<CoverageVector>,
}

impl PhaseReport {
    pub(crate) fn new(
        phase: Phase,
        outcome: PhaseOutcome,
        before: CorpusSize,
        after: CorpusSize,
        target: Option<CoverageVector>,
    ) -> Self {
        Self {
            phase,
            outcome,
            before,
            after,
            files_removed: before.files.saturating_sub(after.files),
            bytes_saved: before.bytes.saturating_sub(after.bytes),
            target,
        }
    }

    pub(crate) fn untouched(phase: Phase, outcome: PhaseOutcome, size: CorpusSize) -> Self {
        Self::new(phase, outcome, size, size, None)
    }

    pub fn is_cancelled(&self) -> bool {
        self.outcome == PhaseOutcome::Cancelled
    }
}

/// Per-phase bookkeeping, alive from phase entry to phase exit.
#[derive(Debug)]
pub(crate) struct ReductionSession {
    pub phase: Phase,
    pub before: CorpusSize,
    pub target: CoverageVector,
    pub best: CoverageVector,
    pub kept: usize,
    pub rejected: usize,
}

impl ReductionSession {
    pub fn start(phase: Phase, before: CorpusSize, target: CoverageVector) -> Self {
        log::info!(
            "Phase {phase}: {} files, {} bytes, target {target}",
            before.files,
            before.bytes
        );
        Self {
            phase,
            before,
            target,
            best: CoverageVector::ZERO,
            kept: 0,
            rejected: 0,
        }
    }

    pub fn finish(
        self,
        store: &CorpusStore,
        outcome: PhaseOutcome,
    ) -> Result<PhaseReport, ReduceError> {
        store.sync();
        let after = store.size()?;
        let report = PhaseReport::new(self.phase, outcome, self.before, after, Some(self.target));
        match outcome {
            PhaseOutcome::Completed => log::info!(
                "Phase {} done: {} -> {} files, {} -> {} bytes ({} kept, {} rejected)",
                self.phase,
                self.before.files,
                after.files,
                self.before.bytes,
                after.bytes,
                self.kept,
                self.rejected
            ),
            PhaseOutcome::Cancelled => log::warn!(
                "Phase {} cancelled; corpus left at {} files, {} bytes",
                self.phase,
                after.files,
                after.bytes
            ),
        }
        Ok(report)
    }
}

/// Consults the oracle, turning a failure caused by an interrupt into `None`.
///
/// A Ctrl-C reaches the measured child as well as our handler, in no fixed
/// order. A child killed by SIGINT therefore raises `cancel` itself, and any
/// failure seen once `cancel` is raised counts as the interrupt.
pub(crate) fn measure_or_cancel(
    oracle: &mut dyn Oracle,
    inputs: &Path,
    cancel: &CancellationToken,
) -> Result<Option<CoverageVector>, ReduceError> {
    match oracle.measure(inputs) {
        Ok(coverage) => Ok(Some(coverage)),
        Err(e) if e.is_interrupt() || cancel.is_cancelled() => {
            cancel.cancel();
            log::debug!("Measurement interrupted: {e}");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// How an oracle-driven phase starts.
pub(crate) enum Entry {
    /// Work to do; the session carries the full-coverage target.
    Proceed(ReductionSession),
    /// Nothing to do (empty corpus) or interrupted before the first mutation.
    Skip(PhaseReport),
}

/// Entry guard shared by the oracle-driven phases: skips empty corpora and
/// captures the full-coverage target.
pub(crate) fn enter(
    phase: Phase,
    store: &CorpusStore,
    oracle: &mut dyn Oracle,
    cancel: &CancellationToken,
) -> Result<Entry, ReduceError> {
    let before = store.size()?;
    if cancel.is_cancelled() {
        return Ok(Entry::Skip(PhaseReport::untouched(
            phase,
            PhaseOutcome::Cancelled,
            before,
        )));
    }
    if before.files == 0 {
        log::info!("Phase {phase}: corpus is empty, nothing to do");
        return Ok(Entry::Skip(PhaseReport::untouched(
            phase,
            PhaseOutcome::Completed,
            before,
        )));
    }
    Ok(match measure_or_cancel(oracle, store.path(), cancel)? {
        Some(target) => Entry::Proceed(ReductionSession::start(phase, before, target)),
        None => Entry::Skip(PhaseReport::untouched(
            phase,
            PhaseOutcome::Cancelled,
            before,
        )),
    })
}
