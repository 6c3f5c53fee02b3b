use crate::additive::reduce_additive;
use crate::cancel::CancellationToken;
use crate::corpus::{CorpusSize, CorpusStore};
use crate::length::reduce_length;
use crate::merge::{Merger, merge_corpus};
use crate::oracle::{MeasuredOracle, Oracle, OracleStats};
use crate::phase::{Phase, PhaseReport, ReduceError};
use crate::subtractive::reduce_subtractive;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Instant;

/// Which phases a reduction run executes. Order is fixed regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct PhaseSelection {
    pub merge: bool,
    pub additive: bool,
    pub subtractive: bool,
    pub length: bool,
}

impl Default for PhaseSelection {
    fn default() -> Self {
        Self {
            merge: true,
            additive: true,
            subtractive: true,
            length: true,
        }
    }
}

impl PhaseSelection {
    pub fn includes(&self, phase: Phase) -> bool {
        match phase {
            Phase::Merge => self.merge,
            Phase::Additive => self.additive,
            Phase::Subtractive => self.subtractive,
            Phase::Length => self.length,
        }
    }
}

/// Summary of one reduction run.
#[derive(Debug, Clone, Serialize)]
pub struct ReductionReport {
    pub before: CorpusSize,
    pub after: CorpusSize,
    pub phases: Vec<PhaseReport>,
    pub oracle: OracleStats,
    pub seconds: f64,
    pub cancelled: bool,
}

impl ReductionReport {
    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create report file {path:?}"))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .with_context(|| format!("Failed to write report to {path:?}"))?;
        Ok(())
    }
}

/// Runs merge, additive, subtractive and length reduction in that order.
///
/// Every phase leaves the corpus durable on disk before the next one starts.
/// The run stops after the first phase that reports a cancellation.
pub struct ReductionPipeline<O: Oracle, M: Merger> {
    oracle: MeasuredOracle<O>,
    merger: M,
    selection: PhaseSelection,
    cancel: CancellationToken,
}

impl<O: Oracle, M: Merger> ReductionPipeline<O, M> {
    pub fn new(oracle: O, merger: M, cancel: CancellationToken) -> Self {
        Self {
            oracle: MeasuredOracle::new(oracle),
            merger,
            selection: PhaseSelection::default(),
            cancel,
        }
    }

    pub fn with_selection(mut self, selection: PhaseSelection) -> Self {
        self.selection = selection;
        self
    }

    /// The oracle, for measurements outside a reduction run (overviews).
    pub fn oracle_mut(&mut self) -> &mut MeasuredOracle<O> {
        &mut self.oracle
    }

    pub fn run(&mut self, store: &CorpusStore) -> Result<ReductionReport, ReduceError> {
        let started = Instant::now();
        let calls_before = self.oracle.stats();
        let before = store.size()?;
        let mut phases = Vec::new();

        for phase in Phase::ALL {
            if !self.selection.includes(phase) {
                log::debug!("Phase {phase} disabled, skipping");
                continue;
            }
            let report = match phase {
                Phase::Merge => merge_corpus(store, &mut self.merger, &self.cancel)?,
                Phase::Additive => reduce_additive(store, &mut self.oracle, &self.cancel)?,
                Phase::Subtractive => reduce_subtractive(store, &mut self.oracle, &self.cancel)?,
                Phase::Length => reduce_length(store, &mut self.oracle, &self.cancel)?,
            };
            let cancelled = report.is_cancelled();
            phases.push(report);
            if cancelled {
                break;
            }
        }

        let after = store.size()?;
        let totals = self.oracle.stats();
        let oracle = OracleStats {
            calls: totals.calls - calls_before.calls,
            seconds: totals.seconds - calls_before.seconds,
        };
        let cancelled = phases.iter().any(PhaseReport::is_cancelled);
        log::info!(
            "Reduction {}: {} -> {} files, {} -> {} bytes, {} oracle calls ({:.2}s each)",
            if cancelled { "interrupted" } else { "finished" },
            before.files,
            after.files,
            before.bytes,
            after.bytes,
            oracle.calls,
            oracle.seconds_per_call()
        );
        Ok(ReductionReport {
            before,
            after,
            phases,
            oracle,
            seconds: started.elapsed().as_secs_f64(),
            cancelled,
        })
    }
}
