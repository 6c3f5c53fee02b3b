use crate::coverage::CoverageVector;
use crate::executor::{CommandExecutor, ExecutionResult, ExecutionStatus, Invocation};
use crate::tools::ToolPaths;
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OracleError {
    /// A tool of the measurement chain could not be started.
    #[error("Could not run {tool}: {message}")]
    Spawn { tool: String, message: String },

    /// The target exited unsuccessfully while replaying the inputs.
    #[error("Target failed on {inputs}: {message}")]
    TargetFailed { inputs: String, message: String },

    #[error("Measurement timed out after {0:?}")]
    Timeout(Duration),

    /// A tool of the chain was killed by SIGINT.
    #[error("Measurement interrupted")]
    Interrupted,

    /// `llvm-profdata merge` failed.
    #[error("Profile aggregation failed: {0}")]
    Aggregation(String),

    /// `llvm-cov report` failed.
    #[error("Coverage report failed: {0}")]
    Report(String),

    #[error("Coverage report has no TOTAL row")]
    MissingTotals,

    #[error("Malformed TOTAL row '{row}': {reason}")]
    MalformedTotals { row: String, reason: String },

    #[error("Could not prepare profiling scratch space: {0}")]
    Scratch(#[from] std::io::Error),
}

impl OracleError {
    pub fn is_interrupt(&self) -> bool {
        matches!(self, OracleError::Interrupted)
    }
}

/// Measures the coverage reached by a directory of inputs.
///
/// Implementations are assumed to be expensive, so callers keep the number of
/// calls as low as the algorithm allows.
pub trait Oracle {
    /// Runs every input in `inputs` and returns the aggregate coverage.
    ///
    /// # Arguments
    /// * `inputs`: A directory of input files. It may be empty, in which case
    ///   implementations should report [`CoverageVector::ZERO`] rather than fail.
    ///
    /// # Returns
    /// The covered line and branch counts, or an `OracleError` if the
    /// measurement could not be carried out. Identical directory contents are
    /// expected to yield identical vectors.
    fn measure(&mut self, inputs: &Path) -> Result<CoverageVector, OracleError>;
}

impl<O: Oracle + ?Sized> Oracle for &mut O {
    fn measure(&mut self, inputs: &Path) -> Result<CoverageVector, OracleError> {
        (**self).measure(inputs)
    }
}

impl<O: Oracle + ?Sized> Oracle for Box<O> {
    fn measure(&mut self, inputs: &Path) -> Result<CoverageVector, OracleError> {
        (**self).measure(inputs)
    }
}

/// Oracle that replays the inputs through an LLVM source-based-coverage build
/// of the target and reads the totals from `llvm-cov report`.
#[derive(Debug, Clone)]
pub struct LlvmCoverageOracle {
    tools: ToolPaths,
    executor: CommandExecutor,
}

impl LlvmCoverageOracle {
    const RAW_PROFILE: &'static str = "coverage.profraw";
    const INDEXED_PROFILE: &'static str = "coverage.profdata";

    pub fn new(tools: ToolPaths, executor: CommandExecutor) -> Self {
        Self { tools, executor }
    }

    fn run_chain(&self, inputs: &Path, workspace: &Path) -> Result<CoverageVector, OracleError> {
        let indexed = self.index_profile(inputs, workspace)?;

        let mut instr_profile = OsString::from("-instr-profile=");
        instr_profile.push(&indexed);
        let report = Invocation::new(&self.tools.llvm_cov)
            .arg("report")
            .arg(&self.tools.target)
            .arg(instr_profile);
        let result = self.check(report, OracleError::Report)?;
        parse_total_row(&result.output.stdout_lossy())
    }

    /// Replays `inputs` and aggregates the raw profile into an indexed one
    /// inside `workspace`. Returns the indexed profile's path.
    pub(crate) fn index_profile(
        &self,
        inputs: &Path,
        workspace: &Path,
    ) -> Result<PathBuf, OracleError> {
        let raw = workspace.join(Self::RAW_PROFILE);
        let indexed = workspace.join(Self::INDEXED_PROFILE);

        let replay = Invocation::new(&self.tools.target)
            .arg("--test")
            .arg(inputs)
            .profile_file(&raw);
        self.check(replay, |message| OracleError::TargetFailed {
            inputs: inputs.display().to_string(),
            message,
        })?;

        let merge = Invocation::new(&self.tools.llvm_profdata)
            .arg("merge")
            .arg("-sparse")
            .arg(&raw)
            .arg("-o")
            .arg(&indexed);
        self.check(merge, OracleError::Aggregation)?;
        Ok(indexed)
    }

    fn check(
        &self,
        invocation: Invocation,
        on_failure: impl FnOnce(String) -> OracleError,
    ) -> Result<ExecutionResult, OracleError> {
        let result = self.executor.execute(&invocation);
        match result.status.clone() {
            ExecutionStatus::Ok => Ok(result),
            ExecutionStatus::Timeout => Err(OracleError::Timeout(
                self.executor.timeout().unwrap_or_default(),
            )),
            ExecutionStatus::SpawnError(message) => Err(OracleError::Spawn {
                tool: invocation.program.display().to_string(),
                message,
            }),
            ExecutionStatus::Failed(_) if result.output.interrupted() => {
                Err(OracleError::Interrupted)
            }
            ExecutionStatus::Failed(message) => Err(on_failure(message)),
        }
    }
}

impl Oracle for LlvmCoverageOracle {
    fn measure(&mut self, inputs: &Path) -> Result<CoverageVector, OracleError> {
        // One private directory per call: concurrent measurements never share a profile.
        let workspace = tempfile::Builder::new()
            .prefix("covmin-profile-")
            .tempdir()?;
        match self.run_chain(inputs, workspace.path()) {
            Ok(coverage) => {
                log::trace!("Coverage of {:?}: {}", inputs, coverage);
                Ok(coverage)
            }
            Err(e) if !e.is_interrupt() && is_empty_dir(inputs) => {
                log::debug!("No coverage for empty input set {:?} ({}), using zero", inputs, e);
                Ok(CoverageVector::ZERO)
            }
            Err(e) => Err(e),
        }
    }
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

/// Extracts covered lines and branches from the `TOTAL` row of `llvm-cov report`.
///
/// Columns after the label are: regions, missed regions, region %, functions,
/// missed functions, function %, lines, missed lines, line %, branches, missed
/// branches, branch %.
pub fn parse_total_row(report: &str) -> Result<CoverageVector, OracleError> {
    const LINES: usize = 7;
    const MISSED_LINES: usize = 8;
    const BRANCHES: usize = 10;
    const MISSED_BRANCHES: usize = 11;
    const COLUMNS: usize = 13;

    let row = report
        .lines()
        .find(|line| line.starts_with("TOTAL"))
        .ok_or(OracleError::MissingTotals)?;
    let fields: Vec<&str> = row.split_whitespace().collect();
    let malformed = |reason: String| OracleError::MalformedTotals {
        row: row.to_string(),
        reason,
    };
    if fields.len() < COLUMNS {
        return Err(malformed(format!(
            "expected {COLUMNS} columns, found {}",
            fields.len()
        )));
    }
    let number = |index: usize| {
        fields[index]
            .parse::<u64>()
            .map_err(|e| malformed(format!("column {index} ('{}'): {e}", fields[index])))
    };
    let covered = |total: usize, missed: usize| -> Result<u64, OracleError> {
        let (total, missed) = (number(total)?, number(missed)?);
        total
            .checked_sub(missed)
            .ok_or_else(|| malformed(format!("{missed} missed out of {total}")))
    };

    Ok(CoverageVector::new(
        covered(LINES, MISSED_LINES)?,
        covered(BRANCHES, MISSED_BRANCHES)?,
    ))
}

/// Oracle backed by a closure, for embedding and for deterministic tests.
pub struct InProcessOracle<F>
where
    F: FnMut(&Path) -> Result<CoverageVector, OracleError>,
{
    measure_fn: F,
}

impl<F> InProcessOracle<F>
where
    F: FnMut(&Path) -> Result<CoverageVector, OracleError>,
{
    pub fn new(measure_fn: F) -> Self {
        Self { measure_fn }
    }
}

impl<F> Oracle for InProcessOracle<F>
where
    F: FnMut(&Path) -> Result<CoverageVector, OracleError>,
{
    fn measure(&mut self, inputs: &Path) -> Result<CoverageVector, OracleError> {
        (self.measure_fn)(inputs)
    }
}

/// Call count and wall time spent inside an oracle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OracleStats {
    pub calls: u64,
    pub seconds: f64,
}

impl OracleStats {
    pub fn seconds_per_call(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.seconds / self.calls as f64
        }
    }
}

/// Wraps an oracle and records how often and how long it was consulted.
pub struct MeasuredOracle<O: Oracle> {
    inner: O,
    calls: u64,
    elapsed: Duration,
}

impl<O: Oracle> MeasuredOracle<O> {
    pub fn new(inner: O) -> Self {
        Self {
            inner,
            calls: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn stats(&self) -> OracleStats {
        OracleStats {
            calls: self.calls,
            seconds: self.elapsed.as_secs_f64(),
        }
    }
}

impl<O: Oracle> Oracle for MeasuredOracle<O> {
    fn measure(&mut self, inputs: &Path) -> Result<CoverageVector, OracleError> {
        let start = Instant::now();
        let result = self.inner.measure(inputs);
        self.calls += 1;
        self.elapsed += start.elapsed();
        result
    }
}
