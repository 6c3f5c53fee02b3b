//! Invocations of the target outside the reduction pipeline: fuzzing, corpus
//! dumps and the browsable HTML coverage report.

use crate::executor::{CommandExecutor, ExecutionStatus, Invocation, OutputMode};
use crate::oracle::{LlvmCoverageOracle, OracleError};
use crate::tools::ToolPaths;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Could not run {tool}: {message}")]
    Spawn { tool: String, message: String },

    #[error("{tool} failed: {message}")]
    Failed { tool: String, message: String },

    #[error("{tool} timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("Could not collect coverage: {0}")]
    Coverage(#[from] OracleError),

    #[error("Could not prepare scratch space: {0}")]
    Scratch(#[from] std::io::Error),
}

/// libFuzzer settings for one fuzzing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuzzOptions {
    /// Seconds; 0 runs until interrupted.
    pub max_total_time: u64,
    /// -1 means unlimited.
    pub runs: i64,
    /// Parallel jobs; 0 disables concurrency.
    pub jobs: u32,
    /// Maximum input length in bytes; 0 lets libFuzzer decide.
    pub max_len: u64,
    pub only_ascii: bool,
}

impl Default for FuzzOptions {
    fn default() -> Self {
        Self {
            max_total_time: 30,
            runs: -1,
            jobs: 0,
            max_len: 0,
            only_ascii: false,
        }
    }
}

impl FuzzOptions {
    fn args(&self) -> [String; 5] {
        [
            format!("-max_total_time={}", self.max_total_time),
            format!("-runs={}", self.runs),
            format!("-only_ascii={}", u8::from(self.only_ascii)),
            format!("-jobs={}", self.jobs),
            format!("-max_len={}", self.max_len),
        ]
    }
}

/// Directory the HTML report for `corpus` is written to: `<corpus>_coverage`.
pub fn report_dir(corpus: &Path) -> PathBuf {
    let mut name = corpus.as_os_str().to_owned();
    name.push("_coverage");
    PathBuf::from(name)
}

/// Runs the target's `--fuzz`, `--dump` and coverage report modes.
#[derive(Debug, Clone)]
pub struct Campaign {
    tools: ToolPaths,
    executor: CommandExecutor,
}

impl Campaign {
    pub fn new(tools: ToolPaths, executor: CommandExecutor) -> Self {
        Self { tools, executor }
    }

    /// Fuzzes into `corpus`. A non-zero exit (a crash found, an interrupt) is
    /// logged and does not fail the call; libFuzzer keeps what it found.
    pub fn fuzz(
        &self,
        corpus: &Path,
        options: &FuzzOptions,
        quiet: bool,
    ) -> Result<(), CampaignError> {
        let workspace = tempfile::Builder::new().prefix("covmin-fuzz-").tempdir()?;
        let mut invocation = Invocation::new(&self.tools.target)
            .arg("--fuzz")
            .arg(corpus)
            .profile_file(workspace.path().join("default.profraw"))
            .output(if quiet {
                OutputMode::Discard
            } else {
                OutputMode::Inherit
            });
        for arg in options.args() {
            invocation = invocation.arg(arg);
        }

        log::info!("Fuzzing {:?} with {:?}", corpus, options);
        match self.executor.execute(&invocation).status {
            ExecutionStatus::Ok => Ok(()),
            ExecutionStatus::Failed(message) => {
                log::warn!("Fuzzer stopped: {message}");
                Ok(())
            }
            status => Err(self.failure(&invocation, status)),
        }
    }

    /// Prints the corpus through the target's `--dump` mode, or writes it to
    /// `output` when given.
    pub fn dump(&self, corpus: &Path, output: Option<&Path>) -> Result<(), CampaignError> {
        let workspace = tempfile::Builder::new().prefix("covmin-dump-").tempdir()?;
        let mut invocation = Invocation::new(&self.tools.target)
            .arg("--dump")
            .arg(corpus)
            .profile_file(workspace.path().join("default.profraw"))
            .output(OutputMode::Inherit);
        if let Some(output) = output {
            invocation = invocation.arg(output);
        }
        match self.executor.execute(&invocation).status {
            ExecutionStatus::Ok => {
                if let Some(output) = output {
                    log::info!("Saved corpus to {}", output.display());
                }
                Ok(())
            }
            status => Err(self.failure(&invocation, status)),
        }
    }

    /// Renders an HTML line/branch coverage report of `corpus` and returns the
    /// path of its `index.html`.
    pub fn render_html_report(&self, corpus: &Path) -> Result<PathBuf, CampaignError> {
        let workspace = tempfile::Builder::new()
            .prefix("covmin-report-")
            .tempdir()?;
        let collector = LlvmCoverageOracle::new(self.tools.clone(), self.executor.clone());
        let indexed = collector.index_profile(corpus, workspace.path())?;

        let output_dir = report_dir(corpus);
        let mut instr_profile = OsString::from("-instr-profile=");
        instr_profile.push(&indexed);
        let mut output_arg = OsString::from("-output-dir=");
        output_arg.push(&output_dir);
        let show = Invocation::new(&self.tools.llvm_cov)
            .arg("show")
            .arg(&self.tools.target)
            .arg(instr_profile)
            .arg("-format=html")
            .arg(output_arg)
            .arg("-show-branches=percent")
            .arg("-show-line-counts-or-regions");
        match self.executor.execute(&show).status {
            ExecutionStatus::Ok => {
                let index = output_dir.join("index.html");
                log::info!("Coverage report written to {}", index.display());
                Ok(index)
            }
            status => Err(self.failure(&show, status)),
        }
    }

    fn failure(&self, invocation: &Invocation, status: ExecutionStatus) -> CampaignError {
        let tool = invocation.program.display().to_string();
        match status {
            ExecutionStatus::SpawnError(message) => CampaignError::Spawn { tool, message },
            ExecutionStatus::Timeout => CampaignError::Timeout {
                tool,
                timeout: self.executor.timeout().unwrap_or_default(),
            },
            ExecutionStatus::Failed(message) => CampaignError::Failed { tool, message },
            ExecutionStatus::Ok => CampaignError::Failed {
                tool,
                message: "unexpected success".to_string(),
            },
        }
    }
}
