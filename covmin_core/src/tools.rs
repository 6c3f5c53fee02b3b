use crate::executor::{CommandExecutor, ExecutionStatus, Invocation};
use std::fmt;
use std::path::PathBuf;

/// Locations of the target binary and the LLVM tools used to measure it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    /// The fuzz target linked against the fuzzcover harness (`--test`, `--fuzz`, `--dump`).
    pub target: PathBuf,
    pub llvm_profdata: PathBuf,
    pub llvm_cov: PathBuf,
}

impl ToolPaths {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            llvm_profdata: PathBuf::from("llvm-profdata"),
            llvm_cov: PathBuf::from("llvm-cov"),
        }
    }

    /// File name of the target, used to derive default corpus and dump names.
    pub fn target_name(&self) -> String {
        self.target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "target".to_string())
    }
}

/// A required external tool could not be started. Operation continues degraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolWarning {
    pub tool: PathBuf,
    pub reason: String,
}

impl fmt::Display for ToolWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "The tool {} was not found in the PATH ({})",
            self.tool.display(),
            self.reason
        )
    }
}

/// Probes the LLVM tools with `--version`. Only tools that cannot be spawned at
/// all are reported; a tool that runs but complains is considered present.
pub fn check_tools(paths: &ToolPaths) -> Vec<ToolWarning> {
    let executor = CommandExecutor::default();
    [&paths.llvm_profdata, &paths.llvm_cov]
        .into_iter()
        .filter_map(|tool| {
            let result = executor.execute(&Invocation::new(tool).arg("--version"));
            match result.status {
                ExecutionStatus::SpawnError(reason) => Some(ToolWarning {
                    tool: tool.clone(),
                    reason,
                }),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_name_is_the_file_name() {
        let paths = ToolPaths::new("/opt/build/json_fuzzer");
        assert_eq!(paths.target_name(), "json_fuzzer");
        assert_eq!(paths.llvm_cov, PathBuf::from("llvm-cov"));
    }

    #[test]
    fn missing_tools_are_warnings() {
        let mut paths = ToolPaths::new("target");
        paths.llvm_profdata = PathBuf::from("/nonexistent/llvm-profdata-covmin-test");
        paths.llvm_cov = PathBuf::from("/nonexistent/llvm-cov-covmin-test");
        let warnings = check_tools(&paths);
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0].tool, paths.llvm_profdata);
        assert!(warnings[1].to_string().contains("llvm-cov-covmin-test"));
    }

    #[cfg(unix)]
    #[test]
    fn present_tools_produce_no_warning() {
        use crate::executor::test_scripts::write_script;
        let dir = tempfile::tempdir().unwrap();
        let mut paths = ToolPaths::new("target");
        paths.llvm_profdata = write_script(dir.path(), "llvm-profdata", "exit 0");
        // A tool that runs but fails `--version` is still present.
        paths.llvm_cov = write_script(dir.path(), "llvm-cov", "exit 1");
        assert!(check_tools(&paths).is_empty());
    }
}
