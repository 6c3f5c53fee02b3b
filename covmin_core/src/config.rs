use crate::campaign::FuzzOptions;
use crate::executor::CommandExecutor;
use crate::pipeline::PhaseSelection;
use crate::tools::ToolPaths;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ToolSettings {
    #[serde(default = "default_llvm_profdata")]
    pub llvm_profdata: PathBuf,
    #[serde(default = "default_llvm_cov")]
    pub llvm_cov: PathBuf,
    /// Per-tool timeout for coverage measurements; unset waits forever.
    #[serde(default)]
    pub measure_timeout_ms: Option<u64>,
}

fn default_llvm_profdata() -> PathBuf {
    PathBuf::from("llvm-profdata")
}

fn default_llvm_cov() -> PathBuf {
    PathBuf::from("llvm-cov")
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            llvm_profdata: default_llvm_profdata(),
            llvm_cov: default_llvm_cov(),
            measure_timeout_ms: None,
        }
    }
}

impl ToolSettings {
    pub fn tool_paths(&self, target: impl Into<PathBuf>) -> ToolPaths {
        let mut paths = ToolPaths::new(target);
        paths.llvm_profdata = self.llvm_profdata.clone();
        paths.llvm_cov = self.llvm_cov.clone();
        paths
    }

    pub fn measure_executor(&self) -> CommandExecutor {
        CommandExecutor::new(self.measure_timeout_ms.map(Duration::from_millis))
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzSettings {
    #[serde(default = "default_max_total_time")]
    pub max_total_time: u64,
    #[serde(default = "default_runs")]
    pub runs: i64,
    #[serde(default)]
    pub jobs: u32,
    #[serde(default)]
    pub max_len: u64,
    #[serde(default)]
    pub only_ascii: bool,
}

fn default_max_total_time() -> u64 {
    30
}

fn default_runs() -> i64 {
    -1
}

impl Default for FuzzSettings {
    fn default() -> Self {
        Self {
            max_total_time: default_max_total_time(),
            runs: default_runs(),
            jobs: 0,
            max_len: 0,
            only_ascii: false,
        }
    }
}

impl From<&FuzzSettings> for FuzzOptions {
    fn from(settings: &FuzzSettings) -> Self {
        FuzzOptions {
            max_total_time: settings.max_total_time,
            runs: settings.runs,
            jobs: settings.jobs,
            max_len: settings.max_len,
            only_ascii: settings.only_ascii,
        }
    }
}

/// Fuzzing settings of the non-interactive mode.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LuckySettings {
    #[serde(default = "default_lucky_time")]
    pub max_total_time: u64,
    #[serde(default = "default_lucky_ascii")]
    pub only_ascii: bool,
}

fn default_lucky_time() -> u64 {
    10
}

fn default_lucky_ascii() -> bool {
    true
}

impl Default for LuckySettings {
    fn default() -> Self {
        Self {
            max_total_time: default_lucky_time(),
            only_ascii: default_lucky_ascii(),
        }
    }
}

impl LuckySettings {
    pub fn fuzz_options(&self) -> FuzzOptions {
        FuzzOptions {
            max_total_time: self.max_total_time,
            only_ascii: self.only_ascii,
            ..FuzzOptions::default()
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CovminConfig {
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub fuzz: FuzzSettings,
    #[serde(default)]
    pub reduce: PhaseSelection,
    #[serde(default)]
    pub lucky: LuckySettings,
}

impl CovminConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: CovminConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn empty_file_yields_defaults() {
        let config: CovminConfig = toml::from_str("").unwrap();
        assert_eq!(config, CovminConfig::default());
        assert_eq!(config.fuzz.max_total_time, 30);
        assert_eq!(config.fuzz.runs, -1);
        assert!(config.reduce.merge && config.reduce.length);
        assert_eq!(config.lucky.fuzz_options().max_total_time, 10);
        assert!(config.lucky.fuzz_options().only_ascii);
        assert_eq!(config.tools.measure_executor().timeout(), None);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: CovminConfig = toml::from_str(
            r#"
            [tools]
            llvm-cov = "/opt/llvm/bin/llvm-cov"
            measure-timeout-ms = 5000

            [fuzz]
            jobs = 4
            only-ascii = true

            [reduce]
            merge = false
            "#,
        )
        .unwrap();

        let paths = config.tools.tool_paths("/bin/target");
        assert_eq!(paths.llvm_cov, PathBuf::from("/opt/llvm/bin/llvm-cov"));
        assert_eq!(paths.llvm_profdata, PathBuf::from("llvm-profdata"));
        assert_eq!(
            config.tools.measure_executor().timeout(),
            Some(Duration::from_secs(5))
        );

        let options = FuzzOptions::from(&config.fuzz);
        assert_eq!(options.jobs, 4);
        assert!(options.only_ascii);
        assert_eq!(options.max_total_time, 30);

        assert!(!config.reduce.merge);
        assert!(config.reduce.additive && config.reduce.subtractive && config.reduce.length);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<CovminConfig>("[reduce]\nshuffle = true\n").is_err());
        assert!(toml::from_str::<CovminConfig>("[unknown]\n").is_err());
    }

    #[test]
    fn load_from_file_reports_path_on_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let err = CovminConfig::load_from_file(&missing).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));

        let bad = dir.path().join("bad.toml");
        fs::write(&bad, "[fuzz]\nruns = \"many\"\n").unwrap();
        let err = CovminConfig::load_from_file(&bad).unwrap_err();
        assert!(err.to_string().contains("Failed to parse TOML"));
    }

    #[test]
    fn load_from_file_reads_lucky_section() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("covmin.toml");
        fs::write(&path, "[lucky]\nmax-total-time = 60\nonly-ascii = false\n").unwrap();
        let config = CovminConfig::load_from_file(&path).unwrap();
        assert_eq!(
            config.lucky,
            LuckySettings {
                max_total_time: 60,
                only_ascii: false
            }
        );
    }
}
