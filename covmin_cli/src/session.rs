use covmin_core::{
    Campaign, CancellationToken, CorpusStore, CovminConfig, FuzzOptions, LibFuzzerMerger,
    LlvmCoverageOracle, Overview, ReductionPipeline, ReductionReport, ToolPaths,
};

use anyhow::Context;
use std::path::PathBuf;

/// Everything the menu actions operate on, plus the overview shown last time.
pub struct Session {
    store: CorpusStore,
    corpus_name: String,
    tools: ToolPaths,
    config: CovminConfig,
    campaign: Campaign,
    oracle: LlvmCoverageOracle,
    merger: LibFuzzerMerger,
    cancel: CancellationToken,
    report_path: Option<PathBuf>,
    quiet: bool,
    last_overview: Option<Overview>,
}

impl Session {
    pub fn new(
        store: CorpusStore,
        corpus_name: String,
        tools: ToolPaths,
        config: CovminConfig,
        cancel: CancellationToken,
        report_path: Option<PathBuf>,
        quiet: bool,
    ) -> Self {
        let executor = config.tools.measure_executor();
        Self {
            oracle: LlvmCoverageOracle::new(tools.clone(), executor.clone()),
            merger: LibFuzzerMerger::new(&tools.target, executor),
            campaign: Campaign::new(tools.clone(), Default::default()),
            store,
            corpus_name,
            tools,
            config,
            cancel,
            report_path,
            quiet,
            last_overview: None,
        }
    }

    pub fn config(&self) -> &CovminConfig {
        &self.config
    }

    /// Banner text: target, corpus size and coverage, with changes since the
    /// previous call.
    pub fn overview(&mut self) -> String {
        let mut text = format!("Fuzzcover binary: {}\n", self.tools.target.display());
        match Overview::take(&self.store, &mut self.oracle) {
            Ok(now) => {
                text.push_str(&now.render(&self.corpus_name, self.last_overview.as_ref()));
                self.last_overview = Some(now);
            }
            Err(e) => {
                log::error!("Could not measure coverage: {e}");
                match self.store.size() {
                    Ok(size) => text.push_str(&format!(
                        "Corpus: {}, {} files, {} bytes",
                        self.corpus_name, size.files, size.bytes
                    )),
                    Err(e) => log::error!("Could not read corpus: {e}"),
                }
            }
        }
        text
    }

    pub fn fuzz(&self, options: &FuzzOptions) -> Result<(), anyhow::Error> {
        self.campaign
            .fuzz(self.store.path(), options, self.quiet)
            .context("Fuzzing failed")
    }

    pub fn reduce(&mut self) -> Result<ReductionReport, anyhow::Error> {
        let mut pipeline =
            ReductionPipeline::new(self.oracle.clone(), self.merger.clone(), self.cancel.clone())
                .with_selection(self.config.reduce);
        let report = pipeline.run(&self.store).context("Reduction failed")?;
        if let Some(path) = &self.report_path {
            report.write_json(path)?;
            log::info!("Reduction report written to {}", path.display());
        }
        Ok(report)
    }

    /// Dumps to stdout, or to `<binary name>.json` when `to_file` is set.
    pub fn dump(&self, to_file: bool) -> Result<(), anyhow::Error> {
        let output = to_file.then(|| self.dump_file());
        self.campaign
            .dump(self.store.path(), output.as_deref())
            .context("Dumping the corpus failed")
    }

    pub fn show_coverage(&self) -> Result<PathBuf, anyhow::Error> {
        self.campaign
            .render_html_report(self.store.path())
            .context("Creating the coverage report failed")
    }

    pub fn clear(&self) -> Result<(), anyhow::Error> {
        self.store.clear()?;
        log::info!("Cleared corpus {}", self.corpus_name);
        Ok(())
    }

    /// Fresh corpus from a short quiet fuzzing run, reduced and dumped.
    pub fn lucky(&mut self) -> Result<(), anyhow::Error> {
        log::info!("Creating corpus with default arguments...");
        self.clear()?;
        let options = self.config.lucky.fuzz_options();
        self.campaign
            .fuzz(self.store.path(), &options, true)
            .context("Fuzzing failed")?;
        // Ctrl-C during fuzzing only ends the fuzzing run.
        self.cancel.reset();
        let report = self.reduce()?;
        if report.cancelled {
            log::warn!("Reduction interrupted, corpus not dumped");
            return Ok(());
        }
        self.dump(true)
    }

    /// Clears a pending interrupt so the next step starts fresh.
    pub fn reset_interrupt(&self) {
        self.cancel.reset();
    }

    fn dump_file(&self) -> PathBuf {
        PathBuf::from(format!("{}.json", self.tools.target_name()))
    }
}
