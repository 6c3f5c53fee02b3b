mod menu;
mod session;

use covmin_core::{CancellationToken, CorpusStore, CovminConfig, check_tools};
use session::Session;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Coverage-guided corpus minimization for fuzzcover targets", long_about = None)]
struct Cli {
    /// The binary linked to the fuzzcover library.
    #[clap(value_name = "FUZZER_BINARY", value_parser)]
    binary: PathBuf,
    /// Corpus directory. Defaults to `<binary name>_corpus` and is created if missing.
    #[clap(value_name = "CORPUS_DIRECTORY", value_parser)]
    corpus: Option<PathBuf>,
    /// Fuzz, reduce and dump without user interaction.
    #[clap(long)]
    lucky: bool,
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// File or directory of seed inputs to add to the corpus. Repeatable.
    #[clap(long = "seed", value_name = "PATH", value_parser)]
    seeds: Vec<PathBuf>,
    /// Write a JSON report after each reduction.
    #[clap(long, value_name = "FILE", value_parser)]
    report: Option<PathBuf>,
    /// Only log warnings and errors; fuzzer output is discarded.
    #[clap(short, long)]
    quiet: bool,
}

fn load_config(config_file: Option<PathBuf>) -> Result<CovminConfig, anyhow::Error> {
    match config_file {
        Some(config_path) => {
            log::info!("Loading configuration from {config_path:?}");
            CovminConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("covmin.toml");
            if default_config_path.exists() {
                log::info!("Loading configuration from {default_config_path:?}");
                CovminConfig::load_from_file(&default_config_path)
            } else {
                log::debug!("No config file found, using built-in defaults");
                Ok(CovminConfig::default())
            }
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let default_level = if cli.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();

    let config = load_config(cli.config_file)?;
    log::debug!("Effective configuration: {config:#?}");

    let binary = std::path::absolute(&cli.binary)
        .with_context(|| format!("Invalid binary path {:?}", cli.binary))?;
    let tools = config.tools.tool_paths(&binary);
    for warning in check_tools(&tools) {
        log::warn!("{warning}");
    }

    let corpus_dir = cli
        .corpus
        .unwrap_or_else(|| PathBuf::from(format!("{}_corpus", tools.target_name())));
    let store = CorpusStore::open(&corpus_dir)
        .with_context(|| format!("Cannot use corpus directory {corpus_dir:?}"))?;
    for seed in &cli.seeds {
        let added = store
            .import(seed)
            .with_context(|| format!("Failed to import seeds from {seed:?}"))?;
        log::info!("Imported {added} new inputs from {seed:?}");
    }

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        if handler_token.is_cancelled() {
            std::process::exit(130);
        }
        handler_token.cancel();
        log::warn!("Interrupted, stopping at the next safe point (Ctrl-C again to quit)");
    })
    .context("Failed to install Ctrl-C handler")?;

    let mut session = Session::new(
        store,
        corpus_dir.display().to_string(),
        tools,
        config,
        cancel,
        cli.report,
        cli.quiet,
    );

    if cli.lucky {
        session.lucky()?;
        return Ok(());
    }
    menu::run(&mut session)
}
