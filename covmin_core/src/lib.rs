pub mod additive;
pub mod campaign;
pub mod cancel;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod executor;
pub mod length;
pub mod merge;
pub mod oracle;
pub mod overview;
pub mod phase;
pub mod pipeline;
pub mod subtractive;
pub mod tools;

pub use additive::reduce_additive;
pub use campaign::{Campaign, CampaignError, FuzzOptions};
pub use cancel::CancellationToken;
pub use config::CovminConfig;
pub use corpus::{CorpusError, CorpusSize, CorpusStore};
pub use coverage::CoverageVector;
pub use executor::{CommandExecutor, ExecutionStatus};
pub use length::reduce_length;
pub use merge::{LibFuzzerMerger, MergeError, Merger, merge_corpus};
pub use oracle::{InProcessOracle, LlvmCoverageOracle, MeasuredOracle, Oracle, OracleError};
pub use overview::{Overview, OverviewDiff};
pub use phase::{Phase, PhaseOutcome, PhaseReport, ReduceError};
pub use pipeline::{PhaseSelection, ReductionPipeline, ReductionReport};
pub use subtractive::reduce_subtractive;
pub use tools::{ToolPaths, ToolWarning, check_tools};
