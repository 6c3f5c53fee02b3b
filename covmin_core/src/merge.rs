//! Structural merge through the fuzz engine's own `-merge=1` mode.

use crate::cancel::CancellationToken;
use crate::corpus::CorpusStore;
use crate::executor::{CommandExecutor, ExecutionStatus, Invocation};
use crate::phase::{Phase, PhaseOutcome, PhaseReport, ReduceError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Raw profile the instrumented target drops into the merge output directory.
pub const MERGE_PROFILE_ARTIFACT: &str = "default.profraw";

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Could not start merge: {0}")]
    Spawn(String),
    #[error("Merge failed: {0}")]
    Failed(String),
    #[error("Merge timed out after {0:?}")]
    Timeout(Duration),
    #[error("Merge interrupted")]
    Interrupted,
}

impl MergeError {
    pub fn is_interrupt(&self) -> bool {
        matches!(self, MergeError::Interrupted)
    }
}

/// Copies a deduplicated selection of `corpus` into the empty directory `into`.
pub trait Merger {
    fn merge(&mut self, corpus: &Path, into: &Path) -> Result<(), MergeError>;
}

impl<F> Merger for F
where
    F: FnMut(&Path, &Path) -> Result<(), MergeError>,
{
    fn merge(&mut self, corpus: &Path, into: &Path) -> Result<(), MergeError> {
        self(corpus, into)
    }
}

/// Runs `target --fuzz <into> <corpus> -merge=1`.
#[derive(Debug, Clone)]
pub struct LibFuzzerMerger {
    target: PathBuf,
    executor: CommandExecutor,
}

impl LibFuzzerMerger {
    pub fn new(target: impl Into<PathBuf>, executor: CommandExecutor) -> Self {
        Self {
            target: target.into(),
            executor,
        }
    }
}

impl Merger for LibFuzzerMerger {
    fn merge(&mut self, corpus: &Path, into: &Path) -> Result<(), MergeError> {
        let invocation = Invocation::new(&self.target)
            .arg("--fuzz")
            .arg(into)
            .arg(corpus)
            .arg("-merge=1")
            .profile_file(into.join(MERGE_PROFILE_ARTIFACT));
        let result = self.executor.execute(&invocation);
        match result.status {
            ExecutionStatus::Ok => Ok(()),
            ExecutionStatus::Timeout => Err(MergeError::Timeout(
                self.executor.timeout().unwrap_or_default(),
            )),
            ExecutionStatus::SpawnError(message) => Err(MergeError::Spawn(message)),
            ExecutionStatus::Failed(_) if result.output.interrupted() => {
                Err(MergeError::Interrupted)
            }
            ExecutionStatus::Failed(message) => Err(MergeError::Failed(message)),
        }
    }
}

/// Runs the merge phase: the merged scratch directory replaces the corpus.
///
/// The corpus is left alone if the merge fails, is interrupted, or comes back
/// empty for a non-empty corpus.
pub fn merge_corpus(
    store: &CorpusStore,
    merger: &mut dyn Merger,
    cancel: &CancellationToken,
) -> Result<PhaseReport, ReduceError> {
    let before = store.size()?;
    if cancel.is_cancelled() {
        return Ok(PhaseReport::untouched(
            Phase::Merge,
            PhaseOutcome::Cancelled,
            before,
        ));
    }
    if before.files == 0 {
        log::info!("Phase merge: corpus is empty, nothing to do");
        return Ok(PhaseReport::untouched(
            Phase::Merge,
            PhaseOutcome::Completed,
            before,
        ));
    }
    log::info!("Phase merge: {} files, {} bytes", before.files, before.bytes);

    let scratch = store.scratch()?;
    if let Err(e) = merger.merge(store.path(), scratch.path()) {
        if e.is_interrupt() || cancel.is_cancelled() {
            cancel.cancel();
            log::debug!("Merge interrupted: {e}");
            return Ok(PhaseReport::untouched(
                Phase::Merge,
                PhaseOutcome::Cancelled,
                before,
            ));
        }
        return Err(e.into());
    }
    scratch.discard_artifact(MERGE_PROFILE_ARTIFACT)?;

    if cancel.is_cancelled() {
        log::warn!("Phase merge cancelled; corpus left unchanged");
        return Ok(PhaseReport::untouched(
            Phase::Merge,
            PhaseOutcome::Cancelled,
            before,
        ));
    }
    if scratch.entries()?.is_empty() {
        log::warn!("Merge produced no inputs; keeping the corpus as it was");
        return Ok(PhaseReport::untouched(
            Phase::Merge,
            PhaseOutcome::Completed,
            before,
        ));
    }

    store.replace_with(scratch)?;
    let after = store.size()?;
    log::info!(
        "Phase merge done: {} -> {} files, {} -> {} bytes",
        before.files,
        after.files,
        before.bytes,
        after.bytes
    );
    Ok(PhaseReport::new(
        Phase::Merge,
        PhaseOutcome::Completed,
        before,
        after,
        None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::testing::snapshot;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn corpus_with(files: &[(&str, &[u8])]) -> (TempDir, CorpusStore) {
        let root = tempdir().unwrap();
        let store = CorpusStore::open(root.path().join("corpus")).unwrap();
        for (name, content) in files {
            fs::write(store.path().join(name), content).unwrap();
        }
        (root, store)
    }

    /// Keeps one file per distinct content, plus the profile the target leaves behind.
    fn dedup_merger(corpus: &Path, into: &Path) -> Result<(), MergeError> {
        let mut seen = Vec::new();
        for (name, content) in snapshot(corpus) {
            if !seen.contains(&content) {
                fs::write(into.join(&name), &content).unwrap();
                seen.push(content);
            }
        }
        fs::write(into.join(MERGE_PROFILE_ARTIFACT), b"profile").unwrap();
        Ok(())
    }

    #[test]
    fn merged_directory_replaces_corpus_without_profile_artifact() {
        let (root, store) = corpus_with(&[("a", b"same"), ("b", b"same"), ("c", b"other")]);

        let report = merge_corpus(&store, &mut dedup_merger, &CancellationToken::new()).unwrap();

        let result = snapshot(store.path());
        assert_eq!(result.keys().collect::<Vec<_>>(), ["a", "c"]);
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.target, None);
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 1);
    }

    #[test]
    fn failed_merge_keeps_corpus() {
        let (_root, store) = corpus_with(&[("a", b"1"), ("b", b"2")]);
        let before = snapshot(store.path());
        let mut merger = |_: &Path, _: &Path| -> Result<(), MergeError> {
            Err(MergeError::Failed("boom".into()))
        };

        let err = merge_corpus(&store, &mut merger, &CancellationToken::new()).unwrap_err();

        assert!(matches!(err, ReduceError::Merge(MergeError::Failed(_))));
        assert_eq!(snapshot(store.path()), before);
    }

    #[test]
    fn interrupted_merge_is_a_cancellation() {
        let (_root, store) = corpus_with(&[("a", b"1")]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut merger = move |_: &Path, into: &Path| -> Result<(), MergeError> {
            fs::write(into.join("partial"), b"1").unwrap();
            trigger.cancel();
            Err(MergeError::Failed("Terminated by signal 2".into()))
        };

        let report = merge_corpus(&store, &mut merger, &cancel).unwrap();

        assert!(report.is_cancelled());
        assert_eq!(snapshot(store.path()).keys().collect::<Vec<_>>(), ["a"]);
    }

    #[test]
    fn merger_killed_by_sigint_cancels_before_the_handler_runs() {
        let (_root, store) = corpus_with(&[("a", b"1")]);
        let cancel = CancellationToken::new();
        let mut merger = |_: &Path, into: &Path| -> Result<(), MergeError> {
            fs::write(into.join("partial"), b"1").unwrap();
            Err(MergeError::Interrupted)
        };

        let report = merge_corpus(&store, &mut merger, &cancel).unwrap();

        assert!(report.is_cancelled());
        assert!(cancel.is_cancelled(), "later phases must see the interrupt");
        assert_eq!(snapshot(store.path()).keys().collect::<Vec<_>>(), ["a"]);
    }

    #[test]
    fn empty_merge_result_is_not_swapped_in() {
        let (_root, store) = corpus_with(&[("a", b"1")]);
        let mut merger = |_: &Path, into: &Path| -> Result<(), MergeError> {
            fs::write(into.join(MERGE_PROFILE_ARTIFACT), b"p").unwrap();
            Ok(())
        };
        let report = merge_corpus(&store, &mut merger, &CancellationToken::new()).unwrap();
        assert_eq!(report.files_removed, 0);
        assert_eq!(snapshot(store.path()).len(), 1);
    }

    #[test]
    fn empty_corpus_skips_merger() {
        let (_root, store) = corpus_with(&[]);
        let mut merger = |_: &Path, _: &Path| -> Result<(), MergeError> {
            panic!("merger must not run on an empty corpus")
        };
        let report = merge_corpus(&store, &mut merger, &CancellationToken::new()).unwrap();
        assert_eq!(report.outcome, PhaseOutcome::Completed);
    }

    #[cfg(unix)]
    #[test]
    fn libfuzzer_merger_passes_merge_arguments() {
        use crate::executor::test_scripts::write_script;

        let bin = tempdir().unwrap();
        let target = write_script(
            bin.path(),
            "target",
            r#"[ "$1" = --fuzz ] && [ "$4" = -merge=1 ] || exit 9
cp "$3"/* "$2"/
echo raw > "$LLVM_PROFILE_FILE""#,
        );
        let (_root, store) = corpus_with(&[("a", b"1"), ("b", b"2")]);
        let mut merger = LibFuzzerMerger::new(target, CommandExecutor::default());

        let report = merge_corpus(&store, &mut merger, &CancellationToken::new()).unwrap();

        assert_eq!(report.outcome, PhaseOutcome::Completed);
        assert_eq!(
            snapshot(store.path()).keys().collect::<Vec<_>>(),
            ["a", "b"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn libfuzzer_merger_reports_sigint_as_interrupt() {
        use crate::executor::test_scripts::write_script;

        let bin = tempdir().unwrap();
        let target = write_script(bin.path(), "target", "kill -INT $$\nsleep 5");
        let into = tempdir().unwrap();
        let mut merger = LibFuzzerMerger::new(target, CommandExecutor::default());

        let err = merger.merge(bin.path(), into.path()).unwrap_err();
        assert!(err.is_interrupt(), "{err}");
    }
}
