//! Greedy forward selection: rebuild the corpus from its smallest files upward,
//! keeping a file only if it strictly improves coverage.

use crate::cancel::CancellationToken;
use crate::corpus::CorpusStore;
use crate::oracle::Oracle;
use crate::phase::{Entry, Phase, PhaseOutcome, PhaseReport, ReduceError, measure_or_cancel};

/// Runs the additive selection phase over `store`.
///
/// Files are tried in ascending size order against a scratch corpus that
/// starts empty. The scratch corpus replaces the real one only as the very last
/// step, so an interrupt at any point before that leaves the corpus untouched.
/// Rejected files are never reconsidered. The search stops early only when the
/// subset matches the target exactly; a subset that measures above it keeps
/// collecting strict improvements.
pub fn reduce_additive(
    store: &CorpusStore,
    oracle: &mut dyn Oracle,
    cancel: &CancellationToken,
) -> Result<PhaseReport, ReduceError> {
    let mut session = match crate::phase::enter(Phase::Additive, store, oracle, cancel)? {
        Entry::Proceed(session) => session,
        Entry::Skip(report) => return Ok(report),
    };

    let scratch = store.scratch()?;
    let files = store.entries_by_size()?;
    let total = files.len();

    for (index, entry) in files.iter().enumerate() {
        if cancel.is_cancelled() {
            return session.finish(store, PhaseOutcome::Cancelled);
        }

        store.copy_to_scratch(&entry.name, &scratch)?;
        let Some(coverage) = measure_or_cancel(oracle, scratch.path(), cancel)? else {
            return session.finish(store, PhaseOutcome::Cancelled);
        };

        if coverage > session.best {
            log::debug!(
                "[{}/{}] keep {:?} ({} bytes): {}",
                index + 1,
                total,
                entry.name,
                entry.size,
                coverage
            );
            session.best = coverage;
            session.kept += 1;
        } else {
            log::debug!(
                "[{}/{}] drop {:?} ({} bytes): no improvement",
                index + 1,
                total,
                entry.name,
                entry.size
            );
            scratch.remove(&entry.name)?;
            session.rejected += 1;
        }

        if session.best == session.target {
            let skipped = total - index - 1;
            if skipped > 0 {
                log::debug!("Target reached, skipping the remaining {skipped} files");
            }
            session.rejected += skipped;
            break;
        }
    }

    if session.best != session.target {
        log::warn!(
            "Additive phase ended at {} instead of {}; keeping the best subset found",
            session.best,
            session.target
        );
    }

    store.replace_with(scratch)?;
    session.finish(store, PhaseOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::CorpusStore;
    use crate::coverage::CoverageVector;
    use crate::oracle::{InProcessOracle, OracleError};
    use crate::phase::testing::{content_oracle, snapshot};
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;
    use std::rc::Rc;
    use tempfile::{TempDir, tempdir};

    fn corpus_with(files: &[(&str, &[u8])]) -> (TempDir, CorpusStore) {
        let root = tempdir().unwrap();
        let store = CorpusStore::open(root.path().join("corpus")).unwrap();
        for (name, content) in files {
            fs::write(store.path().join(name), content).unwrap();
        }
        (root, store)
    }

    #[test]
    fn keeps_the_small_file_that_alone_reaches_full_coverage() {
        let (_root, store) = corpus_with(&[("a", &[b'a'; 10]), ("b", b"bbb")]);
        let mut oracle = content_oracle(|files| {
            if files.contains_key("b") {
                CoverageVector::new(5, 2)
            } else if files.is_empty() {
                CoverageVector::ZERO
            } else {
                CoverageVector::new(2, 1)
            }
        });

        let report = reduce_additive(&store, &mut oracle, &CancellationToken::new()).unwrap();

        let result = snapshot(store.path());
        assert_eq!(result.keys().collect::<Vec<_>>(), ["b"]);
        assert_eq!(result["b"], b"bbb");
        assert_eq!(report.outcome, PhaseOutcome::Completed);
        assert_eq!(report.target, Some(CoverageVector::new(5, 2)));
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.bytes_saved, 10);
    }

    #[test]
    fn stops_measuring_once_target_is_reached() {
        let (_root, store) = corpus_with(&[
            ("one", b"1"),
            ("two", b"22"),
            ("three", b"333"),
            ("four", b"4444"),
        ]);
        let seen: Rc<RefCell<Vec<usize>>> = Rc::default();
        let log = Rc::clone(&seen);
        // Each file covers one line; "two" alone covers everything the others do.
        let mut oracle = content_oracle(move |files| {
            log.borrow_mut().push(files.len());
            if files.contains_key("two") {
                CoverageVector::new(4, 0)
            } else {
                CoverageVector::new(files.len() as u64, 0)
            }
        });

        reduce_additive(&store, &mut oracle, &CancellationToken::new()).unwrap();

        // Full-corpus target, then "one", then "one"+"two" reaches the target.
        assert_eq!(*seen.borrow(), [4, 1, 2]);
        let result = snapshot(store.path());
        assert_eq!(result.keys().collect::<Vec<_>>(), ["one", "two"]);
    }

    #[test]
    fn branch_only_gain_counts_as_improvement() {
        let (_root, store) = corpus_with(&[("a", b"a"), ("bb", b"bb")]);
        let mut oracle = content_oracle(|files| {
            let lines = if files.is_empty() { 0 } else { 3 };
            let branches = if files.contains_key("bb") { 2 } else { 1 };
            CoverageVector::new(lines, branches)
        });

        reduce_additive(&store, &mut oracle, &CancellationToken::new()).unwrap();
        assert_eq!(snapshot(store.path()).len(), 2);
    }

    #[test]
    fn unreachable_target_still_swaps_in_best_subset() {
        let (_root, store) = corpus_with(&[("a", b"a"), ("bb", b"bb")]);
        // Flaky oracle: the first (whole-corpus) measurement is higher than
        // anything reported afterwards.
        let mut calls = 0;
        let mut oracle = InProcessOracle::new(move |dir: &Path| {
            calls += 1;
            Ok(if calls == 1 {
                CoverageVector::new(10, 0)
            } else if snapshot(dir).is_empty() {
                CoverageVector::ZERO
            } else {
                CoverageVector::new(3, 0)
            })
        });

        let report = reduce_additive(&store, &mut oracle, &CancellationToken::new()).unwrap();
        assert_eq!(report.outcome, PhaseOutcome::Completed);
        let result = snapshot(store.path());
        assert_eq!(result.keys().collect::<Vec<_>>(), ["a"]);
    }

    #[test]
    fn overshooting_the_target_does_not_stop_the_search() {
        let (_root, store) = corpus_with(&[("a", b"a"), ("bb", b"bb"), ("ccc", b"ccc")]);
        // Non-monotone oracle: subsets measure above the whole corpus.
        let mut oracle = content_oracle(|files| {
            let names: Vec<&str> = files.keys().map(String::as_str).collect();
            match names.as_slice() {
                ["a", "bb", "ccc"] => CoverageVector::new(5, 2),
                ["a"] | ["a", "bb"] => CoverageVector::new(6, 0),
                ["a", "ccc"] => CoverageVector::new(7, 0),
                _ => CoverageVector::ZERO,
            }
        });

        let report = reduce_additive(&store, &mut oracle, &CancellationToken::new()).unwrap();

        assert_eq!(report.outcome, PhaseOutcome::Completed);
        let result = snapshot(store.path());
        assert_eq!(result.keys().collect::<Vec<_>>(), ["a", "ccc"]);
    }

    #[test]
    fn cancellation_leaves_original_corpus_untouched() {
        let (root, store) = corpus_with(&[("a", b"a"), ("bb", b"bb"), ("ccc", b"ccc")]);
        let before = snapshot(store.path());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut calls = 0;
        let mut oracle = InProcessOracle::new(move |dir: &Path| {
            calls += 1;
            if calls == 2 {
                trigger.cancel();
            }
            Ok(CoverageVector::new(snapshot(dir).len() as u64, 0))
        });

        let report = reduce_additive(&store, &mut oracle, &cancel).unwrap();

        assert_eq!(report.outcome, PhaseOutcome::Cancelled);
        assert_eq!(snapshot(store.path()), before);
        assert_eq!(
            fs::read_dir(root.path()).unwrap().count(),
            1,
            "scratch must be discarded"
        );
    }

    #[test]
    fn oracle_failure_aborts_without_touching_corpus() {
        let (_root, store) = corpus_with(&[("a", b"a"), ("bb", b"bb")]);
        let before = snapshot(store.path());
        let mut calls = 0;
        let mut oracle = InProcessOracle::new(move |_: &Path| {
            calls += 1;
            if calls > 1 {
                Err(OracleError::MissingTotals)
            } else {
                Ok(CoverageVector::new(2, 0))
            }
        });

        let err = reduce_additive(&store, &mut oracle, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, ReduceError::Oracle(OracleError::MissingTotals)));
        assert_eq!(snapshot(store.path()), before);
    }

    #[test]
    fn empty_corpus_is_a_no_op() {
        let (_root, store) = corpus_with(&[]);
        let mut oracle = InProcessOracle::new(|_: &Path| -> Result<CoverageVector, OracleError> {
            panic!("empty corpus must not be measured")
        });
        let report = reduce_additive(&store, &mut oracle, &CancellationToken::new()).unwrap();
        assert_eq!(report.outcome, PhaseOutcome::Completed);
        assert_eq!(report.files_removed, 0);
    }
}
