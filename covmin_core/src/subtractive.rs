//! Greedy backward pass: drop every file whose absence keeps full coverage.

use crate::cancel::CancellationToken;
use crate::corpus::CorpusStore;
use crate::oracle::Oracle;
use crate::phase::{Entry, Phase, PhaseOutcome, PhaseReport, ReduceError, measure_or_cancel};

/// Runs the subtractive pruning phase over `store`.
///
/// Each file, in directory listing order, is moved aside and the remaining
/// corpus measured. The file is restored if coverage drops below the target
/// captured at entry, otherwise it stays deleted. One pass only; earlier
/// decisions are not revisited after later removals.
pub fn reduce_subtractive(
    store: &CorpusStore,
    oracle: &mut dyn Oracle,
    cancel: &CancellationToken,
) -> Result<PhaseReport, ReduceError> {
    let mut session = match crate::phase::enter(Phase::Subtractive, store, oracle, cancel)? {
        Entry::Proceed(session) => session,
        Entry::Skip(report) => return Ok(report),
    };

    let scratch = store.scratch()?;
    let files = store.entries()?;
    let total = files.len();

    for (index, entry) in files.iter().enumerate() {
        if cancel.is_cancelled() {
            return session.finish(store, PhaseOutcome::Cancelled);
        }

        let staged = store.stage(&entry.name, &scratch)?;
        let coverage = match measure_or_cancel(oracle, store.path(), cancel) {
            Ok(Some(coverage)) => coverage,
            Ok(None) => {
                staged.rollback()?;
                return session.finish(store, PhaseOutcome::Cancelled);
            }
            Err(e) => {
                staged.rollback()?;
                return Err(e);
            }
        };

        if coverage < session.target {
            log::debug!(
                "[{}/{}] {:?} is needed ({} without it)",
                index + 1,
                total,
                entry.name,
                coverage
            );
            staged.rollback()?;
            session.kept += 1;
        } else {
            log::debug!("[{}/{}] {:?} is redundant", index + 1, total, entry.name);
            staged.commit()?;
            session.rejected += 1;
        }
    }

    session.finish(store, PhaseOutcome::Completed)
}
