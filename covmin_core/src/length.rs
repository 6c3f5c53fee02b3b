//! Per-file prefix truncation that preserves whole-corpus coverage.

use crate::cancel::CancellationToken;
use crate::corpus::CorpusStore;
use crate::oracle::Oracle;
use crate::phase::{Entry, Phase, PhaseOutcome, PhaseReport, ReduceError, measure_or_cancel};

/// Runs the length reduction phase over `store`.
///
/// Every file is shortened one byte at a time, re-measuring the whole corpus
/// after each cut, until the next cut would lose coverage or the file is down
/// to a single byte. Coverage is not assumed to be monotone in prefix length.
///
/// Between measurements the file on disk always holds a prefix that is known
/// to keep the target, which is the state an interrupt leaves behind.
pub fn reduce_length(
    store: &CorpusStore,
    oracle: &mut dyn Oracle,
    cancel: &CancellationToken,
) -> Result<PhaseReport, ReduceError> {
    let mut session = match crate::phase::enter(Phase::Length, store, oracle, cancel)? {
        Entry::Proceed(session) => session,
        Entry::Skip(report) => return Ok(report),
    };

    let files = store.entries()?;
    let total = files.len();

    for (index, entry) in files.iter().enumerate() {
        let content = store.read(&entry.name)?;
        let mut len = content.len();

        while len > 1 {
            if cancel.is_cancelled() {
                return session.finish(store, PhaseOutcome::Cancelled);
            }

            let shorter = len - 1;
            store.rewrite(&entry.name, &content[..shorter])?;
            let coverage = match measure_or_cancel(oracle, store.path(), cancel) {
                Ok(Some(coverage)) => coverage,
                Ok(None) => {
                    store.rewrite(&entry.name, &content[..len])?;
                    return session.finish(store, PhaseOutcome::Cancelled);
                }
                Err(e) => {
                    store.rewrite(&entry.name, &content[..len])?;
                    return Err(e);
                }
            };

            if coverage < session.target {
                store.rewrite(&entry.name, &content[..len])?;
                break;
            }
            len = shorter;
        }

        if len < content.len() {
            log::debug!(
                "[{}/{}] {:?}: {} -> {} bytes",
                index + 1,
                total,
                entry.name,
                content.len(),
                len
            );
            session.rejected += 1;
        } else {
            session.kept += 1;
        }
    }

    session.finish(store, PhaseOutcome::Completed)
}
