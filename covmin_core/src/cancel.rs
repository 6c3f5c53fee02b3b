use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared flag raised by an external interrupt and polled by the reduction phases.
///
/// Phases only look at it between file-system mutations, so raising it never
/// interrupts a copy, move, delete or rewrite halfway.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clears the flag so the token can be reused for the next menu action.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
