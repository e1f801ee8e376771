//! Cooperative cancellation shared by every worker of a run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set once by the operator interrupt handler; checked before each new request.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
