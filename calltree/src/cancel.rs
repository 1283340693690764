//! Cooperative cancellation of long-running tree operations

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Shared flag which asks long-running operations to stop early
///
/// Call tree builds and drill-into passes check this flag between samples, so
/// a cancelled operation never leaves a sample half-applied.
///
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);
//
impl CancellationToken {
    /// Make a token which is not cancelled yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every operation watching this token (or a clone) to stop
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Truth that cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
