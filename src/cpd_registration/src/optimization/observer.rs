//! Per-iteration observation and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::types::OptimizationState;

/// Receives the optimization state once per completed iteration.
pub trait IterationObserver {
    fn on_iteration(&mut self, state: &OptimizationState);
}

impl<F> IterationObserver for F
where
    F: FnMut(&OptimizationState),
{
    fn on_iteration(&mut self, state: &OptimizationState) {
        self(state)
    }
}

/// Observer that ignores every iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl IterationObserver for NoopObserver {
    fn on_iteration(&mut self, _state: &OptimizationState) {}
}

/// Shared cancellation flag, polled once per outer iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
