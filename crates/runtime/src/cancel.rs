use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared "stop producing" signal between a request owner and a running job.
///
/// Cancelling is one-way; clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
