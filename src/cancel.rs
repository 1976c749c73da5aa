use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ContentModelError, Result};

/// Cooperative cancellation flag shared between a requester and the parse it
/// started. Readers check it between top-level declarations.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns `Err(Cancelled)` once [`cancel`](Self::cancel) has been called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ContentModelError::Cancelled)
        } else {
            Ok(())
        }
    }
}
