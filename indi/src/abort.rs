use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{IndiError, IndiResult};

/// Cooperative cancellation flag shared between a running sequence and the
/// caller that wants it stopped. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct AbortToken {
    requested: Arc<AtomicBool>,
}

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Re-arm for the next run
    pub fn reset(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    /// Err(Aborted) once the flag is set
    pub fn check(&self) -> IndiResult<()> {
        if self.is_aborted() {
            Err(IndiError::Aborted)
        } else {
            Ok(())
        }
    }
}
