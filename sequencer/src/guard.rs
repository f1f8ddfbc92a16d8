//! RAII guard for the single-flight running flag

use std::sync::atomic::{AtomicBool, Ordering};

use crate::{ExecutionError, ExecutionResult};

/// Holds the running flag of an execution; clears it on drop so every exit
/// path of `perform` releases it.
pub(crate) struct RunningGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunningGuard<'a> {
    /// Fails with `Recursive` when the flag is already set
    pub(crate) fn acquire(flag: &'a AtomicBool) -> ExecutionResult<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ExecutionError::Recursive)?;
        Ok(Self { flag })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
