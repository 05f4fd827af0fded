//! Global operation lock: at most one of backup/restore/setup runs
//! system-wide at any instant. Concurrent attempts fail fast with a
//! conflict error naming the operation in progress; there is no queueing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::backup::{BackupError, Result};

#[derive(Debug, Default)]
struct LockState {
    in_progress: bool,
    operation: String,
    started_at: Option<DateTime<Local>>,
    last_error: Option<String>,
}

/// Point-in-time view of the lock for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct LockSnapshot {
    pub in_progress: bool,
    pub operation: Option<String>,
    pub started_at: Option<DateTime<Local>>,
    pub last_error: Option<String>,
}

/// Shared mutual-exclusion state for destructive operations.
#[derive(Debug, Clone, Default)]
pub struct OperationLock {
    state: Arc<Mutex<LockState>>,
}

impl OperationLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the lock for `operation`, or fail with
    /// [`BackupError::OperationInProgress`] naming the holder. Acquiring
    /// clears the previous `last_error`.
    pub fn try_acquire(&self, operation: &str) -> Result<LockGuard> {
        let mut state = self.state();
        if state.in_progress {
            return Err(BackupError::OperationInProgress {
                operation: state.operation.clone(),
            });
        }
        state.in_progress = true;
        state.operation = operation.to_string();
        state.started_at = Some(Local::now());
        state.last_error = None;

        Ok(LockGuard {
            state: Arc::clone(&self.state),
        })
    }

    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.state();
        LockSnapshot {
            in_progress: state.in_progress,
            operation: state.in_progress.then(|| state.operation.clone()),
            started_at: state.started_at,
            last_error: state.last_error.clone(),
        }
    }
}

/// Holds the lock for the duration of one operation. Dropping releases the
/// lock on every exit path; a recorded error stays visible on the snapshot
/// until the next acquire.
pub struct LockGuard {
    state: Arc<Mutex<LockState>>,
}

impl LockGuard {
    pub fn record_error(&self, message: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_error = Some(message.to_string());
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_progress = false;
        state.started_at = None;
    }
}
