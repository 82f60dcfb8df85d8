//! Master broker migration block.
//!
//! Config change events and master migration exclude each other:
//!
//! - a config operation registers itself with
//!   [`set_config_op_in_progress_if_not_blocked`](MigrationBlock::set_config_op_in_progress_if_not_blocked)
//!   and is refused while a migration holds the block;
//! - a migration takes the block with [`block_wait`](MigrationBlock::block_wait),
//!   which waits for in-flight config operations to drain.
//!
//! Both return RAII guards so the block and the in-progress count are
//! released on every exit path, including errors and task cancellation.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::info;

use super::error::{ClusterError, ClusterResult};

#[derive(Debug, Default)]
struct BlockState {
    blocked: bool,
    in_progress: u32,
}

/// Mutual exclusion between master migration and config operations.
#[derive(Debug, Default)]
pub struct MigrationBlock {
    state: Mutex<BlockState>,
    notify: Notify,
}

impl MigrationBlock {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BlockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_blocked(&self) -> bool {
        self.lock().blocked
    }

    pub fn in_progress_count(&self) -> u32 {
        self.lock().in_progress
    }

    /// Register a config operation. Fails with
    /// [`ClusterError::MigrationInProgress`] while blocked.
    pub fn set_config_op_in_progress_if_not_blocked(&self) -> ClusterResult<ConfigOpGuard<'_>> {
        let mut state = self.lock();
        if state.blocked {
            return Err(ClusterError::MigrationInProgress);
        }
        state.in_progress += 1;
        Ok(ConfigOpGuard { block: self })
    }

    /// Take the block and wait for in-flight config operations to finish.
    ///
    /// Fails if the block is already held or operations are still running
    /// at the deadline; in both cases the block is left as it was.
    pub async fn block_wait(
        &self,
        timeout: Duration,
        max_interval: Duration,
    ) -> ClusterResult<BlockGuard<'_>> {
        {
            let mut state = self.lock();
            if state.blocked {
                return Err(ClusterError::MigrationInProgress);
            }
            state.blocked = true;
        }
        let guard = BlockGuard { block: self };

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            let in_progress = self.in_progress_count();
            if in_progress == 0 {
                return Ok(guard);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ClusterError::Precondition(format!(
                    "timed out waiting for {} config operations to complete",
                    in_progress
                )));
            }
            info!(in_progress, "Waiting for config operations to complete");
            let _ = tokio::time::timeout((deadline - now).min(max_interval), notified).await;
        }
    }

    fn done_config_op(&self) {
        let mut state = self.lock();
        state.in_progress = state.in_progress.saturating_sub(1);
        let drained = state.in_progress == 0;
        drop(state);
        if drained {
            self.notify.notify_waiters();
        }
    }

    fn unblock(&self) {
        self.lock().blocked = false;
        self.notify.notify_waiters();
    }
}

/// Held by a running config operation.
#[derive(Debug)]
pub struct ConfigOpGuard<'a> {
    block: &'a MigrationBlock,
}

impl Drop for ConfigOpGuard<'_> {
    fn drop(&mut self) {
        self.block.done_config_op();
    }
}

/// Held by a running master migration.
#[derive(Debug)]
pub struct BlockGuard<'a> {
    block: &'a MigrationBlock,
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        self.block.unblock();
    }
}
