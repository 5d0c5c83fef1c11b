// ABOUTME: Pause/cancel control block shared between the controller and the batch executor
// ABOUTME: Flags are only observed at batch boundaries, never mid-batch

use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{ImporterError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlState {
    pub paused: bool,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct ControlBlock {
    tx: Arc<watch::Sender<ControlState>>,
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlBlock {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ControlState {
        *self.tx.borrow()
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().cancelled
    }

    pub fn pause(&self) {
        self.tx.send_modify(|s| s.paused = true);
    }

    pub fn resume(&self) {
        self.tx.send_modify(|s| s.paused = false);
    }

    /// Also lifts a pause so a suspended run can unwind.
    pub fn cancel(&self) {
        self.tx.send_modify(|s| {
            s.cancelled = true;
            s.paused = false;
        });
    }

    pub fn clear(&self) {
        self.tx.send_replace(ControlState::default());
    }

    /// Batch boundary. Fails with `Cancelled` if a cancel is pending, otherwise
    /// blocks while paused until resumed or cancelled. Returns whether it had to wait.
    pub async fn boundary(&self) -> Result<bool> {
        let mut rx = self.tx.subscribe();
        let current = *rx.borrow_and_update();
        if current.cancelled {
            return Err(ImporterError::Cancelled);
        }
        if !current.paused {
            return Ok(false);
        }

        let state = *rx
            .wait_for(|s| s.cancelled || !s.paused)
            .await
            .map_err(|_| ImporterError::Cancelled)?;
        if state.cancelled {
            return Err(ImporterError::Cancelled);
        }
        Ok(true)
    }
}
