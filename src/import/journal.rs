// ABOUTME: Shared mutable state of the active import run
// ABOUTME: Every appended log entry is mirrored to tracing at the matching level

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

use super::checkpoint::Checkpoint;
use super::models::{
    now_millis, FailedBatch, ImportError, ImportLog, ImportProgress, ImportStatus, ImportSummary,
    LogLevel,
};

#[derive(Debug)]
pub(crate) struct ImportState {
    pub status: ImportStatus,
    pub progress: Option<ImportProgress>,
    pub errors: Vec<ImportError>,
    pub logs: Vec<ImportLog>,
    pub summary: Option<ImportSummary>,
    pub failed_batches: Vec<FailedBatch>,
    pub checkpoint: Option<Checkpoint>,
}

impl Default for ImportState {
    fn default() -> Self {
        Self {
            status: ImportStatus::Idle,
            progress: None,
            errors: Vec::new(),
            logs: Vec::new(),
            summary: None,
            failed_batches: Vec::new(),
            checkpoint: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Journal {
    state: Arc<Mutex<ImportState>>,
}

impl Journal {
    pub fn lock(&self) -> MutexGuard<'_, ImportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> ImportStatus {
        self.lock().status
    }

    pub fn set_status(&self, status: ImportStatus) {
        self.lock().status = status;
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>, details: Option<String>) {
        let message = message.into();
        match (level, details.as_deref()) {
            (LogLevel::Info | LogLevel::Success, Some(d)) => info!(details = d, "{}", message),
            (LogLevel::Info | LogLevel::Success, None) => info!("{}", message),
            (LogLevel::Warn, Some(d)) => warn!(details = d, "{}", message),
            (LogLevel::Warn, None) => warn!("{}", message),
            (LogLevel::Error, Some(d)) => error!(details = d, "{}", message),
            (LogLevel::Error, None) => error!("{}", message),
        }
        self.lock().logs.push(ImportLog {
            timestamp: now_millis(),
            level,
            message,
            details,
        });
    }

    pub fn info(&self, message: impl Into<String>, details: Option<String>) {
        self.log(LogLevel::Info, message, details);
    }

    pub fn warn(&self, message: impl Into<String>, details: Option<String>) {
        self.log(LogLevel::Warn, message, details);
    }

    pub fn error(&self, message: impl Into<String>, details: Option<String>) {
        self.log(LogLevel::Error, message, details);
    }

    pub fn success(&self, message: impl Into<String>, details: Option<String>) {
        self.log(LogLevel::Success, message, details);
    }

    pub fn update_progress(&self, update: impl FnOnce(&mut ImportProgress)) {
        if let Some(progress) = self.lock().progress.as_mut() {
            update(progress);
        }
    }
}
