// ABOUTME: Caller-facing configuration of a single import run
// ABOUTME: Deserializable from TOML with defaults for every field

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::models::Phase;
use super::transform::ConflictMode;
use crate::error::{ImporterError, Result};

pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Statement timeout handed to the proxy for every batch.
pub const PROXY_TIMEOUT_MS: u64 = 60_000;
/// Client-side limit on one proxy call: the statement timeout plus a grace period.
pub const PROXY_CALL_LIMIT: Duration = Duration::from_millis(PROXY_TIMEOUT_MS + 5_000);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionOrder {
    #[default]
    SchemaFirst,
    DataFirst,
    FileOrder,
}

impl ExecutionOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOrder::SchemaFirst => "schema-first",
            ExecutionOrder::DataFirst => "data-first",
            ExecutionOrder::FileOrder => "file-order",
        }
    }
}

impl fmt::Display for ExecutionOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionOrder {
    type Err = ImporterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "schema-first" => Ok(ExecutionOrder::SchemaFirst),
            "data-first" => Ok(ExecutionOrder::DataFirst),
            "file-order" => Ok(ExecutionOrder::FileOrder),
            other => Err(ImporterError::InvalidOptions(format!(
                "unknown execution order '{}', expected schema-first, data-first or file-order",
                other
            ))),
        }
    }
}

/// Where a previous run stopped: skip every phase before `phase` and the first
/// `batch_index` batches of `phase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub phase: Phase,
    pub batch_index: usize,
}

/// The options that decide which statement lands in which batch. A resume point is
/// only meaningful under the layout it was recorded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanLayout {
    pub batch_size: usize,
    pub execution_order: ExecutionOrder,
    pub skip_copy_from_stdin: bool,
    pub skip_ownership_statements: bool,
}

impl PlanLayout {
    pub fn of(options: &ImportOptions) -> Self {
        Self {
            batch_size: options.batch_size,
            execution_order: options.execution_order,
            skip_copy_from_stdin: options.skip_copy_from_stdin,
            skip_ownership_statements: options.skip_ownership_statements,
        }
    }

    pub fn apply_to(&self, options: &mut ImportOptions) {
        options.batch_size = self.batch_size;
        options.execution_order = self.execution_order;
        options.skip_copy_from_stdin = self.skip_copy_from_stdin;
        options.skip_ownership_statements = self.skip_ownership_statements;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    pub batch_size: usize,
    pub execution_order: ExecutionOrder,
    pub stop_on_first_error: bool,
    pub use_transactions: bool,
    /// Extra attempts for a batch whose proxy call itself failed.
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Drop `COPY ... FROM STDIN` blocks from the data phase; the proxy cannot stream them.
    pub skip_copy_from_stdin: bool,
    /// Drop `OWNER TO`, `GRANT`/`REVOKE`, table comments and RLS toggles from every phase.
    pub skip_ownership_statements: bool,
    pub on_conflict: ConflictMode,
    /// Wrap each data batch in `SET CONSTRAINTS ALL DEFERRED` and replica session role.
    pub defer_constraints_during_data: bool,
    pub enable_checkpoint: bool,
    pub resume_from: Option<ResumePoint>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            execution_order: ExecutionOrder::default(),
            stop_on_first_error: true,
            use_transactions: true,
            retry_attempts: 0,
            retry_backoff_ms: 500,
            skip_copy_from_stdin: true,
            skip_ownership_statements: false,
            on_conflict: ConflictMode::Error,
            defer_constraints_during_data: false,
            enable_checkpoint: false,
            resume_from: None,
        }
    }
}

impl ImportOptions {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ImporterError::InvalidOptions(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
