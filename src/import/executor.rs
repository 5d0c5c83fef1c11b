// ABOUTME: Executes one phase of statements through the remote SQL proxy in fixed-size batches
// ABOUTME: Tracks counts, classifies failures and keeps live progress current after every batch

use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

use super::checkpoint::Checkpoint;
use super::classify::{classify, is_aborted_transaction, is_foreign_key_violation, ErrorSeverity};
use super::control::ControlBlock;
use super::journal::Journal;
use super::models::{now_millis, FailedBatch, ImportError, Phase, PhaseCounts};
use super::options::{ImportOptions, PlanLayout, PROXY_CALL_LIMIT, PROXY_TIMEOUT_MS};
use super::transform::{unwrap_deferred, wrap_deferred};
use crate::error::{ImporterError, Result};
use crate::remote::{
    ConnectionDescriptor, ExecuteDetails, ExecuteOptions, ExecuteRequest, SqlProxy,
    StatementFailure,
};

/// Root-cause errors logged individually per batch.
const LOGGED_ERRORS_PER_BATCH: usize = 3;
const SAMPLE_STATEMENT_CHARS: usize = 500;

/// Identity and clock of the run the executor reports into.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub dump_fingerprint: String,
    pub started: Instant,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseResult {
    pub executed: usize,
    pub failed: usize,
    pub errors: Vec<ImportError>,
}

pub struct BatchExecutor<'a> {
    proxy: &'a dyn SqlProxy,
    control: &'a ControlBlock,
    journal: &'a Journal,
    run: &'a RunContext,
}

impl<'a> BatchExecutor<'a> {
    pub(crate) fn new(
        proxy: &'a dyn SqlProxy,
        control: &'a ControlBlock,
        journal: &'a Journal,
        run: &'a RunContext,
    ) -> Self {
        Self {
            proxy,
            control,
            journal,
            run,
        }
    }

    /// Runs `statements` batch by batch. `first_batch` is non-zero when the phase
    /// resumes part way; indexes and batch numbers stay relative to the full phase.
    pub async fn execute(
        &self,
        statements: &[String],
        connection: &ConnectionDescriptor,
        options: &ImportOptions,
        phase: Phase,
        first_batch: usize,
        phase_stats: &mut PhaseCounts,
    ) -> Result<PhaseResult> {
        let batch_size = options.batch_size.max(1);
        let phase_batches = first_batch + statements.len().div_ceil(batch_size);
        let mut result = PhaseResult::default();

        for (offset, batch) in statements.chunks(batch_size).enumerate() {
            if self.control.boundary().await? {
                debug!("Continuing {} after pause at batch {}", phase, first_batch + offset + 1);
            }

            let batch_index = first_batch + offset;
            let base_index = batch_index * batch_size;
            let label = format!("{}/{}", batch_index + 1, phase_batches);

            let details = match self.submit(batch, connection, options, phase, batch_index).await {
                Ok(details) => details,
                Err(message) => {
                    let details = match batch.first() {
                        Some(sample) => format!(
                            "Error: {}; Sample statement: {}",
                            message,
                            truncate(sample, SAMPLE_STATEMENT_CHARS)
                        ),
                        None => message.clone(),
                    };
                    self.journal
                        .error(format!("Batch {} failed ({})", label, phase), Some(details));

                    if options.stop_on_first_error {
                        return Err(ImporterError::Proxy(message));
                    }

                    result.failed += batch.len();
                    phase_stats.failed += batch.len();
                    self.record_failed_batch(phase, batch_index, batch, batch.len(), options);
                    self.advance(batch, 0, batch.len(), phase, batch_index, phase_batches, options, true);
                    continue;
                }
            };

            let executed = details.executed.min(batch.len());
            let failed = details.failed.min(batch.len() - executed);
            result.executed += executed;
            result.failed += failed;
            phase_stats.executed += executed;
            phase_stats.failed += failed;

            let errors = self.record_errors(&details.errors, batch, base_index, phase, options);
            let fatal = errors
                .iter()
                .find(|e| e.severity == ErrorSeverity::Fatal)
                .cloned();
            result.errors.extend(errors);

            let had_failures = failed > 0 || !details.errors.is_empty();
            if had_failures {
                self.record_failed_batch(phase, batch_index, batch, failed.max(1), options);
            }

            // a batch that ends the run is not checkpointed, so a resume re-executes it
            let aborting = fatal.is_some() || (options.stop_on_first_error && had_failures);
            self.advance(batch, executed, failed, phase, batch_index, phase_batches, options, !aborting);
            self.journal.info(
                format!("Batch {} completed ({})", label, phase),
                Some(format!("{} executed, {} failed", executed, failed)),
            );

            if let Some(fatal) = fatal {
                return Err(ImporterError::Fatal(format!(
                    "{} (statement {} in {})",
                    fatal.error,
                    fatal.index + 1,
                    phase
                )));
            }
            if aborting {
                let first = details
                    .errors
                    .first()
                    .map(|e| e.error.clone())
                    .unwrap_or_else(|| format!("{} statements failed", failed));
                return Err(ImporterError::StopOnError(first));
            }
        }

        Ok(result)
    }

    /// Sends one batch, retrying transport and infrastructure failures. A returned
    /// `Err` means the proxy never reported on the individual statements.
    async fn submit(
        &self,
        batch: &[String],
        connection: &ConnectionDescriptor,
        options: &ImportOptions,
        phase: Phase,
        batch_index: usize,
    ) -> std::result::Result<ExecuteDetails, String> {
        let deferred = is_deferred(phase, options);
        let request = ExecuteRequest {
            connection: connection.clone(),
            statements: if deferred {
                wrap_deferred(batch)
            } else {
                batch.to_vec()
            },
            options: ExecuteOptions {
                stop_on_error: options.stop_on_first_error,
                use_transaction: options.use_transactions,
                timeout_ms: PROXY_TIMEOUT_MS,
            },
        };
        let limit = PROXY_CALL_LIMIT;
        let mut attempt = 0;

        loop {
            let outcome = match timeout(limit, self.proxy.execute(&request)).await {
                Err(_) => Err(format!("Proxy call timed out after {}s", limit.as_secs())),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Ok(Ok(response)) if response.is_infra_failure() => Err(if response.message.is_empty() {
                    "Remote execution failed".to_string()
                } else {
                    response.message
                }),
                Ok(Ok(response)) => Ok(match response.details {
                    Some(details) if deferred => unwrap_deferred(details, batch.len()),
                    Some(details) => details,
                    None => ExecuteDetails {
                        executed: batch.len(),
                        ..Default::default()
                    },
                }),
            };

            match outcome {
                Err(message) if attempt < options.retry_attempts => {
                    self.journal.warn(
                        format!(
                            "Retrying batch {} ({}) due to transient error",
                            batch_index + 1,
                            phase
                        ),
                        Some(message),
                    );
                    sleep(backoff(options.retry_backoff_ms, attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn record_errors(
        &self,
        failures: &[StatementFailure],
        batch: &[String],
        base_index: usize,
        phase: Phase,
        options: &ImportOptions,
    ) -> Vec<ImportError> {
        if failures.is_empty() {
            return Vec::new();
        }

        let timestamp = now_millis();
        let errors: Vec<ImportError> = failures
            .iter()
            .map(|failure| {
                let classification = classify(&failure.error);
                let statement = if failure.statement.is_empty() {
                    batch.get(failure.index).cloned().unwrap_or_default()
                } else {
                    failure.statement.clone()
                };
                ImportError {
                    index: base_index + failure.index,
                    statement,
                    error: failure.error.clone(),
                    timestamp,
                    phase,
                    category: classification.category,
                    severity: classification.severity,
                    code: classification.code.to_string(),
                }
            })
            .collect();

        let (aborted, root): (Vec<&ImportError>, Vec<&ImportError>) =
            errors.iter().partition(|e| is_aborted_transaction(&e.error));

        for err in root.iter().take(LOGGED_ERRORS_PER_BATCH) {
            self.journal.error(
                format!(
                    "Stmt {} [{} {}]: {}",
                    err.index + 1,
                    err.severity.as_str().to_uppercase(),
                    err.code,
                    err.error
                ),
                Some(format!("Statement: {}", err.statement)),
            );
        }
        if root.len() > LOGGED_ERRORS_PER_BATCH {
            self.journal.error(
                format!(
                    "...and {} more specific errors",
                    root.len() - LOGGED_ERRORS_PER_BATCH
                ),
                None,
            );
        }

        if let Some(sample) = root.iter().find(|e| is_foreign_key_violation(&e.error)) {
            self.journal.error(
                "Detected foreign key violations while inserting data",
                Some(sample.error.clone()),
            );
            if phase == Phase::Data && options.use_transactions {
                self.journal.warn(
                    "Data batch rolled back due to foreign key violations",
                    Some(
                        "Review parent/child table ordering and source data integrity, then re-run import"
                            .to_string(),
                    ),
                );
            }
        }
        if !aborted.is_empty() {
            self.journal.warn(
                format!(
                    "{} statements failed because the transaction was aborted by a previous error",
                    aborted.len()
                ),
                None,
            );
        }

        self.journal.lock().errors.extend(errors.iter().cloned());
        errors
    }

    /// Keeps the batch as it was submitted, wrapping included, so a re-run behaves the same.
    fn record_failed_batch(
        &self,
        phase: Phase,
        batch_index: usize,
        batch: &[String],
        failed: usize,
        options: &ImportOptions,
    ) {
        let statements = if is_deferred(phase, options) {
            wrap_deferred(batch)
        } else {
            batch.to_vec()
        };
        self.journal.lock().failed_batches.push(FailedBatch {
            phase,
            batch_index,
            statements,
            failed_count: failed,
        });
    }

    /// Progress, throughput estimate and (unless the batch ends the run) checkpoint
    /// after a settled batch.
    #[allow(clippy::too_many_arguments)]
    fn advance(
        &self,
        batch: &[String],
        executed: usize,
        failed: usize,
        phase: Phase,
        batch_index: usize,
        phase_batches: usize,
        options: &ImportOptions,
        checkpoint: bool,
    ) {
        let batch_bytes: u64 = batch.iter().map(|s| s.len() as u64).sum();
        let elapsed_ms = self.run.started.elapsed().as_millis() as u64;

        let mut guard = self.journal.lock();
        let state = &mut *guard;
        let Some(progress) = state.progress.as_mut() else {
            return;
        };
        progress.record(executed, failed);
        progress.current_batch += 1;
        progress.current_phase = Some(phase);
        progress.bytes_processed += batch_bytes;
        if progress.total_bytes > 0 {
            progress.bytes_processed = progress.bytes_processed.min(progress.total_bytes);
        }
        progress.update_timing(elapsed_ms);

        if checkpoint && options.enable_checkpoint {
            let checkpoint = Checkpoint {
                run_id: self.run.run_id.clone(),
                dump_fingerprint: self.run.dump_fingerprint.clone(),
                phase,
                batch: batch_index + 1,
                total_batches: phase_batches,
                executed: progress.statements_executed,
                failed: progress.statements_failed,
                timestamp: now_millis(),
                layout: PlanLayout::of(options),
            };
            state.checkpoint = Some(checkpoint);
        }
    }
}

fn is_deferred(phase: Phase, options: &ImportOptions) -> bool {
    phase == Phase::Data && options.defer_constraints_during_data
}

fn backoff(base_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1u64 << attempt.min(6)))
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
