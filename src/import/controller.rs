// ABOUTME: Top-level import state machine tying planning, batch execution and reporting together
// ABOUTME: Owns the pause/cancel control block, the run journal and the final summary

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use super::checkpoint::{new_run_id, Checkpoint};
use super::control::ControlBlock;
use super::executor::{BatchExecutor, RunContext};
use super::journal::{ImportState, Journal};
use super::metrics::{build_import_metrics, PhaseExecution};
use super::models::{
    now_millis, FailedBatch, ImportError, ImportLog, ImportProgress, ImportStatus, ImportSummary,
    Phase, PhaseCounts, SummaryStatus,
};
use super::options::{ImportOptions, PROXY_CALL_LIMIT, PROXY_TIMEOUT_MS};
use super::plan::{build_plan, ImportPlan};
use crate::dump::ParsedDump;
use crate::error::{ImporterError, Result};
use crate::remote::{
    ConnectionDescriptor, ConnectionTestResult, ExecuteOptions, ExecuteRequest, SqlProxy,
};

/// Foreign-key edges listed individually in the missing-table warning.
const MISSING_EDGE_SAMPLE: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RerunOutcome {
    pub recovered_batches: usize,
    pub recovered_statements: usize,
    pub still_failing: usize,
}

/// Drives one import at a time. Control calls take `&self`, so the controller can be
/// shared (e.g. behind an `Arc`) between the task running `start_import` and callers
/// pausing, resuming or cancelling it.
pub struct ImportController {
    proxy: Arc<dyn SqlProxy>,
    control: ControlBlock,
    journal: Journal,
}

#[derive(Default)]
struct RunTally {
    phases: BTreeMap<Phase, PhaseCounts>,
    executions: Vec<PhaseExecution>,
}

impl RunTally {
    fn executed(&self) -> usize {
        self.phases.values().map(|p| p.executed).sum()
    }

    fn failed(&self) -> usize {
        self.phases.values().map(|p| p.failed).sum()
    }
}

impl ImportController {
    pub fn new(proxy: Arc<dyn SqlProxy>) -> Self {
        Self {
            proxy,
            control: ControlBlock::new(),
            journal: Journal::default(),
        }
    }

    pub fn status(&self) -> ImportStatus {
        self.journal.status()
    }

    pub fn progress(&self) -> Option<ImportProgress> {
        self.journal.lock().progress.clone()
    }

    pub fn errors(&self) -> Vec<ImportError> {
        self.journal.lock().errors.clone()
    }

    pub fn logs(&self) -> Vec<ImportLog> {
        self.journal.lock().logs.clone()
    }

    pub fn summary(&self) -> Option<ImportSummary> {
        self.journal.lock().summary.clone()
    }

    pub fn failed_batches(&self) -> Vec<FailedBatch> {
        self.journal.lock().failed_batches.clone()
    }

    /// Last completed batch of the current or previous run, when checkpointing is enabled.
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.journal.lock().checkpoint.clone()
    }

    pub fn can_start(&self) -> bool {
        self.status().can_start()
    }

    pub fn can_pause(&self) -> bool {
        self.status().can_pause()
    }

    pub fn can_resume(&self) -> bool {
        self.status().can_resume()
    }

    pub fn can_cancel(&self) -> bool {
        self.status().can_cancel()
    }

    /// Never fails: transport problems come back as an unsuccessful result.
    pub async fn test_connection(&self, connection: &ConnectionDescriptor) -> ConnectionTestResult {
        info!("Testing connection to {}", connection.display_target());
        match self.proxy.test(connection).await {
            Ok(result) => result,
            Err(e) => ConnectionTestResult {
                success: false,
                message: e.to_string(),
                code: Some("CLIENT_ERROR".to_string()),
                error: Some(format!("{:#}", e)),
            },
        }
    }

    /// Runs a full import and returns the terminal status (`Completed`, `Failed` or
    /// `Cancelled`). Only guard violations and invalid options are returned as `Err`.
    pub async fn start_import(
        &self,
        dump: &ParsedDump,
        connection: &ConnectionDescriptor,
        options: &ImportOptions,
    ) -> Result<ImportStatus> {
        {
            let mut state = self.journal.lock();
            if !state.status.can_start() {
                return Err(ImporterError::InvalidState {
                    action: "start import",
                    status: state.status,
                });
            }
            *state = ImportState {
                status: ImportStatus::Validating,
                ..Default::default()
            };
        }
        self.control.clear();

        if let Err(e) = options.validate() {
            self.journal.error("Import options rejected", Some(e.to_string()));
            self.journal.set_status(ImportStatus::Failed);
            return Err(e);
        }

        let run = RunContext {
            run_id: new_run_id(),
            dump_fingerprint: dump.fingerprint(),
            started: Instant::now(),
        };
        let start_time = now_millis();
        debug!(run_id = %run.run_id, database = %connection.display_target(), "Preparing import");

        let total_statements = dump.total_statements();
        if dump.data_statements.is_empty() && dump.metadata.estimated_row_count > 0 {
            self.journal.warn(
                "No data statements detected in parsed SQL",
                Some(format!(
                    "Estimated rows from file: {}",
                    dump.metadata.estimated_row_count
                )),
            );
        } else {
            self.journal.info(
                "Data statements detected",
                Some(format!("Count: {}", dump.data_statements.len())),
            );
        }

        let plan = build_plan(dump, options);
        if let (Some(resume), None) = (options.resume_from, plan.resumed_from) {
            let e = ImporterError::InvalidOptions(format!(
                "resume phase {} is not part of a {} plan",
                resume.phase, options.execution_order
            ));
            self.journal.error("Cannot resume import", Some(e.to_string()));
            self.journal.set_status(ImportStatus::Failed);
            return Err(e);
        }
        self.log_plan(&plan, options);

        {
            let mut state = self.journal.lock();
            state.progress = Some(ImportProgress {
                total_batches: plan.total_batches(options.batch_size),
                total_statements,
                total_bytes: dump.file_size_bytes(),
                ..Default::default()
            });
            state.status = ImportStatus::Executing;
        }
        self.journal.info(
            "Starting import",
            Some(format!(
                "{} statements to execute ({})",
                total_statements, options.execution_order
            )),
        );

        let mut tally = RunTally {
            phases: plan
                .phases
                .iter()
                .map(|p| (p.phase, PhaseCounts::default()))
                .collect(),
            ..Default::default()
        };
        let outcome = self
            .run_phases(&plan, connection, options, &run, &mut tally)
            .await;

        let status = self.finish(outcome, start_time, &run, &tally);
        self.control.clear();
        Ok(status)
    }

    async fn run_phases(
        &self,
        plan: &ImportPlan,
        connection: &ConnectionDescriptor,
        options: &ImportOptions,
        run: &RunContext,
        tally: &mut RunTally,
    ) -> Result<()> {
        let executor = BatchExecutor::new(self.proxy.as_ref(), &self.control, &self.journal, run);

        for planned in &plan.phases {
            if planned.statements.is_empty() {
                continue;
            }
            let first_batch = match plan.resumed_from {
                Some(resume) if resume.phase == planned.phase => resume.batch_index,
                _ => 0,
            };

            let phase_start = now_millis();
            self.journal.info(
                format!("Starting phase: {}", planned.phase),
                Some(format!("{} statements", planned.statements.len())),
            );
            self.journal
                .update_progress(|p| p.current_phase = Some(planned.phase));

            let stats = tally.phases.entry(planned.phase).or_default();
            let result = executor
                .execute(
                    &planned.statements,
                    connection,
                    options,
                    planned.phase,
                    first_batch,
                    stats,
                )
                .await;

            let phase_end = now_millis();
            let counts = *stats;
            tally.executions.push(PhaseExecution {
                name: planned.phase,
                start_time: phase_start,
                end_time: phase_end,
                executed: counts.executed,
                failed: counts.failed,
            });
            let result = result?;

            let message = format!(
                "Phase {} completed in {}s",
                planned.phase,
                (phase_end - phase_start) / 1000
            );
            let details = Some(format!(
                "{} executed, {} failed",
                result.executed, result.failed
            ));
            if result.failed > 0 {
                self.journal.warn(message, details);
            } else {
                self.journal.success(message, details);
            }
        }

        // a cancel that arrived during the final batch still ends the run as cancelled
        if self.control.is_cancelled() {
            return Err(ImporterError::Cancelled);
        }
        Ok(())
    }

    fn finish(
        &self,
        outcome: Result<()>,
        start_time: i64,
        run: &RunContext,
        tally: &RunTally,
    ) -> ImportStatus {
        let end_time = now_millis();
        let executed = tally.executed();
        let failed = tally.failed();
        let elapsed_secs = run.started.elapsed().as_secs();

        match outcome {
            Ok(()) => {
                let summary =
                    self.build_summary(SummaryStatus::from_counts(executed, failed), start_time, end_time, tally);
                {
                    let mut state = self.journal.lock();
                    state.summary = Some(summary);
                    state.status = ImportStatus::Completed;
                }
                self.journal.success(
                    "Import completed",
                    Some(format!(
                        "{} statements executed, {} failed in {}s",
                        executed, failed, elapsed_secs
                    )),
                );
                ImportStatus::Completed
            }
            Err(ImporterError::Cancelled) => {
                self.journal.set_status(ImportStatus::Cancelled);
                self.journal.warn(
                    "Import cancelled by user",
                    Some(format!(
                        "{} executed, {} failed before cancellation",
                        executed, failed
                    )),
                );
                ImportStatus::Cancelled
            }
            Err(e) => {
                let summary = self.build_summary(SummaryStatus::Failed, start_time, end_time, tally);
                {
                    let mut state = self.journal.lock();
                    state.summary = Some(summary);
                    state.status = ImportStatus::Failed;
                }
                self.journal.error("Import failed", Some(e.to_string()));
                ImportStatus::Failed
            }
        }
    }

    fn build_summary(
        &self,
        status: SummaryStatus,
        start_time: i64,
        end_time: i64,
        tally: &RunTally,
    ) -> ImportSummary {
        ImportSummary {
            status,
            start_time,
            end_time,
            duration: end_time - start_time,
            statements_executed: tally.executed(),
            statements_failed: tally.failed(),
            errors: self.journal.lock().errors.clone(),
            phases: tally.phases.clone(),
            metrics: build_import_metrics(start_time, end_time, &tally.executions),
        }
    }

    fn log_plan(&self, plan: &ImportPlan, options: &ImportOptions) {
        if let Some(report) = &plan.reorder {
            if report.fk_edges > 0 {
                self.journal.info(
                    "Analyzed foreign key relationships for data ordering",
                    Some(format!(
                        "edges={}, applied={}, missingTables={}",
                        report.fk_edges,
                        report.applied_edges,
                        report.missing_table_edges.len()
                    )),
                );
            }
            if !report.missing_table_edges.is_empty() {
                let sample: Vec<&str> = report
                    .missing_table_edges
                    .iter()
                    .take(MISSING_EDGE_SAMPLE)
                    .map(String::as_str)
                    .collect();
                self.journal.warn(
                    "Some foreign key relationships reference tables without data statements",
                    Some(sample.join("; ")),
                );
            }
            if !report.unresolved_tables.is_empty() {
                self.journal.warn(
                    "Foreign key dependency graph not fully resolved for data reordering",
                    Some(format!(
                        "unresolvedTables={}",
                        report.unresolved_tables.join(", ")
                    )),
                );
            }
        }
        if plan.skipped_copy_statements > 0 {
            self.journal.warn(
                "Skipping COPY FROM STDIN statements",
                Some(format!(
                    "{} COPY block(s) will be skipped; re-export using INSERT format (pg_dump --inserts) to import data rows",
                    plan.skipped_copy_statements
                )),
            );
        }
        if !plan.ownership_statements.is_empty() {
            self.journal.warn(
                "Filtered ownership-sensitive statements",
                Some(format!(
                    "{} statements skipped (OWNER TO, GRANT/REVOKE, table comments, row level security)",
                    plan.ownership_statements.len()
                )),
            );
        }
        if plan.on_conflict.rewritten > 0 {
            self.journal.info(
                format!("Applied ON CONFLICT ({}) to INSERT statements", options.on_conflict),
                Some(format!("Rewrote {} statements", plan.on_conflict.rewritten)),
            );
        }
        if plan.on_conflict.unresolved > 0 {
            self.journal.warn(
                "Some INSERT statements were left without ON CONFLICT handling",
                Some(format!(
                    "{} statements lack a column list or a known primary key",
                    plan.on_conflict.unresolved
                )),
            );
        }
        if options.defer_constraints_during_data {
            self.journal.info(
                "Data batches run with deferred constraints and replica session role",
                None,
            );
        }
        if let Some(resume) = plan.resumed_from {
            self.journal.info(
                "Resuming import from checkpoint",
                Some(format!(
                    "phase={}, batchIndex={}",
                    resume.phase, resume.batch_index
                )),
            );
        }
    }

    pub fn pause_import(&self) -> Result<()> {
        {
            let mut state = self.journal.lock();
            if !state.status.can_pause() {
                return Err(ImporterError::InvalidState {
                    action: "pause",
                    status: state.status,
                });
            }
            state.status = ImportStatus::Paused;
            self.control.pause();
        }
        self.journal.info("Import paused", None);
        Ok(())
    }

    pub fn resume_import(&self) -> Result<()> {
        {
            let mut state = self.journal.lock();
            if !state.status.can_resume() {
                return Err(ImporterError::InvalidState {
                    action: "resume",
                    status: state.status,
                });
            }
            state.status = ImportStatus::Executing;
            self.control.resume();
        }
        self.journal.info("Import resumed", None);
        Ok(())
    }

    /// Takes effect at the next batch boundary; an in-flight batch always settles first.
    pub fn cancel_import(&self) -> Result<()> {
        {
            let state = self.journal.lock();
            if !state.status.can_cancel() {
                return Err(ImporterError::InvalidState {
                    action: "cancel",
                    status: state.status,
                });
            }
            self.control.cancel();
        }
        self.journal.warn("Cancelling import...", None);
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        let mut state = self.journal.lock();
        if matches!(
            state.status,
            ImportStatus::Parsing
                | ImportStatus::Validating
                | ImportStatus::Executing
                | ImportStatus::Paused
        ) {
            return Err(ImporterError::InvalidState {
                action: "reset",
                status: state.status,
            });
        }
        *state = ImportState::default();
        self.control.clear();
        Ok(())
    }

    /// Re-executes every recorded failed batch once. Recovered statements move from
    /// failed to executed in the summary. The controller reports `Executing` while the
    /// re-run is in flight, so pause and cancel apply between batches and a new import
    /// cannot start; the previous terminal status is restored afterwards.
    pub async fn rerun_failed_batches(&self, connection: &ConnectionDescriptor) -> Result<RerunOutcome> {
        let (failed, previous) = {
            let mut state = self.journal.lock();
            if !state.status.can_start() {
                return Err(ImporterError::InvalidState {
                    action: "re-run failed batches",
                    status: state.status,
                });
            }
            let previous = state.status;
            if !state.failed_batches.is_empty() {
                state.status = ImportStatus::Executing;
            }
            (state.failed_batches.clone(), previous)
        };

        let mut outcome = RerunOutcome::default();
        if failed.is_empty() {
            self.journal.info("No failed batches to re-run", None);
            return Ok(outcome);
        }
        self.control.clear();
        self.journal
            .info(format!("Re-running {} failed batches", failed.len()), None);

        let mut still_failed = Vec::new();
        let mut recovered_by_phase: BTreeMap<Phase, usize> = BTreeMap::new();
        let mut pending = failed.into_iter();

        while let Some(batch) = pending.next() {
            if self.control.boundary().await.is_err() {
                self.journal.warn("Re-run cancelled", None);
                still_failed.push(batch);
                still_failed.extend(pending.by_ref());
                break;
            }

            let request = ExecuteRequest {
                connection: connection.clone(),
                statements: batch.statements.clone(),
                options: ExecuteOptions {
                    stop_on_error: false,
                    use_transaction: true,
                    timeout_ms: PROXY_TIMEOUT_MS,
                },
            };

            let verdict = match timeout(PROXY_CALL_LIMIT, self.proxy.execute(&request)).await {
                Err(_) => Err(format!(
                    "Proxy call timed out after {}s",
                    PROXY_CALL_LIMIT.as_secs()
                )),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Ok(Ok(response)) if !response.success => Err(if response.message.is_empty() {
                    "Re-run failed".to_string()
                } else {
                    response.message
                }),
                Ok(Ok(response)) => match response.details {
                    Some(details) if details.failed > 0 => Err(format!(
                        "Batch re-run had {} failed statements",
                        details.failed
                    )),
                    _ => Ok(()),
                },
            };

            match verdict {
                Ok(()) => {
                    outcome.recovered_batches += 1;
                    outcome.recovered_statements += batch.failed_count;
                    *recovered_by_phase.entry(batch.phase).or_default() += batch.failed_count;
                    self.journal.success(
                        format!(
                            "Re-ran failed batch {} ({})",
                            batch.batch_index + 1,
                            batch.phase
                        ),
                        Some(format!("{} statements recovered", batch.failed_count)),
                    );
                }
                Err(message) => {
                    self.journal.error(
                        format!(
                            "Failed to re-run batch {} ({})",
                            batch.batch_index + 1,
                            batch.phase
                        ),
                        Some(message),
                    );
                    still_failed.push(batch);
                }
            }
        }
        outcome.still_failing = still_failed.len();

        self.control.clear();
        {
            let mut state = self.journal.lock();
            state.status = previous;
            state.failed_batches = still_failed;
            if let Some(summary) = state.summary.as_mut() {
                for (phase, delta) in &recovered_by_phase {
                    if let Some(counts) = summary.phases.get_mut(phase) {
                        let delta = (*delta).min(counts.failed);
                        counts.executed += delta;
                        counts.failed -= delta;
                    }
                }
                let recovered = outcome.recovered_statements.min(summary.statements_failed);
                summary.statements_executed += recovered;
                summary.statements_failed -= recovered;
                summary.status =
                    SummaryStatus::from_counts(summary.statements_executed, summary.statements_failed);
            }
        }

        if outcome.recovered_statements > 0 {
            self.journal.success(
                format!(
                    "Recovered {} statements across {} batches. {} batches still failing.",
                    outcome.recovered_statements, outcome.recovered_batches, outcome.still_failing
                ),
                None,
            );
        }
        Ok(outcome)
    }
}
