// ABOUTME: pg_dump import core
// ABOUTME: Reordering, planning and statement rewrites, batch execution, classification and the run state machine

pub mod checkpoint;
pub mod classify;
pub mod control;
pub mod controller;
pub mod executor;
mod journal;
pub mod metrics;
pub mod models;
pub mod options;
pub mod plan;
pub mod reorder;
pub mod transform;

pub use checkpoint::Checkpoint;
pub use classify::{classify, Classification, ErrorCategory, ErrorSeverity};
pub use control::ControlBlock;
pub use controller::{ImportController, RerunOutcome};
pub use metrics::{build_import_metrics, ImportMetrics, PhaseExecution, PhaseTiming};
pub use models::{
    FailedBatch, ImportError, ImportLog, ImportProgress, ImportStatus, ImportSummary, LogLevel,
    Phase, PhaseCounts, SummaryStatus,
};
pub use options::{ExecutionOrder, ImportOptions, PlanLayout, ResumePoint};
pub use plan::{build_plan, ImportPlan, PlannedPhase};
pub use reorder::{reorder, reorder_with_report, ReorderOutcome, ReorderReport};
pub use transform::{ConflictMode, ConflictRewrite};
