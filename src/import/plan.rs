// ABOUTME: Builds the ordered phase list for an import run
// ABOUTME: Applies execution order, data reordering, statement filters and rewrites, and resume offsets

use once_cell::sync::Lazy;
use regex::Regex;

use super::models::Phase;
use super::options::{ExecutionOrder, ImportOptions, ResumePoint};
use super::reorder::{reorder_with_report, ReorderReport};
use super::transform::{primary_keys, rewrite_on_conflict, take_ownership_sensitive, ConflictRewrite};
use crate::dump::ParsedDump;

static COPY_FROM_STDIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*COPY\s+.+?\s+FROM\s+STDIN\b").expect("copy pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPhase {
    pub phase: Phase,
    pub statements: Vec<String>,
}

impl PlannedPhase {
    fn new(phase: Phase, parts: &[&Vec<String>]) -> Self {
        Self {
            phase,
            statements: parts.iter().flat_map(|p| p.iter().cloned()).collect(),
        }
    }

    pub fn batch_count(&self, batch_size: usize) -> usize {
        self.statements.len().div_ceil(batch_size.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportPlan {
    pub phases: Vec<PlannedPhase>,
    /// Present when the data phase went through dependency reordering.
    pub reorder: Option<ReorderReport>,
    pub skipped_copy_statements: usize,
    /// Removed from the phases when ownership filtering is on, in plan order.
    pub ownership_statements: Vec<String>,
    pub on_conflict: ConflictRewrite,
    /// `None` with `resume_from` set means the resume phase is not part of this plan.
    pub resumed_from: Option<ResumePoint>,
}

impl ImportPlan {
    pub fn total_batches(&self, batch_size: usize) -> usize {
        self.phases.iter().map(|p| p.batch_count(batch_size)).sum()
    }

    pub fn total_statements(&self) -> usize {
        self.phases.iter().map(|p| p.statements.len()).sum()
    }
}

pub fn build_plan(dump: &ParsedDump, options: &ImportOptions) -> ImportPlan {
    let mut plan = ImportPlan::default();

    let structure = |phase| {
        PlannedPhase::new(
            phase,
            &[
                &dump.schema_statements,
                &dump.table_statements,
                &dump.sequence_statements,
            ],
        )
    };
    let routines = || {
        PlannedPhase::new(
            Phase::Functions,
            &[&dump.function_statements, &dump.trigger_statements],
        )
    };

    plan.phases = match options.execution_order {
        ExecutionOrder::FileOrder => vec![PlannedPhase::new(Phase::Other, &[&dump.statements])],
        order => {
            let outcome = reorder_with_report(&dump.data_statements, &dump.constraint_statements);
            plan.reorder = Some(outcome.report);
            let data = PlannedPhase {
                phase: Phase::Data,
                statements: outcome.statements,
            };
            let constraints = PlannedPhase::new(Phase::Constraints, &[&dump.constraint_statements]);
            let indexes = PlannedPhase::new(Phase::Indexes, &[&dump.index_statements]);
            let policies = PlannedPhase::new(Phase::Policies, &[&dump.policy_statements]);

            if order == ExecutionOrder::DataFirst {
                vec![structure(Phase::Schema), data, indexes, constraints, routines(), policies]
            } else {
                vec![structure(Phase::Schema), data, constraints, indexes, routines(), policies]
            }
        }
    };

    if options.skip_copy_from_stdin {
        if let Some(data) = plan.phases.iter_mut().find(|p| p.phase == Phase::Data) {
            let before = data.statements.len();
            data.statements.retain(|s| !COPY_FROM_STDIN.is_match(s));
            plan.skipped_copy_statements = before - data.statements.len();
        }
    }

    if options.skip_ownership_statements {
        for phase in &mut plan.phases {
            let removed = take_ownership_sensitive(&mut phase.statements);
            plan.ownership_statements.extend(removed);
        }
    }

    let keys = primary_keys(&dump.constraint_statements);
    for phase in &mut plan.phases {
        let outcome = rewrite_on_conflict(&mut phase.statements, options.on_conflict, &keys);
        plan.on_conflict.rewritten += outcome.rewritten;
        plan.on_conflict.unresolved += outcome.unresolved;
    }

    if let Some(resume) = options.resume_from {
        if let Some(target) = plan.phases.iter().position(|p| p.phase == resume.phase) {
            for phase in &mut plan.phases[..target] {
                phase.statements.clear();
            }
            let skip = options.batch_size.saturating_mul(resume.batch_index);
            let statements = &mut plan.phases[target].statements;
            statements.drain(..skip.min(statements.len()));
            plan.resumed_from = Some(resume);
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn dump() -> ParsedDump {
        ParsedDump {
            schema_statements: strings(&["CREATE SCHEMA app;"]),
            table_statements: strings(&["CREATE TABLE children ();", "CREATE TABLE parents ();"]),
            sequence_statements: strings(&["CREATE SEQUENCE s;"]),
            data_statements: strings(&[
                "INSERT INTO children VALUES ('c1', 'p1');",
                "INSERT INTO parents VALUES ('p1');",
            ]),
            constraint_statements: strings(&[
                "ALTER TABLE children ADD CONSTRAINT c_fk FOREIGN KEY (parent_id) REFERENCES parents(id);",
            ]),
            index_statements: strings(&["CREATE INDEX i ON children (parent_id);"]),
            function_statements: strings(&["CREATE FUNCTION f() RETURNS int AS $$ SELECT 1 $$ LANGUAGE sql;"]),
            trigger_statements: strings(&["CREATE TRIGGER t AFTER INSERT ON parents EXECUTE FUNCTION f();"]),
            policy_statements: strings(&["CREATE POLICY p ON parents USING (true);"]),
            statements: strings(&["CREATE SCHEMA app;", "INSERT INTO children VALUES ('c1', 'p1');"]),
            ..Default::default()
        }
    }

    fn phase_names(plan: &ImportPlan) -> Vec<Phase> {
        plan.phases.iter().map(|p| p.phase).collect()
    }

    #[test]
    fn test_schema_first_order() {
        let plan = build_plan(&dump(), &ImportOptions::default());
        assert_eq!(
            phase_names(&plan),
            vec![
                Phase::Schema,
                Phase::Data,
                Phase::Constraints,
                Phase::Indexes,
                Phase::Functions,
                Phase::Policies
            ]
        );
        assert_eq!(plan.phases[0].statements.len(), 4);
        assert_eq!(plan.phases[4].statements.len(), 2);
        // parents reordered ahead of children
        assert!(plan.phases[1].statements[0].contains("parents"));
        assert_eq!(plan.reorder.as_ref().unwrap().applied_edges, 1);
        assert_eq!(plan.total_statements(), dump().total_statements());
    }

    #[test]
    fn test_data_first_swaps_indexes_and_constraints() {
        let options = ImportOptions {
            execution_order: ExecutionOrder::DataFirst,
            ..Default::default()
        };
        let plan = build_plan(&dump(), &options);
        assert_eq!(
            phase_names(&plan),
            vec![
                Phase::Schema,
                Phase::Data,
                Phase::Indexes,
                Phase::Constraints,
                Phase::Functions,
                Phase::Policies
            ]
        );
        assert!(plan.phases[1].statements[0].contains("parents"));
    }

    #[test]
    fn test_file_order_is_single_untouched_phase() {
        let options = ImportOptions {
            execution_order: ExecutionOrder::FileOrder,
            ..Default::default()
        };
        let plan = build_plan(&dump(), &options);
        assert_eq!(phase_names(&plan), vec![Phase::Other]);
        assert_eq!(plan.phases[0].statements, dump().statements);
        assert!(plan.reorder.is_none());
    }

    #[test]
    fn test_copy_from_stdin_dropped_from_data() {
        let mut dump = dump();
        dump.data_statements
            .push("COPY public.parents (id) FROM stdin;\np2\n\\.".to_string());
        let plan = build_plan(&dump, &ImportOptions::default());
        assert_eq!(plan.skipped_copy_statements, 1);
        assert_eq!(plan.phases[1].statements.len(), 2);

        let keep = ImportOptions {
            skip_copy_from_stdin: false,
            ..Default::default()
        };
        assert_eq!(build_plan(&dump, &keep).phases[1].statements.len(), 3);
    }

    #[test]
    fn test_resume_skips_completed_work() {
        let options = ImportOptions {
            batch_size: 1,
            resume_from: Some(ResumePoint {
                phase: Phase::Data,
                batch_index: 1,
            }),
            ..Default::default()
        };
        let plan = build_plan(&dump(), &options);
        assert!(plan.phases[0].statements.is_empty());
        assert_eq!(plan.phases[1].statements, strings(&["INSERT INTO children VALUES ('c1', 'p1');"]));
        assert_eq!(plan.phases[2].statements.len(), 1);
        assert!(plan.resumed_from.is_some());
    }

    #[test]
    fn test_resume_phase_missing_from_plan() {
        let options = ImportOptions {
            execution_order: ExecutionOrder::FileOrder,
            resume_from: Some(ResumePoint {
                phase: Phase::Data,
                batch_index: 1,
            }),
            ..Default::default()
        };
        let plan = build_plan(&dump(), &options);
        assert!(plan.resumed_from.is_none());
    }

    #[test]
    fn test_ownership_filter_runs_before_resume_offset() {
        let mut dump = dump();
        dump.table_statements
            .insert(1, "ALTER TABLE public.children OWNER TO postgres;".to_string());
        dump.policy_statements
            .push("GRANT SELECT ON public.parents TO reporting;".to_string());

        let options = ImportOptions {
            skip_ownership_statements: true,
            ..Default::default()
        };
        let plan = build_plan(&dump, &options);
        assert_eq!(plan.ownership_statements.len(), 2);
        assert_eq!(plan.phases[0].statements.len(), 4);
        assert_eq!(plan.phases[5].statements.len(), 1);

        let kept = build_plan(&dump, &ImportOptions::default());
        assert!(kept.ownership_statements.is_empty());
        assert_eq!(kept.phases[0].statements.len(), 5);
    }

    #[test]
    fn test_on_conflict_skip_rewrites_data() {
        let options = ImportOptions {
            on_conflict: crate::import::ConflictMode::Skip,
            ..Default::default()
        };
        let plan = build_plan(&dump(), &options);
        assert_eq!(plan.on_conflict.rewritten, 2);
        assert!(plan.phases[1]
            .statements
            .iter()
            .all(|s| s.ends_with("ON CONFLICT DO NOTHING;")));
    }

    #[test]
    fn test_total_batches() {
        let options = ImportOptions {
            batch_size: 3,
            ..Default::default()
        };
        let plan = build_plan(&dump(), &options);
        // schema 4 -> 2, data 2 -> 1, constraints, indexes, functions, policies -> 1 each
        assert_eq!(plan.total_batches(3), 7);
    }
}
