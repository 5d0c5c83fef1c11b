// ABOUTME: Per-phase and total timing aggregation for a finished import
// ABOUTME: Pure computation over recorded phase timestamps and counts

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::models::Phase;

/// One phase as it actually ran. Times are epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseExecution {
    pub name: Phase,
    pub start_time: i64,
    pub end_time: i64,
    pub executed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTiming {
    pub start_time: i64,
    pub end_time: i64,
    pub duration: i64,
    pub executed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportMetrics {
    pub total_duration: i64,
    pub phases: BTreeMap<Phase, PhaseTiming>,
}

pub fn build_import_metrics(
    import_start: i64,
    import_end: i64,
    phase_executions: &[PhaseExecution],
) -> ImportMetrics {
    let phases = phase_executions
        .iter()
        .map(|phase| {
            (
                phase.name,
                PhaseTiming {
                    start_time: phase.start_time,
                    end_time: phase.end_time,
                    duration: phase.end_time - phase.start_time,
                    executed: phase.executed,
                    failed: phase.failed,
                },
            )
        })
        .collect();

    ImportMetrics {
        total_duration: import_end - import_start,
        phases,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builds_phase_durations() {
        let metrics = build_import_metrics(
            1000,
            5000,
            &[
                PhaseExecution {
                    name: Phase::Schema,
                    start_time: 1000,
                    end_time: 2000,
                    executed: 10,
                    failed: 0,
                },
                PhaseExecution {
                    name: Phase::Data,
                    start_time: 2000,
                    end_time: 5000,
                    executed: 100,
                    failed: 5,
                },
            ],
        );

        assert_eq!(metrics.total_duration, 4000);
        assert_eq!(metrics.phases[&Phase::Schema].duration, 1000);
        assert_eq!(metrics.phases[&Phase::Data].duration, 3000);
        assert_eq!(metrics.phases[&Phase::Data].executed, 100);
        assert_eq!(metrics.phases[&Phase::Data].failed, 5);
    }

    #[test]
    fn test_sequential_phases_fit_in_total() {
        let phases = [
            PhaseExecution {
                name: Phase::Schema,
                start_time: 100,
                end_time: 180,
                executed: 3,
                failed: 0,
            },
            PhaseExecution {
                name: Phase::Constraints,
                start_time: 190,
                end_time: 260,
                executed: 2,
                failed: 1,
            },
        ];
        let metrics = build_import_metrics(100, 300, &phases);
        let sum: i64 = metrics.phases.values().map(|p| p.duration).sum();
        assert!(sum <= metrics.total_duration);
        for phase in &phases {
            assert_eq!(
                metrics.phases[&phase.name].duration,
                phase.end_time - phase.start_time
            );
        }
    }

    #[test]
    fn test_no_phases() {
        let metrics = build_import_metrics(10, 10, &[]);
        assert_eq!(metrics.total_duration, 0);
        assert!(metrics.phases.is_empty());
    }
}
