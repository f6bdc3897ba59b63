//! # CoverageCalculator (C8)
//!
//! Pure function: given the operations a spec declares and the runs that
//! exercised them, computes per-operation coverage and a summary
//! percentage. Touches no I/O and holds no state.

use std::collections::BTreeMap;

use crate::domain::{CoverageReport, CoverageStatus, HttpMethod, OperationCoverage, Run, ScenarioId, Scenario};

/// One operation a spec declares, keyed by (method, path).
#[derive(Debug, Clone)]
pub struct DeclaredOperation {
    pub operation_id: String,
    pub method: HttpMethod,
    pub path: String,
}

pub struct CoverageCalculator;

impl CoverageCalculator {
    /// `scenarios` supplies the scenario-to-step (method, endpoint) mapping
    /// so coverage can be attributed back to the scenarios that exercise
    /// each operation; `runs` supplies the pass/fail outcome for each.
    pub fn calculate(
        operations: &[DeclaredOperation],
        scenarios: &[Scenario],
        runs: &[Run],
    ) -> CoverageReport {
        // (method, endpoint) -> scenario ids that touch it
        let mut touching: BTreeMap<(HttpMethod, String), Vec<ScenarioId>> = BTreeMap::new();
        // (scenario id, step index) -> the operation that step exercises, so a
        // run's per-step results can be attributed back without relying on
        // the whole Run's rolled-up status (P4 rolls ERROR/FAILED up across
        // every step, which would misclassify a passing step in an otherwise
        // failing run).
        let mut step_operation: BTreeMap<(ScenarioId, usize), (HttpMethod, String)> =
            BTreeMap::new();
        for scenario in scenarios {
            for step in &scenario.steps {
                let key = (step.method, step.endpoint.clone());
                touching.entry(key.clone()).or_default().push(scenario.id);
                step_operation.insert((scenario.id, step.index), key);
            }
        }

        // (method, endpoint) -> (any step execution passed, any step executed)
        let mut op_outcome: BTreeMap<(HttpMethod, String), (bool, bool)> = BTreeMap::new();
        for run in runs {
            for step_result in &run.steps {
                if let Some(key) = step_operation.get(&(run.scenario_id, step_result.step_index)) {
                    let entry = op_outcome.entry(key.clone()).or_insert((false, false));
                    entry.1 = true;
                    entry.0 = entry.0 || step_result.passed;
                }
            }
        }

        let mut covered_operations = 0usize;
        let mut operation_results = Vec::with_capacity(operations.len());
        let mut gaps = Vec::new();

        for op in operations {
            let key = (op.method, op.path.clone());
            let scenario_ids = touching.get(&key).cloned().unwrap_or_default();
            let outcome = op_outcome.get(&key).copied();

            let status = if scenario_ids.is_empty() {
                gaps.push(format!("{} {}: no scenario exercises this operation", op.method, op.path));
                CoverageStatus::Untested
            } else if outcome.map(|(any_passed, _)| any_passed).unwrap_or(false) {
                CoverageStatus::Covered
            } else if outcome.map(|(_, any_run)| any_run).unwrap_or(false) {
                gaps.push(format!("{} {}: covered but every run failed", op.method, op.path));
                CoverageStatus::Failing
            } else {
                gaps.push(format!("{} {}: no run has executed yet", op.method, op.path));
                CoverageStatus::Untested
            };

            if status == CoverageStatus::Covered {
                covered_operations += 1;
            }

            operation_results.push(OperationCoverage {
                operation_id: op.operation_id.clone(),
                method: op.method,
                path: op.path.clone(),
                status,
                scenario_ids,
            });
        }

        let total_operations = operations.len();
        let coverage_percentage = if total_operations == 0 {
            0.0
        } else {
            100.0 * covered_operations as f64 / total_operations as f64
        };

        CoverageReport {
            total_operations,
            covered_operations,
            coverage_percentage,
            operations: operation_results,
            gaps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExpectedResult, RunId, RunStatus, ScenarioSource, ScenarioStatus, Step, StepResult};

    fn make_op(id: &str, method: HttpMethod, path: &str) -> DeclaredOperation {
        DeclaredOperation {
            operation_id: id.to_string(),
            method,
            path: path.to_string(),
        }
    }

    fn make_step(index: usize, method: HttpMethod, path: &str) -> Step {
        Step {
            index,
            name: "step".to_string(),
            method,
            endpoint: path.to_string(),
            headers: vec![],
            body: None,
            expected: ExpectedResult::default(),
            extractions: Default::default(),
            timeout_ms: 1000,
        }
    }

    fn make_scenario(steps: Vec<Step>) -> Scenario {
        Scenario {
            id: ScenarioId::new(),
            package_id: None,
            suite_id: None,
            name: "s".to_string(),
            description: None,
            steps,
            tags: Default::default(),
            source: ScenarioSource::Manual,
            status: ScenarioStatus::Active,
        }
    }

    fn make_step_result(step_index: usize, passed: bool) -> StepResult {
        StepResult {
            run_id: RunId::new(),
            step_index,
            step_name: "step".to_string(),
            actual_status: Some(if passed { 200 } else { 500 }),
            actual_headers: Default::default(),
            actual_body: None,
            passed,
            assertions: vec![],
            extracted_values: Default::default(),
            error_message: None,
            duration_ms: 1,
            executed_at: chrono::Utc::now(),
        }
    }

    fn make_run(scenario_id: ScenarioId, status: RunStatus, steps: Vec<StepResult>) -> Run {
        Run {
            id: RunId::new(),
            scenario_id,
            package_id: None,
            triggered_by: "t".to_string(),
            base_url: "https://x".to_string(),
            status,
            environment: Default::default(),
            steps,
            started_at: chrono::Utc::now(),
            completed_at: Some(chrono::Utc::now()),
        }
    }

    #[test]
    fn zero_operations_yields_zero_percent_not_nan() {
        let report = CoverageCalculator::calculate(&[], &[], &[]);
        assert_eq!(report.coverage_percentage, 0.0);
    }

    #[test]
    fn untested_operation_has_no_touching_scenario() {
        let ops = vec![make_op("getPets", HttpMethod::Get, "/pets")];
        let report = CoverageCalculator::calculate(&ops, &[], &[]);
        assert_eq!(report.operations[0].status, CoverageStatus::Untested);
        assert_eq!(report.coverage_percentage, 0.0);
    }

    #[test]
    fn covered_operation_has_a_passing_run() {
        let scenario = make_scenario(vec![make_step(0, HttpMethod::Get, "/pets")]);
        let ops = vec![make_op("getPets", HttpMethod::Get, "/pets")];
        let runs = vec![make_run(
            scenario.id,
            RunStatus::Passed,
            vec![make_step_result(0, true)],
        )];
        let report = CoverageCalculator::calculate(&ops, std::slice::from_ref(&scenario), &runs);
        assert_eq!(report.operations[0].status, CoverageStatus::Covered);
        assert_eq!(report.coverage_percentage, 100.0);
    }

    #[test]
    fn failing_operation_has_only_failed_runs() {
        let scenario = make_scenario(vec![make_step(0, HttpMethod::Get, "/pets")]);
        let ops = vec![make_op("getPets", HttpMethod::Get, "/pets")];
        let runs = vec![make_run(
            scenario.id,
            RunStatus::Failed,
            vec![make_step_result(0, false)],
        )];
        let report = CoverageCalculator::calculate(&ops, std::slice::from_ref(&scenario), &runs);
        assert_eq!(report.operations[0].status, CoverageStatus::Failing);
    }

    /// A scenario whose first step (POST /pets) passes but whose second step
    /// fails rolls the whole Run to FAILED (P4), but the first step's
    /// operation must still be COVERED — coverage is attributed per step,
    /// not from the run's overall rollup.
    #[test]
    fn passing_step_is_covered_even_when_the_run_rolls_up_to_failed() {
        let scenario = make_scenario(vec![
            make_step(0, HttpMethod::Post, "/pets"),
            make_step(1, HttpMethod::Get, "/pets/1"),
        ]);
        let ops = vec![
            make_op("createPet", HttpMethod::Post, "/pets"),
            make_op("getPet", HttpMethod::Get, "/pets/1"),
        ];
        let runs = vec![make_run(
            scenario.id,
            RunStatus::Failed,
            vec![make_step_result(0, true), make_step_result(1, false)],
        )];
        let report = CoverageCalculator::calculate(&ops, std::slice::from_ref(&scenario), &runs);
        assert_eq!(report.operations[0].status, CoverageStatus::Covered);
        assert_eq!(report.operations[1].status, CoverageStatus::Failing);
    }
}
