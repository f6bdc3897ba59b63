//! # RunExecutor (C6)
//!
//! Drives one `Scenario` through its steps sequentially — ordering is
//! semantic, since later steps read values extracted by earlier ones — and
//! produces a terminal `Run`.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::context::Context;
use crate::domain::{Run, RunId, RunStatus, Scenario, ScenarioId, StepResult};
use crate::executors::http::HttpStepExecutor;

pub struct RunExecutor {
    http_executor: HttpStepExecutor,
}

impl Default for RunExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RunExecutor {
    pub fn new() -> Self {
        Self {
            http_executor: HttpStepExecutor::new(),
        }
    }

    /// Runs every step of `scenario` in ascending index order against
    /// `base_url`, seeding the `ExecutionContext` with `environment`.
    /// Aborts early on a non-timeout step error, or (if
    /// `stop_on_first_failure`) on the first failing/timed-out step.
    /// `run_timeout` bounds the run's aggregate wall time (§4.6): if it
    /// elapses mid-scenario, the run is marked `ERROR` with a synthesized
    /// final `StepResult`.
    #[instrument(skip(self, scenario, environment, cancellation), fields(scenario_id = %scenario.id))]
    pub async fn execute_run(
        &self,
        run_id: RunId,
        scenario_id: ScenarioId,
        scenario: &Scenario,
        base_url: &str,
        environment: BTreeMap<String, String>,
        stop_on_first_failure: bool,
        run_timeout: Duration,
        cancellation: CancellationToken,
    ) -> Run {
        let started_at = chrono::Utc::now();
        let mut context = Context::seeded(&environment);
        let mut steps: Vec<StepResult> = Vec::with_capacity(scenario.steps.len());

        let deadline = tokio::time::Instant::now() + run_timeout;
        let mut timed_out = false;
        let mut cancelled = false;

        let mut sorted_steps = scenario.steps.clone();
        sorted_steps.sort_by_key(|s| s.index);

        for step in &sorted_steps {
            if cancellation.is_cancelled() {
                steps.push(cancelled_step_result(run_id, step));
                cancelled = true;
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                timed_out = true;
                break;
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let step_future = self.http_executor.execute(run_id, step, base_url, &context);

            let result = tokio::select! {
                result = step_future => result,
                _ = tokio::time::sleep(remaining) => {
                    timed_out = true;
                    break;
                }
                _ = cancellation.cancelled() => {
                    steps.push(cancelled_step_result(run_id, step));
                    cancelled = true;
                    break;
                }
            };

            let is_hard_error = result.error_message.is_some() && !result.is_timeout();
            let should_abort_on_failure =
                stop_on_first_failure && (!result.passed || result.is_timeout());

            context.add_extracted(result.extracted_values.clone());
            steps.push(result);

            if is_hard_error || should_abort_on_failure {
                break;
            }
        }

        let completed_at = chrono::Utc::now();
        let status = if timed_out {
            steps.push(synthesized_timeout_step_result(run_id, sorted_steps.len()));
            RunStatus::Error
        } else if cancelled {
            RunStatus::Cancelled
        } else {
            Run::rollup_status(&steps)
        };

        Run {
            id: run_id,
            scenario_id,
            package_id: scenario.package_id,
            triggered_by: "orchestrator".to_string(),
            base_url: base_url.to_string(),
            status,
            environment,
            steps,
            started_at,
            completed_at: Some(completed_at),
        }
    }
}

fn cancelled_step_result(run_id: RunId, step: &crate::domain::Step) -> StepResult {
    StepResult {
        run_id,
        step_index: step.index,
        step_name: step.name.clone(),
        actual_status: None,
        actual_headers: Default::default(),
        actual_body: None,
        passed: false,
        assertions: Vec::new(),
        extracted_values: Default::default(),
        error_message: Some("cancelled".to_string()),
        duration_ms: 0,
        executed_at: chrono::Utc::now(),
    }
}

fn synthesized_timeout_step_result(run_id: RunId, next_index: usize) -> StepResult {
    StepResult {
        run_id,
        step_index: next_index,
        step_name: "run timeout".to_string(),
        actual_status: None,
        actual_headers: Default::default(),
        actual_body: None,
        passed: false,
        assertions: Vec::new(),
        extracted_values: Default::default(),
        error_message: Some("run timeout".to_string()),
        duration_ms: 0,
        executed_at: chrono::Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExpectedResult, HttpMethod, Scenario, ScenarioSource, ScenarioStatus, Step};

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

    fn make_step(index: usize) -> Step {
        Step {
            index,
            name: format!("step-{}", index),
            method: HttpMethod::Get,
            endpoint: "/x".to_string(),
            headers: vec![],
            body: None,
            expected: ExpectedResult::default(),
            extractions: Default::default(),
            timeout_ms: 1000,
        }
    }

    #[tokio::test]
    async fn aborts_on_first_transport_error_and_marks_error() {
        let executor = RunExecutor::new();
        let scenario = make_scenario(vec![make_step(0), make_step(1)]);

        let run = executor
            .execute_run(
                RunId::new(),
                scenario.id,
                &scenario,
                "http://127.0.0.1:1",
                Default::default(),
                false,
                Duration::from_secs(30),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.steps.len(), 1, "scenario should abort after the first hard error");
    }

    #[tokio::test]
    async fn pre_cancelled_token_skips_every_step() {
        let executor = RunExecutor::new();
        let scenario = make_scenario(vec![make_step(0)]);
        let token = CancellationToken::new();
        token.cancel();

        let run = executor
            .execute_run(
                RunId::new(),
                scenario.id,
                &scenario,
                "http://127.0.0.1:1",
                Default::default(),
                false,
                Duration::from_secs(30),
                token,
            )
            .await;

        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.steps[0].error_message.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn run_timeout_synthesizes_final_step_result() {
        let executor = RunExecutor::new();
        let scenario = make_scenario(vec![make_step(0), make_step(1)]);

        let run = executor
            .execute_run(
                RunId::new(),
                scenario.id,
                &scenario,
                "http://127.0.0.1:1",
                Default::default(),
                false,
                Duration::from_millis(1),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.steps.last().unwrap().error_message.as_deref(), Some("run timeout"));
    }
}
