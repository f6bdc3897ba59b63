//! # PackageOrchestrator (C9)
//!
//! The top-level state machine. Drives one `Package` through
//! `REQUESTED → SPEC_FETCHED → AI_SUCCESS → EXECUTION_IN_PROGRESS →
//! EXECUTION_COMPLETE → [QA_EVAL_IN_PROGRESS → QA_EVAL_DONE] → COMPLETE`,
//! delegating to C5-C8 at each stage and emitting a `PackageEvent` at every
//! transition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::coverage::{CoverageCalculator, DeclaredOperation};
use crate::domain::{Package, PackageId, PackageStatus, Run, RunId, RunStatus, Scenario, SpecSource};
use crate::events::{EventBus, PackageEvent};
use crate::generator::ScenarioGenerator;
use crate::ports::{Repositories, SpecFetcher};
use crate::qa_summary::QaSummaryEvaluator;
use crate::run_executor::RunExecutor;

pub struct PackageOrchestrator {
    repositories: Repositories,
    spec_fetcher: Arc<dyn SpecFetcher>,
    generator: ScenarioGenerator,
    run_executor: Arc<RunExecutor>,
    qa_evaluator: QaSummaryEvaluator,
    event_bus: Arc<EventBus>,
    /// One mutex per package, serializing its own state transitions without
    /// contending with other packages' orchestrations.
    package_locks: Mutex<HashMap<PackageId, Arc<Mutex<()>>>>,
    max_worker_pool_size: usize,
}

impl PackageOrchestrator {
    pub fn new(
        repositories: Repositories,
        spec_fetcher: Arc<dyn SpecFetcher>,
        generator: ScenarioGenerator,
        run_executor: Arc<RunExecutor>,
        qa_evaluator: QaSummaryEvaluator,
        event_bus: Arc<EventBus>,
        max_worker_pool_size: usize,
    ) -> Self {
        Self {
            repositories,
            spec_fetcher,
            generator,
            run_executor,
            qa_evaluator,
            event_bus,
            package_locks: Mutex::new(HashMap::new()),
            max_worker_pool_size,
        }
    }

    async fn lock_for(&self, package_id: PackageId) -> Arc<Mutex<()>> {
        let mut locks = self.package_locks.lock().await;
        locks.entry(package_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Validates and persists a transition, then emits the corresponding
    /// event. The per-package lock is held only across this in-memory
    /// critical section — never across the HTTP/LLM I/O that produced `to`.
    async fn transition(&self, package: &mut Package, to: PackageStatus) -> anyhow::Result<()> {
        let lock = self.lock_for(package.id).await;
        let _guard = lock.lock().await;

        let from = package.status;
        package.status = from.ensure_transition(to)?;
        package.updated_at = chrono::Utc::now();
        self.repositories.packages.upsert(package.clone()).await?;

        self.event_bus.publish(PackageEvent::PackageStatusChanged {
            package_id: package.id,
            from,
            to,
            at: package.updated_at,
        });
        info!(package_id = %package.id, ?from, ?to, "package transitioned");
        Ok(())
    }

    /// Drives `package` end to end. Any stage failure transitions the
    /// package to its corresponding `FAILED_*` terminal state and returns
    /// the package as-is (never propagates the stage error to the caller;
    /// callers read `package.status` to learn the outcome).
    #[instrument(skip(self, package), fields(package_id = %package.id))]
    pub async fn run(&self, mut package: Package) -> Package {
        let spec_text = match self.resolve_spec(&mut package).await {
            Ok(text) => text,
            Err(e) => {
                warn!(package_id = %package.id, error = %e, "spec fetch failed");
                let _ = self.transition(&mut package, PackageStatus::FailedSpecFetch).await;
                return package;
            }
        };

        let scenarios = match self.generate_scenarios(&mut package, &spec_text).await {
            Ok(scenarios) => scenarios,
            Err(e) => {
                warn!(package_id = %package.id, error = %e, "scenario generation failed");
                let _ = self.transition(&mut package, PackageStatus::FailedGeneration).await;
                return package;
            }
        };

        let runs = match self.execute_scenarios(&mut package, &scenarios).await {
            Ok(runs) => runs,
            Err(e) => {
                warn!(package_id = %package.id, error = %e, "scenario execution failed");
                let _ = self.transition(&mut package, PackageStatus::FailedExecution).await;
                return package;
            }
        };

        if self.transition(&mut package, PackageStatus::ExecutionComplete).await.is_err() {
            return package;
        }

        self.evaluate_quality(&mut package, &runs).await;
        self.calculate_coverage(&mut package, &scenarios, &runs).await;

        let _ = self.transition(&mut package, PackageStatus::Complete).await;
        package.completed_at = Some(chrono::Utc::now());
        let _ = self.repositories.packages.upsert(package.clone()).await;
        package
    }

    async fn resolve_spec(&self, package: &mut Package) -> anyhow::Result<String> {
        let (content, _format) = match &package.spec_source {
            SpecSource::Inline(content) => (content.clone(), "inline".to_string()),
            SpecSource::Url(url) => self.spec_fetcher.fetch(url).await?,
        };

        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        package.spec_hash = Some(format!("{:x}", hasher.finalize()));
        package.started_at = Some(chrono::Utc::now());

        self.transition(package, PackageStatus::SpecFetched).await?;
        Ok(content)
    }

    async fn generate_scenarios(
        &self,
        package: &mut Package,
        spec_text: &str,
    ) -> anyhow::Result<Vec<Scenario>> {
        let mut scenarios = self
            .generator
            .generate(
                spec_text,
                package.requirements.as_deref(),
                &package.config.ai_model,
                package.config.max_scenarios,
                package.config.max_steps_per_scenario,
            )
            .await?;

        for scenario in &mut scenarios {
            scenario.package_id = Some(package.id);
        }
        self.repositories.scenarios.insert_many(scenarios.clone()).await?;

        self.transition(package, PackageStatus::AiSuccess).await?;
        Ok(scenarios)
    }

    /// Launches one `RunExecutor` task per scenario, bounded by a
    /// `Semaphore`-gated worker pool sized `min(scenarioCount, bound)` when
    /// `parallelExecution` is set, else run sequentially. On
    /// `stopOnFirstFailure`, the shared cancellation token is tripped after
    /// the first non-PASSED terminal run, and in-flight tasks observe it at
    /// their next await point.
    async fn execute_scenarios(
        &self,
        package: &mut Package,
        scenarios: &[Scenario],
    ) -> anyhow::Result<Vec<Run>> {
        self.transition(package, PackageStatus::ExecutionInProgress).await?;

        let worker_pool_size = if package.config.parallel_execution {
            scenarios.len().max(1).min(self.max_worker_pool_size)
        } else {
            1
        };
        let semaphore = Arc::new(Semaphore::new(worker_pool_size));
        let cancellation = CancellationToken::new();
        let stop_on_first_failure = package.config.stop_on_first_failure;
        let run_timeout = Duration::from_millis(package.config.timeout_ms);

        let mut join_set = JoinSet::new();
        for scenario in scenarios {
            let semaphore = semaphore.clone();
            let executor = self.run_executor.clone();
            let scenario = scenario.clone();
            let base_url = package.base_url.clone();
            let cancellation_token = cancellation.clone();
            let run_id = RunId::new();

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                executor
                    .execute_run(
                        run_id,
                        scenario.id,
                        &scenario,
                        &base_url,
                        Default::default(),
                        stop_on_first_failure,
                        run_timeout,
                        cancellation_token,
                    )
                    .await
            });
        }

        let mut runs = Vec::with_capacity(scenarios.len());
        while let Some(joined) = join_set.join_next().await {
            let run = joined?;
            self.repositories.runs.upsert(run.clone()).await?;

            let passed_steps = run.steps.iter().filter(|s| s.passed).count();
            self.event_bus.publish(PackageEvent::RunCompleted {
                run_id: run.id,
                package_id: run.package_id,
                status: run.status,
                passed_steps,
                failed_steps: run.steps.len() - passed_steps,
                duration_ms: run.duration_ms().unwrap_or(0) as u64,
            });

            if stop_on_first_failure && run.status != RunStatus::Passed {
                cancellation.cancel();
            }
            runs.push(run);
        }

        Ok(runs)
    }

    async fn evaluate_quality(&self, package: &mut Package, runs: &[Run]) {
        if self.transition(package, PackageStatus::QaEvalInProgress).await.is_err() {
            return;
        }
        let summary = self.qa_evaluator.evaluate(runs, &package.config.ai_model).await;
        package.qa_summary = Some(summary);
        let _ = self.transition(package, PackageStatus::QaEvalDone).await;
    }

    async fn calculate_coverage(&self, package: &mut Package, scenarios: &[Scenario], runs: &[Run]) {
        let operations: Vec<DeclaredOperation> = scenarios
            .iter()
            .flat_map(|s| s.steps.iter())
            .map(|step| DeclaredOperation {
                operation_id: format!("{} {}", step.method, step.endpoint),
                method: step.method,
                path: step.endpoint.clone(),
            })
            .collect();

        let report = CoverageCalculator::calculate(&operations, scenarios, runs);

        const COVERAGE_THRESHOLD: f64 = 80.0;
        if report.coverage_percentage < COVERAGE_THRESHOLD {
            self.event_bus.publish(PackageEvent::CoverageThresholdBreach {
                package_id: package.id,
                coverage_percentage: report.coverage_percentage,
                threshold: COVERAGE_THRESHOLD,
            });
        }

        package.coverage = Some(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PackageConfig, SpecSource};
    use crate::errors::AiClientError;
    use crate::ports::{Repositories, StaticSpecFetcher};
    use crate::resilience::{AiClient, AiResponse, Choice, ChatMessage, ResilienceConfig, ResilientAiClient, Usage};
    use async_trait::async_trait;

    struct ScriptedClient {
        body: String,
    }

    #[async_trait]
    impl AiClient for ScriptedClient {
        async fn complete(&self, _request: crate::resilience::AiRequest) -> Result<AiResponse, AiClientError> {
            Ok(AiResponse {
                id: "1".to_string(),
                model: "m".to_string(),
                choices: vec![Choice {
                    message: ChatMessage {
                        role: "assistant".to_string(),
                        content: self.body.clone(),
                    },
                    finish_reason: "stop".to_string(),
                }],
                usage: Usage { prompt_tokens: 0, completion_tokens: 0, total_tokens: 0 },
            })
        }
        async fn healthy(&self) -> bool {
            true
        }
    }

    fn scripted_client(body: &str) -> Arc<ResilientAiClient> {
        let delegate = Arc::new(ScriptedClient { body: body.to_string() });
        Arc::new(ResilientAiClient::new(delegate, ResilienceConfig::default()))
    }

    fn scenarios_body() -> String {
        serde_json::json!({
            "scenarios": [{
                "name": "happy path",
                "description": null,
                "steps": [{
                    "index": 0,
                    "name": "ping",
                    "method": "GET",
                    "endpoint": "/ping",
                    "headers": [],
                    "body": null,
                    "expected": {"status": 200},
                    "extractions": {},
                    "timeoutMs": 5000
                }]
            }]
        })
        .to_string()
    }

    fn qa_body() -> String {
        serde_json::json!({
            "verdict": "PASS",
            "summary": "all good",
            "findings": [],
            "recommendations": []
        })
        .to_string()
    }

    #[tokio::test]
    async fn failed_spec_fetch_moves_package_to_failed_spec_fetch() {
        let orchestrator = PackageOrchestrator::new(
            Repositories::in_memory(),
            Arc::new(StaticSpecFetcher::new()),
            ScenarioGenerator::new(scripted_client(&scenarios_body())),
            Arc::new(RunExecutor::new()),
            QaSummaryEvaluator::new(scripted_client(&qa_body())),
            Arc::new(EventBus::new()),
            4,
        );

        let package = Package::new(
            "demo".to_string(),
            SpecSource::Url("http://unseeded/spec".to_string()),
            "https://api.example.com".to_string(),
            None,
            PackageConfig::default(),
            "tester".to_string(),
            chrono::Utc::now(),
        )
        .unwrap();

        let result = orchestrator.run(package).await;
        assert_eq!(result.status, PackageStatus::FailedSpecFetch);
    }

    #[tokio::test]
    async fn happy_path_reaches_complete_with_coverage_and_qa_summary() {
        let orchestrator = PackageOrchestrator::new(
            Repositories::in_memory(),
            Arc::new(StaticSpecFetcher::new().with_response("http://x/spec", "openapi: 3.0.0", "yaml")),
            ScenarioGenerator::new(scripted_client(&scenarios_body())),
            Arc::new(RunExecutor::new()),
            QaSummaryEvaluator::new(scripted_client(&qa_body())),
            Arc::new(EventBus::new()),
            4,
        );

        let package = Package::new(
            "demo".to_string(),
            SpecSource::Url("http://x/spec".to_string()),
            "http://127.0.0.1:1".to_string(),
            None,
            PackageConfig::default(),
            "tester".to_string(),
            chrono::Utc::now(),
        )
        .unwrap();

        let result = orchestrator.run(package).await;
        assert_eq!(result.status, PackageStatus::Complete);
        assert!(result.qa_summary.is_some());
        assert!(result.coverage.is_some());
    }
}
