//! # QaSummaryEvaluator (C7)
//!
//! Serializes a compact report of a package's runs and asks C4 for a
//! verdict. Never propagates a failure — an unreachable AI provider or
//! malformed response degrades to a deterministic `INCONCLUSIVE` summary.

use serde::Serialize;

use crate::domain::{QaSummary, QaVerdict, Run};
use crate::resilience::{AiRequest, ChatMessage, ResilientAiClient};

const SYSTEM_PROMPT: &str = "You are a QA analyst. Given a compact JSON report of API test \
runs, respond with a JSON object: verdict (one of PASS, PASS_WITH_WARNINGS, FAIL, ERROR), \
summary (string), findings (array of strings), recommendations (array of strings), \
qualityScore, stabilityScore, securityScore (integers 0-100). Respond with JSON only.";

#[derive(Serialize)]
struct ScenarioExcerpt<'a> {
    scenario_id: String,
    status: &'a crate::domain::RunStatus,
    passed_steps: usize,
    failed_steps: usize,
    failure_excerpts: Vec<String>,
}

#[derive(Serialize)]
struct CompactReport<'a> {
    total_runs: usize,
    passed: usize,
    failed: usize,
    errored: usize,
    scenarios: Vec<ScenarioExcerpt<'a>>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVerdict {
    verdict: String,
    summary: String,
    #[serde(default)]
    findings: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    quality_score: Option<u8>,
    #[serde(default)]
    stability_score: Option<u8>,
    #[serde(default)]
    security_score: Option<u8>,
}

fn parse_verdict(raw: &str) -> Option<QaVerdict> {
    match raw {
        "PASS" => Some(QaVerdict::Pass),
        "PASS_WITH_WARNINGS" => Some(QaVerdict::PassWithWarnings),
        "FAIL" => Some(QaVerdict::Fail),
        "ERROR" => Some(QaVerdict::Error),
        "INCONCLUSIVE" => Some(QaVerdict::Inconclusive),
        _ => None,
    }
}

pub struct QaSummaryEvaluator {
    client: std::sync::Arc<ResilientAiClient>,
}

impl QaSummaryEvaluator {
    pub fn new(client: std::sync::Arc<ResilientAiClient>) -> Self {
        Self { client }
    }

    fn build_report(runs: &[Run]) -> CompactReport<'_> {
        let scenarios = runs
            .iter()
            .map(|run| {
                let passed_steps = run.steps.iter().filter(|s| s.passed).count();
                let failed_steps = run.steps.len() - passed_steps;
                let failure_excerpts = run
                    .steps
                    .iter()
                    .filter(|s| !s.passed)
                    .filter_map(|s| s.error_message.clone().or_else(|| {
                        s.assertions
                            .iter()
                            .find(|a| !a.passed)
                            .and_then(|a| a.message.clone())
                    }))
                    .take(5)
                    .collect();

                ScenarioExcerpt {
                    scenario_id: run.scenario_id.to_string(),
                    status: &run.status,
                    passed_steps,
                    failed_steps,
                    failure_excerpts,
                }
            })
            .collect();

        CompactReport {
            total_runs: runs.len(),
            passed: runs.iter().filter(|r| r.status == crate::domain::RunStatus::Passed).count(),
            failed: runs.iter().filter(|r| r.status == crate::domain::RunStatus::Failed).count(),
            errored: runs.iter().filter(|r| r.status == crate::domain::RunStatus::Error).count(),
            scenarios,
        }
    }

    pub async fn evaluate(&self, runs: &[Run], model: &str) -> QaSummary {
        let report = Self::build_report(runs);
        let report_json = match serde_json::to_string(&report) {
            Ok(s) => s,
            Err(e) => return QaSummary::inconclusive(format!("failed to serialize run report: {}", e)),
        };

        let request = AiRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: report_json,
                },
            ],
            temperature: 0.0,
            max_tokens: 2048,
            stream: false,
            response_format: Some("json_object".to_string()),
        };

        let response = self.client.complete(request).await;
        let content = match response.first_content() {
            Some(c) => c,
            None => return QaSummary::inconclusive("AI provider returned no content"),
        };

        let raw: RawVerdict = match serde_json::from_str(content) {
            Ok(r) => r,
            Err(e) => return QaSummary::inconclusive(format!("invalid verdict JSON: {}", e)),
        };

        let verdict = match parse_verdict(&raw.verdict) {
            Some(v) => v,
            None => return QaSummary::inconclusive(format!("unrecognized verdict '{}'", raw.verdict)),
        };

        let mut summary = QaSummary {
            verdict,
            summary: raw.summary,
            passed_count: report.passed,
            failed_count: report.failed,
            error_count: report.errored,
            findings: raw.findings,
            recommendations: raw.recommendations,
            quality_score: raw.quality_score,
            stability_score: raw.stability_score,
            security_score: raw.security_score,
        };
        summary.clamp_scores();
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunId, RunStatus, ScenarioId};
    use crate::resilience::{AiClient, AiResponse, Choice, ResilienceConfig, Usage};
    use crate::errors::AiClientError;
    use async_trait::async_trait;

    struct ScriptedClient {
        body: String,
    }

    #[async_trait]
    impl AiClient for ScriptedClient {
        async fn complete(&self, _request: AiRequest) -> Result<AiResponse, AiClientError> {
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

    fn make_evaluator(body: &str) -> QaSummaryEvaluator {
        let delegate = std::sync::Arc::new(ScriptedClient { body: body.to_string() });
        let client = std::sync::Arc::new(ResilientAiClient::new(delegate, ResilienceConfig::default()));
        QaSummaryEvaluator::new(client)
    }

    fn make_run(status: RunStatus) -> Run {
        Run {
            id: RunId::new(),
            scenario_id: ScenarioId::new(),
            package_id: None,
            triggered_by: "t".to_string(),
            base_url: "https://x".to_string(),
            status,
            environment: Default::default(),
            steps: vec![],
            started_at: chrono::Utc::now(),
            completed_at: Some(chrono::Utc::now()),
        }
    }

    #[tokio::test]
    async fn valid_response_produces_clamped_summary() {
        let body = serde_json::json!({
            "verdict": "PASS_WITH_WARNINGS",
            "summary": "mostly fine",
            "findings": ["slow endpoint"],
            "recommendations": ["add caching"],
            "qualityScore": 250,
            "stabilityScore": 80,
            "securityScore": 90
        })
        .to_string();

        let evaluator = make_evaluator(&body);
        let runs = vec![make_run(RunStatus::Passed)];
        let summary = evaluator.evaluate(&runs, "gpt-4o-mini").await;

        assert_eq!(summary.verdict, QaVerdict::PassWithWarnings);
        assert_eq!(summary.quality_score, Some(100));
    }

    #[tokio::test]
    async fn malformed_json_falls_back_to_inconclusive() {
        let evaluator = make_evaluator("not json");
        let runs = vec![make_run(RunStatus::Failed)];
        let summary = evaluator.evaluate(&runs, "gpt-4o-mini").await;

        assert_eq!(summary.verdict, QaVerdict::Inconclusive);
    }

    #[tokio::test]
    async fn unknown_verdict_string_falls_back_to_inconclusive() {
        let body = serde_json::json!({"verdict": "MAYBE", "summary": "?"}).to_string();
        let evaluator = make_evaluator(&body);
        let runs = vec![make_run(RunStatus::Passed)];
        let summary = evaluator.evaluate(&runs, "gpt-4o-mini").await;

        assert_eq!(summary.verdict, QaVerdict::Inconclusive);
    }
}
