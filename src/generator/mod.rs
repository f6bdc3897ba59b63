//! # ScenarioGenerator (C5)
//!
//! Turns (spec, requirements, limits) into a validated list of `Scenario`s
//! by prompting the resilient AI client (C4) for a JSON document and
//! structurally validating every scenario it returns.

use serde::Deserialize;
use serde_json::Value;

use crate::domain::{Scenario, ScenarioSource, ScenarioStatus, Step};
use crate::errors::GenerationError;
use crate::resilience::{AiRequest, ChatMessage, ResilientAiClient};

const SYSTEM_PROMPT: &str = "You are an API test scenario generator. Given an OpenAPI \
specification and optional requirements, emit a JSON object with a single key \
\"scenarios\", an array of test scenario objects. Each scenario has: name, \
description, steps (an array of step objects). Each step has: index (0-based, \
contiguous), name, method (GET/POST/PUT/PATCH/DELETE/HEAD/OPTIONS), endpoint, \
headers (array of [name, value] pairs), body (string or null), expected \
(status, statusRange, bodyContains, fieldMatchers, headers), extractions (map \
of name to JSON path), timeoutMs. Respond with JSON only, no prose.";

/// Mirrors the wire shape the LLM is instructed to emit; deserialized, then
/// converted into domain `Scenario`s one at a time so a single malformed
/// scenario doesn't sink the whole batch.
#[derive(Debug, Deserialize)]
struct GeneratedScenarios {
    scenarios: Vec<GeneratedScenario>,
}

#[derive(Debug, Deserialize)]
struct GeneratedScenario {
    name: String,
    description: Option<String>,
    steps: Vec<Step>,
}

pub struct ScenarioGenerator {
    client: std::sync::Arc<ResilientAiClient>,
}

impl ScenarioGenerator {
    pub fn new(client: std::sync::Arc<ResilientAiClient>) -> Self {
        Self { client }
    }

    fn build_prompt(spec_text: &str, requirements: Option<&str>) -> String {
        let mut prompt = format!("API specification:\n{}\n", spec_text);
        if let Some(r) = requirements {
            prompt.push_str(&format!("\nAdditional requirements:\n{}\n", r));
        }
        prompt
    }

    /// Calls C4 with `responseFormat = JSON`, parses and validates the
    /// result, truncating to `max_scenarios`. Raises `GenerationError` on
    /// unparseable JSON or zero surviving scenarios; callers move the owning
    /// package to `FAILED_GENERATION`.
    pub async fn generate(
        &self,
        spec_text: &str,
        requirements: Option<&str>,
        model: &str,
        max_scenarios: usize,
        max_steps_per_scenario: usize,
    ) -> Result<Vec<Scenario>, GenerationError> {
        let request = AiRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: Self::build_prompt(spec_text, requirements),
                },
            ],
            temperature: 0.2,
            max_tokens: 4096,
            stream: false,
            response_format: Some("json_object".to_string()),
        };

        let response = self.client.complete(request).await;
        let content = response.first_content().unwrap_or("{}");
        parse_and_validate(content, max_scenarios, max_steps_per_scenario)
    }
}

/// Parses a `{"scenarios": [...]}` document and keeps only the scenarios
/// that pass `Scenario::validate`, dropping and logging the rest. Shared by
/// `generate` (LLM output) and the CLI's `validate` subcommand (a file on
/// disk, no LLM call involved) so both apply identical structural rules.
fn parse_and_validate(
    content: &str,
    max_scenarios: usize,
    max_steps_per_scenario: usize,
) -> Result<Vec<Scenario>, GenerationError> {
    let parsed: Value = serde_json::from_str(content).map_err(GenerationError::InvalidJson)?;
    let generated: GeneratedScenarios =
        serde_json::from_value(parsed).map_err(GenerationError::InvalidJson)?;

    let mut valid = Vec::new();
    for candidate in generated.scenarios {
        let scenario = Scenario {
            id: crate::domain::ScenarioId::new(),
            package_id: None,
            suite_id: None,
            name: candidate.name,
            description: candidate.description,
            steps: candidate.steps,
            tags: Default::default(),
            source: ScenarioSource::AiGenerated,
            status: ScenarioStatus::Active,
        };

        match scenario.validate(max_steps_per_scenario) {
            Ok(()) => valid.push(scenario),
            Err(e) => {
                tracing::warn!(scenario = %scenario.name, error = %e, "rejecting invalid scenario");
            }
        }

        if valid.len() >= max_scenarios {
            break;
        }
    }

    if valid.is_empty() {
        return Err(GenerationError::NoValidScenarios);
    }

    valid.truncate(max_scenarios);
    Ok(valid)
}

/// Structural-only validation for a scenarios document already on disk —
/// no LLM call, used by the CLI's `validate` subcommand.
pub fn validate_scenarios_document(
    content: &str,
    max_scenarios: usize,
    max_steps_per_scenario: usize,
) -> Result<Vec<Scenario>, GenerationError> {
    parse_and_validate(content, max_scenarios, max_steps_per_scenario)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{AiClient, AiResponse, Choice, ResilienceConfig, Usage};
    use async_trait::async_trait;
    use crate::errors::AiClientError;

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
                usage: Usage {
                    prompt_tokens: 0,
                    completion_tokens: 0,
                    total_tokens: 0,
                },
            })
        }

        async fn healthy(&self) -> bool {
            true
        }
    }

    fn make_generator(body: &str) -> ScenarioGenerator {
        let delegate = std::sync::Arc::new(ScriptedClient { body: body.to_string() });
        let client = std::sync::Arc::new(ResilientAiClient::new(delegate, ResilienceConfig::default()));
        ScenarioGenerator::new(client)
    }

    #[tokio::test]
    async fn rejects_non_json_response_with_invalid_json_error() {
        let generator = make_generator("not json at all");
        let result = generator.generate("spec", None, "m", 10, 10).await;
        assert!(matches!(result, Err(GenerationError::InvalidJson(_))));
    }

    #[tokio::test]
    async fn filters_out_invalid_scenarios_and_keeps_valid_ones() {
        let body = serde_json::json!({
            "scenarios": [
                {
                    "name": "happy path",
                    "description": null,
                    "steps": [
                        {
                            "index": 0,
                            "name": "get pet",
                            "method": "GET",
                            "endpoint": "/pets/1",
                            "headers": [],
                            "body": null,
                            "expected": {"status": 200},
                            "extractions": {},
                            "timeoutMs": 5000
                        }
                    ]
                },
                {
                    "name": "broken indices",
                    "description": null,
                    "steps": [
                        {
                            "index": 0,
                            "name": "a",
                            "method": "GET",
                            "endpoint": "/a",
                            "headers": [],
                            "body": null,
                            "expected": {},
                            "extractions": {},
                            "timeoutMs": 5000
                        },
                        {
                            "index": 5,
                            "name": "b",
                            "method": "GET",
                            "endpoint": "/b",
                            "headers": [],
                            "body": null,
                            "expected": {},
                            "extractions": {},
                            "timeoutMs": 5000
                        }
                    ]
                }
            ]
        })
        .to_string();

        let generator = make_generator(&body);
        let scenarios = generator.generate("spec", None, "m", 10, 10).await.unwrap();
        assert_eq!(scenarios.len(), 1);
        assert_eq!(scenarios[0].name, "happy path");
    }

    #[tokio::test]
    async fn truncates_to_max_scenarios() {
        let scenarios_json: Vec<Value> = (0..5)
            .map(|i| {
                serde_json::json!({
                    "name": format!("scenario {}", i),
                    "description": null,
                    "steps": [
                        {
                            "index": 0,
                            "name": "a",
                            "method": "GET",
                            "endpoint": "/a",
                            "headers": [],
                            "body": null,
                            "expected": {},
                            "extractions": {},
                            "timeoutMs": 5000
                        }
                    ]
                })
            })
            .collect();
        let body = serde_json::json!({ "scenarios": scenarios_json }).to_string();

        let generator = make_generator(&body);
        let scenarios = generator.generate("spec", None, "m", 2, 10).await.unwrap();
        assert_eq!(scenarios.len(), 2);
    }

    #[tokio::test]
    async fn zero_valid_scenarios_is_an_error() {
        let body = serde_json::json!({ "scenarios": [] }).to_string();
        let generator = make_generator(&body);
        let result = generator.generate("spec", None, "m", 10, 10).await;
        assert!(matches!(result, Err(GenerationError::NoValidScenarios)));
    }
}
