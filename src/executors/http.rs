//! # HttpStepExecutor (C2)
//!
//! Dispatches one `Step` over HTTP and produces a `StepResult`. Never
//! returns an `Err` for request-level failures — timeouts, transport
//! errors, and oversized bodies are all represented as fields on the
//! `StepResult` itself, per the error-handling design (step-level failures
//! are absorbed, not propagated).

use std::time::{Duration, Instant};

use reqwest::{Client, Method};
use serde_json::Value;
use tracing::instrument;

use crate::assertions;
use crate::context::Context;
use crate::domain::{AssertionResult, HttpMethod, RunId, Step, StepResult};

/// Response bodies larger than this are rejected rather than buffered
/// unbounded (§6 default).
const MAX_RESPONSE_BODY_BYTES: usize = 16 * 1024 * 1024;

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
        HttpMethod::Head => Method::HEAD,
        HttpMethod::Options => Method::OPTIONS,
    }
}

pub struct HttpStepExecutor {
    client: Client,
}

impl Default for HttpStepExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpStepExecutor {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    fn build_url(base_url: &str, resolved_endpoint: &str) -> String {
        if resolved_endpoint.starts_with("http://") || resolved_endpoint.starts_with("https://") {
            resolved_endpoint.to_string()
        } else {
            format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                resolved_endpoint.trim_start_matches('/')
            )
        }
    }

    /// Executes `step` against `base_url`, resolving templates through
    /// `context`. `run_id`/`step.index`/`step.name` are carried onto the
    /// returned `StepResult` for correlation; `context` is read but not
    /// mutated here — callers (C6) merge `extracted_values` back in between
    /// steps.
    #[instrument(skip(self, step, context), fields(run_id = %run_id, step_index = step.index))]
    pub async fn execute(
        &self,
        run_id: RunId,
        step: &Step,
        base_url: &str,
        context: &Context,
    ) -> StepResult {
        let started = Instant::now();
        let executed_at = chrono::Utc::now();

        let resolved_endpoint = context.resolve(&step.endpoint);
        let url = Self::build_url(base_url, &resolved_endpoint);

        let resolved_headers: Vec<(String, String)> = step
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), context.resolve(v)))
            .collect();

        let resolved_body = step.body.as_ref().map(|b| context.resolve(b));

        let mut request = self
            .client
            .request(to_reqwest_method(step.method), &url)
            .timeout(Duration::from_millis(step.timeout_ms));

        for (name, value) in &resolved_headers {
            request = request.header(name, value);
        }
        if let Some(body) = &resolved_body {
            request = request.body(body.clone());
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                return Self::failure_result(
                    run_id,
                    step,
                    started,
                    executed_at,
                    format!("Request timed out after {}ms", step.timeout_ms),
                );
            }
            Err(e) => {
                return Self::failure_result(
                    run_id,
                    step,
                    started,
                    executed_at,
                    e.to_string(),
                );
            }
        };

        let actual_status = response.status().as_u16();
        let actual_headers: std::collections::BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();

        if let Some(len) = response.content_length() {
            if len as usize > MAX_RESPONSE_BODY_BYTES {
                return Self::failure_result(
                    run_id,
                    step,
                    started,
                    executed_at,
                    "response body exceeds limit".to_string(),
                );
            }
        }

        let raw_body = match response.bytes().await {
            Ok(bytes) if bytes.len() > MAX_RESPONSE_BODY_BYTES => {
                return Self::failure_result(
                    run_id,
                    step,
                    started,
                    executed_at,
                    "response body exceeds limit".to_string(),
                );
            }
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                return Self::failure_result(run_id, step, started, executed_at, e.to_string());
            }
        };

        let body_json: Value = serde_json::from_str(&raw_body).unwrap_or(Value::Null);

        let assertions: Vec<AssertionResult> = assertions::evaluate(
            &step.expected,
            actual_status,
            &raw_body,
            &body_json,
            &resolved_headers,
        );
        let all_passed = assertions.iter().all(|a| a.passed);

        let extracted_values = Self::apply_extractions(step, &body_json);

        StepResult {
            run_id,
            step_index: step.index,
            step_name: step.name.clone(),
            actual_status: Some(actual_status),
            actual_headers,
            actual_body: Some(body_json),
            passed: all_passed,
            assertions,
            extracted_values,
            error_message: None,
            duration_ms: started.elapsed().as_millis() as u64,
            executed_at,
        }
    }

    /// Reads each extraction's JSON path out of the response body. A
    /// missing or null value is simply omitted, never an error.
    fn apply_extractions(
        step: &Step,
        body: &Value,
    ) -> std::collections::BTreeMap<String, Value> {
        let mut extracted = std::collections::BTreeMap::new();
        for (name, path) in &step.extractions {
            if let Some(value) = assertions::get_json_path(body, path) {
                if !value.is_null() {
                    extracted.insert(name.clone(), value.clone());
                }
            }
        }
        extracted
    }

    fn failure_result(
        run_id: RunId,
        step: &Step,
        started: Instant,
        executed_at: chrono::DateTime<chrono::Utc>,
        error_message: String,
    ) -> StepResult {
        StepResult {
            run_id,
            step_index: step.index,
            step_name: step.name.clone(),
            actual_status: None,
            actual_headers: std::collections::BTreeMap::new(),
            actual_body: None,
            passed: false,
            assertions: Vec::new(),
            extracted_values: std::collections::BTreeMap::new(),
            error_message: Some(error_message),
            duration_ms: started.elapsed().as_millis() as u64,
            executed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExpectedResult;

    fn make_step(index: usize, endpoint: &str, expected: ExpectedResult) -> Step {
        Step {
            index,
            name: format!("step-{}", index),
            method: HttpMethod::Get,
            endpoint: endpoint.to_string(),
            headers: vec![],
            body: None,
            expected,
            extractions: Default::default(),
            timeout_ms: 5000,
        }
    }

    #[test]
    fn build_url_joins_base_and_relative_endpoint() {
        let url = HttpStepExecutor::build_url("https://api.example.com", "/pets/1");
        assert_eq!(url, "https://api.example.com/pets/1");
    }

    #[test]
    fn build_url_passes_through_absolute_endpoint() {
        let url = HttpStepExecutor::build_url("https://api.example.com", "https://other.com/x");
        assert_eq!(url, "https://other.com/x");
    }

    #[test]
    fn apply_extractions_omits_missing_and_null_paths() {
        let mut extractions = std::collections::BTreeMap::new();
        extractions.insert("id".to_string(), "data.id".to_string());
        extractions.insert("missing".to_string(), "data.nope".to_string());
        extractions.insert("explicit_null".to_string(), "data.deleted_at".to_string());

        let mut step = make_step(0, "/x", ExpectedResult::default());
        step.extractions = extractions;

        let body = serde_json::json!({"data": {"id": 42, "deleted_at": null}});
        let extracted = HttpStepExecutor::apply_extractions(&step, &body);

        assert_eq!(extracted.get("id"), Some(&serde_json::json!(42)));
        assert!(!extracted.contains_key("missing"));
        assert!(!extracted.contains_key("explicit_null"));
    }

    #[tokio::test]
    async fn connect_error_produces_error_step_result_not_panic() {
        let executor = HttpStepExecutor::new();
        let step = make_step(0, "/x", ExpectedResult::default());
        let context = Context::new();

        let result = executor
            .execute(RunId::new(), &step, "http://127.0.0.1:1", &context)
            .await;

        assert!(!result.passed);
        assert!(result.error_message.is_some());
        assert!(result.actual_status.is_none());
    }
}
