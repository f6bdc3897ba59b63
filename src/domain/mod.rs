//! # Domain Model
//!
//! The entities the orchestrator operates on: `Package` is the aggregate
//! root, owning `Scenario`s and `Run`s by id reference (no cyclic pointer
//! graphs — cleanup cascades through the repository ports, not destructors).
//!
//! Everything here is a plain value object. Mutation happens by replacing a
//! field and re-persisting through a repository port; nothing in this module
//! talks to I/O.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::{InvalidStatusTransition, ValidationError};

/// Declares an opaque 128-bit identifier newtype, serialized as its
/// canonical UUID text form.
macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

id_type!(PackageId);
id_type!(ScenarioId);
id_type!(RunId);
id_type!(WebhookId);

// ============================================================================
// PACKAGE
// ============================================================================

/// Where a package's OpenAPI spec comes from. Exactly one of these is
/// present on a valid `Package` (see `Package::validate`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpecSource {
    Url(String),
    Inline(String),
}

/// The 12-state orchestration lifecycle. Transitions are validated by
/// `ensure_transition` — anything outside the graph in §4.9 raises
/// `InvalidStatusTransition` rather than silently succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageStatus {
    Requested,
    SpecFetched,
    AiSuccess,
    ExecutionInProgress,
    ExecutionComplete,
    QaEvalInProgress,
    QaEvalDone,
    Complete,
    FailedSpecFetch,
    FailedGeneration,
    FailedExecution,
    Cancelled,
}

impl PackageStatus {
    /// Whether this status forbids any further outgoing transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PackageStatus::Complete
                | PackageStatus::FailedSpecFetch
                | PackageStatus::FailedGeneration
                | PackageStatus::FailedExecution
                | PackageStatus::Cancelled
        )
    }

    fn allowed_targets(&self) -> &'static [PackageStatus] {
        use PackageStatus::*;
        match self {
            Requested => &[SpecFetched, FailedSpecFetch, Cancelled],
            SpecFetched => &[AiSuccess, FailedGeneration, Cancelled],
            AiSuccess => &[ExecutionInProgress, FailedExecution, Cancelled],
            ExecutionInProgress => &[ExecutionComplete, FailedExecution, Cancelled],
            ExecutionComplete => &[QaEvalInProgress, Complete, Cancelled],
            QaEvalInProgress => &[QaEvalDone, Complete, Cancelled],
            QaEvalDone => &[Complete],
            Complete | FailedSpecFetch | FailedGeneration | FailedExecution | Cancelled => &[],
        }
    }

    /// Validates `self -> to` against the allowed graph, returning the new
    /// status on success. This never mutates anything itself; callers
    /// persist the result atomically with the event it causes.
    pub fn ensure_transition(
        self,
        to: PackageStatus,
    ) -> Result<PackageStatus, InvalidStatusTransition> {
        if self.allowed_targets().contains(&to) {
            Ok(to)
        } else {
            Err(InvalidStatusTransition { from: self, to })
        }
    }
}

/// Tunables for one orchestration run, supplied at package creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageConfig {
    pub max_scenarios: usize,
    pub max_steps_per_scenario: usize,
    pub timeout_ms: u64,
    pub parallel_execution: bool,
    pub stop_on_first_failure: bool,
    pub include_security_tests: bool,
    pub ai_provider: String,
    pub ai_model: String,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            max_scenarios: 10,
            max_steps_per_scenario: 10,
            timeout_ms: 300_000,
            parallel_execution: true,
            stop_on_first_failure: false,
            include_security_tests: false,
            ai_provider: "openai".to_string(),
            ai_model: "gpt-4o-mini".to_string(),
        }
    }
}

/// The orchestration aggregate root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub id: PackageId,
    pub name: String,
    pub description: Option<String>,
    pub spec_source: SpecSource,
    /// SHA-256 hex digest of the spec content, used for dedup/correlation.
    /// Populated once the spec has been fetched (`SPEC_FETCHED` onward).
    pub spec_hash: Option<String>,
    pub base_url: String,
    pub requirements: Option<String>,
    pub status: PackageStatus,
    pub config: PackageConfig,
    pub coverage: Option<CoverageReport>,
    pub qa_summary: Option<QaSummary>,
    pub triggered_by: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Package {
    pub fn new(
        name: String,
        spec_source: SpecSource,
        base_url: String,
        requirements: Option<String>,
        config: PackageConfig,
        triggered_by: String,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Self, ValidationError> {
        let pkg = Self {
            id: PackageId::new(),
            name,
            description: None,
            spec_source,
            spec_hash: None,
            base_url,
            requirements,
            status: PackageStatus::Requested,
            config,
            coverage: None,
            qa_summary: None,
            triggered_by,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        pkg.validate()?;
        Ok(pkg)
    }

    /// Checks the invariants from §3 that don't depend on lifecycle state:
    /// non-blank name/baseUrl, a present spec source, and sane timestamp
    /// ordering once the relevant fields are populated.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::BlankName);
        }
        if self.base_url.trim().is_empty() {
            return Err(ValidationError::BlankBaseUrl);
        }
        match &self.spec_source {
            SpecSource::Url(u) if u.trim().is_empty() => {
                return Err(ValidationError::MissingSpecSource)
            }
            SpecSource::Inline(c) if c.trim().is_empty() => {
                return Err(ValidationError::MissingSpecSource)
            }
            _ => {}
        }
        if let (Some(started), Some(completed)) = (self.started_at, self.completed_at) {
            debug_assert!(completed >= started, "completedAt must be >= startedAt");
        }
        Ok(())
    }
}

// ============================================================================
// SCENARIO & STEP
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioSource {
    AiGenerated,
    Manual,
    Imported,
}

/// Minimal lifecycle for a scenario as a standalone catalog entry; the
/// orchestrator itself only ever creates scenarios in `Active` state and
/// does not drive this field (see DESIGN.md's note on the open question).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioStatus {
    Active,
    Archived,
}

impl Default for ScenarioStatus {
    fn default() -> Self {
        ScenarioStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl FromStr for HttpMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(ValidationError::UnknownMethod(other.to_string())),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        };
        write!(f, "{}", s)
    }
}

/// A tagged-union matcher applied to a single JSON-path-addressed field.
/// The wire form uses a `type` discriminator with `value`/`pattern`/`values`
/// siblings depending on variant, per the design notes on sum types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FieldMatcher {
    #[serde(rename = "EXACT")]
    Exact { value: Value },
    #[serde(rename = "ANY_PRESENT")]
    AnyPresent,
    #[serde(rename = "REGEX")]
    Regex { pattern: String },
    #[serde(rename = "GREATER_THAN")]
    GreaterThan { value: f64 },
    #[serde(rename = "LESS_THAN")]
    LessThan { value: f64 },
    #[serde(rename = "ONE_OF")]
    OneOf { values: Vec<Value> },
    #[serde(rename = "NOT_NULL")]
    NotNull,
    #[serde(rename = "IS_NULL")]
    IsNull,
}

/// Conjunction of constraints a `StepResult` must satisfy to pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedResult {
    pub status: Option<u16>,
    pub status_range: Option<(u16, u16)>,
    #[serde(default)]
    pub body_contains: Vec<String>,
    /// JSON path (dotted, `[i]` subscripts) -> matcher.
    #[serde(default)]
    pub field_matchers: BTreeMap<String, FieldMatcher>,
    /// Header name (case-insensitive match at evaluation time) -> exact value.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// One HTTP action plus its expected result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub index: usize,
    pub name: String,
    pub method: HttpMethod,
    /// Path template, may contain `${var}` placeholders resolved against the
    /// `ExecutionContext` before dispatch.
    pub endpoint: String,
    /// Insertion order is preserved for reproducible dispatch.
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub expected: ExpectedResult,
    /// Extraction name -> JSON path read from the response body.
    #[serde(default)]
    pub extractions: BTreeMap<String, String>,
    pub timeout_ms: u64,
}

impl Step {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.endpoint.len() > 2000 {
            return Err(ValidationError::EndpointTooLong(self.endpoint.len()));
        }
        if !(100..=300_000).contains(&self.timeout_ms) {
            return Err(ValidationError::TimeoutOutOfRange { ms: self.timeout_ms });
        }
        Ok(())
    }
}

/// A named, ordered sequence of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub id: ScenarioId,
    pub package_id: Option<PackageId>,
    pub suite_id: Option<Uuid>,
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<Step>,
    pub tags: std::collections::BTreeSet<String>,
    pub source: ScenarioSource,
    #[serde(default)]
    pub status: ScenarioStatus,
}

impl Scenario {
    /// Checks step-index contiguity (canonical order, starting at 0) and the
    /// `maxStepsPerScenario` bound. Individual step invariants are checked
    /// separately via `Step::validate`.
    pub fn validate(&self, max_steps_per_scenario: usize) -> Result<(), ValidationError> {
        if self.steps.is_empty() {
            return Err(ValidationError::EmptySteps);
        }
        if self.steps.len() > max_steps_per_scenario {
            return Err(ValidationError::TooManySteps {
                actual: self.steps.len(),
                max: max_steps_per_scenario,
            });
        }
        let mut seen = std::collections::HashSet::new();
        for (expected_index, step) in self.steps.iter().enumerate() {
            if !seen.insert(step.index) {
                return Err(ValidationError::DuplicateStepIndex {
                    index: expected_index,
                    duplicate: step.index,
                });
            }
            if step.index != expected_index {
                return Err(ValidationError::NonContiguousStepIndex { at: expected_index });
            }
            step.validate()?;
        }
        Ok(())
    }
}

// ============================================================================
// RUN & STEP RESULT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Running,
    Passed,
    Failed,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Queued | RunStatus::Running)
    }
}

/// `(type, field?, expected?, actual?, passed, message?)` — one matcher's
/// evaluation outcome against a single `StepResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub field: Option<String>,
    pub expected: Option<Value>,
    pub actual: Option<Value>,
    pub passed: bool,
    pub message: Option<String>,
}

/// One step's outcome within a `Run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub run_id: RunId,
    pub step_index: usize,
    pub step_name: String,
    pub actual_status: Option<u16>,
    #[serde(default)]
    pub actual_headers: BTreeMap<String, String>,
    pub actual_body: Option<Value>,
    pub passed: bool,
    pub assertions: Vec<AssertionResult>,
    #[serde(default)]
    pub extracted_values: BTreeMap<String, Value>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub executed_at: chrono::DateTime<chrono::Utc>,
}

impl StepResult {
    /// P3: `passed` iff there's no error and every assertion passed.
    pub fn is_coherent(&self) -> bool {
        self.passed == (self.error_message.is_none() && self.assertions.iter().all(|a| a.passed))
    }

    /// Whether `error_message` (if any) represents a timeout rather than a
    /// hard transport/assertion error — timeouts don't abort the scenario.
    pub fn is_timeout(&self) -> bool {
        self.error_message
            .as_deref()
            .map(|m| m.contains("timed out"))
            .unwrap_or(false)
    }
}

/// One execution of a `Scenario`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub scenario_id: ScenarioId,
    pub package_id: Option<PackageId>,
    pub triggered_by: String,
    pub base_url: String,
    pub status: RunStatus,
    pub environment: BTreeMap<String, String>,
    pub steps: Vec<StepResult>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Run {
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }

    /// P4: rollup rule — ERROR beats FAILED beats PASSED.
    pub fn rollup_status(steps: &[StepResult]) -> RunStatus {
        if steps
            .iter()
            .any(|s| s.error_message.is_some() && !s.is_timeout())
        {
            RunStatus::Error
        } else if steps.iter().any(|s| !s.passed) {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        }
    }
}

// ============================================================================
// COVERAGE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoverageStatus {
    Covered,
    Failing,
    Untested,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationCoverage {
    pub operation_id: String,
    pub method: HttpMethod,
    pub path: String,
    pub status: CoverageStatus,
    pub scenario_ids: Vec<ScenarioId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageReport {
    pub total_operations: usize,
    pub covered_operations: usize,
    pub coverage_percentage: f64,
    pub operations: Vec<OperationCoverage>,
    pub gaps: Vec<String>,
}

// ============================================================================
// QA SUMMARY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QaVerdict {
    Pass,
    PassWithWarnings,
    Fail,
    Error,
    Inconclusive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QaSummary {
    pub verdict: QaVerdict,
    pub summary: String,
    pub passed_count: usize,
    pub failed_count: usize,
    pub error_count: usize,
    pub findings: Vec<String>,
    pub recommendations: Vec<String>,
    pub quality_score: Option<u8>,
    pub stability_score: Option<u8>,
    pub security_score: Option<u8>,
}

impl QaSummary {
    /// The deterministic fallback used when C7 cannot reach the AI
    /// provider or the response fails to parse.
    pub fn inconclusive(reason: impl Into<String>) -> Self {
        Self {
            verdict: QaVerdict::Inconclusive,
            summary: reason.into(),
            passed_count: 0,
            failed_count: 0,
            error_count: 0,
            findings: Vec::new(),
            recommendations: Vec::new(),
            quality_score: None,
            stability_score: None,
            security_score: None,
        }
    }

    /// Clamps risk scores into the documented 0..100 range.
    pub fn clamp_scores(&mut self) {
        self.quality_score = self.quality_score.map(|v| v.min(100));
        self.stability_score = self.stability_score.map(|v| v.min(100));
        self.security_score = self.security_score.map(|v| v.min(100));
    }
}

// ============================================================================
// WEBHOOKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookType {
    Slack,
    Generic,
    Email,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookEventType {
    RunCompleted,
    RunFailed,
    CoverageThresholdBreach,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub id: WebhookId,
    pub name: String,
    pub url: String,
    #[serde(rename = "type")]
    pub webhook_type: WebhookType,
    pub subscribed_events: std::collections::BTreeSet<WebhookEventType>,
    pub headers: BTreeMap<String, String>,
    pub secret: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookDeliveryStatus {
    Pending,
    Success,
    Failed,
    Retrying,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_id: WebhookId,
    pub event_type: WebhookEventType,
    pub payload: String,
    pub status: WebhookDeliveryStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<chrono::DateTime<chrono::Utc>>,
    pub next_retry_at: Option<chrono::DateTime<chrono::Utc>>,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl WebhookDelivery {
    const MAX_ATTEMPTS: u32 = 3;
    const RESPONSE_BODY_CAP: usize = 1000;

    pub fn new(
        webhook_id: WebhookId,
        event_type: WebhookEventType,
        payload: String,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            webhook_id,
            event_type,
            payload,
            status: WebhookDeliveryStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            next_retry_at: None,
            response_status: None,
            response_body: None,
            error_message: None,
            created_at: now,
            completed_at: None,
        }
    }

    fn truncate_body(body: &str) -> String {
        if body.len() <= Self::RESPONSE_BODY_CAP {
            body.to_string()
        } else {
            body.chars().take(Self::RESPONSE_BODY_CAP).collect()
        }
    }

    /// Records a 2xx response as a terminal success.
    pub fn record_success(
        &mut self,
        status: u16,
        body: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        self.attempt_count += 1;
        self.last_attempt_at = Some(now);
        self.status = WebhookDeliveryStatus::Success;
        self.response_status = Some(status);
        self.response_body = Some(Self::truncate_body(body));
        self.completed_at = Some(now);
    }

    /// Records a non-2xx response or transport error. Schedules a retry
    /// with `30s * 2^min(attempt, 5)` backoff unless the attempt budget
    /// (P5: at most 3 attempts) is exhausted.
    pub fn record_failure(
        &mut self,
        response_status: Option<u16>,
        body: Option<&str>,
        error_message: Option<String>,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        self.attempt_count += 1;
        self.last_attempt_at = Some(now);
        self.response_status = response_status;
        self.response_body = body.map(Self::truncate_body);
        self.error_message = error_message;

        if self.attempt_count < Self::MAX_ATTEMPTS {
            self.status = WebhookDeliveryStatus::Retrying;
            let backoff_secs = 30 * 2i64.pow(self.attempt_count.min(5));
            self.next_retry_at = Some(now + chrono::Duration::seconds(backoff_secs));
        } else {
            self.status = WebhookDeliveryStatus::Failed;
            self.next_retry_at = None;
            self.completed_at = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn package_status_graph_rejects_skipping_stages() {
        let result = PackageStatus::Requested.ensure_transition(PackageStatus::ExecutionInProgress);
        assert!(result.is_err());
    }

    #[test]
    fn package_status_graph_allows_documented_path() {
        let s = PackageStatus::Requested
            .ensure_transition(PackageStatus::SpecFetched)
            .unwrap();
        let s = s.ensure_transition(PackageStatus::AiSuccess).unwrap();
        let s = s.ensure_transition(PackageStatus::ExecutionInProgress).unwrap();
        let s = s.ensure_transition(PackageStatus::ExecutionComplete).unwrap();
        let s = s.ensure_transition(PackageStatus::QaEvalInProgress).unwrap();
        let s = s.ensure_transition(PackageStatus::QaEvalDone).unwrap();
        let s = s.ensure_transition(PackageStatus::Complete).unwrap();
        assert!(s.is_terminal());
    }

    #[test]
    fn terminal_states_reject_everything() {
        assert!(PackageStatus::Complete
            .ensure_transition(PackageStatus::Requested)
            .is_err());
        assert!(PackageStatus::Cancelled
            .ensure_transition(PackageStatus::SpecFetched)
            .is_err());
    }

    #[test]
    fn scenario_rejects_non_contiguous_indices() {
        let scenario = Scenario {
            id: ScenarioId::new(),
            package_id: None,
            suite_id: None,
            name: "s".into(),
            description: None,
            steps: vec![
                Step {
                    index: 0,
                    name: "a".into(),
                    method: HttpMethod::Get,
                    endpoint: "/x".into(),
                    headers: vec![],
                    body: None,
                    expected: ExpectedResult::default(),
                    extractions: BTreeMap::new(),
                    timeout_ms: 1000,
                },
                Step {
                    index: 2,
                    name: "b".into(),
                    method: HttpMethod::Get,
                    endpoint: "/y".into(),
                    headers: vec![],
                    body: None,
                    expected: ExpectedResult::default(),
                    extractions: BTreeMap::new(),
                    timeout_ms: 1000,
                },
            ],
            tags: Default::default(),
            source: ScenarioSource::Manual,
            status: ScenarioStatus::Active,
        };
        assert!(matches!(
            scenario.validate(10),
            Err(ValidationError::NonContiguousStepIndex { at: 1 })
        ));
    }

    #[test]
    fn run_rollup_error_beats_failed() {
        let base = |error: Option<&str>, passed: bool| StepResult {
            run_id: RunId::new(),
            step_index: 0,
            step_name: "s".into(),
            actual_status: Some(200),
            actual_headers: BTreeMap::new(),
            actual_body: None,
            passed,
            assertions: vec![],
            extracted_values: BTreeMap::new(),
            error_message: error.map(|s| s.to_string()),
            duration_ms: 10,
            executed_at: Utc::now(),
        };
        let steps = vec![base(None, false), base(Some("boom"), false)];
        assert_eq!(Run::rollup_status(&steps), RunStatus::Error);
    }

    #[test]
    fn run_rollup_timeout_does_not_count_as_error() {
        let step = StepResult {
            run_id: RunId::new(),
            step_index: 0,
            step_name: "s".into(),
            actual_status: None,
            actual_headers: BTreeMap::new(),
            actual_body: None,
            passed: false,
            assertions: vec![],
            extracted_values: BTreeMap::new(),
            error_message: Some("timed out after 100ms".to_string()),
            duration_ms: 100,
            executed_at: Utc::now(),
        };
        assert_eq!(Run::rollup_status(&[step]), RunStatus::Failed);
    }

    #[test]
    fn webhook_delivery_backoff_grows_and_caps_at_three_attempts() {
        let now = Utc::now();
        let mut d = WebhookDelivery::new(
            WebhookId::new(),
            WebhookEventType::RunCompleted,
            "{}".to_string(),
            now,
        );
        d.record_failure(Some(500), Some("err"), None, now);
        assert_eq!(d.status, WebhookDeliveryStatus::Retrying);
        assert!(d.next_retry_at.unwrap() >= now + chrono::Duration::seconds(60));

        d.record_failure(Some(500), Some("err"), None, now);
        assert_eq!(d.status, WebhookDeliveryStatus::Retrying);
        assert!(d.next_retry_at.unwrap() >= now + chrono::Duration::seconds(120));

        d.record_failure(Some(500), Some("err"), None, now);
        assert_eq!(d.status, WebhookDeliveryStatus::Failed);
        assert_eq!(d.attempt_count, 3);
        assert!(d.completed_at.is_some());
    }
}
