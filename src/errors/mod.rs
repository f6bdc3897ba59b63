//! Error taxonomy for the orchestrator, organized by kind rather than by call
//! site. Each component that can fail in a way a caller needs to branch on
//! gets its own `thiserror` enum; the CLI boundary collapses everything into
//! `anyhow::Result` for reporting.
//!
//! Per the error-handling design: step-level errors are absorbed into
//! `StepResult`, run-level errors into `Run::status`, package-level errors
//! into `PackageStatus`. Only input validation and state-machine misuse are
//! allowed to propagate as exceptions.

use thiserror::Error;

/// Input validation failures. These must be raised before any state change
/// and never leave partial mutations behind.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("name must not be blank")]
    BlankName,

    #[error("baseUrl must not be blank")]
    BlankBaseUrl,

    #[error("package must provide either specUrl or specContent")]
    MissingSpecSource,

    #[error("scenario must contain at least one step")]
    EmptySteps,

    #[error("step {index} has duplicate index {duplicate}")]
    DuplicateStepIndex { index: usize, duplicate: usize },

    #[error("step indices must form a contiguous sequence starting at 0, found gap at {at}")]
    NonContiguousStepIndex { at: usize },

    #[error("step count {actual} exceeds maxStepsPerScenario {max}")]
    TooManySteps { actual: usize, max: usize },

    #[error("unknown HTTP method '{0}'")]
    UnknownMethod(String),

    #[error("endpoint exceeds 2000 characters ({0} chars)")]
    EndpointTooLong(usize),

    #[error("unrecognized matcher type '{0}'")]
    BadMatcherType(String),

    #[error("step timeout {ms}ms is out of the allowed range 100..=300000")]
    TimeoutOutOfRange { ms: u64 },
}

/// Errors surfaced by `ScenarioGenerator` (C5). Callers move the owning
/// package to `FAILED_GENERATION` on any of these rather than propagate.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("AI provider call failed: {0}")]
    AiCallFailed(#[from] AiClientError),

    #[error("AI response was not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("AI response produced zero valid scenarios")]
    NoValidScenarios,

    #[error("generated scenario failed validation: {0}")]
    Invalid(#[from] ValidationError),
}

/// Errors surfaced by the resilient AI client (C4). `RateLimited` is the one
/// variant the retry policy must never retry.
#[derive(Debug, Error, Clone)]
pub enum AiClientError {
    #[error("bulkhead at capacity ({in_flight}/{capacity} in-flight calls)")]
    BulkheadFull { in_flight: u32, capacity: u32 },

    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("circuit breaker open, cooling down until {cooldown_remaining_ms}ms from now")]
    CircuitOpen { cooldown_remaining_ms: u64 },

    #[error("upstream AI provider error: {0}")]
    Upstream(String),
}

impl AiClientError {
    /// Per C4's retry policy: `RateLimited` always propagates; everything
    /// else is a candidate for retry under the bounded-attempt policy.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AiClientError::RateLimited { .. })
    }
}

/// Raised when the orchestrator state machine is asked to perform a
/// transition outside the allowed graph. This is a programmer error, not a
/// runtime condition: the package's persisted status is left untouched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid status transition: {from:?} -> {to:?}")]
pub struct InvalidStatusTransition {
    pub from: crate::domain::PackageStatus,
    pub to: crate::domain::PackageStatus,
}

/// Errors that can occur fetching a package's OpenAPI spec.
#[derive(Debug, Error)]
pub enum SpecFetchError {
    #[error("spec fetch returned HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("failed to read spec: {0}")]
    Io(#[from] std::io::Error),

    #[error("spec request failed: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_not_retryable() {
        let e = AiClientError::RateLimited { retry_after_ms: 100 };
        assert!(!e.is_retryable());
    }

    #[test]
    fn circuit_open_is_retryable_by_caller_policy() {
        let e = AiClientError::CircuitOpen { cooldown_remaining_ms: 500 };
        assert!(e.is_retryable());
    }

    #[test]
    fn validation_error_messages_are_descriptive() {
        let e = ValidationError::TooManySteps { actual: 12, max: 10 };
        assert!(e.to_string().contains("12"));
        assert!(e.to_string().contains("10"));
    }
}
