//! # ResilientAiClient (C4)
//!
//! Wraps a raw `AiClient` delegate with a fixed composition chain, outermost
//! first: **Bulkhead → RateLimiter → CircuitBreaker → Retry → delegate**.
//! The LLM resilience primitives are process-wide — one `ResilientAiClient`
//! is constructed at startup and shared (via `Arc`) across every concurrent
//! package orchestration, per the design note that these are a single
//! injectable subsystem rather than ambient singletons.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};

use crate::errors::AiClientError;
use crate::retry::{RetryExecutor, RetryPolicy};

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AiRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    pub response_format: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Choice {
    pub message: ChatMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AiResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl AiResponse {
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

/// The raw delegate. Implementations talk to an actual LLM provider;
/// `ResilientAiClient` never calls this directly outside of its composed
/// policy chain.
#[async_trait]
pub trait AiClient: Send + Sync {
    async fn complete(&self, request: AiRequest) -> Result<AiResponse, AiClientError>;
    async fn healthy(&self) -> bool;
}

// ============================================================================
// BULKHEAD
// ============================================================================

/// Fixed-capacity admission controller: at most `capacity` concurrent
/// in-flight calls. Requests over the limit fail immediately with
/// `BulkheadFull` rather than queueing.
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    capacity: u32,
}

pub struct BulkheadPermit(#[allow(dead_code)] tokio::sync::OwnedSemaphorePermit);

impl Bulkhead {
    pub fn new(capacity: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    pub fn try_acquire(&self) -> Result<BulkheadPermit, AiClientError> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map(BulkheadPermit)
            .map_err(|_| AiClientError::BulkheadFull {
                in_flight: self.capacity - self.semaphore.available_permits() as u32,
                capacity: self.capacity,
            })
    }
}

// ============================================================================
// RATE LIMITER
// ============================================================================

/// Token bucket: `permits` tokens refilled every `period`. Non-blocking —
/// callers over budget get `RateLimited` back immediately rather than
/// waiting for a token.
pub struct RateLimiter {
    capacity: f64,
    refill_per_ms: f64,
    state: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    pub fn new(permits: u32, period: Duration) -> Self {
        let capacity = permits as f64;
        let refill_per_ms = capacity / period.as_millis().max(1) as f64;
        Self {
            capacity,
            refill_per_ms,
            state: Mutex::new((capacity, Instant::now())),
        }
    }

    pub async fn try_acquire(&self) -> Result<(), AiClientError> {
        let mut guard = self.state.lock().await;
        let (tokens, last_refill) = &mut *guard;
        let elapsed_ms = last_refill.elapsed().as_millis() as f64;
        *tokens = (*tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
        *last_refill = Instant::now();

        if *tokens >= 1.0 {
            *tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - *tokens;
            let retry_after_ms = (deficit / self.refill_per_ms).ceil() as u64;
            Err(AiClientError::RateLimited { retry_after_ms })
        }
    }
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
}

/// Sliding-window circuit breaker over recent call outcomes. Opens when the
/// failure rate over the last `window_size` calls reaches `failure_threshold`;
/// while open, calls short-circuit without invoking the delegate until
/// `cooldown` elapses, at which point a single probe is admitted
/// (`HalfOpen`) — its outcome decides whether the circuit re-closes or
/// reopens.
pub struct CircuitBreaker {
    window_size: usize,
    failure_threshold: f64,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(window_size: usize, failure_threshold: f64, cooldown: Duration) -> Self {
        Self {
            window_size,
            failure_threshold,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: VecDeque::with_capacity(window_size),
                opened_at: None,
            }),
        }
    }

    /// Must be called before each delegate invocation. Returns
    /// `CircuitOpen` while tripped and cooling down; otherwise admits the
    /// call (including the single `HalfOpen` probe).
    pub async fn check(&self) -> Result<(), AiClientError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(AiClientError::CircuitOpen {
                        cooldown_remaining_ms: (self.cooldown - elapsed).as_millis() as u64,
                    })
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.window.push_back(true);
        if inner.window.len() > self.window_size {
            inner.window.pop_front();
        }
        // A successful probe from HalfOpen closes the circuit.
        inner.state = BreakerState::Closed;
        inner.opened_at = None;
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.window.push_back(false);
        if inner.window.len() > self.window_size {
            inner.window.pop_front();
        }

        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            return;
        }

        if inner.window.len() >= self.window_size {
            let failures = inner.window.iter().filter(|ok| !**ok).count();
            let failure_rate = failures as f64 / inner.window.len() as f64;
            if failure_rate >= self.failure_threshold {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
        }
    }
}

// ============================================================================
// RESILIENT CLIENT
// ============================================================================

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResilienceConfig {
    pub bulkhead_capacity: u32,
    pub rate_limit_permits: u32,
    #[serde(with = "humantime_secs")]
    pub rate_limit_period: Duration,
    pub circuit_window_size: usize,
    pub circuit_failure_threshold: f64,
    #[serde(with = "humantime_secs")]
    pub circuit_cooldown: Duration,
    pub retry: RetryPolicy,
}

mod humantime_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            bulkhead_capacity: 16,
            rate_limit_permits: 30,
            rate_limit_period: Duration::from_secs(60),
            circuit_window_size: 10,
            circuit_failure_threshold: 0.5,
            circuit_cooldown: Duration::from_secs(30),
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_ms: 250,
                backoff_factor: 2.0,
            },
        }
    }
}

/// Counts fallback invocations, surfaced for observability (not part of any
/// invariant, purely diagnostic).
#[derive(Default)]
pub struct ResilienceMetrics {
    pub fallbacks: AtomicU32,
}

pub struct ResilientAiClient {
    delegate: Arc<dyn AiClient>,
    bulkhead: Bulkhead,
    rate_limiter: RateLimiter,
    circuit_breaker: CircuitBreaker,
    retry: RetryExecutor,
    pub metrics: ResilienceMetrics,
}

impl ResilientAiClient {
    pub fn new(delegate: Arc<dyn AiClient>, config: ResilienceConfig) -> Self {
        Self {
            delegate,
            bulkhead: Bulkhead::new(config.bulkhead_capacity),
            rate_limiter: RateLimiter::new(config.rate_limit_permits, config.rate_limit_period),
            circuit_breaker: CircuitBreaker::new(
                config.circuit_window_size,
                config.circuit_failure_threshold,
                config.circuit_cooldown,
            ),
            retry: RetryExecutor::new(config.retry),
            metrics: ResilienceMetrics::default(),
        }
    }

    /// Returns the static fallback payload used whenever a policy refuses
    /// to invoke the delegate.
    fn fallback_response(&self) -> AiResponse {
        self.metrics.fallbacks.fetch_add(1, Ordering::Relaxed);
        AiResponse {
            id: "fallback".to_string(),
            model: "unavailable".to_string(),
            choices: vec![Choice {
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content: "{\"status\":\"service unavailable\"}".to_string(),
                },
                finish_reason: "fallback".to_string(),
            }],
            usage: Usage {
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
            },
        }
    }

    /// Runs `complete` through Bulkhead → RateLimiter → CircuitBreaker →
    /// Retry → delegate. Never propagates an `AiClientError` to the
    /// caller — any policy refusal or exhausted retry degrades to the
    /// fallback response instead, per C4's contract.
    pub async fn complete(&self, request: AiRequest) -> AiResponse {
        let permit = match self.bulkhead.try_acquire() {
            Ok(p) => p,
            Err(_) => return self.fallback_response(),
        };

        if self.rate_limiter.try_acquire().await.is_err() {
            return self.fallback_response();
        }

        if self.circuit_breaker.check().await.is_err() {
            return self.fallback_response();
        }

        let result = self
            .retry
            .execute(
                "ai_complete",
                |e: &AiClientError| e.is_retryable(),
                || self.delegate.complete(request.clone()),
            )
            .await;

        drop(permit);

        match result {
            Ok(response) => {
                self.circuit_breaker.record_success().await;
                response
            }
            Err(_) => {
                self.circuit_breaker.record_failure().await;
                self.fallback_response()
            }
        }
    }

    pub async fn healthy(&self) -> bool {
        self.delegate.healthy().await
    }
}
