//! # RunnerConfig (A2)
//!
//! Aggregates every tunable the runner needs to operate: AI provider
//! settings, HTTP client limits, webhook defaults, and telemetry. Built
//! from defaults, optionally overlaid by a TOML/JSON file, then overlaid
//! by environment variables — environment always wins.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resilience::ResilienceConfig;
use crate::telemetry::TelemetryConfig;

pub const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_WEBHOOK_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_WEBHOOK_BASE_BACKOFF_MS: u64 = 1000;
pub const DEFAULT_MAX_WORKER_POOL_SIZE: usize = 10;

/// AI provider settings: which model to target and how to reach it, plus
/// the resilience tunables `ResilientAiClient` (C4) enforces around it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiProviderConfig {
    pub provider: String,
    pub model: String,
    pub api_base: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

impl Default for AiProviderConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            resilience: ResilienceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    pub body_limit_bytes: usize,
    #[serde(with = "duration_secs")]
    pub default_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            body_limit_bytes: DEFAULT_HTTP_BODY_LIMIT_BYTES,
            default_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfigDefaults {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub base_backoff: Duration,
}

impl Default for WebhookConfigDefaults {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_WEBHOOK_MAX_ATTEMPTS,
            base_backoff: Duration::from_millis(DEFAULT_WEBHOOK_BASE_BACKOFF_MS),
        }
    }
}

/// Top-level configuration for the runner process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub ai_provider: AiProviderConfig,
    pub http_client: HttpClientConfig,
    pub webhook: WebhookConfigDefaults,
    pub max_worker_pool_size: usize,
    /// Not part of the file/JSON configuration surface — `Level` and the
    /// OTEL wiring are runtime-only concerns, assembled directly by
    /// `from_env()` after the rest of the config is resolved.
    #[serde(skip)]
    pub telemetry: Option<TelemetryConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            ai_provider: AiProviderConfig::default(),
            http_client: HttpClientConfig::default(),
            webhook: WebhookConfigDefaults::default(),
            max_worker_pool_size: DEFAULT_MAX_WORKER_POOL_SIZE,
            telemetry: None,
        }
    }
}

impl RunnerConfig {
    /// Loads defaults, overlays an optional file (TOML, falling back to
    /// JSON if the extension or parse suggests it), then overlays
    /// well-known environment variables. Never panics on a missing
    /// optional variable; a present-but-unparsable variable is logged
    /// and the prior value is retained.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RUNNER_CONFIG_FILE") {
            match Self::load_file(&path) {
                Ok(file_config) => config = file_config,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to load RUNNER_CONFIG_FILE, using defaults");
                }
            }
        }

        if let Ok(provider) = std::env::var("RUNNER_AI_PROVIDER") {
            config.ai_provider.provider = provider;
        }
        if let Ok(model) = std::env::var("RUNNER_AI_MODEL") {
            config.ai_provider.model = model;
        }
        if let Ok(base) = std::env::var("RUNNER_AI_API_BASE") {
            config.ai_provider.api_base = base;
        }
        if let Ok(key) = std::env::var("RUNNER_AI_API_KEY") {
            config.ai_provider.api_key = Some(key);
        }
        if let Ok(val) = std::env::var("RUNNER_HTTP_BODY_LIMIT_BYTES") {
            match val.parse() {
                Ok(n) => config.http_client.body_limit_bytes = n,
                Err(e) => tracing::warn!(value = %val, error = %e, "invalid RUNNER_HTTP_BODY_LIMIT_BYTES, keeping default"),
            }
        }
        if let Ok(val) = std::env::var("RUNNER_HTTP_TIMEOUT_SECS") {
            match val.parse() {
                Ok(n) => config.http_client.default_timeout = Duration::from_secs(n),
                Err(e) => tracing::warn!(value = %val, error = %e, "invalid RUNNER_HTTP_TIMEOUT_SECS, keeping default"),
            }
        }
        if let Ok(val) = std::env::var("RUNNER_WEBHOOK_MAX_ATTEMPTS") {
            match val.parse() {
                Ok(n) => config.webhook.max_attempts = n,
                Err(e) => tracing::warn!(value = %val, error = %e, "invalid RUNNER_WEBHOOK_MAX_ATTEMPTS, keeping default"),
            }
        }
        if let Ok(val) = std::env::var("RUNNER_WEBHOOK_BASE_BACKOFF_MS") {
            match val.parse() {
                Ok(n) => config.webhook.base_backoff = Duration::from_millis(n),
                Err(e) => tracing::warn!(value = %val, error = %e, "invalid RUNNER_WEBHOOK_BASE_BACKOFF_MS, keeping default"),
            }
        }
        if let Ok(val) = std::env::var("RUNNER_MAX_WORKER_POOL_SIZE") {
            match val.parse() {
                Ok(n) => config.max_worker_pool_size = n,
                Err(e) => tracing::warn!(value = %val, error = %e, "invalid RUNNER_MAX_WORKER_POOL_SIZE, keeping default"),
            }
        }

        let mut telemetry = config.telemetry.take().unwrap_or_default();
        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            telemetry.service_name = name;
        }
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            telemetry.otlp_endpoint = Some(endpoint);
        }
        if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG") {
            match ratio.parse::<f64>() {
                Ok(r) => telemetry.sampling_ratio = r.clamp(0.0, 1.0),
                Err(e) => tracing::warn!(value = %ratio, error = %e, "invalid OTEL_TRACES_SAMPLER_ARG, keeping default"),
            }
        }
        config.telemetry = Some(telemetry);

        config
    }

    fn load_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        if path.ends_with(".json") {
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(toml::from_str(&contents)?)
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = RunnerConfig::default();
        assert_eq!(config.http_client.body_limit_bytes, DEFAULT_HTTP_BODY_LIMIT_BYTES);
        assert_eq!(config.webhook.max_attempts, DEFAULT_WEBHOOK_MAX_ATTEMPTS);
        assert_eq!(config.ai_provider.model, "gpt-4o-mini");
    }

    #[test]
    fn env_override_wins_over_default() {
        std::env::set_var("RUNNER_AI_MODEL", "gpt-4o");
        let config = RunnerConfig::from_env();
        assert_eq!(config.ai_provider.model, "gpt-4o");
        std::env::remove_var("RUNNER_AI_MODEL");
    }

    #[test]
    fn unparsable_env_var_keeps_default_instead_of_panicking() {
        std::env::set_var("RUNNER_HTTP_TIMEOUT_SECS", "not-a-number");
        let config = RunnerConfig::from_env();
        assert_eq!(config.http_client.default_timeout, Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS));
        std::env::remove_var("RUNNER_HTTP_TIMEOUT_SECS");
    }
}
