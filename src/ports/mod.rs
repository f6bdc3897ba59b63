//! # Ports
//!
//! Interfaces to external collaborators the core does not implement itself:
//! persistence (repositories), spec fetching, clock, and id generation. The
//! real implementations (a database, an HTTP OpenAPI fetcher) live outside
//! this crate's scope; what ships here are the trait contracts plus
//! in-memory reference implementations used by the CLI and by tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{
    Package, PackageId, PackageStatus, Run, RunId, Scenario, ScenarioId, StepResult,
    WebhookConfig, WebhookDelivery, WebhookDeliveryStatus, WebhookEventType, WebhookId,
};
use crate::errors::SpecFetchError;

// ============================================================================
// CLOCK & ID GENERATION
// ============================================================================

/// Injectable wall clock, so tests can control timestamps deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Injectable id source, so tests can assert on generated ids.
pub trait IdGenerator: Send + Sync {
    fn new_id(&self) -> Uuid;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn new_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// A deterministic fake clock/id-generator pair for tests that need to
/// assert on exact timestamps or ids (e.g. backoff-schedule property tests).
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

// ============================================================================
// SPEC FETCHER
// ============================================================================

/// Resolves a package's OpenAPI spec, by URL or by returning inline content
/// unchanged. Failures map to `FAILED_SPEC_FETCH` at the orchestrator level.
#[async_trait]
pub trait SpecFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<(String, String), SpecFetchError>;
}

/// Fetches specs over HTTP. `format` is inferred from the URL's extension,
/// defaulting to `"yaml"` — OpenAPI parsing itself is out of core scope.
pub struct HttpSpecFetcher {
    client: reqwest::Client,
}

impl HttpSpecFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpSpecFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpecFetcher for HttpSpecFetcher {
    async fn fetch(&self, url: &str) -> Result<(String, String), SpecFetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SpecFetchError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SpecFetchError::HttpStatus {
                status: response.status().as_u16(),
            });
        }

        let format = if url.ends_with(".json") { "json" } else { "yaml" }.to_string();
        let body = response
            .text()
            .await
            .map_err(|e| SpecFetchError::Transport(e.to_string()))?;
        Ok((body, format))
    }
}

/// Fixed-response fetcher for tests: pre-seed it with the exact body a
/// given URL should return.
#[derive(Default)]
pub struct StaticSpecFetcher {
    responses: HashMap<String, (String, String)>,
}

impl StaticSpecFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, url: impl Into<String>, content: impl Into<String>, format: impl Into<String>) -> Self {
        self.responses.insert(url.into(), (content.into(), format.into()));
        self
    }
}

#[async_trait]
impl SpecFetcher for StaticSpecFetcher {
    async fn fetch(&self, url: &str) -> Result<(String, String), SpecFetchError> {
        self.responses
            .get(url)
            .cloned()
            .ok_or(SpecFetchError::HttpStatus { status: 404 })
    }
}

// ============================================================================
// IN-MEMORY REPOSITORIES
// ============================================================================

/// A generic `RwLock<HashMap<Id, T>>` store shared by every in-memory
/// repository below — the concurrent-safe shape the ports require without
/// pulling in an actual database for the reference implementation.
#[derive(Debug)]
struct InMemoryStore<K, V> {
    rows: RwLock<HashMap<K, V>>,
}

impl<K: std::hash::Hash + Eq + Clone, V: Clone> InMemoryStore<K, V> {
    fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }

    async fn upsert(&self, key: K, value: V) {
        self.rows.write().await.insert(key, value);
    }

    async fn get(&self, key: &K) -> Option<V> {
        self.rows.read().await.get(key).cloned()
    }

    async fn delete(&self, key: &K) {
        self.rows.write().await.remove(key);
    }

    async fn all(&self) -> Vec<V> {
        self.rows.read().await.values().cloned().collect()
    }
}

#[async_trait]
pub trait PackageRepository: Send + Sync {
    async fn upsert(&self, package: Package) -> anyhow::Result<()>;
    async fn get(&self, id: PackageId) -> anyhow::Result<Option<Package>>;
    async fn list_by_status(&self, status: PackageStatus) -> anyhow::Result<Vec<Package>>;
    async fn delete(&self, id: PackageId) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct InMemoryPackageRepository {
    store: InMemoryStore<PackageId, Package>,
}

impl InMemoryPackageRepository {
    pub fn new() -> Self {
        Self {
            store: InMemoryStore::new(),
        }
    }
}

#[async_trait]
impl PackageRepository for InMemoryPackageRepository {
    async fn upsert(&self, package: Package) -> anyhow::Result<()> {
        self.store.upsert(package.id, package).await;
        Ok(())
    }

    async fn get(&self, id: PackageId) -> anyhow::Result<Option<Package>> {
        Ok(self.store.get(&id).await)
    }

    async fn list_by_status(&self, status: PackageStatus) -> anyhow::Result<Vec<Package>> {
        Ok(self
            .store
            .all()
            .await
            .into_iter()
            .filter(|p| p.status == status)
            .collect())
    }

    async fn delete(&self, id: PackageId) -> anyhow::Result<()> {
        self.store.delete(&id).await;
        Ok(())
    }
}

#[async_trait]
pub trait ScenarioRepository: Send + Sync {
    async fn insert_many(&self, scenarios: Vec<Scenario>) -> anyhow::Result<()>;
    async fn get(&self, id: ScenarioId) -> anyhow::Result<Option<Scenario>>;
    async fn list_by_package(&self, package_id: PackageId) -> anyhow::Result<Vec<Scenario>>;
    async fn delete_by_package(&self, package_id: PackageId) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct InMemoryScenarioRepository {
    store: InMemoryStore<ScenarioId, Scenario>,
}

impl InMemoryScenarioRepository {
    pub fn new() -> Self {
        Self {
            store: InMemoryStore::new(),
        }
    }
}

#[async_trait]
impl ScenarioRepository for InMemoryScenarioRepository {
    async fn insert_many(&self, scenarios: Vec<Scenario>) -> anyhow::Result<()> {
        for s in scenarios {
            self.store.upsert(s.id, s).await;
        }
        Ok(())
    }

    async fn get(&self, id: ScenarioId) -> anyhow::Result<Option<Scenario>> {
        Ok(self.store.get(&id).await)
    }

    async fn list_by_package(&self, package_id: PackageId) -> anyhow::Result<Vec<Scenario>> {
        Ok(self
            .store
            .all()
            .await
            .into_iter()
            .filter(|s| s.package_id == Some(package_id))
            .collect())
    }

    async fn delete_by_package(&self, package_id: PackageId) -> anyhow::Result<()> {
        let ids: Vec<ScenarioId> = self
            .store
            .all()
            .await
            .into_iter()
            .filter(|s| s.package_id == Some(package_id))
            .map(|s| s.id)
            .collect();
        for id in ids {
            self.store.delete(&id).await;
        }
        Ok(())
    }
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn upsert(&self, run: Run) -> anyhow::Result<()>;
    async fn get(&self, id: RunId) -> anyhow::Result<Option<Run>>;
    async fn list_by_package(&self, package_id: PackageId) -> anyhow::Result<Vec<Run>>;
}

#[derive(Default)]
pub struct InMemoryRunRepository {
    store: InMemoryStore<RunId, Run>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self {
            store: InMemoryStore::new(),
        }
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn upsert(&self, run: Run) -> anyhow::Result<()> {
        self.store.upsert(run.id, run).await;
        Ok(())
    }

    async fn get(&self, id: RunId) -> anyhow::Result<Option<Run>> {
        Ok(self.store.get(&id).await)
    }

    async fn list_by_package(&self, package_id: PackageId) -> anyhow::Result<Vec<Run>> {
        Ok(self
            .store
            .all()
            .await
            .into_iter()
            .filter(|r| r.package_id == Some(package_id))
            .collect())
    }
}

/// `StepResult`s are keyed by `(runId, stepIndex)`; uniqueness is enforced
/// by upsert-on-key semantics.
#[async_trait]
pub trait StepResultRepository: Send + Sync {
    async fn upsert(&self, result: StepResult) -> anyhow::Result<()>;
    async fn list_by_run(&self, run_id: RunId) -> anyhow::Result<Vec<StepResult>>;
}

#[derive(Default)]
pub struct InMemoryStepResultRepository {
    store: InMemoryStore<(RunId, usize), StepResult>,
}

impl InMemoryStepResultRepository {
    pub fn new() -> Self {
        Self {
            store: InMemoryStore::new(),
        }
    }
}

#[async_trait]
impl StepResultRepository for InMemoryStepResultRepository {
    async fn upsert(&self, result: StepResult) -> anyhow::Result<()> {
        self.store.upsert((result.run_id, result.step_index), result).await;
        Ok(())
    }

    async fn list_by_run(&self, run_id: RunId) -> anyhow::Result<Vec<StepResult>> {
        let mut results: Vec<StepResult> = self
            .store
            .all()
            .await
            .into_iter()
            .filter(|r| r.run_id == run_id)
            .collect();
        results.sort_by_key(|r| r.step_index);
        Ok(results)
    }
}

#[async_trait]
pub trait WebhookRepository: Send + Sync {
    async fn upsert(&self, config: WebhookConfig) -> anyhow::Result<()>;
    async fn list_active_for_event(&self, event: WebhookEventType) -> anyhow::Result<Vec<WebhookConfig>>;
}

#[derive(Default)]
pub struct InMemoryWebhookRepository {
    store: InMemoryStore<WebhookId, WebhookConfig>,
}

impl InMemoryWebhookRepository {
    pub fn new() -> Self {
        Self {
            store: InMemoryStore::new(),
        }
    }
}

#[async_trait]
impl WebhookRepository for InMemoryWebhookRepository {
    async fn upsert(&self, config: WebhookConfig) -> anyhow::Result<()> {
        self.store.upsert(config.id, config).await;
        Ok(())
    }

    async fn list_active_for_event(&self, event: WebhookEventType) -> anyhow::Result<Vec<WebhookConfig>> {
        Ok(self
            .store
            .all()
            .await
            .into_iter()
            .filter(|w| w.active && w.subscribed_events.contains(&event))
            .collect())
    }
}

#[async_trait]
pub trait WebhookDeliveryRepository: Send + Sync {
    async fn upsert(&self, delivery: WebhookDelivery) -> anyhow::Result<()>;
    async fn list_due_for_retry(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<WebhookDelivery>>;
}

#[derive(Default)]
pub struct InMemoryWebhookDeliveryRepository {
    store: InMemoryStore<Uuid, WebhookDelivery>,
}

impl InMemoryWebhookDeliveryRepository {
    pub fn new() -> Self {
        Self {
            store: InMemoryStore::new(),
        }
    }
}

#[async_trait]
impl WebhookDeliveryRepository for InMemoryWebhookDeliveryRepository {
    async fn upsert(&self, delivery: WebhookDelivery) -> anyhow::Result<()> {
        self.store.upsert(delivery.id, delivery).await;
        Ok(())
    }

    async fn list_due_for_retry(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<WebhookDelivery>> {
        Ok(self
            .store
            .all()
            .await
            .into_iter()
            .filter(|d| {
                d.status == WebhookDeliveryStatus::Retrying
                    && d.next_retry_at.map(|t| t <= now).unwrap_or(false)
            })
            .collect())
    }
}

/// Bundles the five repositories so components only need to thread one
/// handle through the orchestrator.
#[derive(Clone)]
pub struct Repositories {
    pub packages: Arc<dyn PackageRepository>,
    pub scenarios: Arc<dyn ScenarioRepository>,
    pub runs: Arc<dyn RunRepository>,
    pub step_results: Arc<dyn StepResultRepository>,
    pub webhooks: Arc<dyn WebhookRepository>,
    pub webhook_deliveries: Arc<dyn WebhookDeliveryRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            packages: Arc::new(InMemoryPackageRepository::new()),
            scenarios: Arc::new(InMemoryScenarioRepository::new()),
            runs: Arc::new(InMemoryRunRepository::new()),
            step_results: Arc::new(InMemoryStepResultRepository::new()),
            webhooks: Arc::new(InMemoryWebhookRepository::new()),
            webhook_deliveries: Arc::new(InMemoryWebhookDeliveryRepository::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PackageConfig, SpecSource};

    #[tokio::test]
    async fn package_repository_roundtrips() {
        let repo = InMemoryPackageRepository::new();
        let pkg = Package::new(
            "demo".to_string(),
            SpecSource::Inline("openapi: 3.0.0".to_string()),
            "https://api.example.com".to_string(),
            None,
            PackageConfig::default(),
            "tester".to_string(),
            Utc::now(),
        )
        .unwrap();
        let id = pkg.id;
        repo.upsert(pkg).await.unwrap();
        assert!(repo.get(id).await.unwrap().is_some());
        assert_eq!(repo.list_by_status(PackageStatus::Requested).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn static_spec_fetcher_returns_seeded_content() {
        let fetcher = StaticSpecFetcher::new().with_response("http://x/spec", "openapi: 3.0.0", "yaml");
        let (content, format) = fetcher.fetch("http://x/spec").await.unwrap();
        assert_eq!(content, "openapi: 3.0.0");
        assert_eq!(format, "yaml");
    }

    #[tokio::test]
    async fn static_spec_fetcher_errors_on_unknown_url() {
        let fetcher = StaticSpecFetcher::new();
        assert!(fetcher.fetch("http://missing").await.is_err());
    }
}
