//! # WebhookDispatcher (C10)
//!
//! Subscribes to the event bus, fans each event out to matching active
//! `WebhookConfig`s, and drives their `WebhookDelivery` state through to a
//! terminal outcome — including the periodic retry scan for deliveries that
//! backed off.

use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use tracing::{info, instrument, warn};

use crate::domain::{WebhookConfig, WebhookDelivery, WebhookEventType, WebhookType};
use crate::events::{EventBus, PackageEvent};
use crate::ports::WebhookDeliveryRepository;

type HmacSha256 = Hmac<Sha256>;

fn event_type_of(event: &PackageEvent) -> Option<WebhookEventType> {
    match event {
        PackageEvent::RunCompleted { status, .. } => Some(match status {
            crate::domain::RunStatus::Passed => WebhookEventType::RunCompleted,
            _ => WebhookEventType::RunFailed,
        }),
        PackageEvent::CoverageThresholdBreach { .. } => Some(WebhookEventType::CoverageThresholdBreach),
        PackageEvent::PackageStatusChanged { .. } => None,
    }
}

/// Builds the outgoing payload for a webhook, shaped per its `WebhookType`.
fn build_payload(webhook_type: WebhookType, event: &PackageEvent) -> String {
    match webhook_type {
        WebhookType::Slack => serde_json::json!({
            "text": slack_text(event),
        })
        .to_string(),
        WebhookType::Generic => serde_json::to_string(event).unwrap_or_default(),
        WebhookType::Email => slack_text(event),
    }
}

fn slack_text(event: &PackageEvent) -> String {
    match event {
        PackageEvent::RunCompleted { run_id, status, passed_steps, failed_steps, .. } => format!(
            "Run {} finished with status {:?} ({} passed, {} failed)",
            run_id, status, passed_steps, failed_steps
        ),
        PackageEvent::CoverageThresholdBreach { package_id, coverage_percentage, threshold } => format!(
            "Package {} coverage {:.1}% is below threshold {:.1}%",
            package_id, coverage_percentage, threshold
        ),
        PackageEvent::PackageStatusChanged { package_id, from, to, .. } => format!(
            "Package {} moved {:?} -> {:?}",
            package_id, from, to
        ),
    }
}

fn sign(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    format!("sha256={:x}", mac.finalize().into_bytes())
}

pub struct WebhookDispatcher {
    client: Client,
    delivery_repository: std::sync::Arc<dyn WebhookDeliveryRepository>,
}

impl WebhookDispatcher {
    pub fn new(delivery_repository: std::sync::Arc<dyn WebhookDeliveryRepository>) -> Self {
        Self {
            client: Client::new(),
            delivery_repository,
        }
    }

    /// Runs forever, consuming events from `bus` and creating+delivering a
    /// `WebhookDelivery` per matching active config. Intended to be spawned
    /// as a background task.
    pub async fn run(&self, mut bus_subscription: crate::events::EventSubscription, webhooks: &[WebhookConfig]) {
        while let Some(event) = bus_subscription.recv().await {
            let Some(event_type) = event_type_of(&event) else {
                continue;
            };
            for webhook in webhooks {
                if webhook.active && webhook.subscribed_events.contains(&event_type) {
                    self.dispatch_one(webhook, event_type, &event).await;
                }
            }
        }
    }

    #[instrument(skip(self, webhook, event), fields(webhook_id = %webhook.id))]
    async fn dispatch_one(&self, webhook: &WebhookConfig, event_type: WebhookEventType, event: &PackageEvent) {
        let payload = build_payload(webhook.webhook_type, event);
        let now = chrono::Utc::now();
        let mut delivery = WebhookDelivery::new(webhook.id, event_type, payload, now);
        self.attempt_delivery(webhook, &mut delivery).await;
        if let Err(e) = self.delivery_repository.upsert(delivery).await {
            warn!(webhook_id = %webhook.id, error = %e, "failed to persist webhook delivery");
        }
    }

    /// Sends one delivery attempt and records the outcome on `delivery`.
    /// Does not persist — callers are responsible for the repository
    /// upsert, so the retry scanner and first-attempt path share this.
    async fn attempt_delivery(&self, webhook: &WebhookConfig, delivery: &mut WebhookDelivery) {
        let now = chrono::Utc::now();
        let mut request = self.client.post(&webhook.url).body(delivery.payload.clone());
        for (name, value) in &webhook.headers {
            request = request.header(name, value);
        }
        if let Some(secret) = &webhook.secret {
            request = request.header("X-Signature", sign(secret, &delivery.payload));
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                delivery.record_success(status, &body, now);
                info!(webhook_id = %webhook.id, "webhook delivered");
            }
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                delivery.record_failure(Some(status), Some(&body), None, now);
                warn!(webhook_id = %webhook.id, status, "webhook delivery rejected");
            }
            Err(e) => {
                delivery.record_failure(None, None, Some(e.to_string()), now);
                warn!(webhook_id = %webhook.id, error = %e, "webhook delivery transport error");
            }
        }
    }

    /// Periodically scans for `RETRYING` deliveries whose `nextRetryAt` has
    /// elapsed and retries them against their owning `WebhookConfig`.
    pub async fn retry_due_deliveries(&self, webhooks: &[WebhookConfig]) {
        let now = chrono::Utc::now();
        let due = self.delivery_repository.list_due_for_retry(now).await.unwrap_or_default();
        for mut delivery in due {
            let Some(webhook) = webhooks.iter().find(|w| w.id == delivery.webhook_id) else {
                continue;
            };
            self.attempt_delivery(webhook, &mut delivery).await;
            if let Err(e) = self.delivery_repository.upsert(delivery).await {
                warn!(webhook_id = %webhook.id, error = %e, "failed to persist retried webhook delivery");
            }
        }
    }
}
