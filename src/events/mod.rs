//! # Event bus
//!
//! A `tokio::sync::broadcast` channel: the Orchestrator (C9) is the sole
//! producer, the WebhookDispatcher (C10) and any telemetry sink are
//! subscribers. Publish never blocks — on a full buffer, broadcast drops
//! the oldest unread message for a lagging subscriber rather than stalling
//! the producer; we just count it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::domain::{PackageId, PackageStatus, RunId};

const DEFAULT_CAPACITY: usize = 1024;

/// Tagged union mirroring every event this bus can carry, with a real
/// `Serialize` impl so consumers outside the process (webhook payloads) get
/// a parseable JSON shape instead of a Rust-Debug dump.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "eventType", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PackageEvent {
    PackageStatusChanged {
        package_id: PackageId,
        from: PackageStatus,
        to: PackageStatus,
        at: DateTime<Utc>,
    },
    RunCompleted {
        run_id: RunId,
        package_id: Option<PackageId>,
        status: crate::domain::RunStatus,
        passed_steps: usize,
        failed_steps: usize,
        duration_ms: u64,
    },
    CoverageThresholdBreach {
        package_id: PackageId,
        coverage_percentage: f64,
        threshold: f64,
    },
}

/// Counts broadcast lag events so operators can see overflow pressure
/// without the publisher ever blocking on a slow subscriber.
#[derive(Default)]
pub struct EventBusMetrics {
    pub dropped: AtomicU64,
}

pub struct EventBus {
    sender: broadcast::Sender<PackageEvent>,
    pub metrics: Arc<EventBusMetrics>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self {
            sender,
            metrics: Arc::new(EventBusMetrics::default()),
        }
    }

    /// Non-blocking publish. A send error only occurs when there are zero
    /// subscribers, which is not a failure condition for the producer.
    pub fn publish(&self, event: PackageEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            metrics: self.metrics.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EventSubscription {
    receiver: broadcast::Receiver<PackageEvent>,
    metrics: Arc<EventBusMetrics>,
}

impl EventSubscription {
    /// Awaits the next event, transparently resuming past lag (dropped,
    /// unread events) rather than surfacing it as an error to the caller.
    pub async fn recv(&mut self) -> Option<PackageEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.metrics.dropped.fetch_add(skipped, Ordering::Relaxed);
                    warn!(skipped, "event bus subscriber lagged, resuming");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.publish(PackageEvent::CoverageThresholdBreach {
            package_id: PackageId::new(),
            coverage_percentage: 40.0,
            threshold: 80.0,
        });

        let event = sub.recv().await.unwrap();
        assert!(matches!(event, PackageEvent::CoverageThresholdBreach { .. }));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(PackageEvent::RunCompleted {
            run_id: RunId::new(),
            package_id: None,
            status: crate::domain::RunStatus::Passed,
            passed_steps: 1,
            failed_steps: 0,
            duration_ms: 10,
        });
    }

    #[tokio::test]
    async fn lagging_subscriber_resumes_instead_of_erroring() {
        let bus = EventBus::with_capacity(2);
        let mut sub = bus.subscribe();

        for _ in 0..5 {
            bus.publish(PackageEvent::CoverageThresholdBreach {
                package_id: PackageId::new(),
                coverage_percentage: 0.0,
                threshold: 0.0,
            });
        }

        assert!(sub.recv().await.is_some());
        assert!(bus.metrics.dropped.load(Ordering::Relaxed) > 0);
    }
}
