//! Event delivery transports
//!
//! The engine hands every event to a [`Delivery`] and moves on; transports
//! own their own failure handling and never report back. `deliver` must
//! return promptly: it runs inside the pipeline loop.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tunebridge_common::events::{ConversionEvent, EventBus};

const WEBHOOK_BACKOFF_MS: u64 = 200;
const WEBHOOK_MAX_BACKOFF_MS: u64 = 30_000;
const WEBHOOK_TIMEOUT_SECS: u64 = 10;
const WEBHOOK_QUEUE_CAPACITY: usize = 1024;

/// Push-based event sink
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, event: ConversionEvent);
}

/// In-process delivery over the broadcast [`EventBus`]
#[derive(Clone)]
pub struct EventBusDelivery {
    event_bus: EventBus,
}

impl EventBusDelivery {
    pub fn new(event_bus: EventBus) -> Self {
        Self { event_bus }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }
}

#[async_trait]
impl Delivery for EventBusDelivery {
    async fn deliver(&self, event: ConversionEvent) {
        if self.event_bus.emit(event).is_err() {
            tracing::trace!("No event subscribers, event dropped");
        }
    }
}

/// JSON POST to a webhook, re-attempted on failure (at-least-once)
///
/// `deliver` only enqueues; one worker per webhook posts events in order, so
/// a slow or unresponsive endpoint never holds up the pipeline. When the
/// queue is full new events are dropped with a warning.
pub struct WebhookDelivery {
    url: String,
    queue: mpsc::Sender<ConversionEvent>,
}

impl WebhookDelivery {
    /// Spawns the delivery worker; must be called within a Tokio runtime
    pub fn new(url: impl Into<String>, attempts: u32) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()?;

        let url = url.into();
        let (queue, pending) = mpsc::channel(WEBHOOK_QUEUE_CAPACITY);
        let worker = WebhookWorker {
            http_client,
            url: url.clone(),
            attempts: attempts.max(1),
        };
        tokio::spawn(worker.run(pending));

        Ok(Self { url, queue })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Delivery for WebhookDelivery {
    async fn deliver(&self, event: ConversionEvent) {
        match self.queue.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(
                    url = %self.url,
                    task_id = %event.task_id(),
                    sequence = event.sequence(),
                    "Webhook queue full, event dropped"
                );
            }
            Err(TrySendError::Closed(event)) => {
                tracing::warn!(
                    url = %self.url,
                    task_id = %event.task_id(),
                    "Webhook worker stopped, event dropped"
                );
            }
        }
    }
}

/// Drains one webhook's queue
struct WebhookWorker {
    http_client: reqwest::Client,
    url: String,
    attempts: u32,
}

impl WebhookWorker {
    /// Runs until every sender is dropped
    async fn run(self, mut pending: mpsc::Receiver<ConversionEvent>) {
        while let Some(event) = pending.recv().await {
            self.post(&event).await;
        }
        tracing::debug!(url = %self.url, "Webhook worker finished");
    }

    async fn post_once(&self, event: &ConversionEvent) -> Result<(), String> {
        let response = self
            .http_client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", response.status()))
        }
    }

    async fn post(&self, event: &ConversionEvent) {
        let mut backoff_ms = WEBHOOK_BACKOFF_MS;

        for attempt in 1..=self.attempts {
            match self.post_once(event).await {
                Ok(()) => {
                    tracing::debug!(
                        task_id = %event.task_id(),
                        sequence = event.sequence(),
                        "Webhook delivered"
                    );
                    return;
                }
                Err(e) if attempt < self.attempts => {
                    tracing::debug!(url = %self.url, attempt, error = %e, "Webhook delivery failed, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2).min(WEBHOOK_MAX_BACKOFF_MS);
                }
                Err(e) => {
                    tracing::warn!(
                        url = %self.url,
                        task_id = %event.task_id(),
                        sequence = event.sequence(),
                        attempts = self.attempts,
                        error = %e,
                        "Webhook delivery abandoned"
                    );
                }
            }
        }
    }
}

/// Delivers each event to several transports, in order
pub struct FanoutDelivery {
    targets: Vec<Arc<dyn Delivery>>,
}

impl FanoutDelivery {
    pub fn new(targets: Vec<Arc<dyn Delivery>>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl Delivery for FanoutDelivery {
    async fn deliver(&self, event: ConversionEvent) {
        for target in &self.targets {
            target.deliver(event.clone()).await;
        }
    }
}
