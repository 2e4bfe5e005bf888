//! Operator notifications: broadcast events and webhooks

use crate::config::{WebhookConfig, WebhookEvent};
use crate::types::Event;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// JSON body POSTed to webhooks
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Subscription that matched (`success`, `failed`, `integrity_alert`, `run_halted`)
    pub event: String,
    /// Unix timestamp when the payload was built
    pub timestamp: i64,
    /// The operator event, tagged by `type`
    #[serde(flatten)]
    pub details: Event,
}

/// Webhook subscription an event triggers, if any
pub(crate) fn webhook_event(event: &Event) -> Option<WebhookEvent> {
    match event {
        Event::JobSucceeded { .. } => Some(WebhookEvent::OnSuccess),
        Event::JobFailed { .. } => Some(WebhookEvent::OnFailed),
        Event::IntegrityAlert { .. } => Some(WebhookEvent::OnIntegrityAlert),
        Event::RunHalted { .. } => Some(WebhookEvent::OnRunHalted),
        _ => None,
    }
}

/// Publishes events to subscribers and matching webhooks
#[derive(Clone)]
pub(crate) struct Notifier {
    event_tx: broadcast::Sender<Event>,
    webhooks: Arc<Vec<WebhookConfig>>,
    client: reqwest::Client,
}

impl Notifier {
    pub(crate) fn new(event_tx: broadcast::Sender<Event>, webhooks: Vec<WebhookConfig>) -> Self {
        Self {
            event_tx,
            webhooks: Arc::new(webhooks),
            client: reqwest::Client::new(),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Send `event` to subscribers and fire any subscribed webhooks
    ///
    /// Having no subscribers is not an error.
    pub(crate) fn publish(&self, event: Event) {
        if let Some(kind) = webhook_event(&event) {
            self.trigger_webhooks(kind, &event);
        }
        self.event_tx.send(event).ok();
    }

    /// POST the event to every webhook subscribed to `kind` (fire and forget)
    fn trigger_webhooks(&self, kind: WebhookEvent, event: &Event) {
        let matching: Vec<_> = self
            .webhooks
            .iter()
            .filter(|w| w.events.contains(&kind))
            .cloned()
            .collect();
        if matching.is_empty() {
            return;
        }

        let event_str: &'static str = match kind {
            WebhookEvent::OnSuccess => "success",
            WebhookEvent::OnFailed => "failed",
            WebhookEvent::OnIntegrityAlert => "integrity_alert",
            WebhookEvent::OnRunHalted => "run_halted",
        };
        let payload = Arc::new(WebhookPayload {
            event: event_str.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            details: event.clone(),
        });
        let client = self.client.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            for webhook in matching {
                let mut request = client
                    .post(&webhook.url)
                    .json(payload.as_ref())
                    .timeout(webhook.timeout);
                if let Some(auth) = &webhook.auth_header {
                    request = request.header("Authorization", auth);
                }

                let url = webhook.url;
                let timeout = webhook.timeout;
                let error = match tokio::time::timeout(timeout, request.send()).await {
                    Ok(Ok(response)) if response.status().is_success() => {
                        tracing::debug!(url = %url, event = event_str, "webhook sent");
                        continue;
                    }
                    Ok(Ok(response)) => format!(
                        "Webhook returned status {}: {}",
                        response.status(),
                        response.text().await.unwrap_or_default()
                    ),
                    Ok(Err(e)) => format!("Failed to send webhook: {e}"),
                    Err(_) => format!("Webhook timed out after {timeout:?}"),
                };

                tracing::warn!(url = %url, error = %error, "webhook failed");
                event_tx.send(Event::WebhookFailed { url, error }).ok();
            }
        });
    }
}
