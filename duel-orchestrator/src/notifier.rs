// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Real-time duel event notifications.
//!
//! Every lifecycle transition is published to the duel's channel so connected
//! clients can update live. Delivery is best effort by design: a notification
//! that cannot be delivered is logged and dropped, and never affects the
//! state transition that produced it.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECS: u64 = 2;

/// Channel name carrying all events for one duel.
pub fn channel_for_duel(duel_id: &str) -> String {
    format!("duel:{}", duel_id)
}

/// Serialize `payload` and publish it to the duel's channel.
pub async fn publish_duel_event(
    notifier: &dyn RealtimeNotifier,
    duel_id: &str,
    event: &str,
    payload: impl serde::Serialize,
) {
    match serde_json::to_value(payload) {
        Ok(value) => {
            notifier
                .publish(&channel_for_duel(duel_id), event, value)
                .await
        }
        Err(e) => warn!(
            "[Notifier] Failed to encode `{}` payload for duel `{}`: {}",
            event, duel_id, e
        ),
    }
}

#[async_trait]
pub trait RealtimeNotifier: Send + Sync {
    fn is_configured(&self) -> bool;

    /// Publish `event` with `payload` to `channel`. Failures are handled
    /// internally; this never blocks a caller on delivery problems.
    async fn publish(&self, channel: &str, event: &str, payload: serde_json::Value);
}

/// Notifier that POSTs events to a realtime webhook gateway.
pub struct WebhookNotifier {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl std::fmt::Debug for WebhookNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookNotifier")
            .field("configured", &self.is_configured())
            .finish()
    }
}

impl WebhookNotifier {
    pub fn new(base_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap();
        Self {
            client,
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
        }
    }
}

#[async_trait]
impl RealtimeNotifier for WebhookNotifier {
    fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    async fn publish(&self, channel: &str, event: &str, payload: serde_json::Value) {
        let Some(base_url) = &self.base_url else {
            info!(
                "[Notifier] Not configured, would publish `{}` to {}",
                event, channel
            );
            return;
        };

        let url = format!("{}/channels/{}/events", base_url, channel);
        let body = json!({
            "event": event,
            "payload": payload,
        });

        for attempt in 0..MAX_RETRIES {
            match self.client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!("[Notifier] ✅ Published `{}` to {}", event, channel);
                    return;
                }
                Ok(resp) => {
                    warn!(
                        "[Notifier] Publish attempt {}/{} for `{}` failed: {}",
                        attempt + 1,
                        MAX_RETRIES,
                        event,
                        resp.status()
                    );
                }
                Err(e) => {
                    warn!(
                        "[Notifier] Publish attempt {}/{} for `{}` failed: {:?}",
                        attempt + 1,
                        MAX_RETRIES,
                        event,
                        e
                    );
                }
            }

            if attempt < MAX_RETRIES - 1 {
                tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECS * (attempt as u64 + 1)))
                    .await;
            }
        }

        warn!(
            "[Notifier] Failed to publish `{}` to {} after {} attempts",
            event, channel, MAX_RETRIES
        );
    }
}
