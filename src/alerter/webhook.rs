use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use super::AlertSink;
use crate::config::WebhookConfig;
use crate::types::AlertEvent;

/// Custom webhook alert channel
pub struct WebhookSink {
    url: String,
    headers: std::collections::HashMap<String, String>,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        Ok(Self {
            url: config.url.clone(),
            headers: config.headers.clone(),
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, event: &AlertEvent) -> Result<()> {
        let payload = json!({
            "kind": event.kind(),
            "device_id": event.device_id(),
            "event": event,
            "timestamp": Utc::now().to_rfc3339(),
        });

        let mut request = self.client.post(&self.url).json(&payload);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        request.send().await?.error_for_status()?;
        Ok(())
    }
}
