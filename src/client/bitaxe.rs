use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

use super::{CollectError, RetryPolicy};

/// HTTP client for Bitaxe devices. The firmware serves a JSON API on the
/// device's web port; every call is bounded by the request timeout and
/// transient failures are retried per the policy.
#[derive(Clone)]
pub struct BitaxeClient {
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl BitaxeClient {
    pub fn new(request_timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { http, retry })
    }

    /// Fetch the full system info payload from a device.
    pub async fn fetch_system_info(&self, ip: &str) -> Result<Value, CollectError> {
        let url = format!("http://{ip}/api/system/info");

        self.retry
            .run(|_attempt| {
                let http = self.http.clone();
                let url = url.clone();
                async move {
                    let response = http
                        .get(&url)
                        .send()
                        .await
                        .map_err(|e| CollectError::Transport(e.to_string()))?
                        .error_for_status()
                        .map_err(|e| CollectError::Transport(e.to_string()))?;

                    response
                        .json::<Value>()
                        .await
                        .map_err(|e| CollectError::Transport(format!("reading body: {e}")))
                }
            })
            .await
    }

    /// One-shot restart directive. Soft failure: the outcome is a boolean
    /// and the reason is logged, never propagated.
    pub async fn restart(&self, ip: &str, device_id: &str) -> bool {
        let url = format!("http://{ip}/api/system/restart");
        info!(device = device_id, %url, "sending restart command");

        match self.http.post(&url).send().await {
            Ok(response) => match response.error_for_status() {
                Ok(_) => {
                    info!(device = device_id, "restart command accepted");
                    true
                }
                Err(e) => {
                    warn!(device = device_id, error = %e, "restart command rejected");
                    false
                }
            },
            Err(e) => {
                warn!(device = device_id, error = %e, "restart command failed");
                false
            }
        }
    }
}
