use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use super::PoolBackend;
use crate::client::{CollectError, RetryPolicy};
use crate::metrics::format_hashrate;
use crate::types::PoolSample;

/// Public Pool backend. Unlike ckpool, hashrates arrive as raw numeric
/// H/s values; only a fixed-scale division is needed. The API has no
/// per-window statistics, so every window column carries the current rate.
pub struct PublicpoolBackend {
    api_url: String,
    address: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl PublicpoolBackend {
    pub fn new(
        base_url: &str,
        address: &str,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let mut api_url = base_url.trim_end_matches('/').to_string();
        if !api_url.ends_with("/api") {
            api_url.push_str("/api");
        }

        Ok(Self {
            api_url,
            address: address.to_string(),
            http: reqwest::Client::builder().timeout(request_timeout).build()?,
            retry,
        })
    }

    async fn get_json(&self, url: String) -> Result<Value, CollectError> {
        self.retry
            .run(|_attempt| {
                let http = self.http.clone();
                let url = url.clone();
                async move {
                    http.get(&url)
                        .send()
                        .await
                        .map_err(|e| CollectError::Transport(e.to_string()))?
                        .error_for_status()
                        .map_err(|e| CollectError::Transport(e.to_string()))?
                        .json::<Value>()
                        .await
                        .map_err(|e| CollectError::Decode(e.to_string()))
                }
            })
            .await
    }
}

#[async_trait::async_trait]
impl PoolBackend for PublicpoolBackend {
    fn name(&self) -> &'static str {
        "publicpool"
    }

    async fn fetch_stats(&self) -> Result<PoolSample, CollectError> {
        let client_stats = self
            .get_json(format!("{}/client/{}", self.api_url, self.address))
            .await?;

        // Pool-wide totals are nice-to-have; their absence never fails the
        // collection.
        let pool_stats = match self.get_json(format!("{}/pool", self.api_url)).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "could not fetch pool-wide stats");
                None
            }
        };

        Ok(build_sample(
            &client_stats,
            pool_stats.as_ref(),
            &self.address,
            Utc::now(),
        ))
    }
}

/// Map client stats (and optional pool-wide stats) onto a pool sample.
/// The user's total hashrate is the sum over reported workers, in H/s.
pub fn build_sample(
    client_stats: &Value,
    pool_stats: Option<&Value>,
    address: &str,
    now: DateTime<Utc>,
) -> PoolSample {
    let workers = client_stats
        .get("workers")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let total_hashrate_hs: f64 = workers
        .iter()
        .filter_map(|w| w.get("hashRate").and_then(Value::as_f64))
        .sum();

    let workers_count = client_stats
        .get("workersCount")
        .and_then(Value::as_i64)
        .unwrap_or(workers.len() as i64);

    let best_difficulty = client_stats
        .get("bestDifficulty")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    let pool_total_miners = pool_stats
        .and_then(|p| p.get("totalMiners"))
        .and_then(Value::as_i64)
        .unwrap_or(0);

    let formatted = format_hashrate(total_hashrate_hs);
    let hashrate_ghs = total_hashrate_hs / 1e9;

    PoolSample {
        pool_address: address.to_string(),
        timestamp: now,
        hashrate_1m: formatted.clone(),
        hashrate_5m: formatted.clone(),
        hashrate_1hr: formatted.clone(),
        hashrate_1d: formatted.clone(),
        hashrate_7d: formatted,
        hashrate_1m_ghs: hashrate_ghs,
        hashrate_1d_ghs: hashrate_ghs,
        last_share: 0,
        workers: workers_count,
        shares: 0,
        best_share: best_difficulty,
        best_ever: best_difficulty,
        authorised: pool_total_miners,
    }
}
