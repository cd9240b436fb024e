use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::PoolBackend;
use crate::client::{CollectError, RetryPolicy};
use crate::protocol::parse_suffixed_hashrate_ghs;
use crate::types::PoolSample;

/// ckpool user-statistics backend. Hashrate windows arrive as
/// human-formatted strings with K/M/G/T/P suffixes.
pub struct CkpoolBackend {
    base_url: String,
    address: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl CkpoolBackend {
    pub fn new(
        base_url: &str,
        address: &str,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            address: address.to_string(),
            http: reqwest::Client::builder().timeout(request_timeout).build()?,
            retry,
        })
    }
}

#[async_trait::async_trait]
impl PoolBackend for CkpoolBackend {
    fn name(&self) -> &'static str {
        "ckpool"
    }

    async fn fetch_stats(&self) -> Result<PoolSample, CollectError> {
        let url = format!("{}/users/{}", self.base_url, self.address);

        let stats = self
            .retry
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
            .await?;

        Ok(build_sample(&stats, &self.address, Utc::now()))
    }
}

/// Map a ckpool user-stats payload onto a pool sample. Missing fields
/// degrade to zero/empty, matching the device decoders.
pub fn build_sample(stats: &Value, address: &str, now: DateTime<Utc>) -> PoolSample {
    let hashrate_1m = str_field(stats, "hashrate1m");
    let hashrate_1d = str_field(stats, "hashrate1d");

    PoolSample {
        pool_address: address.to_string(),
        timestamp: now,
        hashrate_1m_ghs: parse_suffixed_hashrate_ghs(&hashrate_1m),
        hashrate_1d_ghs: parse_suffixed_hashrate_ghs(&hashrate_1d),
        hashrate_1m,
        hashrate_5m: str_field(stats, "hashrate5m"),
        hashrate_1hr: str_field(stats, "hashrate1hr"),
        hashrate_1d,
        hashrate_7d: str_field(stats, "hashrate7d"),
        last_share: i64_field(stats, "lastshare"),
        workers: i64_field(stats, "workers"),
        shares: i64_field(stats, "shares"),
        best_share: f64_field(stats, "bestshare"),
        best_ever: f64_field(stats, "bestever"),
        authorised: i64_field(stats, "authorised"),
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("0")
        .to_string()
}

fn i64_field(value: &Value, key: &str) -> i64 {
    value.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn f64_field(value: &Value, key: &str) -> f64 {
    value.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}
