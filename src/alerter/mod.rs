pub mod telegram;
pub mod webhook;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, warn};

use crate::config::AlertingConfig;
use crate::settings::CollectorSettings;
use crate::types::AlertEvent;

/// Trait for alert delivery channels
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Channel name
    fn name(&self) -> &str;

    /// Deliver a single event
    async fn send(&self, event: &AlertEvent) -> Result<()>;
}

/// Token bucket limiting alert volume per minute.
pub struct RateLimiter {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self {
            tokens: per_minute as f64,
            max_tokens: per_minute as f64,
            refill_rate: per_minute as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Fans one event out to every configured sink. Delivery is best-effort:
/// a failed send is logged and never retried, and nothing here can block
/// data persistence.
pub struct AlertDispatcher {
    sinks: Vec<Box<dyn AlertSink>>,
    limiter: Arc<Mutex<RateLimiter>>,
}

impl AlertDispatcher {
    /// Build the sink set for one cycle. The Telegram sink comes from the
    /// hot-reloaded settings row, so credential changes apply on the next
    /// cycle; the webhook sink is static file configuration.
    pub fn from_settings(
        settings: &CollectorSettings,
        alerting: &AlertingConfig,
        limiter: Arc<Mutex<RateLimiter>>,
    ) -> Self {
        let mut sinks: Vec<Box<dyn AlertSink>> = Vec::new();

        if settings.telegram_enabled
            && !settings.telegram_bot_token.is_empty()
            && !settings.telegram_chat_id.is_empty()
        {
            match telegram::TelegramSink::new(
                &settings.telegram_bot_token,
                &settings.telegram_chat_id,
            ) {
                Ok(sink) => sinks.push(Box::new(sink)),
                Err(e) => warn!(error = %e, "telegram sink unavailable"),
            }
        }

        if let Some(ref wc) = alerting.webhook {
            if wc.enabled {
                match webhook::WebhookSink::new(wc) {
                    Ok(sink) => sinks.push(Box::new(sink)),
                    Err(e) => warn!(error = %e, "webhook sink unavailable"),
                }
            }
        }

        Self { sinks, limiter }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub async fn dispatch(&self, event: &AlertEvent) {
        if self.sinks.is_empty() {
            tracing::debug!(kind = event.kind(), "no alert sinks configured");
            return;
        }

        if !self.limiter.lock().unwrap().try_acquire() {
            warn!(
                kind = event.kind(),
                device = event.device_id(),
                "alert rate limited"
            );
            return;
        }

        for sink in &self.sinks {
            if let Err(e) = sink.send(event).await {
                error!(
                    channel = sink.name(),
                    kind = event.kind(),
                    error = %e,
                    "failed to deliver alert"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_exhausts_and_refills() {
        let mut limiter = RateLimiter::new(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }
}
