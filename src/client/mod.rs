pub mod avalon;
pub mod bitaxe;

pub use avalon::AvalonClient;
pub use bitaxe::BitaxeClient;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Failure modes on the collection path. None of these are fatal to the
/// process; the scheduler records them per device and moves on.
#[derive(Debug, Error)]
pub enum CollectError {
    /// Retries exhausted against a device
    #[error("device unreachable after {attempts} attempts: {reason}")]
    Unreachable { attempts: u32, reason: String },

    /// Single-attempt transport failure; retried by the policy
    #[error("{0}")]
    Transport(String),

    /// The remote accepted the connection but sent nothing back
    #[error("empty response from device")]
    EmptyResponse,

    /// Structurally unusable wire data
    #[error("malformed response: {0}")]
    Decode(String),

    #[error(transparent)]
    Persistence(#[from] StoreError),
}

/// Explicit retry policy: a fixed attempt budget with exponential backoff.
///
/// Composed into each device client so the schedule can be exercised with
/// injected faults instead of real network failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay, max_delay }
    }

    /// Backoff before the attempt following `attempt` (1-based): doubles
    /// from the base, capped at the maximum.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    /// Run `op` until it succeeds or the attempt budget is spent, sleeping
    /// the backoff schedule between attempts. Exhaustion collapses into a
    /// single `Unreachable` carrying the last failure.
    pub async fn run<T, Fut, Op>(&self, mut op: Op) -> Result<T, CollectError>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CollectError>>,
    {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt < self.max_attempts {
                        let delay = self.delay_after(attempt);
                        tracing::debug!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "retrying after transient failure"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(CollectError::Unreachable {
            attempts: self.max_attempts,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts made".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(4), Duration::from_secs(8));
        assert_eq!(policy.delay_after(5), Duration::from_secs(10));
        assert_eq!(policy.delay_after(20), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_within_the_attempt_budget() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result = policy
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(CollectError::Transport("connection refused".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_as_unreachable() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CollectError::Transport("timed out".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(CollectError::Unreachable { attempts, reason }) => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("timed out"));
            }
            other => panic!("expected Unreachable, got {other:?}"),
        }
    }
}
