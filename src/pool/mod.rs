pub mod ckpool;
pub mod publicpool;

use std::time::Duration;

use async_trait::async_trait;

use crate::client::{CollectError, RetryPolicy};
use crate::settings::{CollectorSettings, PoolBackendKind};
use crate::types::PoolSample;

/// A pool-side statistics source. Two wire variants exist; exactly one is
/// active at a time, selected by the settings row.
#[async_trait]
pub trait PoolBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_stats(&self) -> Result<PoolSample, CollectError>;
}

/// Build the backend selected by settings, or `None` when its address is
/// not configured (skipping pool collection is a log note, not an error).
pub fn from_settings(
    settings: &CollectorSettings,
    request_timeout: Duration,
    retry: RetryPolicy,
) -> anyhow::Result<Option<Box<dyn PoolBackend>>> {
    let (address, url) = settings.active_pool();
    if address.is_empty() {
        return Ok(None);
    }

    let backend: Box<dyn PoolBackend> = match settings.pool_backend {
        PoolBackendKind::Ckpool => {
            Box::new(ckpool::CkpoolBackend::new(url, address, request_timeout, retry)?)
        }
        PoolBackendKind::Publicpool => Box::new(publicpool::PublicpoolBackend::new(
            url,
            address,
            request_timeout,
            retry,
        )?),
    };

    Ok(Some(backend))
}
