use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

use crate::store::StoreError;

/// Which pool integration is active. Exactly one polls per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolBackendKind {
    Ckpool,
    Publicpool,
}

impl PoolBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolBackendKind::Ckpool => "ckpool",
            PoolBackendKind::Publicpool => "publicpool",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "publicpool" => PoolBackendKind::Publicpool,
            // Unknown values fall back to the default backend
            _ => PoolBackendKind::Ckpool,
        }
    }
}

/// Collector runtime settings. These live in a single fixed-key row that
/// the dashboard API mutates; the scheduler re-reads them at the start of
/// every cycle so changes apply without a restart.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorSettings {
    pub polling_interval_minutes: u64,
    pub device_check_interval_minutes: u64,
    pub pool_backend: PoolBackendKind,
    pub ckpool_address: String,
    pub ckpool_url: String,
    pub publicpool_address: String,
    pub publicpool_url: String,
    #[serde(skip_serializing)]
    pub telegram_enabled: bool,
    #[serde(skip_serializing)]
    pub telegram_bot_token: String,
    #[serde(skip_serializing)]
    pub telegram_chat_id: String,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            polling_interval_minutes: 15,
            device_check_interval_minutes: 5,
            pool_backend: PoolBackendKind::Ckpool,
            ckpool_address: String::new(),
            ckpool_url: "https://eusolo.ckpool.org".to_string(),
            publicpool_address: String::new(),
            publicpool_url: "http://localhost:3334".to_string(),
            telegram_enabled: false,
            telegram_bot_token: String::new(),
            telegram_chat_id: String::new(),
        }
    }
}

impl CollectorSettings {
    /// The address and base URL of whichever pool backend is selected.
    pub fn active_pool(&self) -> (&str, &str) {
        match self.pool_backend {
            PoolBackendKind::Ckpool => (&self.ckpool_address, &self.ckpool_url),
            PoolBackendKind::Publicpool => (&self.publicpool_address, &self.publicpool_url),
        }
    }
}

/// Source of the settings snapshot consumed by each cycle.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn load(&self) -> Result<CollectorSettings, StoreError>;
}

/// Settings backed by the fixed-key `collector_settings` row. The
/// "exactly one instance" invariant is a property of the access pattern:
/// reads get-or-create at id 1, never anywhere else.
pub struct PgSettings {
    pool: PgPool,
}

impl PgSettings {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsSource for PgSettings {
    async fn load(&self) -> Result<CollectorSettings, StoreError> {
        let row = sqlx::query(
            "SELECT polling_interval_minutes, device_check_interval_minutes,
                    pool_backend, ckpool_address, ckpool_url,
                    publicpool_address, publicpool_url,
                    telegram_enabled, telegram_bot_token, telegram_chat_id
             FROM collector_settings
             WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            sqlx::query(
                "INSERT INTO collector_settings (id) VALUES (1)
                 ON CONFLICT (id) DO NOTHING",
            )
            .execute(&self.pool)
            .await?;
            tracing::info!("seeded default collector settings");
            return Ok(CollectorSettings::default());
        };

        let backend: String = row.try_get("pool_backend")?;
        let polling: i64 = row.try_get("polling_interval_minutes")?;
        let device_check: i64 = row.try_get("device_check_interval_minutes")?;

        Ok(CollectorSettings {
            polling_interval_minutes: polling.max(1) as u64,
            device_check_interval_minutes: device_check.max(1) as u64,
            pool_backend: PoolBackendKind::parse(&backend),
            ckpool_address: row.try_get("ckpool_address")?,
            ckpool_url: row.try_get("ckpool_url")?,
            publicpool_address: row.try_get("publicpool_address")?,
            publicpool_url: row.try_get("publicpool_url")?,
            telegram_enabled: row.try_get("telegram_enabled")?,
            telegram_bot_token: row.try_get("telegram_bot_token")?,
            telegram_chat_id: row.try_get("telegram_chat_id")?,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Fixed settings for scheduler tests.
    pub struct FixedSettings {
        inner: Mutex<CollectorSettings>,
    }

    impl FixedSettings {
        pub fn new(settings: CollectorSettings) -> Self {
            Self { inner: Mutex::new(settings) }
        }
    }

    #[async_trait]
    impl SettingsSource for FixedSettings {
        async fn load(&self) -> Result<CollectorSettings, StoreError> {
            Ok(self.inner.lock().unwrap().clone())
        }
    }
}
