use async_trait::async_trait;
use sqlx::{PgPool, Row};
use thiserror::Error;

use crate::types::{
    Device, DeviceFamily, DeviceStatus, HardwareSample, MiningSample, PoolSample,
    SystemInfoSample,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("inconsistent row: {0}")]
    Corrupt(String),
}

/// Append-only time-series storage plus device status, consumed by the
/// scheduler and the anomaly detector. Sample tables are insert-only;
/// device rows are the only mutable state.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn insert_mining_sample(
        &self,
        device_id: i64,
        sample: &MiningSample,
    ) -> Result<(), StoreError>;

    async fn insert_hardware_sample(
        &self,
        device_id: i64,
        sample: &HardwareSample,
    ) -> Result<(), StoreError>;

    async fn insert_system_info(
        &self,
        device_id: i64,
        sample: &SystemInfoSample,
    ) -> Result<(), StoreError>;

    /// The most recent mining samples for a device, newest first.
    async fn recent_mining_samples(
        &self,
        device_id: i64,
        limit: i64,
    ) -> Result<Vec<MiningSample>, StoreError>;

    /// The best-difficulty value preceding the most recent positive one,
    /// i.e. excluding the sample that was just written. 0.0 when the device
    /// has no prior record.
    async fn previous_best_difficulty(&self, device_id: i64) -> Result<f64, StoreError>;

    async fn device_status(&self, device_id: i64) -> Result<Option<DeviceStatus>, StoreError>;

    /// Record the outcome of a poll and return the state it replaced, in
    /// one atomic step so edge detection cannot double-fire under retried
    /// polls. `last_seen_at` only advances on a successful contact.
    async fn set_device_status(
        &self,
        device_id: i64,
        online: bool,
        error_message: &str,
    ) -> Result<Option<DeviceStatus>, StoreError>;

    /// Enrolled devices of one family. Soft-deactivated devices are
    /// excluded here but keep their history.
    async fn active_devices(&self, family: DeviceFamily) -> Result<Vec<Device>, StoreError>;

    async fn insert_pool_sample(&self, sample: &PoolSample) -> Result<(), StoreError>;
}

/// Postgres-backed store. Connections are pooled and acquired per
/// operation, so a stalled device poll never pins one for a whole cycle.
pub struct PgStore {
    pool: PgPool,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id BIGSERIAL PRIMARY KEY,
    family TEXT NOT NULL,
    device_id TEXT NOT NULL UNIQUE,
    device_name TEXT NOT NULL,
    ip_address TEXT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    is_online BOOLEAN NOT NULL DEFAULT TRUE,
    last_seen_at TIMESTAMPTZ,
    error_message TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS mining_samples (
    id BIGSERIAL PRIMARY KEY,
    device_id BIGINT NOT NULL REFERENCES devices(id),
    recorded_at TIMESTAMPTZ NOT NULL,
    hashrate_ghs DOUBLE PRECISION NOT NULL,
    shares_accepted BIGINT NOT NULL,
    shares_rejected BIGINT NOT NULL,
    blocks_found BIGINT NOT NULL,
    uptime_secs BIGINT NOT NULL,
    best_difficulty DOUBLE PRECISION NOT NULL,
    best_session_difficulty DOUBLE PRECISION NOT NULL,
    pool_url TEXT,
    pool_user TEXT
);
CREATE INDEX IF NOT EXISTS mining_samples_device_time
    ON mining_samples (device_id, recorded_at DESC);

CREATE TABLE IF NOT EXISTS hardware_samples (
    id BIGSERIAL PRIMARY KEY,
    device_id BIGINT NOT NULL REFERENCES devices(id),
    recorded_at TIMESTAMPTZ NOT NULL,
    power_watts DOUBLE PRECISION NOT NULL,
    efficiency_j_per_th DOUBLE PRECISION NOT NULL,
    temperature_c DOUBLE PRECISION NOT NULL,
    fan_speed_rpm INTEGER NOT NULL,
    voltage DOUBLE PRECISION NOT NULL,
    frequency_mhz DOUBLE PRECISION NOT NULL
);
CREATE INDEX IF NOT EXISTS hardware_samples_device_time
    ON hardware_samples (device_id, recorded_at DESC);

CREATE TABLE IF NOT EXISTS system_info_samples (
    id BIGSERIAL PRIMARY KEY,
    device_id BIGINT NOT NULL REFERENCES devices(id),
    recorded_at TIMESTAMPTZ NOT NULL,
    model TEXT,
    firmware_version TEXT,
    mac_address TEXT,
    hostname TEXT,
    wifi_rssi INTEGER NOT NULL,
    memory_usage_percent DOUBLE PRECISION NOT NULL,
    overheat_mode INTEGER NOT NULL,
    display_rotation INTEGER NOT NULL,
    display_timeout INTEGER NOT NULL,
    free_heap BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS pool_samples (
    id BIGSERIAL PRIMARY KEY,
    pool_address TEXT NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL,
    hashrate_1m TEXT NOT NULL,
    hashrate_5m TEXT NOT NULL,
    hashrate_1hr TEXT NOT NULL,
    hashrate_1d TEXT NOT NULL,
    hashrate_7d TEXT NOT NULL,
    hashrate_1m_ghs DOUBLE PRECISION NOT NULL,
    hashrate_1d_ghs DOUBLE PRECISION NOT NULL,
    last_share BIGINT NOT NULL,
    workers BIGINT NOT NULL,
    shares BIGINT NOT NULL,
    best_share DOUBLE PRECISION NOT NULL,
    best_ever DOUBLE PRECISION NOT NULL,
    authorised BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS collector_settings (
    id SMALLINT PRIMARY KEY CHECK (id = 1),
    polling_interval_minutes BIGINT NOT NULL DEFAULT 15,
    device_check_interval_minutes BIGINT NOT NULL DEFAULT 5,
    pool_backend TEXT NOT NULL DEFAULT 'ckpool',
    ckpool_address TEXT NOT NULL DEFAULT '',
    ckpool_url TEXT NOT NULL DEFAULT 'https://eusolo.ckpool.org',
    publicpool_address TEXT NOT NULL DEFAULT '',
    publicpool_url TEXT NOT NULL DEFAULT 'http://localhost:3334',
    telegram_enabled BOOLEAN NOT NULL DEFAULT FALSE,
    telegram_bot_token TEXT NOT NULL DEFAULT '',
    telegram_chat_id TEXT NOT NULL DEFAULT ''
);
"#;

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create any missing tables. Idempotent, run once at startup.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    fn row_to_mining_sample(row: &sqlx::postgres::PgRow) -> Result<MiningSample, StoreError> {
        Ok(MiningSample {
            timestamp: row.try_get("recorded_at")?,
            hashrate_ghs: row.try_get("hashrate_ghs")?,
            shares_accepted: row.try_get("shares_accepted")?,
            shares_rejected: row.try_get("shares_rejected")?,
            blocks_found: row.try_get("blocks_found")?,
            uptime_secs: row.try_get("uptime_secs")?,
            best_difficulty: row.try_get("best_difficulty")?,
            best_session_difficulty: row.try_get("best_session_difficulty")?,
            pool_url: row.try_get("pool_url")?,
            pool_user: row.try_get("pool_user")?,
        })
    }
}

#[async_trait]
impl HistoryStore for PgStore {
    async fn insert_mining_sample(
        &self,
        device_id: i64,
        sample: &MiningSample,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO mining_samples (
                device_id, recorded_at, hashrate_ghs, shares_accepted,
                shares_rejected, blocks_found, uptime_secs,
                best_difficulty, best_session_difficulty, pool_url, pool_user
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(device_id)
        .bind(sample.timestamp)
        .bind(sample.hashrate_ghs)
        .bind(sample.shares_accepted)
        .bind(sample.shares_rejected)
        .bind(sample.blocks_found)
        .bind(sample.uptime_secs)
        .bind(sample.best_difficulty)
        .bind(sample.best_session_difficulty)
        .bind(&sample.pool_url)
        .bind(&sample.pool_user)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_hardware_sample(
        &self,
        device_id: i64,
        sample: &HardwareSample,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO hardware_samples (
                device_id, recorded_at, power_watts, efficiency_j_per_th,
                temperature_c, fan_speed_rpm, voltage, frequency_mhz
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(device_id)
        .bind(sample.timestamp)
        .bind(sample.power_watts)
        .bind(sample.efficiency_j_per_th)
        .bind(sample.temperature_c)
        .bind(sample.fan_speed_rpm)
        .bind(sample.voltage)
        .bind(sample.frequency_mhz)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_system_info(
        &self,
        device_id: i64,
        sample: &SystemInfoSample,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO system_info_samples (
                device_id, recorded_at, model, firmware_version, mac_address,
                hostname, wifi_rssi, memory_usage_percent, overheat_mode,
                display_rotation, display_timeout, free_heap
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(device_id)
        .bind(sample.timestamp)
        .bind(&sample.model)
        .bind(&sample.firmware_version)
        .bind(&sample.mac_address)
        .bind(&sample.hostname)
        .bind(sample.wifi_rssi)
        .bind(sample.memory_usage_percent)
        .bind(sample.overheat_mode)
        .bind(sample.display_rotation)
        .bind(sample.display_timeout)
        .bind(sample.free_heap)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_mining_samples(
        &self,
        device_id: i64,
        limit: i64,
    ) -> Result<Vec<MiningSample>, StoreError> {
        let rows = sqlx::query(
            "SELECT recorded_at, hashrate_ghs, shares_accepted, shares_rejected,
                    blocks_found, uptime_secs, best_difficulty,
                    best_session_difficulty, pool_url, pool_user
             FROM mining_samples
             WHERE device_id = $1
             ORDER BY recorded_at DESC, id DESC
             LIMIT $2",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_mining_sample).collect()
    }

    async fn previous_best_difficulty(&self, device_id: i64) -> Result<f64, StoreError> {
        let row = sqlx::query(
            "SELECT best_difficulty
             FROM mining_samples
             WHERE device_id = $1 AND best_difficulty > 0
             ORDER BY recorded_at DESC, id DESC
             LIMIT 1 OFFSET 1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => row.try_get("best_difficulty")?,
            None => 0.0,
        })
    }

    async fn device_status(&self, device_id: i64) -> Result<Option<DeviceStatus>, StoreError> {
        let row = sqlx::query(
            "SELECT is_online, last_seen_at FROM devices WHERE id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(DeviceStatus {
                is_online: row.try_get("is_online")?,
                last_seen_at: row.try_get("last_seen_at")?,
            }),
            None => None,
        })
    }

    async fn set_device_status(
        &self,
        device_id: i64,
        online: bool,
        error_message: &str,
    ) -> Result<Option<DeviceStatus>, StoreError> {
        // Row-locked read-and-update in one statement: the returned state is
        // exactly what this write replaced.
        let row = sqlx::query(
            "UPDATE devices AS d
             SET is_online = $2,
                 last_seen_at = CASE WHEN $2 THEN now() ELSE d.last_seen_at END,
                 error_message = $3
             FROM (
                 SELECT id, is_online, last_seen_at
                 FROM devices
                 WHERE id = $1
                 FOR UPDATE
             ) AS prev
             WHERE d.id = prev.id
             RETURNING prev.is_online AS was_online,
                       prev.last_seen_at AS prev_last_seen",
        )
        .bind(device_id)
        .bind(online)
        .bind(error_message)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(DeviceStatus {
                is_online: row.try_get("was_online")?,
                last_seen_at: row.try_get("prev_last_seen")?,
            }),
            None => None,
        })
    }

    async fn active_devices(&self, family: DeviceFamily) -> Result<Vec<Device>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, device_id, device_name, ip_address
             FROM devices
             WHERE family = $1 AND is_active = TRUE
             ORDER BY device_id",
        )
        .bind(family.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Device {
                    id: row.try_get("id")?,
                    device_id: row.try_get("device_id")?,
                    name: row.try_get("device_name")?,
                    ip_address: row.try_get("ip_address")?,
                    family,
                })
            })
            .collect()
    }

    async fn insert_pool_sample(&self, sample: &PoolSample) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pool_samples (
                pool_address, recorded_at,
                hashrate_1m, hashrate_5m, hashrate_1hr, hashrate_1d, hashrate_7d,
                hashrate_1m_ghs, hashrate_1d_ghs,
                last_share, workers, shares, best_share, best_ever, authorised
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(&sample.pool_address)
        .bind(sample.timestamp)
        .bind(&sample.hashrate_1m)
        .bind(&sample.hashrate_5m)
        .bind(&sample.hashrate_1hr)
        .bind(&sample.hashrate_1d)
        .bind(&sample.hashrate_7d)
        .bind(sample.hashrate_1m_ghs)
        .bind(sample.hashrate_1d_ghs)
        .bind(sample.last_share)
        .bind(sample.workers)
        .bind(sample.shares)
        .bind(sample.best_share)
        .bind(sample.best_ever)
        .bind(sample.authorised)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
