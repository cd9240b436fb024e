use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::alerter::{AlertDispatcher, RateLimiter};
use crate::client::{AvalonClient, BitaxeClient, CollectError, RetryPolicy};
use crate::config::{AlertingConfig, CollectorConfig};
use crate::detector::AnomalyDetector;
use crate::metrics;
use crate::pool;
use crate::protocol;
use crate::registry::DeviceRegistry;
use crate::settings::{CollectorSettings, SettingsSource};
use crate::store::HistoryStore;
use crate::types::{AlertEvent, Device, DeviceFamily, DeviceSnapshot};

/// Request timeout against pool APIs, which sit behind the public internet
/// rather than on the LAN.
const POOL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FamilyOutcome {
    pub attempted: usize,
    pub succeeded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolOutcome {
    Skipped,
    Ok,
    Failed,
}

/// Best-effort report of one collection cycle, kept for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub bitaxe: FamilyOutcome,
    pub avalon: FamilyOutcome,
    pub pool: PoolOutcome,
}

/// The orchestrating loop: fires a cycle per polling interval, walks the
/// registry, and runs the fetch, decode, persist and detect steps per device.
///
/// Cycles never overlap: the periodic driver and the manual trigger both
/// take the same async lock, so an out-of-band `/poll` while a scheduled
/// cycle runs queues behind it instead of racing it. Within a cycle,
/// distinct devices are polled concurrently up to the configured bound,
/// while each device's own persist-then-detect steps stay sequential.
pub struct CollectionScheduler {
    store: Arc<dyn HistoryStore>,
    settings_source: Arc<dyn SettingsSource>,
    registry: Arc<DeviceRegistry>,
    detector: AnomalyDetector,
    bitaxe: BitaxeClient,
    avalon: AvalonClient,
    retry: RetryPolicy,
    concurrency: usize,
    alerting: AlertingConfig,
    limiter: Arc<StdMutex<RateLimiter>>,
    cycle_lock: Mutex<()>,
    current_settings: RwLock<CollectorSettings>,
    last_summary: RwLock<Option<CycleSummary>>,
}

impl CollectionScheduler {
    pub fn new(
        store: Arc<dyn HistoryStore>,
        settings_source: Arc<dyn SettingsSource>,
        registry: Arc<DeviceRegistry>,
        collector: &CollectorConfig,
        alerting: AlertingConfig,
    ) -> Result<Self> {
        let retry = RetryPolicy::new(
            collector.retry_max_attempts,
            Duration::from_secs(collector.retry_base_secs),
            Duration::from_secs(collector.retry_max_secs),
        );
        let request_timeout = Duration::from_secs(collector.request_timeout_secs);

        Ok(Self {
            store,
            settings_source,
            registry,
            detector: AnomalyDetector,
            bitaxe: BitaxeClient::new(request_timeout, retry)?,
            avalon: AvalonClient::new(request_timeout, retry),
            retry,
            concurrency: collector.concurrency.max(1),
            limiter: Arc::new(StdMutex::new(RateLimiter::new(alerting.rate_limit_per_minute))),
            alerting,
            cycle_lock: Mutex::new(()),
            current_settings: RwLock::new(CollectorSettings::default()),
            last_summary: RwLock::new(None),
        })
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        self.registry.clone()
    }

    pub fn current_settings(&self) -> CollectorSettings {
        self.current_settings.read().unwrap().clone()
    }

    pub fn last_summary(&self) -> Option<CycleSummary> {
        self.last_summary.read().unwrap().clone()
    }

    /// Periodic driver. The first cycle runs immediately; the sleep after
    /// each cycle uses the interval that cycle loaded, so interval changes
    /// take effect on the next schedule.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.run_cycle().await;
            let minutes = self
                .current_settings
                .read()
                .unwrap()
                .polling_interval_minutes
                .max(1);
            tokio::time::sleep(Duration::from_secs(minutes * 60)).await;
        }
    }

    /// Device-list refresh between cycles, so newly registered devices show
    /// up in `/status` before the next poll picks them up.
    pub async fn run_device_check(self: Arc<Self>) {
        loop {
            let minutes = self
                .current_settings
                .read()
                .unwrap()
                .device_check_interval_minutes
                .max(1);
            tokio::time::sleep(Duration::from_secs(minutes * 60)).await;
            if let Err(e) = self.registry.refresh().await {
                warn!(error = %e, "device registry refresh failed");
            }
        }
    }

    /// Run exactly one collection cycle. Safe to call while the periodic
    /// schedule is pending; invocations serialize on the cycle lock.
    pub async fn run_cycle(&self) -> CycleSummary {
        let _guard = self.cycle_lock.lock().await;
        let started_at = Utc::now();
        let started = Instant::now();
        info!("starting collection cycle");

        match self.settings_source.load().await {
            Ok(settings) => *self.current_settings.write().unwrap() = settings,
            Err(e) => {
                warn!(error = %e, "settings reload failed, keeping previous values")
            }
        }
        let settings = self.current_settings.read().unwrap().clone();

        let alerts =
            AlertDispatcher::from_settings(&settings, &self.alerting, self.limiter.clone());

        let devices = match self.registry.refresh().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "device registry reload failed, using last known set");
                self.registry.snapshot()
            }
        };

        let bitaxe = self
            .poll_family(DeviceFamily::Bitaxe, devices.family(DeviceFamily::Bitaxe), &alerts)
            .await;
        let avalon = self
            .poll_family(DeviceFamily::Avalon, devices.family(DeviceFamily::Avalon), &alerts)
            .await;

        let pool = self.poll_pool(&settings).await;

        let summary = CycleSummary {
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            bitaxe,
            avalon,
            pool,
        };
        *self.last_summary.write().unwrap() = Some(summary.clone());

        info!(
            duration_ms = summary.duration_ms,
            bitaxe_ok = summary.bitaxe.succeeded,
            bitaxe_total = summary.bitaxe.attempted,
            avalon_ok = summary.avalon.succeeded,
            avalon_total = summary.avalon.attempted,
            pool = ?summary.pool,
            "collection cycle completed"
        );
        summary
    }

    async fn poll_family(
        &self,
        family: DeviceFamily,
        devices: &[Device],
        alerts: &AlertDispatcher,
    ) -> FamilyOutcome {
        if devices.is_empty() {
            info!(%family, "no devices configured for collection");
            return FamilyOutcome::default();
        }

        let results: Vec<bool> = stream::iter(devices.iter().cloned())
            .map(|device| async move { self.poll_device(&device, alerts).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        FamilyOutcome {
            attempted: devices.len(),
            succeeded: results.into_iter().filter(|ok| *ok).count(),
        }
    }

    /// Full pipeline for one device. Failures are isolated here: whatever
    /// happens, the cycle continues with the other devices.
    async fn poll_device(&self, device: &Device, alerts: &AlertDispatcher) -> bool {
        let snapshot = match self.fetch_snapshot(device).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    device = %device.device_id,
                    ip = %device.ip_address,
                    error = %e,
                    "device poll failed"
                );
                self.record_outcome(device, false, &e.to_string(), alerts).await;
                return false;
            }
        };

        self.record_outcome(device, true, "", alerts).await;

        // A failed write skips this device's detection for the cycle; the
        // rules would otherwise compare against a window missing its head.
        if let Err(e) = self
            .store
            .insert_mining_sample(device.id, &snapshot.mining)
            .await
        {
            error!(device = %device.device_id, error = %e, "failed to persist mining sample");
            return false;
        }
        if let Err(e) = self
            .store
            .insert_hardware_sample(device.id, &snapshot.hardware)
            .await
        {
            error!(device = %device.device_id, error = %e, "failed to persist hardware sample");
            return false;
        }
        if let Err(e) = self
            .store
            .insert_system_info(device.id, &snapshot.system)
            .await
        {
            error!(device = %device.device_id, error = %e, "failed to persist system info");
            return false;
        }

        match self
            .detector
            .evaluate_sample(self.store.as_ref(), device, &snapshot.mining)
            .await
        {
            Ok(detection) => {
                for event in &detection.events {
                    alerts.dispatch(event).await;
                }
                if detection.restart_requested && self.restart_device(device).await {
                    alerts
                        .dispatch(&AlertEvent::DeviceRestarted {
                            device_id: device.device_id.clone(),
                            device_name: device.name.clone(),
                        })
                        .await;
                }
            }
            Err(e) => {
                error!(device = %device.device_id, error = %e, "anomaly evaluation failed")
            }
        }

        info!(
            device = %device.device_id,
            hashrate_ghs = snapshot.mining.hashrate_ghs,
            temperature_c = snapshot.hardware.temperature_c,
            reject_rate = metrics::reject_rate_percent(
                snapshot.mining.shares_accepted,
                snapshot.mining.shares_rejected
            ),
            "collected device sample"
        );
        true
    }

    async fn record_outcome(
        &self,
        device: &Device,
        online: bool,
        error_message: &str,
        alerts: &AlertDispatcher,
    ) {
        match self
            .detector
            .record_poll_outcome(self.store.as_ref(), device, online, error_message)
            .await
        {
            Ok(Some(event)) => alerts.dispatch(&event).await,
            Ok(None) => {}
            Err(e) => {
                error!(device = %device.device_id, error = %e, "device status update failed")
            }
        }
    }

    async fn fetch_snapshot(&self, device: &Device) -> Result<DeviceSnapshot, CollectError> {
        match device.family {
            DeviceFamily::Bitaxe => {
                let info = self.bitaxe.fetch_system_info(&device.ip_address).await?;
                protocol::bitaxe::decode(&info, Utc::now())
            }
            DeviceFamily::Avalon => {
                let ip = &device.ip_address;
                let version = self.avalon.request(ip, "version").await?;
                let summary = self.avalon.request(ip, "summary").await?;
                let stats = self.avalon.request(ip, "estats").await?;
                let pools = self.avalon.request(ip, "pools").await?;

                Ok(protocol::avalon::snapshot(
                    &protocol::avalon::parse_response(&version),
                    &protocol::avalon::parse_response(&summary),
                    &protocol::avalon::parse_response(&stats),
                    &protocol::avalon::parse_response(&pools),
                    Utc::now(),
                ))
            }
        }
    }

    async fn restart_device(&self, device: &Device) -> bool {
        match device.family {
            DeviceFamily::Bitaxe => {
                self.bitaxe.restart(&device.ip_address, &device.device_id).await
            }
            DeviceFamily::Avalon => {
                self.avalon.restart(&device.ip_address, &device.device_id).await
            }
        }
    }

    async fn poll_pool(&self, settings: &CollectorSettings) -> PoolOutcome {
        let backend = match pool::from_settings(settings, POOL_REQUEST_TIMEOUT, self.retry) {
            Ok(Some(backend)) => backend,
            Ok(None) => {
                info!(
                    backend = settings.pool_backend.as_str(),
                    "skipping pool polling, no address configured"
                );
                return PoolOutcome::Skipped;
            }
            Err(e) => {
                error!(error = %e, "pool backend construction failed");
                return PoolOutcome::Failed;
            }
        };

        match backend.fetch_stats().await {
            Ok(sample) => {
                info!(
                    backend = backend.name(),
                    hashrate = %sample.hashrate_1m,
                    workers = sample.workers,
                    "collected pool stats"
                );
                if let Err(e) = self.store.insert_pool_sample(&sample).await {
                    error!(error = %e, "failed to persist pool sample");
                    return PoolOutcome::Failed;
                }
                PoolOutcome::Ok
            }
            Err(e) => {
                error!(backend = backend.name(), error = %e, "pool polling failed");
                PoolOutcome::Failed
            }
        }
    }
}
