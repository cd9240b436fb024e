use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::store::{HistoryStore, StoreError};
use crate::types::{Device, DeviceFamily};

/// Snapshot of the enrolled device set, refreshed from persistent config.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub bitaxe: Vec<Device>,
    pub avalon: Vec<Device>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl RegistrySnapshot {
    pub fn family(&self, family: DeviceFamily) -> &[Device] {
        match family {
            DeviceFamily::Bitaxe => &self.bitaxe,
            DeviceFamily::Avalon => &self.avalon,
        }
    }

    pub fn total(&self) -> usize {
        self.bitaxe.len() + self.avalon.len()
    }
}

/// Holds the active set of devices to poll. Devices are registered and
/// deactivated through the dashboard API; this side only reads, so a
/// refresh at cycle start (plus the faster device-check loop) is the
/// hot-reload path.
pub struct DeviceRegistry {
    store: Arc<dyn HistoryStore>,
    snapshot: RwLock<RegistrySnapshot>,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store, snapshot: RwLock::new(RegistrySnapshot::default()) }
    }

    /// Re-read both families from storage and publish the new snapshot.
    pub async fn refresh(&self) -> Result<RegistrySnapshot, StoreError> {
        let bitaxe = self.store.active_devices(DeviceFamily::Bitaxe).await?;
        let avalon = self.store.active_devices(DeviceFamily::Avalon).await?;

        let snapshot = RegistrySnapshot {
            bitaxe,
            avalon,
            refreshed_at: Some(Utc::now()),
        };

        {
            let previous = self.snapshot.read().unwrap();
            if previous.total() != snapshot.total() {
                info!(
                    bitaxe = snapshot.bitaxe.len(),
                    avalon = snapshot.avalon.len(),
                    "active device set changed"
                );
            }
        }

        *self.snapshot.write().unwrap() = snapshot.clone();
        Ok(snapshot)
    }

    /// The most recently published snapshot, without touching storage.
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.snapshot.read().unwrap().clone()
    }
}
