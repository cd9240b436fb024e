pub mod alerter;
pub mod client;
pub mod config;
pub mod detector;
pub mod http;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod settings;
pub mod store;

/// Common types used across modules
pub mod types {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    /// Device family, which determines the wire protocol spoken to the
    /// device and the reporting granularity of its firmware.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum DeviceFamily {
        /// HTTP/JSON API on port 80
        Bitaxe,
        /// cgminer-style text protocol over TCP 4028
        Avalon,
    }

    impl DeviceFamily {
        /// Absolute hashrate tolerance (GH/s) under which consecutive
        /// samples count as "unchanged". Bitaxe firmware reports to a tenth
        /// of a GH/s, Avalon to a hundredth, so the thresholds differ.
        pub fn stagnation_tolerance_ghs(&self) -> f64 {
            match self {
                DeviceFamily::Bitaxe => 0.1,
                DeviceFamily::Avalon => 0.01,
            }
        }

        pub fn as_str(&self) -> &'static str {
            match self {
                DeviceFamily::Bitaxe => "bitaxe",
                DeviceFamily::Avalon => "avalon",
            }
        }
    }

    impl std::fmt::Display for DeviceFamily {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl std::str::FromStr for DeviceFamily {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s {
                "bitaxe" => Ok(DeviceFamily::Bitaxe),
                "avalon" => Ok(DeviceFamily::Avalon),
                other => Err(format!("unknown device family: {other}")),
            }
        }
    }

    /// A registered device, as enumerated from the registry.
    #[derive(Debug, Clone, Serialize)]
    pub struct Device {
        /// Storage row id
        pub id: i64,
        /// Stable external identifier
        pub device_id: String,
        pub name: String,
        pub ip_address: String,
        pub family: DeviceFamily,
    }

    /// Online/offline state of a device as last recorded in storage.
    #[derive(Debug, Clone, Serialize)]
    pub struct DeviceStatus {
        pub is_online: bool,
        pub last_seen_at: Option<DateTime<Utc>>,
    }

    /// One observation of a device's mining performance. Insert-only;
    /// timestamps strictly increase per device in storage order.
    #[derive(Debug, Clone, Serialize)]
    pub struct MiningSample {
        pub timestamp: DateTime<Utc>,
        pub hashrate_ghs: f64,
        pub shares_accepted: i64,
        pub shares_rejected: i64,
        pub blocks_found: i64,
        pub uptime_secs: i64,
        /// All-time best share difficulty
        pub best_difficulty: f64,
        /// Best share difficulty this mining session (0 for families that
        /// do not report it)
        pub best_session_difficulty: f64,
        pub pool_url: Option<String>,
        pub pool_user: Option<String>,
    }

    /// One observation of a device's physical metrics.
    #[derive(Debug, Clone, Serialize)]
    pub struct HardwareSample {
        pub timestamp: DateTime<Utc>,
        pub power_watts: f64,
        pub efficiency_j_per_th: f64,
        pub temperature_c: f64,
        pub fan_speed_rpm: i32,
        pub voltage: f64,
        pub frequency_mhz: f64,
    }

    /// Extended per-device system information. Fields a hardware variant
    /// does not report keep their documented defaults (0 for flags and
    /// rotation, -1 for a disabled display timeout) so they can land in
    /// non-nullable columns.
    #[derive(Debug, Clone, Serialize)]
    pub struct SystemInfoSample {
        pub timestamp: DateTime<Utc>,
        pub model: Option<String>,
        pub firmware_version: Option<String>,
        pub mac_address: Option<String>,
        pub hostname: Option<String>,
        pub wifi_rssi: i32,
        pub memory_usage_percent: f64,
        pub overheat_mode: i32,
        pub display_rotation: i32,
        pub display_timeout: i32,
        pub free_heap: i64,
    }

    /// Everything decoded from one poll of one device.
    #[derive(Debug, Clone)]
    pub struct DeviceSnapshot {
        pub mining: MiningSample,
        pub hardware: HardwareSample,
        pub system: SystemInfoSample,
    }

    /// One observation of pool-side aggregate statistics, keyed by the
    /// configured pool address rather than any single device.
    #[derive(Debug, Clone, Serialize)]
    pub struct PoolSample {
        pub pool_address: String,
        pub timestamp: DateTime<Utc>,
        pub hashrate_1m: String,
        pub hashrate_5m: String,
        pub hashrate_1hr: String,
        pub hashrate_1d: String,
        pub hashrate_7d: String,
        pub hashrate_1m_ghs: f64,
        pub hashrate_1d_ghs: f64,
        pub last_share: i64,
        pub workers: i64,
        pub shares: i64,
        pub best_share: f64,
        pub best_ever: f64,
        pub authorised: i64,
    }

    /// An anomaly detected for a device. Transient: produced by the
    /// detector, delivered by the alert sinks, never stored.
    #[derive(Debug, Clone, Serialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum AlertEvent {
        HashrateStagnation {
            device_id: String,
            device_name: String,
            hashrate_ghs: f64,
            /// Number of consecutive unchanged collections
            window: usize,
        },
        DeviceOffline {
            device_id: String,
            device_name: String,
            last_seen: String,
            error: String,
        },
        DeviceOnline {
            device_id: String,
            device_name: String,
            offline_for: String,
        },
        /// `previous == 0.0` means this is the first recorded best share.
        BestDifficulty {
            device_id: String,
            device_name: String,
            current: f64,
            previous: f64,
        },
        DeviceRestarted {
            device_id: String,
            device_name: String,
        },
    }

    impl AlertEvent {
        pub fn kind(&self) -> &'static str {
            match self {
                AlertEvent::HashrateStagnation { .. } => "hashrate_stagnation",
                AlertEvent::DeviceOffline { .. } => "device_offline",
                AlertEvent::DeviceOnline { .. } => "device_online",
                AlertEvent::BestDifficulty { .. } => "best_difficulty",
                AlertEvent::DeviceRestarted { .. } => "device_restarted",
            }
        }

        pub fn device_id(&self) -> &str {
            match self {
                AlertEvent::HashrateStagnation { device_id, .. }
                | AlertEvent::DeviceOffline { device_id, .. }
                | AlertEvent::DeviceOnline { device_id, .. }
                | AlertEvent::BestDifficulty { device_id, .. }
                | AlertEvent::DeviceRestarted { device_id, .. } => device_id,
            }
        }
    }
}
