use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::parse_difficulty;
use crate::client::CollectError;
use crate::metrics;
use crate::types::{DeviceSnapshot, HardwareSample, MiningSample, SystemInfoSample};

/// Decode a Bitaxe `/api/system/info` payload into a normalized snapshot.
///
/// Fails only when the payload is not a JSON object. Individual fields are
/// never required: hardware variants ship different firmware builds and any
/// absent field takes its documented default instead of surfacing as null
/// downstream.
pub fn decode(info: &Value, now: DateTime<Utc>) -> Result<DeviceSnapshot, CollectError> {
    let obj = info
        .as_object()
        .ok_or_else(|| CollectError::Decode("system info payload is not a JSON object".into()))?;

    // Hashrate is already reported in GH/s
    let hashrate_ghs = f64_field(obj, "hashRate", 0.0);
    let power_watts = f64_field(obj, "power", 0.0);

    let mining = MiningSample {
        timestamp: now,
        hashrate_ghs,
        shares_accepted: i64_field(obj, "sharesAccepted", 0),
        shares_rejected: i64_field(obj, "sharesRejected", 0),
        // Not reported by the API
        blocks_found: 0,
        uptime_secs: i64_field(obj, "uptimeSeconds", 0),
        best_difficulty: parse_difficulty(str_field(obj, "bestDiff")),
        best_session_difficulty: parse_difficulty(str_field(obj, "bestSessionDiff")),
        pool_url: opt_string(obj, "stratumURL"),
        pool_user: opt_string(obj, "stratumUser"),
    };

    let hardware = HardwareSample {
        timestamp: now,
        power_watts,
        efficiency_j_per_th: metrics::efficiency_j_per_th(power_watts, hashrate_ghs),
        temperature_c: f64_field(obj, "temp", 0.0),
        fan_speed_rpm: i64_field(obj, "fanrpm", 0) as i32,
        // Reported in millivolts
        voltage: f64_field(obj, "voltage", 0.0) / 1000.0,
        frequency_mhz: f64_field(obj, "frequency", 0.0),
    };

    let system = SystemInfoSample {
        timestamp: now,
        model: opt_string(obj, "ASICModel"),
        firmware_version: opt_string(obj, "version"),
        mac_address: opt_string(obj, "macAddr"),
        hostname: opt_string(obj, "hostname"),
        wifi_rssi: i64_field(obj, "wifiRSSI", 0) as i32,
        memory_usage_percent: 0.0,
        overheat_mode: i64_field(obj, "overheat_mode", 0) as i32,
        display_rotation: i64_field(obj, "rotation", 0) as i32,
        // -1 marks "never times out" on variants without the setting
        display_timeout: i64_field(obj, "displayTimeout", -1) as i32,
        free_heap: i64_field(obj, "freeHeap", 0),
    };

    Ok(DeviceSnapshot { mining, hardware, system })
}

fn f64_field(obj: &Map<String, Value>, key: &str, default: f64) -> f64 {
    obj.get(key).and_then(Value::as_f64).unwrap_or(default)
}

fn i64_field(obj: &Map<String, Value>, key: &str, default: i64) -> i64 {
    obj.get(key).and_then(Value::as_i64).unwrap_or(default)
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> &'a str {
    obj.get(key).and_then(Value::as_str).unwrap_or("")
}

fn opt_string(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_payload() -> Value {
        json!({
            "hashRate": 485.5,
            "sharesAccepted": 1200,
            "sharesRejected": 3,
            "uptimeSeconds": 86400,
            "bestDiff": "22.23 M",
            "bestSessionDiff": "1.5K",
            "stratumURL": "solo.ckpool.org",
            "stratumUser": "bc1qexample.worker1",
            "power": 14.2,
            "temp": 58.5,
            "fanrpm": 4800,
            "voltage": 5120.0,
            "frequency": 485.0,
            "ASICModel": "BM1366",
            "version": "v2.1.8",
            "macAddr": "AA:BB:CC:DD:EE:FF",
            "hostname": "bitaxe1",
            "wifiRSSI": -52,
            "overheat_mode": 1,
            "rotation": 90,
            "displayTimeout": 300,
            "freeHeap": 123456
        })
    }

    #[test]
    fn decodes_full_payload() {
        let now = Utc::now();
        let snap = decode(&full_payload(), now).unwrap();

        assert!((snap.mining.hashrate_ghs - 485.5).abs() < 1e-9);
        assert_eq!(snap.mining.shares_accepted, 1200);
        assert_eq!(snap.mining.shares_rejected, 3);
        assert_eq!(snap.mining.blocks_found, 0);
        assert!((snap.mining.best_difficulty - 22.23e6).abs() < 1.0);
        assert!((snap.mining.best_session_difficulty - 1500.0).abs() < 1e-9);
        assert_eq!(snap.mining.pool_url.as_deref(), Some("solo.ckpool.org"));

        assert!((snap.hardware.voltage - 5.12).abs() < 1e-9);
        assert_eq!(snap.hardware.fan_speed_rpm, 4800);
        // 14.2 W at 485.5 GH/s = 14.2 / 0.4855 J/TH
        assert!((snap.hardware.efficiency_j_per_th - 14.2 / 0.4855).abs() < 1e-6);

        assert_eq!(snap.system.overheat_mode, 1);
        assert_eq!(snap.system.display_rotation, 90);
        assert_eq!(snap.system.display_timeout, 300);
    }

    #[test]
    fn absent_optional_fields_take_documented_defaults() {
        let now = Utc::now();
        let snap = decode(&json!({ "hashRate": 100.0 }), now).unwrap();

        assert_eq!(snap.system.overheat_mode, 0);
        assert_eq!(snap.system.display_rotation, 0);
        assert_eq!(snap.system.display_timeout, -1);
        assert_eq!(snap.system.free_heap, 0);
        assert_eq!(snap.system.wifi_rssi, 0);
        assert!(snap.system.model.is_none());
        assert_eq!(snap.mining.shares_accepted, 0);
        assert!((snap.mining.best_difficulty).abs() < 1e-9);
        assert!(snap.mining.pool_url.is_none());
    }

    #[test]
    fn unparsable_difficulty_strings_become_zero() {
        let now = Utc::now();
        let snap = decode(&json!({ "bestDiff": "not a number" }), now).unwrap();
        assert!((snap.mining.best_difficulty).abs() < 1e-9);
    }

    #[test]
    fn zero_hashrate_means_zero_efficiency() {
        let now = Utc::now();
        let snap = decode(&json!({ "power": 14.0 }), now).unwrap();
        assert!((snap.hardware.efficiency_j_per_th).abs() < 1e-9);
    }

    #[test]
    fn non_object_payload_is_a_decode_error() {
        let now = Utc::now();
        assert!(decode(&json!([1, 2, 3]), now).is_err());
        assert!(decode(&json!("text"), now).is_err());
    }
}
