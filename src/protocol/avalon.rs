use std::collections::HashMap;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::metrics;
use crate::types::{DeviceSnapshot, HardwareSample, MiningSample, SystemInfoSample};

/// Key whose value embeds the bracketed hardware stats blob.
const MM_ID0_KEY: &str = "MM ID0=";

/// Field delimiters that terminate the MM ID0 blob inside its section.
const MM_ID0_END_MARKERS: [&str; 2] = [",MM Count=", ",Nonce Mask="];

/// Reported by firmware when a temperature sensor is not populated.
const SENSOR_ABSENT: f64 = -273.0;

/// The device does not report total memory; all known units carry 128 MB.
const ASSUMED_TOTAL_MEM_KB: f64 = 128.0 * 1024.0;

/// Parse a cgminer-style response into a flat key/value map.
///
/// The response is pipe-delimited sections of comma-delimited `KEY=VALUE`
/// pairs, except that the `MM ID0` value is a free-form blob of bracketed
/// sub-arrays. That blob is isolated by scanning from its literal prefix to
/// the next recognized field delimiter rather than splitting on commas.
/// Malformed or truncated frames degrade to whatever pairs were readable.
pub fn parse_response(raw: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();

    for section in raw.split('|') {
        if section.is_empty() {
            continue;
        }

        if let Some(start) = section.find(MM_ID0_KEY) {
            let tail = &section[start + MM_ID0_KEY.len()..];
            let end = MM_ID0_END_MARKERS
                .iter()
                .filter_map(|marker| tail.find(marker))
                .min();
            let (blob, rest) = match end {
                Some(idx) => (&tail[..idx], &tail[idx..]),
                None => (tail, ""),
            };
            fields.insert("MM ID0".to_string(), blob.to_string());
            parse_pairs(&section[..start], &mut fields);
            parse_pairs(rest, &mut fields);
        } else {
            parse_pairs(section, &mut fields);
        }
    }

    fields
}

fn parse_pairs(part: &str, fields: &mut HashMap<String, String>) {
    for pair in part.split(',') {
        if let Some((key, value)) = pair.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                fields.insert(key.to_string(), value.trim().to_string());
            }
        }
    }
}

/// Extract the contents of `key[...]` from the stats blob.
fn bracket_group(blob: &str, key: &str) -> Option<String> {
    let pattern = format!(r"{}\[([^\]]*)\]", regex::escape(key));
    let re = Regex::new(&pattern).ok()?;
    re.captures(blob).map(|caps| caps[1].to_string())
}

fn bracket_f64(blob: &str, key: &str) -> Option<f64> {
    bracket_group(blob, key).and_then(|s| s.trim().parse().ok())
}

fn mm_blob(fields: &HashMap<String, String>) -> &str {
    fields.get("MM ID0").map(String::as_str).unwrap_or("")
}

/// Operating temperature in °C. The sensor-absent sentinel falls back to
/// the board average; 0.0 when neither group is present.
pub fn temperature_c(fields: &HashMap<String, String>) -> f64 {
    let blob = mm_blob(fields);

    if let Some(value) = bracket_f64(blob, "OTemp") {
        if value != SENSOR_ABSENT {
            return value;
        }
    }

    bracket_f64(blob, "TAvg").unwrap_or(0.0)
}

/// Consumed power in watts. The PS array encodes multiple supply stages;
/// the final entry is the wall reading. MPO and ATA2 cover firmwares that
/// omit PS.
pub fn power_watts(fields: &HashMap<String, String>) -> f64 {
    let blob = mm_blob(fields);

    if let Some(values) = bracket_group(blob, "PS") {
        let parsed: Vec<f64> = values
            .split_whitespace()
            .filter_map(|token| token.parse().ok())
            .collect();
        if let Some(last) = parsed.last() {
            return *last;
        }
    }

    if let Some(value) = bracket_f64(blob, "MPO") {
        return value;
    }

    if let Some(values) = bracket_group(blob, "ATA2") {
        if let Some(first) = values.split('-').next().and_then(|t| t.trim().parse().ok()) {
            return first;
        }
    }

    0.0
}

/// Fan speed in RPM, no conversion.
pub fn fan_speed_rpm(fields: &HashMap<String, String>) -> i32 {
    bracket_f64(mm_blob(fields), "Fan1").map(|v| v as i32).unwrap_or(0)
}

/// Chip frequency in MHz.
pub fn frequency_mhz(fields: &HashMap<String, String>) -> f64 {
    bracket_f64(mm_blob(fields), "Freq").unwrap_or(0.0)
}

/// Core voltage in volts. The wire carries a centivolt-scaled integer array;
/// the first element is the representative reading.
pub fn voltage(fields: &HashMap<String, String>) -> f64 {
    let blob = mm_blob(fields);
    if let Some(values) = bracket_group(blob, "PVT_V0") {
        if let Some(first) = values
            .split_whitespace()
            .next()
            .and_then(|t| t.parse::<f64>().ok())
        {
            return first / 100.0;
        }
    }
    0.0
}

/// Memory usage percent derived from the free-kilobytes report against the
/// fixed family total, clamped at zero.
pub fn memory_usage_percent(fields: &HashMap<String, String>) -> f64 {
    let blob = mm_blob(fields);
    match bracket_f64(blob, "MEMFREE") {
        Some(free_kb) => {
            let used_kb = ASSUMED_TOTAL_MEM_KB - free_kb;
            (used_kb / ASSUMED_TOTAL_MEM_KB * 100.0).max(0.0)
        }
        None => 0.0,
    }
}

fn field_f64(fields: &HashMap<String, String>, key: &str) -> f64 {
    fields.get(key).and_then(|v| v.parse().ok()).unwrap_or(0.0)
}

fn field_i64(fields: &HashMap<String, String>, key: &str) -> i64 {
    fields
        .get(key)
        .and_then(|v| v.parse::<f64>().ok())
        .map(|v| v as i64)
        .unwrap_or(0)
}

/// Assemble a normalized snapshot from the four command responses.
///
/// Every input is a parsed field map from [`parse_response`]; missing keys
/// resolve to zeroed metrics, so a partially readable device still yields
/// a storable sample.
pub fn snapshot(
    version: &HashMap<String, String>,
    summary: &HashMap<String, String>,
    stats: &HashMap<String, String>,
    pools: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> DeviceSnapshot {
    // Summary reports MH/s; normalize to GH/s
    let hashrate_ghs = field_f64(summary, "MHS av") / 1000.0;
    let power = power_watts(stats);

    let mining = MiningSample {
        timestamp: now,
        hashrate_ghs,
        shares_accepted: field_i64(summary, "Accepted"),
        shares_rejected: field_i64(summary, "Rejected"),
        blocks_found: field_i64(summary, "Found Blocks"),
        uptime_secs: field_i64(summary, "Elapsed"),
        // Plain float, no unit suffix on this family
        best_difficulty: field_f64(summary, "Best Share"),
        best_session_difficulty: 0.0,
        pool_url: pools.get("URL").cloned(),
        pool_user: pools.get("User").cloned(),
    };

    let hardware = HardwareSample {
        timestamp: now,
        power_watts: power,
        efficiency_j_per_th: metrics::efficiency_j_per_th(power, hashrate_ghs),
        temperature_c: temperature_c(stats),
        fan_speed_rpm: fan_speed_rpm(stats),
        voltage: voltage(stats),
        frequency_mhz: frequency_mhz(stats),
    };

    let system = SystemInfoSample {
        timestamp: now,
        model: version.get("MODEL").cloned(),
        firmware_version: version.get("CGMiner").cloned(),
        mac_address: version.get("MAC").cloned(),
        hostname: None,
        wifi_rssi: 0,
        memory_usage_percent: memory_usage_percent(stats),
        overheat_mode: 0,
        display_rotation: 0,
        display_timeout: -1,
        free_heap: 0,
    };

    DeviceSnapshot { mining, hardware, system }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATS_RESPONSE: &str = "STATUS=S,When=1700000000,Code=70,Msg=CGMiner stats|\
STATS=0,ID=AVA10,Elapsed=183,MM ID0=Ver[840-24042501] DNA[0134aabbccdd] \
OTemp[65] TAvg[61] Fan1[1520] FanR[42%] Freq[464.89] \
PS[0 0 27541 4 0 3756 133] PVT_V0[299 303 301 303 300 301] MEMFREE[63728],\
MM Count=1,Nonce Mask=25|";

    fn stats_fields() -> HashMap<String, String> {
        parse_response(STATS_RESPONSE)
    }

    #[test]
    fn isolates_mm_blob_from_surrounding_pairs() {
        let fields = stats_fields();
        let blob = fields.get("MM ID0").unwrap();
        assert!(blob.contains("OTemp[65]"));
        assert!(blob.contains("MEMFREE[63728]"));
        assert!(!blob.contains("MM Count"));
        assert_eq!(fields.get("MM Count").map(String::as_str), Some("1"));
        assert_eq!(fields.get("Elapsed").map(String::as_str), Some("183"));
        assert_eq!(fields.get("STATUS").map(String::as_str), Some("S"));
    }

    #[test]
    fn decodes_example_hardware_metrics() {
        let fields = stats_fields();
        assert!((temperature_c(&fields) - 65.0).abs() < 1e-9);
        // Last PS element is the consumed-power reading
        assert!((power_watts(&fields) - 133.0).abs() < 1e-9);
        assert_eq!(fan_speed_rpm(&fields), 1520);
        assert!((frequency_mhz(&fields) - 464.89).abs() < 1e-9);
        assert!((voltage(&fields) - 2.99).abs() < 1e-9);
    }

    #[test]
    fn sensor_absent_temperature_falls_back_to_average() {
        let raw = "STATS=0,MM ID0=OTemp[-273] TAvg[61] Fan1[1200],MM Count=1|";
        let fields = parse_response(raw);
        assert!((temperature_c(&fields) - 61.0).abs() < 1e-9);
    }

    #[test]
    fn missing_temperature_groups_resolve_to_zero() {
        let fields = parse_response("STATS=0,MM ID0=Fan1[1200],MM Count=1|");
        assert!((temperature_c(&fields)).abs() < 1e-9);
    }

    #[test]
    fn power_falls_back_through_mpo_then_ata2() {
        let mpo = parse_response("STATS=0,MM ID0=MPO[120],MM Count=1|");
        assert!((power_watts(&mpo) - 120.0).abs() < 1e-9);

        let ata2 = parse_response("STATS=0,MM ID0=ATA2[118-0-3],MM Count=1|");
        assert!((power_watts(&ata2) - 118.0).abs() < 1e-9);

        let none = parse_response("STATS=0,MM ID0=Fan1[900],MM Count=1|");
        assert!((power_watts(&none)).abs() < 1e-9);
    }

    #[test]
    fn memory_usage_is_derived_and_clamped() {
        let fields = stats_fields();
        let expected = (128.0 * 1024.0 - 63728.0) / (128.0 * 1024.0) * 100.0;
        assert!((memory_usage_percent(&fields) - expected).abs() < 1e-9);

        // Free beyond the assumed total clamps to zero rather than going negative
        let odd = parse_response("STATS=0,MM ID0=MEMFREE[999999999],MM Count=1|");
        assert!((memory_usage_percent(&odd)).abs() < 1e-9);
    }

    #[test]
    fn truncated_and_corrupted_frames_never_panic() {
        for raw in [
            "",
            "|||",
            "STATS=0,MM ID0=OTemp[65",
            "STATUS=S,When=,|,,=,=|MM ID0=",
            "garbage with no delimiters at all",
            "KEY=,=VALUE,|=",
        ] {
            let fields = parse_response(raw);
            // No bracket group survives any of these; every metric zeroes out
            assert!((temperature_c(&fields)).abs() < 1e-9, "input: {raw:?}");
            assert!((power_watts(&fields)).abs() < 1e-9, "input: {raw:?}");
            assert_eq!(fan_speed_rpm(&fields), 0, "input: {raw:?}");
            assert!((voltage(&fields)).abs() < 1e-9, "input: {raw:?}");
            assert!((memory_usage_percent(&fields)).abs() < 1e-9, "input: {raw:?}");
        }
    }

    #[test]
    fn assembles_snapshot_from_command_responses() {
        let version = parse_response(
            "STATUS=S,Code=22|VERSION,CGMiner=4.11.1,MODEL=Nano3s,HWTYPE=MM3v1,DNA=0134aabb,MAC=aa:bb:cc:dd:ee:ff|",
        );
        let summary = parse_response(
            "STATUS=S,Code=11|SUMMARY,Elapsed=18345,MHS av=3542.77,Accepted=912,Rejected=4,Found Blocks=0,Best Share=184467.2|",
        );
        let pools = parse_response(
            "STATUS=S,Code=7|POOLS,POOL=0,URL=stratum+tcp://solo.ckpool.org:3333,User=bc1qexample,Status=Alive|",
        );
        let stats = stats_fields();

        let snap = snapshot(&version, &summary, &stats, &pools, Utc::now());

        // MH/s normalized to GH/s
        assert!((snap.mining.hashrate_ghs - 3.54277).abs() < 1e-9);
        assert_eq!(snap.mining.shares_accepted, 912);
        assert_eq!(snap.mining.shares_rejected, 4);
        assert_eq!(snap.mining.uptime_secs, 18345);
        assert!((snap.mining.best_difficulty - 184467.2).abs() < 1e-9);
        assert_eq!(
            snap.mining.pool_url.as_deref(),
            Some("stratum+tcp://solo.ckpool.org:3333")
        );

        assert!((snap.hardware.power_watts - 133.0).abs() < 1e-9);
        assert!(
            (snap.hardware.efficiency_j_per_th - 133.0 / (3.54277 / 1000.0)).abs() < 1e-6
        );
        assert_eq!(snap.system.model.as_deref(), Some("Nano3s"));
        assert_eq!(snap.system.firmware_version.as_deref(), Some("4.11.1"));
    }

    #[test]
    fn empty_maps_yield_zeroed_snapshot() {
        let empty = HashMap::new();
        let snap = snapshot(&empty, &empty, &empty, &empty, Utc::now());
        assert!((snap.mining.hashrate_ghs).abs() < 1e-9);
        assert!((snap.hardware.power_watts).abs() < 1e-9);
        assert_eq!(snap.hardware.fan_speed_rpm, 0);
        assert!(snap.mining.pool_url.is_none());
    }

    /// Encode hardware metrics back into a stats frame, then decode.
    fn encode_stats_frame(temp: f64, power: f64, fan: i32, freq: f64, volts: f64) -> String {
        format!(
            "STATS=0,ID=AVA10,MM ID0=OTemp[{temp}] Fan1[{fan}] Freq[{freq}] \
PS[0 0 27541 4 0 3756 {power}] PVT_V0[{} 303 301],MM Count=1|",
            (volts * 100.0).round()
        )
    }

    #[test]
    fn stats_frame_round_trips_within_tolerance() {
        let fields = parse_response(&encode_stats_frame(65.0, 133.0, 1520, 464.89, 2.99));
        assert!((temperature_c(&fields) - 65.0).abs() < 1e-6);
        assert!((power_watts(&fields) - 133.0).abs() < 1e-6);
        assert_eq!(fan_speed_rpm(&fields), 1520);
        assert!((frequency_mhz(&fields) - 464.89).abs() < 1e-6);
        assert!((voltage(&fields) - 2.99).abs() < 1e-6);
    }
}
