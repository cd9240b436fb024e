//! Derived-metric computation. Pure functions, no I/O, no state.

/// Energy efficiency in joules per terahash, given watts and GH/s.
/// Zero hashrate means the metric is undefined; report 0 rather than
/// dividing by zero.
pub fn efficiency_j_per_th(power_watts: f64, hashrate_ghs: f64) -> f64 {
    if hashrate_ghs > 0.0 {
        power_watts / (hashrate_ghs / 1000.0)
    } else {
        0.0
    }
}

/// Share reject rate as a percentage of all submitted shares.
pub fn reject_rate_percent(accepted: i64, rejected: i64) -> f64 {
    let total = accepted + rejected;
    if total > 0 {
        rejected as f64 / total as f64 * 100.0
    } else {
        0.0
    }
}

/// Format a raw H/s value into a human-readable string like "466.00G".
pub fn format_hashrate(hashrate_hs: f64) -> String {
    if hashrate_hs <= 0.0 {
        return "0".to_string();
    }

    if hashrate_hs >= 1e15 {
        format!("{:.2}P", hashrate_hs / 1e15)
    } else if hashrate_hs >= 1e12 {
        format!("{:.2}T", hashrate_hs / 1e12)
    } else if hashrate_hs >= 1e9 {
        format!("{:.2}G", hashrate_hs / 1e9)
    } else if hashrate_hs >= 1e6 {
        format!("{:.2}M", hashrate_hs / 1e6)
    } else if hashrate_hs >= 1e3 {
        format!("{:.2}K", hashrate_hs / 1e3)
    } else {
        format!("{:.2}", hashrate_hs)
    }
}

/// Format a share difficulty with its natural unit suffix.
pub fn format_difficulty(difficulty: f64) -> String {
    if difficulty >= 1e12 {
        format!("{:.2} T", difficulty / 1e12)
    } else if difficulty >= 1e9 {
        format!("{:.2} G", difficulty / 1e9)
    } else if difficulty >= 1e6 {
        format!("{:.2} M", difficulty / 1e6)
    } else if difficulty >= 1e3 {
        format!("{:.2} K", difficulty / 1e3)
    } else {
        format!("{:.2}", difficulty)
    }
}

/// Format a duration as "1h 2m 3s", dropping leading zero units.
pub fn format_duration(duration: chrono::Duration) -> String {
    let total_seconds = duration.num_seconds().max(0);
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn efficiency_is_zero_without_hashrate() {
        assert_eq!(efficiency_j_per_th(15.0, 0.0), 0.0);
        assert_eq!(efficiency_j_per_th(15.0, -1.0), 0.0);
    }

    #[test]
    fn efficiency_matches_definition() {
        // 14 W at 500 GH/s = 28 J/TH
        assert!((efficiency_j_per_th(14.0, 500.0) - 28.0).abs() < 1e-9);
    }

    #[test]
    fn efficiency_scales_linearly_with_power() {
        let base = efficiency_j_per_th(10.0, 485.0);
        let tripled = efficiency_j_per_th(30.0, 485.0);
        assert!((tripled - 3.0 * base).abs() < 1e-9);
    }

    #[test]
    fn reject_rate_handles_empty_denominator() {
        assert_eq!(reject_rate_percent(0, 0), 0.0);
        assert!((reject_rate_percent(97, 3) - 3.0).abs() < 1e-9);
        assert!((reject_rate_percent(0, 5) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn hashrate_formatting_picks_the_natural_unit() {
        assert_eq!(format_hashrate(0.0), "0");
        assert_eq!(format_hashrate(950.0), "950.00");
        assert_eq!(format_hashrate(466e9), "466.00G");
        assert_eq!(format_hashrate(1.29e12), "1.29T");
        assert_eq!(format_hashrate(2.5e15), "2.50P");
    }

    #[test]
    fn difficulty_formatting_picks_the_natural_unit() {
        assert_eq!(format_difficulty(512.0), "512.00");
        assert_eq!(format_difficulty(22.23e6), "22.23 M");
        assert_eq!(format_difficulty(3.1e12), "3.10 T");
    }

    #[test]
    fn duration_formatting_drops_leading_units() {
        assert_eq!(format_duration(chrono::Duration::seconds(42)), "42s");
        assert_eq!(format_duration(chrono::Duration::seconds(184)), "3m 4s");
        assert_eq!(format_duration(chrono::Duration::seconds(3700)), "1h 1m 40s");
    }
}
