pub mod avalon;
pub mod bitaxe;

use regex::Regex;

/// Parse a share-difficulty string like "22.23 M" into a plain float.
///
/// The numeric prefix may carry an optional K/M/G/T suffix applied
/// multiplicatively. Absent or unparsable input yields 0.0, never an error.
pub fn parse_difficulty(raw: &str) -> f64 {
    let raw = raw.trim();
    if raw.is_empty() {
        return 0.0;
    }

    let re = Regex::new(r"^([\d.]+)\s*([KMGT])?").unwrap();
    let Some(caps) = re.captures(raw) else {
        return 0.0;
    };

    let Ok(value) = caps[1].parse::<f64>() else {
        return 0.0;
    };

    let multiplier = match caps.get(2).map(|m| m.as_str()) {
        Some("K") => 1e3,
        Some("M") => 1e6,
        Some("G") => 1e9,
        Some("T") => 1e12,
        _ => 1.0,
    };

    value * multiplier
}

/// Convert a pool-reported hashrate string like "466G", "1.29T" or "185M"
/// into GH/s. A bare number is raw H/s.
pub fn parse_suffixed_hashrate_ghs(raw: &str) -> f64 {
    let raw = raw.trim();
    if raw.is_empty() {
        return 0.0;
    }

    let re = Regex::new(r"^([\d.]+)\s*([KMGTPkmgtp]?)").unwrap();
    let Some(caps) = re.captures(raw) else {
        return 0.0;
    };

    let Ok(value) = caps[1].parse::<f64>() else {
        return 0.0;
    };

    let multiplier = match caps[2].to_ascii_uppercase().as_str() {
        "K" => 1e-6,
        "M" => 1e-3,
        "G" => 1.0,
        "T" => 1e3,
        "P" => 1e6,
        _ => 1e-9, // plain H/s
    };

    value * multiplier
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("", 0.0; "empty")]
    #[test_case("42", 42.0; "no suffix")]
    #[test_case("1.5K", 1.5e3; "kilo")]
    #[test_case("22.23 M", 22.23e6; "mega with space")]
    #[test_case("3G", 3e9; "giga")]
    #[test_case("0.5T", 0.5e12; "tera")]
    #[test_case("garbage", 0.0; "unparsable")]
    fn difficulty_suffixes(raw: &str, expected: f64) {
        assert!((parse_difficulty(raw) - expected).abs() < 1e-9);
    }

    #[test]
    fn difficulty_is_monotonic_in_multiplier() {
        let parsed: Vec<f64> = ["7", "7K", "7M", "7G", "7T"]
            .iter()
            .map(|s| parse_difficulty(s))
            .collect();
        assert!(parsed.windows(2).all(|w| w[0] < w[1]));
    }

    #[test_case("466G", 466.0; "giga")]
    #[test_case("1.29T", 1290.0; "tera")]
    #[test_case("185M", 0.185; "mega")]
    #[test_case("2k", 2e-6; "lowercase kilo")]
    #[test_case("", 0.0; "empty")]
    #[test_case("N/A", 0.0; "unparsable")]
    fn suffixed_hashrates(raw: &str, expected_ghs: f64) {
        assert!((parse_suffixed_hashrate_ghs(raw) - expected_ghs).abs() < 1e-9);
    }

    #[test]
    fn bare_hashrate_is_raw_hs() {
        // 2 GH/s reported as raw hashes per second
        assert!((parse_suffixed_hashrate_ghs("2000000000") - 2.0).abs() < 1e-9);
    }
}
