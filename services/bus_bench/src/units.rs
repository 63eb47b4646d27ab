//! Unit parsing and formatting for sizes, rates and durations.
//!
//! Sizes use binary multiples (`4KB` and `4KiB` are both 4096 bytes). Rates
//! distinguish bits (`bps`) from bytes (`Bps`) and use decimal multiples, so
//! `1Gbps` is 125,000,000 bytes per second. A bare rate number is taken as
//! megabytes per second and a bare duration as seconds.

use crate::error::{BenchError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

static SIZE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(\d+)\s*(b|[kmgt]i?b|[kmgt])?\s*$").expect("valid size pattern")
});

static RATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+(?:\.\d+)?)\s*([kKMG])?(bps|Bps)?\s*$").expect("valid rate pattern")
});

static DURATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+(?:\.\d+)?)\s*(ns|us|µs|ms|s|m)?\s*$").expect("valid duration pattern")
});

/// Parse a byte size such as `512`, `4KB`, `1MiB`
pub fn parse_size(text: &str) -> Result<usize> {
    let caps = SIZE
        .captures(text)
        .ok_or_else(|| BenchError::config(format!("invalid size '{}'", text), None))?;
    let value: usize = caps[1]
        .parse()
        .map_err(|_| BenchError::config(format!("size out of range '{}'", text), None))?;
    let shift = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        None => 0,
        Some(unit) => match unit.chars().next() {
            Some('k') => 10,
            Some('m') => 20,
            Some('g') => 30,
            Some('t') => 40,
            _ => 0,
        },
    };
    value
        .checked_mul(1usize << shift)
        .ok_or_else(|| BenchError::config(format!("size out of range '{}'", text), None))
}

/// Parse `min..max` or a single size; a single size yields `(n, n)`
pub fn parse_size_range(text: &str) -> Result<(usize, usize)> {
    match text.split_once("..") {
        Some((min, max)) => Ok((parse_size(min)?, parse_size(max)?)),
        None => {
            let size = parse_size(text)?;
            Ok((size, size))
        }
    }
}

/// Parse a rate into bytes per second
pub fn parse_rate(text: &str) -> Result<u64> {
    let caps = RATE
        .captures(text)
        .ok_or_else(|| BenchError::config(format!("invalid rate '{}'", text), None))?;
    let value: f64 = caps[1]
        .parse()
        .map_err(|_| BenchError::config(format!("invalid rate '{}'", text), None))?;
    let multiplier = match caps.get(2).map(|m| m.as_str()) {
        Some("k") | Some("K") => 1e3,
        Some("M") => 1e6,
        Some("G") => 1e9,
        _ => 1.0,
    };
    let bytes_per_sec = match (caps.get(2), caps.get(3).map(|m| m.as_str())) {
        (_, Some("bps")) => value * multiplier / 8.0,
        (_, Some(_)) => value * multiplier,
        (None, None) => value * 1e6,
        (Some(_), None) => value * multiplier,
    };
    if bytes_per_sec < 1.0 {
        return Err(BenchError::config(format!("rate below one byte per second '{}'", text), None));
    }
    Ok(bytes_per_sec as u64)
}

/// Parse a duration such as `250ms`, `10us`, `5s`, `2m`
pub fn parse_duration(text: &str) -> Result<Duration> {
    let caps = DURATION
        .captures(text)
        .ok_or_else(|| BenchError::config(format!("invalid duration '{}'", text), None))?;
    let value: f64 = caps[1]
        .parse()
        .map_err(|_| BenchError::config(format!("invalid duration '{}'", text), None))?;
    let nanos_per_unit = match caps.get(2).map(|m| m.as_str()) {
        Some("ns") => 1.0,
        Some("us") | Some("µs") => 1e3,
        Some("ms") => 1e6,
        Some("m") => 60e9,
        _ => 1e9,
    };
    Ok(Duration::from_nanos((value * nanos_per_unit).round() as u64))
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}B", bytes)
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}

/// Format a byte rate as a bit rate
pub fn format_bit_rate(bytes_per_sec: f64) -> String {
    let bits = bytes_per_sec * 8.0;
    if bits >= 1e9 {
        format!("{:.2}Gbps", bits / 1e9)
    } else if bits >= 1e6 {
        format!("{:.2}Mbps", bits / 1e6)
    } else if bits >= 1e3 {
        format!("{:.2}kbps", bits / 1e3)
    } else {
        format!("{:.0}bps", bits)
    }
}

pub fn format_nanos(nanos: f64) -> String {
    if nanos >= 1e9 {
        format!("{:.2}s", nanos / 1e9)
    } else if nanos >= 1e6 {
        format!("{:.2}ms", nanos / 1e6)
    } else if nanos >= 1e3 {
        format!("{:.1}us", nanos / 1e3)
    } else {
        format!("{:.0}ns", nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_are_binary() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("4KB").unwrap(), 4096);
        assert_eq!(parse_size("4kib").unwrap(), 4096);
        assert_eq!(parse_size("1MiB").unwrap(), 1 << 20);
        assert_eq!(parse_size(" 2 G ").unwrap(), 2 << 30);
        assert!(parse_size("4XB").is_err());
        assert!(parse_size("-1").is_err());
    }

    #[test]
    fn test_size_ranges() {
        assert_eq!(parse_size_range("64..1KB").unwrap(), (64, 1024));
        assert_eq!(parse_size_range("128").unwrap(), (128, 128));
        assert!(parse_size_range("1..x").is_err());
    }

    #[test]
    fn test_rates_distinguish_bits_from_bytes() {
        assert_eq!(parse_rate("100MBps").unwrap(), 100_000_000);
        assert_eq!(parse_rate("1Gbps").unwrap(), 125_000_000);
        assert_eq!(parse_rate("8kbps").unwrap(), 1_000);
        assert_eq!(parse_rate("50").unwrap(), 50_000_000);
        assert_eq!(parse_rate("2.5KBps").unwrap(), 2_500);
        assert!(parse_rate("1bps").is_err());
        assert!(parse_rate("fast").is_err());
    }

    #[test]
    fn test_durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("10us").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("5h").is_err());
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1536), "1.5KB");
        assert_eq!(format_bit_rate(125_000_000.0), "1.00Gbps");
        assert_eq!(format_nanos(12_500.0), "12.5us");
        assert_eq!(format_nanos(2_000_000.0), "2.00ms");
    }
}
