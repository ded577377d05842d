//! Time helpers shared across the consumer subsystem.
//!
//! Wall-clock values that cross the wire or land on disk are unix
//! nanoseconds (`i64`); everything purely internal uses `Duration`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

pub fn now_ms() -> u64 {
    (now_ns() / 1_000_000) as u64
}

/// Parse a Go-style duration string ("250ms", "1m30s", "1.5h").
///
/// Accepted units: ns, us, µs, ms, s, m, h. Multiple segments concatenate.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let mut total_ns: f64 = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let value: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];

        let (unit_ns, unit_len) = if rest.starts_with("ns") {
            (1.0, 2)
        } else if rest.starts_with("us") {
            (1_000.0, 2)
        } else if rest.starts_with("µs") {
            (1_000.0, "µs".len())
        } else if rest.starts_with("ms") {
            (1_000_000.0, 2)
        } else if rest.starts_with('s') {
            (1_000_000_000.0, 1)
        } else if rest.starts_with('m') {
            (60.0 * 1_000_000_000.0, 1)
        } else if rest.starts_with('h') {
            (3600.0 * 1_000_000_000.0, 1)
        } else {
            return None;
        };
        rest = &rest[unit_len..];
        total_ns += value * unit_ns;
    }
    if total_ns < 0.0 {
        return None;
    }
    Some(Duration::from_nanos(total_ns as u64))
}
