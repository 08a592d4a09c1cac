// Copyright (C) 2026 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Shared utilities for load reports

use std::time::Duration;

/// Calculate percentiles from a list of latencies.
/// Returns (p50, p95, p99, max).
pub fn calculate_percentiles(mut latencies: Vec<Duration>) -> (Duration, Duration, Duration, Duration) {
    if latencies.is_empty() {
        return (
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
        );
    }

    latencies.sort();
    let len = latencies.len();

    let p50 = latencies[len / 2];
    let p95 = latencies[(len * 95) / 100];
    let p99 = latencies[(len * 99) / 100];
    let max = latencies[len - 1];

    (p50, p95, p99, max)
}

/// Format a duration for log output.
pub fn format_duration(d: Duration) -> String {
    if d.as_nanos() < 1000 {
        format!("{}ns", d.as_nanos())
    } else if d.as_micros() < 1000 {
        format!("{:.1}µs", d.as_nanos() as f64 / 1000.0)
    } else if d.as_millis() < 1000 {
        format!("{:.2}ms", d.as_micros() as f64 / 1000.0)
    } else {
        format!("{:.2}s", d.as_secs_f64())
    }
}

/// Operations per second over `elapsed`, formatted for log output.
pub fn format_throughput(operations: usize, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return "-".to_string();
    }
    let ops_per_sec = operations as f64 / secs;
    if ops_per_sec >= 1_000_000.0 {
        format!("{:.2}M/s", ops_per_sec / 1_000_000.0)
    } else if ops_per_sec >= 1_000.0 {
        format!("{:.2}K/s", ops_per_sec / 1_000.0)
    } else {
        format!("{:.2}/s", ops_per_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_percentiles() {
        let latencies: Vec<_> = (1..=100).map(Duration::from_millis).collect();
        let (p50, p95, p99, max) = calculate_percentiles(latencies);
        assert_eq!(p50, Duration::from_millis(51));
        assert_eq!(p95, Duration::from_millis(96));
        assert_eq!(p99, Duration::from_millis(100));
        assert_eq!(max, Duration::from_millis(100));
        assert_eq!(calculate_percentiles(vec![]).3, Duration::ZERO);
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format_duration(Duration::from_nanos(250)), "250ns");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
        assert_eq!(format_throughput(3000, Duration::from_secs(2)), "1.50K/s");
        assert_eq!(format_throughput(1, Duration::ZERO), "-");
    }
}
