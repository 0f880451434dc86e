//! Counter normalization
//!
//! Turns cumulative runtime counters into instantaneous usage figures:
//! - CPU percentage from the delta between two consecutive snapshots
//! - Memory in MB from the current snapshot
//! - Network RX/TX in KB summed across all interfaces

use crate::models::{CounterSnapshot, MetricsRecord};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const BYTES_PER_KB: f64 = 1024.0;

/// Normalize a snapshot against the one taken on the previous cycle
pub fn normalize(prev: &CounterSnapshot, curr: &CounterSnapshot) -> MetricsRecord {
    MetricsRecord {
        cpu_percent: cpu_percent(prev, curr),
        ..normalize_initial(curr)
    }
}

/// Normalize the first snapshot seen for a container.
///
/// CPU needs two samples, so it is reported as zero; memory and network are
/// instantaneous and come from `curr` alone.
pub fn normalize_initial(curr: &CounterSnapshot) -> MetricsRecord {
    let (rx_bytes, tx_bytes) = curr
        .network_ifaces
        .values()
        .fold((0u64, 0u64), |(rx, tx), iface| {
            (rx.saturating_add(iface.rx_bytes), tx.saturating_add(iface.tx_bytes))
        });

    MetricsRecord {
        cpu_percent: 0.0,
        mem_mb: round2(curr.mem_usage_bytes as f64 / BYTES_PER_MB),
        rx_kb: round2(rx_bytes as f64 / BYTES_PER_KB),
        tx_kb: round2(tx_bytes as f64 / BYTES_PER_KB),
    }
}

/// CPU usage as a percentage of host CPU time elapsed between snapshots.
///
/// Counters that move backwards (container restarted between polls) clamp
/// to a zero delta, so a reset never yields a negative percentage. This is a
/// deliberate correction: a plain subtraction would report a negative CPU%
/// after every container restart.
fn cpu_percent(prev: &CounterSnapshot, curr: &CounterSnapshot) -> f64 {
    let cpu_delta = curr.cpu_total_usage.saturating_sub(prev.cpu_total_usage);
    let system_delta = curr.cpu_system_usage.saturating_sub(prev.cpu_system_usage);

    if system_delta == 0 {
        return 0.0;
    }

    round2((cpu_delta as f64 / system_delta as f64) * 100.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InterfaceCounters;
    use std::collections::HashMap;

    const MB: u64 = 1024 * 1024;

    fn snapshot(cpu_total: u64, system: u64, mem: u64) -> CounterSnapshot {
        CounterSnapshot {
            cpu_total_usage: cpu_total,
            cpu_system_usage: system,
            mem_usage_bytes: mem,
            network_ifaces: HashMap::new(),
        }
    }

    #[test]
    fn test_reference_scenario() {
        let prev = snapshot(100_000_000, 900_000_000, 50 * MB);
        let mut curr = snapshot(200_000_000, 1_000_000_000, 100 * MB);
        curr.network_ifaces.insert(
            "eth0".to_string(),
            InterfaceCounters {
                rx_bytes: 4096,
                tx_bytes: 2048,
            },
        );

        let record = normalize(&prev, &curr);

        assert_eq!(record.cpu_percent, 100.0);
        assert_eq!(record.mem_mb, 100.0);
        assert_eq!(record.rx_kb, 4.0);
        assert_eq!(record.tx_kb, 2.0);
    }

    #[test]
    fn test_zero_system_delta_yields_zero_cpu() {
        let prev = snapshot(100, 5_000, MB);
        let curr = snapshot(900, 5_000, MB);

        assert_eq!(normalize(&prev, &curr).cpu_percent, 0.0);
    }

    #[test]
    fn test_counter_reset_is_clamped() {
        // Container restarted: its CPU counter starts over
        let prev = snapshot(9_000_000, 1_000_000_000, MB);
        let curr = snapshot(1_000, 1_100_000_000, MB);

        let record = normalize(&prev, &curr);
        assert_eq!(record.cpu_percent, 0.0);

        // Host counter going backwards is treated as no elapsed time
        let curr = snapshot(10_000_000, 900_000_000, MB);
        assert_eq!(normalize(&prev, &curr).cpu_percent, 0.0);
    }

    #[test]
    fn test_memory_exact_megabytes() {
        let curr = snapshot(0, 0, 104_857_600);
        assert_eq!(normalize_initial(&curr).mem_mb, 100.0);
        assert_eq!(normalize(&curr, &curr).mem_mb, 100.0);
    }

    #[test]
    fn test_memory_rounded_to_two_decimals() {
        // 1.5 MB + 1 byte
        let curr = snapshot(0, 0, MB + MB / 2 + 1);
        assert_eq!(normalize_initial(&curr).mem_mb, 1.5);
    }

    #[test]
    fn test_network_summed_across_interfaces() {
        let mut curr = snapshot(0, 0, 0);
        curr.network_ifaces.insert(
            "eth0".to_string(),
            InterfaceCounters {
                rx_bytes: 1024,
                tx_bytes: 512,
            },
        );
        curr.network_ifaces.insert(
            "eth1".to_string(),
            InterfaceCounters {
                rx_bytes: 2048,
                tx_bytes: 1536,
            },
        );

        let record = normalize_initial(&curr);
        assert_eq!(record.rx_kb, 3.0);
        assert_eq!(record.tx_kb, 2.0);
    }

    #[test]
    fn test_missing_network_is_zero() {
        let record = normalize_initial(&snapshot(0, 0, MB));
        assert_eq!(record.rx_kb, 0.0);
        assert_eq!(record.tx_kb, 0.0);
    }

    #[test]
    fn test_initial_reports_zero_cpu() {
        let curr = snapshot(500_000_000, 1_000_000_000, 10 * MB);
        let record = normalize_initial(&curr);

        assert_eq!(record.cpu_percent, 0.0);
        assert_eq!(record.mem_mb, 10.0);
    }

    #[test]
    fn test_normalize_is_pure() {
        let prev = snapshot(123_456_789, 987_654_321, 77 * MB);
        let curr = snapshot(223_456_789, 1_187_654_321, 78 * MB);

        assert_eq!(normalize(&prev, &curr), normalize(&prev, &curr));
        assert_eq!(normalize(&prev, &curr).cpu_percent, 50.0);
    }
}
