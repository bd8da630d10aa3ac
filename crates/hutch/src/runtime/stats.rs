//! Container statistics.

use serde::Serialize;

use crate::cgroup::CgroupStats;

/// Statistics snapshot of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Cgroup accounting.
    #[serde(flatten)]
    pub cgroup: CgroupStats,
    /// Per-interface counters of the init's network namespace.
    pub network: Vec<InterfaceStats>,
}

/// Counters of one network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct InterfaceStats {
    pub name: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub tx_dropped: u64,
}

/// Read `/proc/<pid>/net/dev`. A vanished process yields no interfaces.
#[must_use]
pub fn network_stats(pid: u32) -> Vec<InterfaceStats> {
    std::fs::read_to_string(format!("/proc/{pid}/net/dev"))
        .map(|content| parse_net_dev(&content))
        .unwrap_or_default()
}

/// Parse the content of `/proc/net/dev`: two header lines, then
/// `name: rx(8 columns) tx(8 columns)`.
#[must_use]
pub fn parse_net_dev(content: &str) -> Vec<InterfaceStats> {
    content
        .lines()
        .skip(2)
        .filter_map(|line| {
            let (name, counters) = line.split_once(':')?;
            let values: Vec<u64> = counters
                .split_whitespace()
                .map(str::parse)
                .collect::<Result<_, _>>()
                .ok()?;
            if values.len() < 16 {
                return None;
            }
            Some(InterfaceStats {
                name: name.trim().to_string(),
                rx_bytes: values[0],
                rx_packets: values[1],
                rx_errors: values[2],
                rx_dropped: values[3],
                tx_bytes: values[8],
                tx_packets: values[9],
                tx_errors: values[10],
                tx_dropped: values[11],
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:    1200      12    0    0    0     0          0         0     1200      12    0    0    0     0       0          0
  eth0: 9876543    6543    1    2    0     0          0        10   123456     789    3    4    0     0       0          0
";

    #[test]
    fn parse_interfaces() {
        let stats = parse_net_dev(NET_DEV);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "lo");
        assert_eq!(
            stats[1],
            InterfaceStats {
                name: "eth0".to_string(),
                rx_bytes: 9_876_543,
                rx_packets: 6543,
                rx_errors: 1,
                rx_dropped: 2,
                tx_bytes: 123_456,
                tx_packets: 789,
                tx_errors: 3,
                tx_dropped: 4,
            }
        );
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let content = "h1\nh2\n  eth0: 1 2 3\nbogus line\n";
        assert!(parse_net_dev(content).is_empty());
    }

    #[test]
    fn own_network_stats_have_loopback() {
        let stats = network_stats(std::process::id());
        assert!(stats.iter().any(|s| s.name == "lo"));
    }

    #[test]
    fn vanished_process_has_no_interfaces() {
        assert!(network_stats(4_194_305).is_empty());
    }
}
