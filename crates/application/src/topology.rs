//! Topology Processor (C7): folds `topology.discovery`, `topology.connections`,
//! and `telemetry.wifi_clients` reports into a device+edge graph, sweeping
//! stale/expired edges on an interval.

use dashmap::DashMap;
use domain::device::DeviceId;
use domain::network::{ConnectionMetrics, ConnectionType, DeviceConnection, NetworkDevice, NetworkIface};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// One client observation from a `telemetry.wifi_clients` report, used to
/// synthesize a `wifi` edge with real link metrics rather than a bare
/// connectivity fact.
#[derive(Debug, Clone)]
pub struct WifiClientSample {
    pub mac: String,
    pub rssi: Option<i32>,
    pub tx_rate: Option<u64>,
    pub tx_bytes: Option<u64>,
    pub rx_bytes: Option<u64>,
}

pub struct TopologyProcessor {
    nodes: DashMap<DeviceId, NetworkDevice>,
    edges: DashMap<String, DeviceConnection>,
    edge_staleness_ms: i64,
    edge_expiry_ms: i64,
}

impl TopologyProcessor {
    pub fn new(edge_staleness_ms: i64, edge_expiry_ms: i64) -> Arc<Self> {
        Arc::new(TopologyProcessor {
            nodes: DashMap::new(),
            edges: DashMap::new(),
            edge_staleness_ms,
            edge_expiry_ms,
        })
    }

    /// `topology.discovery`: merges reported interfaces/capabilities into
    /// the node for `device`, creating it if this is the first report.
    pub fn report_discovery(&self, device: DeviceId, ifaces: Vec<NetworkIface>, capabilities: Vec<String>, ts: i64) {
        self.nodes
            .entry(device.clone())
            .and_modify(|node| node.merge(ifaces.clone(), capabilities.clone(), ts))
            .or_insert_with(|| {
                let mut node = NetworkDevice::new(device, ts);
                node.merge(ifaces, capabilities, ts);
                node
            });
    }

    /// `topology.connections`: records/refreshes a directed edge. The edge
    /// id is deterministic from `(from, to, discovered)`, so replaying the
    /// same discovery event is idempotent — it only refreshes `last_seen`
    /// and `metrics`, never creates a duplicate edge.
    #[allow(clippy::too_many_arguments)]
    pub fn report_connection(
        &self,
        from: DeviceId,
        to: DeviceId,
        from_iface: Option<String>,
        to_iface: Option<String>,
        connection_type: ConnectionType,
        is_direct_link: bool,
        metrics: ConnectionMetrics,
        discovered: i64,
        now_ts: i64,
    ) {
        let id = DeviceConnection::edge_id(&from, &to, discovered);
        self.edges
            .entry(id.clone())
            .and_modify(|edge| {
                edge.last_seen = now_ts;
                edge.metrics = metrics.clone();
                edge.down = false;
            })
            .or_insert(DeviceConnection {
                id,
                from,
                to,
                from_iface,
                to_iface,
                connection_type,
                is_direct_link,
                metrics,
                last_seen: now_ts,
                discovered,
                down: false,
            });
    }

    /// `telemetry.wifi_clients`: each resolved client MAC becomes a direct
    /// `wifi` edge from the reporting AP, with metrics taken from the
    /// sample's rssi/tx_rate/byte counters. Uses `ts` as the `discovered`
    /// timestamp, so repeated reports at the same `ts` are a no-op beyond
    /// refreshing metrics — matching the discovery idempotence property.
    pub fn report_wifi_clients(
        &self,
        ap: &DeviceId,
        resolve_mac: impl Fn(&str) -> Option<DeviceId>,
        clients: &[WifiClientSample],
        ts: i64,
    ) {
        for sample in clients {
            let Some(client) = resolve_mac(&sample.mac) else { continue };
            let metrics = ConnectionMetrics {
                rssi: sample.rssi,
                link_speed: sample.tx_rate,
                bandwidth: None,
                latency: None,
                tx_bytes: sample.tx_bytes.unwrap_or(0),
                rx_bytes: sample.rx_bytes.unwrap_or(0),
                last_update: ts,
            };
            self.report_connection(
                ap.clone(),
                client,
                None,
                None,
                ConnectionType::Wifi,
                true,
                metrics,
                ts,
                ts,
            );
        }
    }

    /// Cross-device identity (spec.md §4.7): finds the node, if any, whose
    /// interface MACs already include `primary_mac`.
    pub fn resolve_by_interface_mac(&self, primary_mac: &str) -> Option<DeviceId> {
        self.nodes
            .iter()
            .find(|entry| entry.has_interface_mac(primary_mac))
            .map(|entry| entry.key().clone())
    }

    /// Periodic sweep: edges past `edge_staleness` are marked `down` (still
    /// queryable with `include_stale`); edges past `edge_expiry` are
    /// removed outright. Returns the number of edges removed.
    pub fn sweep(&self, now_ts: i64) -> usize {
        let mut expired = Vec::new();
        for mut entry in self.edges.iter_mut() {
            if entry.is_expired(now_ts, self.edge_expiry_ms) {
                expired.push(entry.key().clone());
            } else if entry.is_stale(now_ts, self.edge_staleness_ms) {
                entry.down = true;
            }
        }
        for key in &expired {
            self.edges.remove(key);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired stale topology edges");
        }
        expired.len()
    }

    pub fn neighbors(&self, device: &DeviceId, now_ts: i64, include_stale: bool) -> Vec<DeviceConnection> {
        self.edges
            .iter()
            .filter(|e| e.from == *device || e.to == *device)
            .filter(|e| include_stale || !e.is_stale(now_ts, self.edge_staleness_ms))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Breadth-first shortest path (fewest hops) between two devices over
    /// non-stale edges, tie-broken by the summed `latency` metric along the
    /// path. Returns the ordered device id list including both endpoints,
    /// or `None` if unreachable.
    pub fn path(&self, from: &DeviceId, to: &DeviceId, now_ts: i64) -> Option<Vec<DeviceId>> {
        if from == to {
            return Some(vec![from.clone()]);
        }

        let mut visited: HashSet<DeviceId> = HashSet::new();
        visited.insert(from.clone());
        let mut queue = std::collections::VecDeque::new();
        queue.push_back((vec![from.clone()], 0.0f64));
        let mut best: Option<(Vec<DeviceId>, f64)> = None;

        while let Some((path, latency)) = queue.pop_front() {
            if let Some((best_path, _)) = &best {
                if path.len() > best_path.len() {
                    continue;
                }
            }
            let current = path.last().unwrap().clone();
            for edge in self.neighbors(&current, now_ts, false) {
                let next = if edge.from == current { edge.to.clone() } else { edge.from.clone() };
                let next_latency = latency + edge.metrics.latency.unwrap_or(0.0);
                if next == *to {
                    let mut full = path.clone();
                    full.push(next);
                    match &best {
                        Some((best_path, best_latency))
                            if best_path.len() < full.len()
                                || (best_path.len() == full.len() && *best_latency <= next_latency) => {}
                        _ => best = Some((full, next_latency)),
                    }
                    continue;
                }
                if visited.insert(next.clone()) {
                    let mut next_path = path.clone();
                    next_path.push(next);
                    queue.push_back((next_path, next_latency));
                }
            }
        }
        best.map(|(path, _)| path)
    }

    pub fn get_topology(&self, now_ts: i64) -> (Vec<NetworkDevice>, Vec<DeviceConnection>) {
        let nodes = self.nodes.iter().map(|e| e.value().clone()).collect();
        let edges = self
            .edges
            .iter()
            .filter(|e| !e.is_stale(now_ts, self.edge_staleness_ms))
            .map(|e| e.value().clone())
            .collect();
        (nodes, edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: &str) -> DeviceId {
        DeviceId::new("acme", "site-a", n).unwrap()
    }

    fn report(t: &TopologyProcessor, from: &str, to: &str, ts: i64) {
        t.report_connection(
            id(from),
            id(to),
            None,
            None,
            ConnectionType::Ethernet,
            true,
            ConnectionMetrics::default(),
            ts,
            ts,
        );
    }

    #[test]
    fn reports_and_lists_neighbors() {
        let t = TopologyProcessor::new(1_000, 10_000);
        report(&t, "ap", "client", 0);
        let n = t.neighbors(&id("ap"), 0, false);
        assert_eq!(n.len(), 1);
    }

    #[test]
    fn stale_edges_excluded_by_default() {
        let t = TopologyProcessor::new(1_000, 10_000);
        report(&t, "ap", "client", 0);
        assert!(t.neighbors(&id("ap"), 5_000, false).is_empty());
        assert_eq!(t.neighbors(&id("ap"), 5_000, true).len(), 1);
    }

    #[test]
    fn sweep_marks_down_before_removing_on_expiry() {
        let t = TopologyProcessor::new(1_000, 10_000);
        report(&t, "ap", "client", 0);

        t.sweep(5_000);
        assert_eq!(t.get_topology(5_000).1.len(), 0);
        assert_eq!(t.neighbors(&id("ap"), 5_000, true).len(), 1);

        let removed = t.sweep(20_000);
        assert_eq!(removed, 1);
        assert!(t.neighbors(&id("ap"), 20_000, true).is_empty());
    }

    #[test]
    fn finds_shortest_path_across_hops() {
        let t = TopologyProcessor::new(1_000, 10_000);
        report(&t, "a", "b", 0);
        report(&t, "b", "c", 0);
        let path = t.path(&id("a"), &id("c"), 0).unwrap();
        assert_eq!(path, vec![id("a"), id("b"), id("c")]);
    }

    #[test]
    fn unreachable_devices_return_none() {
        let t = TopologyProcessor::new(1_000, 10_000);
        report(&t, "a", "b", 0);
        assert!(t.path(&id("a"), &id("z"), 0).is_none());
    }

    #[test]
    fn wifi_clients_synthesize_edges_via_mac_resolution() {
        let t = TopologyProcessor::new(1_000, 10_000);
        let samples = vec![WifiClientSample {
            mac: "aa:bb".to_string(),
            rssi: Some(-55),
            tx_rate: Some(866),
            tx_bytes: Some(1000),
            rx_bytes: Some(2000),
        }];
        t.report_wifi_clients(&id("ap"), |mac| (mac == "aa:bb").then(|| id("client")), &samples, 0);

        let neighbors = t.neighbors(&id("ap"), 0, false);
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].connection_type, ConnectionType::Wifi);
        assert!(neighbors[0].is_direct_link);
        assert_eq!(neighbors[0].metrics.rssi, Some(-55));
    }

    #[test]
    fn repeated_identical_discovery_is_a_node_noop_and_refreshes_edge() {
        let t = TopologyProcessor::new(1_000, 10_000);
        t.report_discovery(
            id("r"),
            vec![NetworkIface {
                name: "eth0".to_string(),
                mac: Some("aa:bb:cc:dd:ee:01".to_string()),
                ..Default::default()
            }],
            vec![],
            0,
        );
        t.report_discovery(
            id("r"),
            vec![NetworkIface {
                name: "eth0".to_string(),
                mac: Some("aa:bb:cc:dd:ee:01".to_string()),
                ..Default::default()
            }],
            vec![],
            100,
        );
        let (nodes, _) = t.get_topology(100);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].ifaces.len(), 1);

        report(&t, "a", "b", 0);
        report(&t, "a", "b", 0);
        let (_, edges) = t.get_topology(0);
        assert_eq!(edges.iter().filter(|e| e.from == id("a") && e.to == id("b")).count(), 1);
    }

    #[test]
    fn cross_device_identity_resolves_by_interface_mac() {
        let t = TopologyProcessor::new(1_000, 10_000);
        t.report_discovery(
            id("r"),
            vec![NetworkIface {
                name: "wlan0".to_string(),
                mac: Some("aa:bb:cc:dd:ee:02".to_string()),
                ..Default::default()
            }],
            vec![],
            0,
        );
        assert_eq!(t.resolve_by_interface_mac("aa:bb:cc:dd:ee:02"), Some(id("r")));
        assert_eq!(t.resolve_by_interface_mac("00:00:00:00:00:00"), None);
    }
}
