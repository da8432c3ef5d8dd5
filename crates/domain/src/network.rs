//! Topology graph types: network devices, their interfaces, and the
//! directed connections (edges) discovered between them.

use crate::device::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One interface reported on a `NetworkDevice`, keyed by name in the
/// owning device's `ifaces` map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkIface {
    pub name: String,
    #[serde(default)]
    pub iface_type: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub ip: Vec<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub rssi: Option<i32>,
    #[serde(default)]
    pub tx_bytes: Option<u64>,
    #[serde(default)]
    pub rx_bytes: Option<u64>,
}

impl NetworkIface {
    /// Merge policy for a single interface: an incoming non-empty field
    /// replaces the stored one; an absent/empty incoming field leaves the
    /// stored value untouched.
    fn merge_from(&mut self, incoming: NetworkIface) {
        if incoming.iface_type.is_some() {
            self.iface_type = incoming.iface_type;
        }
        if incoming.mac.is_some() {
            self.mac = incoming.mac;
        }
        if !incoming.ip.is_empty() {
            self.ip = incoming.ip;
        }
        if incoming.status.is_some() {
            self.status = incoming.status;
        }
        if incoming.rssi.is_some() {
            self.rssi = incoming.rssi;
        }
        if incoming.tx_bytes.is_some() {
            self.tx_bytes = incoming.tx_bytes;
        }
        if incoming.rx_bytes.is_some() {
            self.rx_bytes = incoming.rx_bytes;
        }
    }
}

/// A discovered network device: its interfaces (keyed by name) and
/// reported capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDevice {
    pub id: DeviceId,
    #[serde(default)]
    pub ifaces: HashMap<String, NetworkIface>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub last_update_ts: i64,
}

impl NetworkDevice {
    pub fn new(id: DeviceId, ts: i64) -> Self {
        NetworkDevice {
            id,
            ifaces: HashMap::new(),
            capabilities: Vec::new(),
            last_update_ts: ts,
        }
    }

    /// Merge policy (spec.md §4.7): incoming fields replace only non-empty
    /// values; `capabilities` is replaced wholesale when present;
    /// `interfaces` merge by name using the same per-field rule.
    pub fn merge(&mut self, incoming_ifaces: Vec<NetworkIface>, incoming_capabilities: Vec<String>, ts: i64) {
        for iface in incoming_ifaces {
            self.ifaces
                .entry(iface.name.clone())
                .and_modify(|existing| existing.merge_from(iface.clone()))
                .or_insert(iface);
        }
        if !incoming_capabilities.is_empty() {
            self.capabilities = incoming_capabilities;
        }
        self.last_update_ts = ts;
    }

    /// Cross-device identity (spec.md §4.7): true if `mac` is recorded as
    /// one of this node's interface MACs.
    pub fn has_interface_mac(&self, mac: &str) -> bool {
        self.ifaces.values().any(|i| i.mac.as_deref() == Some(mac))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Ethernet,
    Wifi,
    Bridge,
    Route,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub rssi: Option<i32>,
    pub link_speed: Option<u64>,
    pub bandwidth: Option<u64>,
    pub latency: Option<f64>,
    #[serde(default)]
    pub tx_bytes: u64,
    #[serde(default)]
    pub rx_bytes: u64,
    pub last_update: i64,
}

/// A directed edge in the topology graph. Id is `{from}-{to}-{discovered}`
/// per spec.md §3, so repeated discoveries of the same link are idempotent
/// (same id) while genuinely new discoveries of the same pair get a new
/// edge record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConnection {
    pub id: String,
    pub from: DeviceId,
    pub to: DeviceId,
    pub from_iface: Option<String>,
    pub to_iface: Option<String>,
    pub connection_type: ConnectionType,
    pub is_direct_link: bool,
    pub metrics: ConnectionMetrics,
    pub last_seen: i64,
    pub discovered: i64,
    /// Set true by the periodic sweep once the edge crosses
    /// `edge_staleness` without a refresh; cleared by the next refresh.
    /// Distinct from removal, which only happens past `edge_expire`
    /// (see DESIGN.md's Open Question decisions).
    #[serde(default)]
    pub down: bool,
}

impl DeviceConnection {
    pub fn edge_id(from: &DeviceId, to: &DeviceId, discovered: i64) -> String {
        format!("{from}-{to}-{discovered}")
    }

    pub fn is_stale(&self, now_ts: i64, edge_staleness_ms: i64) -> bool {
        now_ts - self.last_seen > edge_staleness_ms
    }

    pub fn is_expired(&self, now_ts: i64, edge_expiry_ms: i64) -> bool {
        now_ts - self.last_seen > edge_expiry_ms
    }
}
