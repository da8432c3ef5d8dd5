//! Device identity, last-known state, and liveness (LWT-derived) tracking.

use crate::error::DomainError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `tenant:site:device`, the registry key for everything about a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(tenant: &str, site: &str, device: &str) -> Result<Self, DomainError> {
        if tenant.is_empty() || site.is_empty() || device.is_empty() {
            return Err(DomainError::InvalidDeviceId(format!(
                "{tenant}:{site}:{device}"
            )));
        }
        Ok(DeviceId(format!("{tenant}:{site}:{device}")))
    }

    pub fn from_key(key: impl Into<String>) -> Result<Self, DomainError> {
        let key = key.into();
        if key.splitn(3, ':').count() != 3 || key.split(':').any(str::is_empty) {
            return Err(DomainError::InvalidDeviceId(key));
        }
        Ok(DeviceId(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical/administrative identity attributes reported by a device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceAttrs {
    pub primary_mac: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub hostname: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Connection status derived from liveness (LWT + recent traffic), not
/// reported directly by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Online,
    Offline,
    Unknown,
}

impl ConnectionStatus {
    /// Parses a device-self-reported `connection_status` state field.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "online" => Some(ConnectionStatus::Online),
            "offline" => Some(ConnectionStatus::Offline),
            "unknown" => Some(ConnectionStatus::Unknown),
            _ => None,
        }
    }
}

/// The latest-wins-by-ts merged view of a device's reported state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    pub id: DeviceId,
    pub attrs: DeviceAttrs,
    /// Free-form last-known state fields (kind `state`), merged shallowly,
    /// latest field wins by envelope `ts`.
    pub fields: HashMap<String, serde_json::Value>,
    pub connection_status: ConnectionStatus,
    /// `ts` (ms) of the most recent accepted update, per field source.
    pub last_update_ts: i64,
    pub last_seen_ts: Option<i64>,
    /// `ts` of the latest LWT-derived liveness update, 0 if none yet.
    lwt_ts: i64,
    /// `ts` of the latest `state` update that reported its own
    /// `connection_status` field, 0 if none yet.
    reported_status_ts: i64,
}

impl DeviceState {
    pub fn new(id: DeviceId) -> Self {
        DeviceState {
            id,
            attrs: DeviceAttrs::default(),
            fields: HashMap::new(),
            connection_status: ConnectionStatus::Unknown,
            last_update_ts: 0,
            last_seen_ts: None,
            lwt_ts: 0,
            reported_status_ts: 0,
        }
    }

    /// Records an LWT-derived liveness status; `connection_status` becomes
    /// this value only if it is at least as recent as the latest
    /// device-self-reported status.
    pub fn apply_lwt_status(&mut self, status: ConnectionStatus, ts: i64) {
        self.lwt_ts = ts;
        if ts >= self.reported_status_ts {
            self.connection_status = status;
        }
    }

    /// Records a `state`-reported `connection_status`; `connection_status`
    /// becomes this value only if it is at least as recent as the latest
    /// LWT-derived status. The two sources are reconciled by timestamp, not
    /// by which arrived last on the wire.
    pub fn apply_reported_status(&mut self, status: ConnectionStatus, ts: i64) {
        self.reported_status_ts = ts;
        if ts >= self.lwt_ts {
            self.connection_status = status;
        }
    }

    /// Applies an incoming `ts`-stamped update if it is not older than the
    /// current state by more than `skew_window_ms` (spec §4.6 skew window:
    /// updates within the window of the current high-water mark are still
    /// accepted even if nominally "earlier", to tolerate clock skew between
    /// devices).
    pub fn accepts_update(&self, incoming_ts: i64, skew_window_ms: i64) -> bool {
        incoming_ts >= self.last_update_ts - skew_window_ms
    }
}

/// Last-Will-and-Testament derived liveness record for a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liveness {
    pub id: DeviceId,
    pub online: bool,
    pub reason: Option<String>,
    pub ts: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_device_id_from_parts() {
        let id = DeviceId::new("acme", "site-a", "dev-1").unwrap();
        assert_eq!(id.as_str(), "acme:site-a:dev-1");
    }

    #[test]
    fn rejects_empty_parts() {
        assert!(DeviceId::new("", "site-a", "dev-1").is_err());
    }

    #[test]
    fn skew_window_tolerates_small_backward_jumps() {
        let mut state = DeviceState::new(DeviceId::new("a", "b", "c").unwrap());
        state.last_update_ts = 10_000;
        assert!(state.accepts_update(9_500, 1_000));
        assert!(!state.accepts_update(8_000, 1_000));
    }

    #[test]
    fn connection_status_follows_whichever_source_is_more_recent() {
        let mut state = DeviceState::new(DeviceId::new("a", "b", "c").unwrap());
        state.apply_lwt_status(ConnectionStatus::Online, 100);
        assert_eq!(state.connection_status, ConnectionStatus::Online);

        // A state-reported status older than the LWT update doesn't win.
        state.apply_reported_status(ConnectionStatus::Offline, 50);
        assert_eq!(state.connection_status, ConnectionStatus::Online);

        // A newer state-reported status does.
        state.apply_reported_status(ConnectionStatus::Offline, 200);
        assert_eq!(state.connection_status, ConnectionStatus::Offline);

        // And a newer LWT update overrides that in turn.
        state.apply_lwt_status(ConnectionStatus::Online, 300);
        assert_eq!(state.connection_status, ConnectionStatus::Online);
    }

    #[test]
    fn parses_reported_connection_status_strings() {
        assert_eq!(ConnectionStatus::parse("online"), Some(ConnectionStatus::Online));
        assert_eq!(ConnectionStatus::parse("offline"), Some(ConnectionStatus::Offline));
        assert_eq!(ConnectionStatus::parse("bogus"), None);
    }
}
