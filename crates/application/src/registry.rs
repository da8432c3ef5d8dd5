//! Device Registry (C6): the latest-wins-by-ts merged view of every
//! device's attrs, state fields, and derived connection status.

use dashmap::DashMap;
use domain::device::{ConnectionStatus, DeviceAttrs, DeviceId, DeviceState};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RegistryUpdate {
    pub device: DeviceId,
    pub status: ConnectionStatus,
}

/// Concurrent, in-memory device state keyed by `DeviceId`. `DashMap`'s
/// sharded locking gives per-device write isolation without a single
/// global lock serializing unrelated devices.
pub struct DeviceRegistry {
    devices: DashMap<DeviceId, DeviceState>,
    skew_window_ms: i64,
    updates: broadcast::Sender<RegistryUpdate>,
}

impl DeviceRegistry {
    pub fn new(skew_window_ms: i64) -> Arc<Self> {
        let (updates, _) = broadcast::channel(1024);
        Arc::new(DeviceRegistry {
            devices: DashMap::new(),
            skew_window_ms,
            updates,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryUpdate> {
        self.updates.subscribe()
    }

    fn entry(&self, id: &DeviceId) -> dashmap::mapref::one::RefMut<'_, DeviceId, DeviceState> {
        self.devices
            .entry(id.clone())
            .or_insert_with(|| DeviceState::new(id.clone()))
    }

    /// Applies a `state` kind update: every field is merged shallowly,
    /// latest `ts` wins within the skew window (spec's tolerance for clock
    /// skew between devices), earlier updates outside the window are
    /// silently dropped rather than erroring. A `connection_status` field
    /// in the update is treated as the device's own claim about its
    /// liveness, reconciled against the LWT-derived claim by timestamp.
    pub fn apply_state(&self, id: &DeviceId, fields: serde_json::Map<String, serde_json::Value>, ts: i64) {
        let mut state = self.entry(id);
        if !state.accepts_update(ts, self.skew_window_ms) {
            debug!(device = %id, ts, "dropping stale state update outside skew window");
            return;
        }
        let reported_status = fields
            .get("connection_status")
            .and_then(|v| v.as_str())
            .and_then(ConnectionStatus::parse);
        for (k, v) in fields {
            state.fields.insert(k, v);
        }
        state.last_update_ts = ts;
        state.last_seen_ts = Some(ts);
        if let Some(status) = reported_status {
            state.apply_reported_status(status, ts);
        }
    }

    /// Applies an `attr` kind update (identity attributes, e.g.
    /// `primary_mac`); attrs are not subject to the skew window since they
    /// rarely change and a late-arriving update is still correct.
    pub fn apply_attrs(&self, id: &DeviceId, attrs: DeviceAttrs, ts: i64) {
        let mut state = self.entry(id);
        state.attrs = attrs;
        state.last_seen_ts = Some(ts);
    }

    /// Applies an LWT-derived liveness update. `connection_status` becomes
    /// this status only if it is at least as recent as the last
    /// device-self-reported `connection_status` (spec's "most recent of
    /// `lwt.status` and `state.connection_status`" rule); the broadcast
    /// update always reflects the resulting merged status, not just this
    /// update, so subscribers never see it regress behind a newer report.
    pub fn apply_liveness(&self, id: &DeviceId, online: bool, ts: i64) {
        let mut state = self.entry(id);
        let status = if online {
            ConnectionStatus::Online
        } else {
            ConnectionStatus::Offline
        };
        state.apply_lwt_status(status, ts);
        state.last_seen_ts = Some(ts);
        let merged = state.connection_status;
        drop(state);

        let _ = self.updates.send(RegistryUpdate {
            device: id.clone(),
            status: merged,
        });
    }

    pub fn get(&self, id: &DeviceId) -> Option<DeviceState> {
        self.devices.get(id).map(|r| r.clone())
    }

    pub fn primary_mac_lookup(&self, mac: &str) -> Option<DeviceId> {
        self.devices
            .iter()
            .find(|entry| entry.attrs.primary_mac.as_deref() == Some(mac))
            .map(|entry| entry.key().clone())
    }

    pub fn list(&self) -> Vec<DeviceState> {
        self.devices.iter().map(|e| e.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id() -> DeviceId {
        DeviceId::new("acme", "site-a", "dev-1").unwrap()
    }

    #[test]
    fn applies_state_update_and_tracks_ts() {
        let reg = DeviceRegistry::new(1_000);
        let mut fields = serde_json::Map::new();
        fields.insert("online".to_string(), json!(true));
        reg.apply_state(&id(), fields, 100);

        let state = reg.get(&id()).unwrap();
        assert_eq!(state.fields["online"], json!(true));
        assert_eq!(state.last_update_ts, 100);
    }

    #[test]
    fn drops_update_outside_skew_window() {
        let reg = DeviceRegistry::new(1_000);
        let mut fields = serde_json::Map::new();
        fields.insert("a".to_string(), json!(1));
        reg.apply_state(&id(), fields.clone(), 10_000);
        reg.apply_state(&id(), fields, 1_000);

        let state = reg.get(&id()).unwrap();
        assert_eq!(state.last_update_ts, 10_000);
    }

    #[test]
    fn liveness_updates_connection_status() {
        let reg = DeviceRegistry::new(1_000);
        reg.apply_liveness(&id(), true, 1);
        assert_eq!(reg.get(&id()).unwrap().connection_status, ConnectionStatus::Online);
        reg.apply_liveness(&id(), false, 2);
        assert_eq!(reg.get(&id()).unwrap().connection_status, ConnectionStatus::Offline);
    }

    #[test]
    fn reported_connection_status_wins_when_more_recent_than_lwt() {
        let reg = DeviceRegistry::new(1_000);
        reg.apply_liveness(&id(), true, 10);
        assert_eq!(reg.get(&id()).unwrap().connection_status, ConnectionStatus::Online);

        let mut fields = serde_json::Map::new();
        fields.insert("connection_status".to_string(), json!("offline"));
        reg.apply_state(&id(), fields, 20);

        assert_eq!(
            reg.get(&id()).unwrap().connection_status,
            ConnectionStatus::Offline,
            "a newer device-reported status must win over an older lwt claim"
        );
    }

    #[test]
    fn lwt_still_wins_when_reported_status_is_older() {
        let reg = DeviceRegistry::new(1_000);
        let mut fields = serde_json::Map::new();
        fields.insert("connection_status".to_string(), json!("offline"));
        reg.apply_state(&id(), fields, 5);

        reg.apply_liveness(&id(), true, 10);

        assert_eq!(reg.get(&id()).unwrap().connection_status, ConnectionStatus::Online);
    }

    #[test]
    fn primary_mac_lookup_finds_device() {
        let reg = DeviceRegistry::new(1_000);
        reg.apply_attrs(
            &id(),
            DeviceAttrs {
                primary_mac: Some("aa:bb:cc:dd:ee:ff".to_string()),
                ..Default::default()
            },
            1,
        );
        assert_eq!(reg.primary_mac_lookup("aa:bb:cc:dd:ee:ff"), Some(id()));
        assert_eq!(reg.primary_mac_lookup("00:00:00:00:00:00"), None);
    }
}
