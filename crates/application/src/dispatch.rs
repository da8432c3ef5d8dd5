//! Inbound message dispatch: Broker Client -> Topic Codec -> Schema
//! Validator -> Message Log -> kind-specific handler.

use crate::command::CommandTracker;
use crate::event::EventProcessor;
use crate::registry::DeviceRegistry;
use crate::topology::{TopologyProcessor, WifiClientSample};
use domain::device::{DeviceAttrs, DeviceId};
use domain::envelope::Envelope;
use domain::log_entry::MessageLogEntry;
use domain::network::{ConnectionMetrics, ConnectionType, NetworkIface};
use domain::topic::Topic;
use infrastructure::{MessageLog, SchemaRegistry};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct Dispatcher {
    pub schema: Arc<SchemaRegistry>,
    pub log: Arc<MessageLog>,
    pub registry: Arc<DeviceRegistry>,
    pub topology: Arc<TopologyProcessor>,
    pub commands: Arc<CommandTracker>,
    pub events: Arc<EventProcessor>,
}

impl Dispatcher {
    /// Processes one inbound MQTT publish. Topic/envelope parse failures
    /// and schema-invalid payloads are still appended to the Message Log
    /// (with `schema_matched: None` or the failed match) so a forensic
    /// replay can see what the controller rejected and why, but they are
    /// not handed to a kind handler.
    pub async fn handle(&self, topic_str: &str, payload: &[u8]) {
        let topic = match Topic::parse(topic_str) {
            Ok(t) => t,
            Err(e) => {
                warn!(topic = %topic_str, error = %e, "dropping message on unparseable topic");
                return;
            }
        };

        let validation = self.schema.validate(topic_str, payload);
        let envelope = Envelope::parse(payload).ok();

        self.log
            .append(MessageLogEntry {
                id: Uuid::new_v4().to_string(),
                topic: topic_str.to_string(),
                payload: payload.to_vec(),
                ts: envelope.as_ref().map(|e| e.ts).unwrap_or_default(),
                schema_matched: validation.schema_matched.clone(),
            })
            .await;

        if !validation.valid {
            debug!(topic = %topic_str, errors = ?validation.errors, "schema validation failed");
            return;
        }
        let Some(envelope) = envelope else { return };

        let device_id = match DeviceId::from_key(topic.device_key()) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "dropping message with invalid device key");
                return;
            }
        };

        match topic.kind.as_str() {
            "state" => self.handle_state(&device_id, envelope),
            "lwt" => self.handle_lwt(&device_id, envelope),
            "attr" => self.handle_attr(&device_id, envelope),
            "event" => self.handle_event(&device_id, envelope),
            "topology" => self.handle_topology(&device_id, &topic, envelope),
            "telemetry" => self.handle_telemetry(&device_id, &topic, envelope),
            "cmd" => self.handle_cmd(&device_id, &topic, envelope),
            _ => debug!(kind = %topic.kind, "no handler registered for kind"),
        }
    }

    fn handle_state(&self, device: &DeviceId, envelope: Envelope) {
        if let serde_json::Value::Object(mut fields) = envelope.body {
            fields.remove("schema");
            fields.remove("ts");
            self.registry.apply_state(device, fields, envelope.ts);
        }
    }

    fn handle_lwt(&self, device: &DeviceId, envelope: Envelope) {
        let online = envelope.body.get("online").and_then(|v| v.as_bool()).unwrap_or(false);
        self.registry.apply_liveness(device, online, envelope.ts);
    }

    fn handle_attr(&self, device: &DeviceId, envelope: Envelope) {
        let attrs: DeviceAttrs = serde_json::from_value(envelope.body.clone()).unwrap_or_default();
        self.registry.apply_attrs(device, attrs, envelope.ts);
    }

    fn handle_event(&self, device: &DeviceId, envelope: Envelope) {
        let name = envelope
            .body
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let severity = envelope.body.get("severity").and_then(|v| v.as_str());
        if let Err(e) = self.events.process(device.clone(), name, severity, envelope.ts, envelope.body) {
            warn!(error = %e, "failed to persist event");
        }
    }

    fn handle_topology(&self, device: &DeviceId, topic: &Topic, envelope: Envelope) {
        match topic.sub.as_deref() {
            Some("discovery") => {
                let ifaces: Vec<NetworkIface> = envelope
                    .body
                    .get("interfaces")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                let capabilities: Vec<String> = envelope
                    .body
                    .get("capabilities")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                self.topology.report_discovery(device.clone(), ifaces, capabilities, envelope.ts);
            }
            Some("connections") => {
                let Some(edges) = envelope.body.get("edges").and_then(|v| v.as_array()) else { return };
                for e in edges {
                    let Some(to_str) = e.get("to").and_then(|v| v.as_str()) else { continue };
                    let Ok(to) = DeviceId::from_key(to_str.to_string()) else { continue };
                    let connection_type: ConnectionType = e
                        .get("connection_type")
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                        .unwrap_or(ConnectionType::Ethernet);
                    let is_direct_link = e.get("is_direct_link").and_then(|v| v.as_bool()).unwrap_or(true);
                    let metrics: ConnectionMetrics = e
                        .get("metrics")
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                        .unwrap_or_default();
                    let discovered = e.get("discovered").and_then(|v| v.as_i64()).unwrap_or(envelope.ts);
                    let from_iface = e.get("from_iface").and_then(|v| v.as_str()).map(str::to_string);
                    let to_iface = e.get("to_iface").and_then(|v| v.as_str()).map(str::to_string);
                    self.topology.report_connection(
                        device.clone(),
                        to,
                        from_iface,
                        to_iface,
                        connection_type,
                        is_direct_link,
                        metrics,
                        discovered,
                        envelope.ts,
                    );
                }
            }
            other => debug!(sub = ?other, "unhandled topology sub-kind"),
        }
    }

    fn handle_telemetry(&self, device: &DeviceId, topic: &Topic, envelope: Envelope) {
        if topic.sub.as_deref() != Some("wifi_clients") {
            return;
        }
        let Some(clients) = envelope.body.get("clients").and_then(|v| v.as_array()) else { return };
        let samples: Vec<WifiClientSample> = clients
            .iter()
            .filter_map(|c| {
                let mac = c.get("mac").and_then(|v| v.as_str())?.to_string();
                Some(WifiClientSample {
                    mac,
                    rssi: c.get("rssi").and_then(|v| v.as_i64()).map(|n| n as i32),
                    tx_rate: c.get("tx_rate").and_then(|v| v.as_u64()),
                    tx_bytes: c.get("tx_bytes").and_then(|v| v.as_u64()),
                    rx_bytes: c.get("rx_bytes").and_then(|v| v.as_u64()),
                })
            })
            .collect();
        let registry = self.registry.clone();
        self.topology
            .report_wifi_clients(device, |mac| registry.primary_mac_lookup(mac), &samples, envelope.ts);
    }

    /// `cmd/ack` and `cmd/res` carry their correlation fields nested under
    /// `payload` (`{"schema":"cmd.ack/1.0","ts":…,"payload":{"id":…}}`); a
    /// top-level field is also accepted for devices that flatten it.
    fn cmd_field<'a>(body: &'a serde_json::Value, field: &str) -> Option<&'a serde_json::Value> {
        body.get("payload").and_then(|p| p.get(field)).or_else(|| body.get(field))
    }

    fn handle_cmd(&self, _device: &DeviceId, topic: &Topic, envelope: Envelope) {
        let Some(id) = Self::cmd_field(&envelope.body, "id").and_then(|v| v.as_str()) else {
            warn!("cmd message missing correlation id");
            return;
        };
        match topic.sub.as_deref() {
            Some("ack") => {
                if let Err(e) = self.commands.on_ack(id, envelope.ts) {
                    debug!(command_id = %id, error = %e, "ack for unknown/closed command");
                }
            }
            Some("res") => {
                let status = Self::cmd_field(&envelope.body, "status").and_then(|v| v.as_str());
                let error = Self::cmd_field(&envelope.body, "error")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                // Per the cmd/res contract: status == "completed" succeeds;
                // any other status, or an explicit `error` field, fails.
                let succeeded = status == Some("completed") && error.is_none();
                let result = Self::cmd_field(&envelope.body, "result").cloned();
                if let Err(e) = self.commands.on_result(id, succeeded, result, error, envelope.ts) {
                    debug!(command_id = %id, error = %e, "result for unknown/closed command");
                }
            }
            other => debug!(sub = ?other, "unhandled cmd sub-kind"),
        }
    }
}
