use anyhow::{Result, anyhow};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task;
use tracing::{error, info};

#[derive(Clone, Debug)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub pkid: u16,
}

#[async_trait::async_trait]
pub trait MqttPublisherClient: Send + Sync {
    async fn publish_bytes(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<()>;
    fn is_connected(&self) -> bool;
}

/// Per-kind QoS/retained policy: RTK topic `kind` segment maps to the QoS
/// and retained-flag a publish should carry. `state`, `attr`, and `lwt` are
/// retained so a newly-subscribed controller sees the last-known value
/// immediately; commands and events are not, since replaying a stale
/// command or event on every (re)subscribe would be actively wrong.
pub fn publish_policy(kind: &str) -> (QoS, bool) {
    match kind {
        "state" | "attr" | "lwt" => (QoS::AtLeastOnce, true),
        "cmd" => (QoS::AtLeastOnce, false),
        "event" => (QoS::AtLeastOnce, false),
        "telemetry" => (QoS::AtMostOnce, false),
        "topology" => (QoS::AtLeastOnce, false),
        _ => (QoS::AtLeastOnce, false),
    }
}

#[derive(Clone)]
pub struct MqttClient {
    client: AsyncClient,
    tx: broadcast::Sender<MqttMessage>,
    connected: Arc<AtomicBool>,
    subscriptions: Arc<std::sync::RwLock<Vec<String>>>,
}

impl MqttClient {
    /// `online_lwt_topic`, if set, is republished with a fresh `{online:
    /// true}` payload on every `ConnAck` — both the initial connect and
    /// every reconnect after a broker outage — so a newly (re)subscribed
    /// controller's liveness is never stuck on the registered `last_will`'s
    /// offline payload.
    pub async fn new(
        host: &str,
        port: u16,
        client_id: &str,
        keep_alive_secs: u64,
        last_will: Option<LastWill>,
        online_lwt_topic: Option<String>,
    ) -> Result<Self> {
        let mut mqttoptions = MqttOptions::new(client_id, host, port);
        mqttoptions.set_keep_alive(Duration::from_secs(keep_alive_secs));
        mqttoptions.set_clean_session(false);
        mqttoptions.set_manual_acks(true);

        if let Some(will) = last_will {
            mqttoptions.set_last_will(will);
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
        let (tx, _) = broadcast::channel(1024);
        let tx_clone = tx.clone();
        let connected = Arc::new(AtomicBool::new(false));
        let connected_clone = connected.clone();

        let subscriptions = Arc::new(std::sync::RwLock::new(Vec::new()));
        let subscriptions_clone = subscriptions.clone();
        let client_clone = client.clone();

        task::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(notification) => match notification {
                        Event::Incoming(Packet::Publish(publish)) => {
                            let msg = MqttMessage {
                                topic: publish.topic,
                                payload: publish.payload.to_vec(),
                                pkid: publish.pkid,
                            };
                            if tx_clone.send(msg).is_err() {
                                // No internal subscribers yet; dropping is fine, the
                                // broker still holds the message for re-delivery.
                            }
                        }
                        Event::Incoming(Packet::ConnAck(_)) => {
                            info!("mqtt connected");
                            connected_clone.store(true, Ordering::Relaxed);

                            if let Some(topic) = &online_lwt_topic {
                                let payload = serde_json::json!({
                                    "schema": "lwt/1.0",
                                    "ts": chrono::Utc::now().timestamp_millis(),
                                    "online": true,
                                })
                                .to_string();
                                if let Err(e) =
                                    client_clone.publish(topic, QoS::AtLeastOnce, true, payload).await
                                {
                                    error!(topic = %topic, error = %e, "failed to publish online lwt on (re)connect");
                                }
                            }

                            let subs = subscriptions_clone.read().unwrap().clone();
                            if !subs.is_empty() {
                                info!(count = subs.len(), "re-subscribing");
                                for topic in subs {
                                    if let Err(e) =
                                        client_clone.subscribe(&topic, QoS::AtLeastOnce).await
                                    {
                                        error!(topic = %topic, error = %e, "re-subscribe failed");
                                    }
                                }
                            }
                        }
                        Event::Outgoing(rumqttc::Outgoing::Disconnect) => {
                            connected_clone.store(false, Ordering::Relaxed);
                        }
                        _ => {}
                    },
                    Err(e) => {
                        error!(error = ?e, "mqtt connection error");
                        connected_clone.store(false, Ordering::Relaxed);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            tx,
            connected,
            subscriptions,
        })
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<MqttMessage> {
        self.tx.subscribe()
    }

    /// Publishes using the per-kind QoS/retained policy, waiting up to 5
    /// seconds for the broker to ack before giving up.
    pub async fn publish_for_kind(&self, topic: &str, kind: &str, payload: &[u8]) -> Result<()> {
        let (qos, retain) = publish_policy(kind);
        tokio::time::timeout(
            Duration::from_secs(5),
            self.publish_bytes(topic, payload, qos, retain),
        )
        .await
        .map_err(|_| anyhow!("publish to {} timed out", topic))?
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        {
            let mut subs = self.subscriptions.write().unwrap();
            if !subs.contains(&topic.to_string()) {
                subs.push(topic.to_string());
            }
        }

        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| anyhow!("failed to subscribe to topic {}: {}", topic, e))?;
        Ok(())
    }

    pub async fn ack(&self, topic: &str, pkid: u16) -> Result<()> {
        let publish = rumqttc::Publish {
            pkid,
            topic: topic.to_string(),
            qos: rumqttc::QoS::AtLeastOnce,
            payload: bytes::Bytes::new(),
            retain: false,
            dup: false,
        };

        self.client
            .ack(&publish)
            .await
            .map_err(|e| anyhow!("failed to ack packet {}: {}", pkid, e))
    }
}

#[async_trait::async_trait]
impl MqttPublisherClient for MqttClient {
    async fn publish_bytes(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| anyhow!("failed to publish mqtt message: {}", e))?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_attr_and_lwt_are_retained() {
        assert_eq!(publish_policy("state"), (QoS::AtLeastOnce, true));
        assert_eq!(publish_policy("attr"), (QoS::AtLeastOnce, true));
        assert_eq!(publish_policy("lwt"), (QoS::AtLeastOnce, true));
    }

    #[test]
    fn commands_and_events_are_not_retained() {
        assert_eq!(publish_policy("cmd"), (QoS::AtLeastOnce, false));
        assert_eq!(publish_policy("event"), (QoS::AtLeastOnce, false));
    }

    #[test]
    fn telemetry_is_best_effort() {
        assert_eq!(publish_policy("telemetry"), (QoS::AtMostOnce, false));
    }
}
