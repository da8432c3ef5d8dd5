//! Event Processor (C9): persists device-reported events and fans them out
//! to in-process subscribers, classified by severity.

use domain::device::DeviceId;
use domain::error::DomainError;
use domain::event::{Event, Severity};
use domain::storage::KvStore;
use domain::topic::matches as topic_matches;
use infrastructure::StorageFailureMonitor;
use serde_json::Value;
use std::ops::ControlFlow;
use std::sync::{Arc, OnceLock, RwLock};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

pub struct EventProcessor {
    store: Arc<dyn KvStore>,
    subscribers: RwLock<broadcast::Sender<Event>>,
    retention_days: u64,
    failure_monitor: OnceLock<StorageFailureMonitor>,
}

impl EventProcessor {
    pub fn new(store: Arc<dyn KvStore>, retention_days: u64) -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(EventProcessor {
            store,
            subscribers: RwLock::new(tx),
            retention_days,
            failure_monitor: OnceLock::new(),
        })
    }

    /// Registers the shared storage-failure budget; a no-op if already set.
    pub fn set_failure_monitor(&self, monitor: StorageFailureMonitor) {
        let _ = self.failure_monitor.set(monitor);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.subscribers.read().unwrap().subscribe()
    }

    /// Subscribes with a device-topic-pattern filter (MQTT wildcards against
    /// `event.device`) and a severity floor; events below the floor or not
    /// matching the pattern are never sent down the returned receiver.
    pub fn subscribe_filtered(
        &self,
        device_pattern: String,
        min_severity: Severity,
    ) -> broadcast::Receiver<Event> {
        let upstream = self.subscribers.read().unwrap().subscribe();
        let (tx, rx) = broadcast::channel(1024);
        tokio::spawn(async move {
            let mut upstream = upstream;
            loop {
                match upstream.recv().await {
                    Ok(event) => {
                        let device_path = event.device.to_string().replace(':', "/");
                        if event.severity >= min_severity
                            && topic_matches(&device_pattern, &device_path)
                            && tx.send(event).is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }

    /// Persists under `event:{ts_desc}:{device}:{uuid}` (ts stored
    /// descending so the most recent events sort first under ascending byte
    /// iteration) and fans out to subscribers. Persistence failure is
    /// propagated; fan-out failure (no listeners) is not an error.
    pub fn process(&self, device: DeviceId, name: String, severity_raw: Option<&str>, ts: i64, body: Value) -> Result<Event, DomainError> {
        let severity = Severity::classify(severity_raw);
        let event = Event {
            id: Uuid::new_v4().to_string(),
            device,
            severity,
            name,
            ts,
            body,
        };

        let key = Self::key(&event);
        let value = serde_json::to_vec(&event).map_err(|e| DomainError::Storage(e.to_string()))?;
        if let Err(e) = self.store.set(&key, &value) {
            if let Some(m) = self.failure_monitor.get() {
                m.note_failure("event");
            }
            return Err(e);
        }
        if let Some(m) = self.failure_monitor.get() {
            m.reset();
        }

        let _ = self.subscribers.read().unwrap().send(event.clone());
        info!(device = %event.device, severity = ?event.severity, name = %event.name, "processed event");
        Ok(event)
    }

    fn key(event: &Event) -> String {
        let ts_desc = i64::MAX - event.ts;
        format!("event:{ts_desc:020}:{}:{}", event.device, event.id)
    }

    pub fn retention_days(&self) -> u64 {
        self.retention_days
    }

    /// Deletes events older than `retention_days`, in bounded transactions
    /// of up to 1000 keys. Keys sort by descending timestamp, so expired
    /// entries (the oldest) live at the high end of the `event:` namespace
    /// rather than the low end, unlike the message log.
    pub fn purge(&self, now_ts: i64) -> Result<usize, DomainError> {
        let horizon = now_ts - (self.retention_days as i64) * 86_400_000;
        let ts_desc_start = i64::MAX - (horizon - 1);
        let start = format!("event:{ts_desc_start:020}:");
        let end = "event;".to_string();

        let mut to_delete = Vec::new();
        self.store.iterate_range(&start, &end, &mut |key, _| {
            to_delete.push(key.to_string());
            if to_delete.len() >= 1000 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;

        let count = to_delete.len();
        if count > 0 {
            self.store.transaction(&mut |tx| {
                for key in &to_delete {
                    tx.delete(key)?;
                }
                Ok(())
            })?;
            info!(count, "purged events past retention horizon");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infrastructure::storage::SledStore;

    fn store() -> (Arc<dyn KvStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path().to_str().unwrap()).unwrap();
        (Arc::new(store), dir)
    }

    #[test]
    fn processes_and_persists_event() {
        let (store, _dir) = store();
        let ep = EventProcessor::new(store.clone(), 30);
        let device = DeviceId::new("a", "b", "c").unwrap();
        let event = ep
            .process(device.clone(), "link_down".to_string(), Some("critical"), 100, Value::Null)
            .unwrap();

        assert_eq!(event.severity, Severity::Critical);
        let key = EventProcessor::key(&event);
        assert!(store.get(&key).unwrap().is_some());
    }

    #[tokio::test]
    async fn subscribers_receive_processed_events() {
        let (store, _dir) = store();
        let ep = EventProcessor::new(store, 30);
        let mut rx = ep.subscribe();
        let device = DeviceId::new("a", "b", "c").unwrap();
        ep.process(device, "boot".to_string(), None, 1, Value::Null).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.name, "boot");
        assert_eq!(received.severity, Severity::Info);
    }

    #[tokio::test]
    async fn filtered_subscriber_honors_pattern_and_severity_floor() {
        let (store, _dir) = store();
        let ep = EventProcessor::new(store, 30);
        let mut rx = ep.subscribe_filtered("a/b/c".to_string(), Severity::Warning);

        let device = DeviceId::new("a", "b", "c").unwrap();
        let other_device = DeviceId::new("a", "b", "z").unwrap();
        ep.process(device.clone(), "low".to_string(), Some("info"), 1, Value::Null).unwrap();
        ep.process(other_device, "wrong_device".to_string(), Some("critical"), 2, Value::Null).unwrap();
        ep.process(device, "link_down".to_string(), Some("critical"), 3, Value::Null).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.name, "link_down");
    }

    #[test]
    fn purge_deletes_events_past_retention() {
        let (store, _dir) = store();
        let ep = EventProcessor::new(store.clone(), 30);
        let device = DeviceId::new("a", "b", "c").unwrap();

        let old = ep.process(device.clone(), "old".to_string(), None, 0, Value::Null).unwrap();
        let recent_ts = 100_000_000_000;
        let recent = ep.process(device, "recent".to_string(), None, recent_ts, Value::Null).unwrap();

        let now_ts = recent_ts + 40 * 86_400_000;
        let purged = ep.purge(now_ts).unwrap();

        assert_eq!(purged, 1);
        assert!(store.get(&EventProcessor::key(&old)).unwrap().is_none());
        assert!(store.get(&EventProcessor::key(&recent)).unwrap().is_some());
    }
}
