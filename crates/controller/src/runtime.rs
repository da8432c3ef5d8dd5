use anyhow::Result;
use application::{CommandTracker, DeviceRegistry, Dispatcher, EventProcessor, TopologyProcessor};
use infrastructure::{ControllerConfig, MessageLog, MqttClient, SchemaRegistry, SledStore, StorageFailureMonitor};
use rumqttc::LastWill;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Owns every background task spawned during startup so shutdown can join
/// them in reverse order, mirroring the teacher's `stop_all`-aborts-handles
/// discipline but generalized to the RTK startup/shutdown sequence.
pub struct ControllerRuntime {
    config: ControllerConfig,
    mqtt: MqttClient,
    storage: Arc<SledStore>,
    log: Arc<MessageLog>,
    pub registry: Arc<DeviceRegistry>,
    pub topology: Arc<TopologyProcessor>,
    pub commands: Arc<CommandTracker>,
    pub events: Arc<EventProcessor>,
    tasks: Vec<JoinHandle<()>>,
    storage_trip_rx: mpsc::Receiver<String>,
    lwt_topic: String,
}

impl ControllerRuntime {
    /// Startup order: storage -> schema -> log -> broker -> processors ->
    /// tracker -> dispatch loop.
    pub async fn start(config: ControllerConfig) -> Result<Self> {
        let storage = Arc::new(SledStore::open(&config.storage.path)?);
        let (storage_monitor, storage_trip_rx) = StorageFailureMonitor::new(config.storage_failure_budget);

        let schema = Arc::new(SchemaRegistry::load(
            config.schema.schema_dir.as_deref(),
            config.schema.cache_size,
            config.schema.strict,
        )?);

        let (log, log_task) = MessageLog::spawn(
            storage.clone() as Arc<dyn domain::storage::KvStore>,
            config.log.batch_size,
            config.log.excluded_topics.clone(),
            config.log.max_payload_bytes,
        );
        log.set_failure_monitor(storage_monitor.clone());

        let lwt_topic = format!("rtk/controller/{}/lwt", config.mqtt.client_id);
        let lwt_payload = serde_json::json!({
            "schema": "lwt/1.0",
            "ts": chrono::Utc::now().timestamp_millis(),
            "online": false,
            "reason": "unexpected_disconnect",
        })
        .to_string();
        let last_will = LastWill::new(&lwt_topic, lwt_payload, rumqttc::QoS::AtLeastOnce, true);

        let mqtt = MqttClient::new(
            &config.mqtt.host,
            config.mqtt.port,
            &config.mqtt.client_id,
            config.mqtt.keep_alive_secs,
            Some(last_will),
            Some(lwt_topic.clone()),
        )
        .await?;

        let subscribe_filter = format!("rtk/v1/{}/{}/+/#", config.tenant, config.site);
        mqtt.subscribe(&subscribe_filter).await?;

        let registry = DeviceRegistry::new(config.skew_window_secs * 1000);
        let topology = TopologyProcessor::new(
            (config.topology.edge_staleness_secs * 1000) as i64,
            (config.topology.edge_expiry_secs * 1000) as i64,
        );
        let commands = CommandTracker::with_bounds_and_store(
            config.command.default_timeout_ms,
            config.command.max_timeout_ms,
            storage.clone() as Arc<dyn domain::storage::KvStore>,
        );
        commands.set_failure_monitor(storage_monitor.clone());
        let now_ts = chrono::Utc::now().timestamp_millis();
        match CommandTracker::load_outstanding(storage.as_ref()) {
            Ok(outstanding) => {
                for command in outstanding {
                    commands.recover(command, now_ts);
                }
            }
            Err(e) => warn!(error = %e, "failed to load outstanding commands from storage"),
        }
        let events = EventProcessor::new(
            storage.clone() as Arc<dyn domain::storage::KvStore>,
            config.event_retention_days,
        );
        events.set_failure_monitor(storage_monitor.clone());

        let dispatcher = Arc::new(Dispatcher {
            schema,
            log: log.clone(),
            registry: registry.clone(),
            topology: topology.clone(),
            commands: commands.clone(),
            events: events.clone(),
        });

        let mut rx = mqtt.subscribe_messages();
        let dispatch_task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => dispatcher.handle(&msg.topic, &msg.payload).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "dispatch loop lagged behind broker fan-out");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let sweep_topology = topology.clone();
        let edge_sweep_interval = config.topology.edge_staleness_secs.max(1);
        let sweep_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(edge_sweep_interval));
            loop {
                ticker.tick().await;
                sweep_topology.sweep(chrono::Utc::now().timestamp_millis());
            }
        });

        let purge_log = log.clone();
        let retention_days = config.log.retention_days;
        let purge_interval_secs = config.log.purge_interval_secs;
        let purge_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(purge_interval_secs));
            loop {
                ticker.tick().await;
                if let Err(e) = purge_log.purge(chrono::Utc::now().timestamp_millis(), retention_days) {
                    error!(error = %e, "message log purge failed");
                }
            }
        });

        let purge_events = events.clone();
        let event_purge_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(purge_interval_secs));
            loop {
                ticker.tick().await;
                if let Err(e) = purge_events.purge(chrono::Utc::now().timestamp_millis()) {
                    error!(error = %e, "event purge failed");
                }
            }
        });

        // The online LWT itself is published by `MqttClient`'s event loop on
        // every `ConnAck`, including this initial connect, not here.
        info!("controller runtime started");

        Ok(ControllerRuntime {
            config,
            mqtt,
            storage,
            log,
            registry,
            topology,
            commands,
            events,
            tasks: vec![log_task, dispatch_task, sweep_task, purge_task, event_purge_task],
            storage_trip_rx,
            lwt_topic,
        })
    }

    /// Resolves once the storage-failure budget trips (consecutive storage
    /// errors from the log, command tracker, or event processor reaching
    /// `storage_failure_budget`), yielding the reason string to shut down
    /// with. Never resolves if the budget is never exceeded; callers race
    /// it against their own shutdown signal (e.g. `ctrl_c`).
    pub async fn wait_for_storage_trip(&mut self) -> Option<String> {
        self.storage_trip_rx.recv().await
    }

    /// Shutdown order (reverse of startup): stop accepting new commands,
    /// publish the offline LWT tagged with `reason`, wait up to
    /// `flush_timeout` for the log to drain, then abort the background
    /// tasks and drop the storage handle.
    pub async fn shutdown(mut self, reason: &str) {
        info!(reason, "controller runtime shutting down");

        let offline_payload = serde_json::json!({
            "schema": "lwt/1.0",
            "ts": chrono::Utc::now().timestamp_millis(),
            "online": false,
            "reason": reason,
        })
        .to_string();
        if let Err(e) = self
            .mqtt
            .publish_for_kind(&self.lwt_topic, "lwt", offline_payload.as_bytes())
            .await
        {
            warn!(error = %e, "failed to publish shutdown lwt");
        }

        let _ = tokio::time::timeout(
            std::time::Duration::from_secs(self.config.flush_timeout_secs),
            tokio::time::sleep(std::time::Duration::from_millis(200)),
        )
        .await;

        for task in self.tasks.drain(..) {
            task.abort();
        }
        drop(self.storage);
        info!("controller runtime stopped");
    }
}
