//! Message Log: every accepted inbound MQTT message is appended here,
//! batched onto the Storage Engine by a single writer task, and expired by
//! a periodic purge once it crosses the retention horizon.

use crate::failure::StorageFailureMonitor;
use domain::log_entry::MessageLogEntry;
use domain::storage::KvStore;
use domain::topic::{matches as topic_matches, Topic};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Filters for `MessageLog::query`; a `None` field is unconstrained.
#[derive(Debug, Clone, Default)]
pub struct LogFilters {
    /// MQTT wildcard pattern (`+`/`#`) matched against the full topic string.
    pub topic_pattern: Option<String>,
    /// MQTT wildcard pattern matched against the topic's device segment.
    pub device_pattern: Option<String>,
    /// Exact match against the topic's `kind` segment (e.g. `state`, `cmd`).
    pub message_kind: Option<String>,
    pub min_size: Option<usize>,
}

impl LogFilters {
    fn accepts(&self, entry: &MessageLogEntry) -> bool {
        if let Some(min_size) = self.min_size {
            if entry.payload.len() < min_size {
                return false;
            }
        }
        if let Some(pattern) = &self.topic_pattern {
            if !topic_matches(pattern, &entry.topic) {
                return false;
            }
        }
        if self.device_pattern.is_some() || self.message_kind.is_some() {
            let Ok(topic) = Topic::parse(&entry.topic) else { return false };
            if let Some(pattern) = &self.device_pattern {
                if !topic_matches(pattern, &topic.device) {
                    return false;
                }
            }
            if let Some(kind) = &self.message_kind {
                if &topic.kind != kind {
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Debug, Default)]
pub struct LogStats {
    pub dropped_fullbuffer: u64,
    pub dropped_oversize: u64,
}

pub struct MessageLog {
    store: Arc<dyn KvStore>,
    intake: mpsc::Sender<MessageLogEntry>,
    excluded_topics: Vec<String>,
    max_payload_bytes: usize,
    dropped_fullbuffer: AtomicU64,
    dropped_oversize: AtomicU64,
    failure_monitor: Arc<OnceLock<StorageFailureMonitor>>,
}

impl MessageLog {
    /// Spawns the batched writer task and returns a handle whose `append`
    /// method feeds it through a bounded channel sized `2 * batch_size`.
    /// The channel is drop-on-full rather than backpressuring: a broker
    /// read task calling `append` must never block behind a slow writer.
    pub fn spawn(
        store: Arc<dyn KvStore>,
        batch_size: usize,
        excluded_topics: Vec<String>,
        max_payload_bytes: usize,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<MessageLogEntry>(2 * batch_size.max(1));
        let writer_store = store.clone();
        let failure_monitor = Arc::new(OnceLock::new());
        let task_monitor = failure_monitor.clone();

        let handle = tokio::spawn(async move {
            let mut batch = Vec::with_capacity(batch_size);
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));

            loop {
                tokio::select! {
                    maybe_entry = rx.recv() => {
                        match maybe_entry {
                            Some(entry) => {
                                batch.push(entry);
                                if batch.len() >= batch_size {
                                    flush(&writer_store, &mut batch, &task_monitor);
                                }
                            }
                            None => {
                                flush(&writer_store, &mut batch, &task_monitor);
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if !batch.is_empty() {
                            flush(&writer_store, &mut batch, &task_monitor);
                        }
                    }
                }
            }
        });

        (
            Arc::new(MessageLog {
                store,
                intake: tx,
                excluded_topics,
                max_payload_bytes,
                dropped_fullbuffer: AtomicU64::new(0),
                dropped_oversize: AtomicU64::new(0),
                failure_monitor,
            }),
            handle,
        )
    }

    /// Registers the shared storage-failure budget; flush errors reported
    /// after this call trip it once the consecutive-failure count reaches
    /// its budget. A no-op if already set.
    pub fn set_failure_monitor(&self, monitor: StorageFailureMonitor) {
        let _ = self.failure_monitor.set(monitor);
    }

    /// Enqueues an entry for the writer task. Excluded topics and
    /// oversize payloads are dropped before the channel. The intake
    /// channel itself is drop-on-full, not backpressuring: the broker
    /// read path that calls `append` must never block on a slow writer
    /// task, so a full channel increments `dropped_fullbuffer` and moves
    /// on rather than awaiting capacity.
    pub async fn append(&self, entry: MessageLogEntry) {
        if self.excluded_topics.iter().any(|t| t == &entry.topic) {
            return;
        }
        if entry.payload.len() > self.max_payload_bytes {
            self.dropped_oversize.fetch_add(1, Ordering::Relaxed);
            warn!(topic = %entry.topic, size = entry.payload.len(), "dropping oversize message from log");
            return;
        }
        match self.intake.try_send(entry) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_fullbuffer.fetch_add(1, Ordering::Relaxed);
                warn!("message log intake channel full, dropping entry");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("message log writer task is gone, dropping entry");
            }
        }
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            dropped_fullbuffer: self.dropped_fullbuffer.load(Ordering::Relaxed),
            dropped_oversize: self.dropped_oversize.load(Ordering::Relaxed),
        }
    }

    /// Time-ordered range query over `[start_ms, end_ms)`, applying
    /// `filters` and stopping once `limit` matches are collected.
    pub fn query(
        &self,
        start_ms: i64,
        end_ms: i64,
        filters: &LogFilters,
        limit: usize,
    ) -> Result<Vec<MessageLogEntry>, domain::error::DomainError> {
        let start = MessageLogEntry::key(start_ms, "");
        let end = MessageLogEntry::key(end_ms, "");

        let mut matched = Vec::new();
        self.store.iterate_range(&start, &end, &mut |_key, value| {
            if let Ok(entry) = serde_json::from_slice::<MessageLogEntry>(value) {
                if filters.accepts(&entry) {
                    matched.push(entry);
                    if matched.len() >= limit {
                        return ControlFlow::Break(());
                    }
                }
            }
            ControlFlow::Continue(())
        })?;
        Ok(matched)
    }

    /// Deletes log entries older than `retention_days`, in bounded
    /// transactions of up to 1000 keys so a large backlog doesn't hold one
    /// giant transaction open.
    pub fn purge(&self, now_ts: i64, retention_days: u64) -> Result<usize, domain::error::DomainError> {
        let horizon = now_ts - (retention_days as i64) * 86_400_000;
        let start = "mqtt_log:".to_string();
        let end = MessageLogEntry::key(horizon, "");

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
            info!(count, "purged message log entries past retention horizon");
        }
        Ok(count)
    }
}

fn flush(store: &Arc<dyn KvStore>, batch: &mut Vec<MessageLogEntry>, monitor: &OnceLock<StorageFailureMonitor>) {
    if batch.is_empty() {
        return;
    }
    let result = store.transaction(&mut |tx| {
        for entry in batch.iter() {
            let key = MessageLogEntry::key(entry.ts, &entry.id);
            let value = serde_json::to_vec(entry)
                .map_err(|e| domain::error::DomainError::Storage(e.to_string()))?;
            tx.set(&key, &value)?;
        }
        Ok(())
    });
    match result {
        Ok(()) => {
            if let Some(m) = monitor.get() {
                m.reset();
            }
        }
        Err(e) => {
            error!(error = %e, "failed to flush message log batch");
            if let Some(m) = monitor.get() {
                m.note_failure("message_log");
            }
        }
    }
    batch.clear();
}
