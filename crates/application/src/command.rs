//! Command Tracker (C8): issues commands, correlates inbound `cmd/ack` and
//! `cmd/res` by id, and drives each outstanding command's timeout.

use dashmap::DashMap;
use domain::command::{Command, CommandState, Expect};
use domain::device::DeviceId;
use domain::error::DomainError;
use domain::storage::KvStore;
use infrastructure::StorageFailureMonitor;
use serde_json::Value;
use std::ops::ControlFlow;
use std::sync::{Arc, OnceLock};
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

/// `cmd:{id}` per spec.md §6's persisted-state key layout.
fn storage_key(id: &str) -> String {
    format!("cmd:{id}")
}

#[derive(Clone)]
pub struct CommandStats {
    pub pending: usize,
    pub acked: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

struct Tracked {
    command: Command,
    /// Dropping this cancels the per-command timeout task (ack/res/cancel
    /// all complete the command before its timer fires).
    _cancel_timeout: Option<oneshot::Sender<()>>,
}

/// One entry per outstanding or recently-completed command, keyed by id.
/// `DashMap`'s per-shard locking gives each command effectively its own
/// lock, matching the "per-id lock or owning task" requirement directly.
pub struct CommandTracker {
    commands: DashMap<String, Tracked>,
    default_timeout_ms: u64,
    max_timeout_ms: u64,
    store: Option<Arc<dyn KvStore>>,
    failure_monitor: OnceLock<StorageFailureMonitor>,
}

impl CommandTracker {
    pub fn new(default_timeout_secs: u64) -> Arc<Self> {
        Self::with_bounds(default_timeout_secs * 1000, 10 * 60 * 1000)
    }

    pub fn with_bounds(default_timeout_ms: u64, max_timeout_ms: u64) -> Arc<Self> {
        Arc::new(CommandTracker {
            commands: DashMap::new(),
            default_timeout_ms,
            max_timeout_ms,
            store: None,
            failure_monitor: OnceLock::new(),
        })
    }

    /// Same as `with_bounds`, but persists every issued/updated command
    /// under `cmd:{id}` so `load_outstanding` can recover it across a
    /// restart.
    pub fn with_bounds_and_store(default_timeout_ms: u64, max_timeout_ms: u64, store: Arc<dyn KvStore>) -> Arc<Self> {
        Arc::new(CommandTracker {
            commands: DashMap::new(),
            default_timeout_ms,
            max_timeout_ms,
            store: Some(store),
            failure_monitor: OnceLock::new(),
        })
    }

    /// Registers the shared storage-failure budget; a no-op if already set.
    pub fn set_failure_monitor(&self, monitor: StorageFailureMonitor) {
        let _ = self.failure_monitor.set(monitor);
    }

    /// Scans the `cmd:` keyspace for commands left `pending`/`acked` by a
    /// prior run, for the caller to feed into `recover` at startup.
    pub fn load_outstanding(store: &dyn KvStore) -> Result<Vec<Command>, DomainError> {
        let mut found = Vec::new();
        store.iterate_range("cmd:", "cmd;", &mut |_key, value| {
            if let Ok(command) = serde_json::from_slice::<Command>(value) {
                if matches!(command.state, CommandState::Pending | CommandState::Acked) {
                    found.push(command);
                }
            }
            ControlFlow::Continue(())
        })?;
        Ok(found)
    }

    fn persist(&self, command: &Command) {
        if let Some(store) = &self.store {
            match serde_json::to_vec(command) {
                Ok(bytes) => match store.set(&storage_key(&command.id), &bytes) {
                    Ok(()) => {
                        if let Some(m) = self.failure_monitor.get() {
                            m.reset();
                        }
                    }
                    Err(e) => {
                        warn!(command_id = %command.id, error = %e, "failed to persist command");
                        if let Some(m) = self.failure_monitor.get() {
                            m.note_failure("command");
                        }
                    }
                },
                Err(e) => warn!(command_id = %command.id, error = %e, "failed to serialize command"),
            }
        }
    }

    /// Issues a new command with a time-ordered id and `expect == Result`,
    /// using the tracker's configured default timeout.
    pub fn issue(self: &Arc<Self>, device: DeviceId, action: String, args: Value, now_ts: i64) -> Command {
        self.issue_with(device, action, args, None, Expect::Result, now_ts)
    }

    /// Issues a new command honoring a caller-supplied `timeout_ms`
    /// (clamped to `max_timeout_ms`) and `expect`, spawning its timeout
    /// timer. Callers publish the resulting `Command`'s `id`/`action`/`args`
    /// as the `cmd/req` payload themselves; the tracker only owns state.
    pub fn issue_with(
        self: &Arc<Self>,
        device: DeviceId,
        action: String,
        args: Value,
        timeout_ms: Option<u64>,
        expect: Expect,
        now_ts: i64,
    ) -> Command {
        let id = Uuid::now_v7().to_string();
        let timeout_ms = timeout_ms.unwrap_or(self.default_timeout_ms).min(self.max_timeout_ms);
        let command = Command::with_expectation(id.clone(), device, action, args, timeout_ms, expect, now_ts);

        let cancel_tx = self.spawn_timeout(id.clone(), timeout_ms);
        self.persist(&command);
        self.commands.insert(
            id,
            Tracked {
                command: command.clone(),
                _cancel_timeout: Some(cancel_tx),
            },
        );
        command
    }

    fn spawn_timeout(self: &Arc<Self>, id: String, timeout_ms: u64) -> oneshot::Sender<()> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)) => {
                    tracker.time_out(&id);
                }
                _ = cancel_rx => {}
            }
        });
        cancel_tx
    }

    /// Restart recovery: re-inserts a command loaded from durable storage
    /// without re-issuing it on the wire. Its timer is re-armed from
    /// `issued_at + timeout_ms - now`; if that has already elapsed it
    /// transitions to `timed_out` synchronously rather than waiting on a
    /// zero-or-negative sleep.
    pub fn recover(self: &Arc<Self>, command: Command, now_ts: i64) {
        if matches!(command.state, CommandState::Pending | CommandState::Acked) {
            let remaining_ms = command.created_ts + command.timeout_ms as i64 - now_ts;
            if remaining_ms <= 0 {
                let mut command = command;
                let _ = command.transition(CommandState::TimedOut, now_ts);
                warn!(command_id = %command.id, "command already past deadline at startup, marking timed_out");
                self.commands.insert(
                    command.id.clone(),
                    Tracked {
                        command,
                        _cancel_timeout: None,
                    },
                );
                return;
            }
            let cancel_tx = self.spawn_timeout(command.id.clone(), remaining_ms as u64);
            self.commands.insert(
                command.id.clone(),
                Tracked {
                    command,
                    _cancel_timeout: Some(cancel_tx),
                },
            );
        } else {
            self.commands.insert(
                command.id.clone(),
                Tracked {
                    command,
                    _cancel_timeout: None,
                },
            );
        }
    }

    fn update(&self, id: &str, next: CommandState, now_ts: i64, result: Option<Value>, error: Option<String>) -> Result<(), DomainError> {
        let mut entry = self
            .commands
            .get_mut(id)
            .ok_or_else(|| DomainError::Storage(format!("unknown command {id}")))?;
        entry.command.transition(next, now_ts)?;
        entry.command.result = result;
        entry.command.error = error;
        if next.is_terminal_state() {
            entry._cancel_timeout.take();
        }
        self.persist(&entry.command);
        Ok(())
    }

    /// `cmd/ack` transitions `pending -> acked` and, per the expected
    /// follow-up, either resets the timeout to the full `timeout_ms`
    /// (`expect == Result`, a `cmd/res` is still coming) or closes the
    /// command immediately as `succeeded` (ack is itself the terminal
    /// signal).
    pub fn on_ack(self: &Arc<Self>, id: &str, now_ts: i64) -> Result<(), DomainError> {
        let expect = {
            let entry = self
                .commands
                .get(id)
                .ok_or_else(|| DomainError::Storage(format!("unknown command {id}")))?;
            entry.command.expect
        };

        if expect == Expect::Result {
            self.update(id, CommandState::Acked, now_ts, None, None)?;
            let timeout_ms = self.commands.get(id).map(|e| e.command.timeout_ms).unwrap_or(self.default_timeout_ms);
            let cancel_tx = self.spawn_timeout(id.to_string(), timeout_ms);
            if let Some(mut entry) = self.commands.get_mut(id) {
                entry._cancel_timeout = Some(cancel_tx);
            }
            Ok(())
        } else {
            self.update(id, CommandState::Succeeded, now_ts, None, None)
        }
    }

    pub fn on_result(&self, id: &str, succeeded: bool, result: Option<Value>, error: Option<String>, now_ts: i64) -> Result<(), DomainError> {
        let next = if succeeded {
            CommandState::Succeeded
        } else {
            CommandState::Failed
        };
        self.update(id, next, now_ts, result, error)
    }

    pub fn cancel(&self, id: &str, now_ts: i64) -> Result<(), DomainError> {
        self.update(id, CommandState::Cancelled, now_ts, None, Some("cancelled".to_string()))
    }

    fn time_out(&self, id: &str) {
        if let Some(mut entry) = self.commands.get_mut(id) {
            if matches!(entry.command.state, CommandState::Pending | CommandState::Acked) {
                warn!(command_id = %id, "command timed out");
                let now_ts = chrono::Utc::now().timestamp_millis();
                let _ = entry.command.transition(CommandState::TimedOut, now_ts);
                entry._cancel_timeout.take();
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Command> {
        self.commands.get(id).map(|e| e.command.clone())
    }

    pub fn list(&self) -> Vec<Command> {
        self.commands.iter().map(|e| e.command.clone()).collect()
    }

    pub fn stats(&self) -> CommandStats {
        let mut stats = CommandStats {
            pending: 0,
            acked: 0,
            succeeded: 0,
            failed: 0,
            timed_out: 0,
            cancelled: 0,
        };
        for entry in self.commands.iter() {
            match entry.command.state {
                CommandState::Pending => stats.pending += 1,
                CommandState::Acked => stats.acked += 1,
                CommandState::Succeeded => stats.succeeded += 1,
                CommandState::Failed => stats.failed += 1,
                CommandState::TimedOut => stats.timed_out += 1,
                CommandState::Cancelled => stats.cancelled += 1,
            }
        }
        info!(pending = stats.pending, acked = stats.acked, "command tracker stats snapshot");
        stats
    }
}

trait IsTerminal {
    fn is_terminal_state(self) -> bool;
}

impl IsTerminal for CommandState {
    fn is_terminal_state(self) -> bool {
        matches!(
            self,
            CommandState::Succeeded | CommandState::Failed | CommandState::TimedOut | CommandState::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev() -> DeviceId {
        DeviceId::new("a", "b", "c").unwrap()
    }

    #[tokio::test]
    async fn issue_then_ack_then_succeed() {
        let tracker = CommandTracker::new(30);
        let cmd = tracker.issue(dev(), "reboot".to_string(), Value::Null, 0);
        tracker.on_ack(&cmd.id, 1).unwrap();
        tracker.on_result(&cmd.id, true, Some(Value::Bool(true)), None, 2).unwrap();

        let got = tracker.get(&cmd.id).unwrap();
        assert_eq!(got.state, CommandState::Succeeded);
    }

    #[tokio::test]
    async fn res_without_prior_ack_still_terminates() {
        let tracker = CommandTracker::new(30);
        let cmd = tracker.issue(dev(), "reboot".to_string(), Value::Null, 0);
        tracker.on_result(&cmd.id, false, None, Some("boom".to_string()), 1).unwrap();
        assert_eq!(tracker.get(&cmd.id).unwrap().state, CommandState::Failed);
    }

    #[tokio::test]
    async fn cancel_marks_cancelled() {
        let tracker = CommandTracker::new(30);
        let cmd = tracker.issue(dev(), "reboot".to_string(), Value::Null, 0);
        tracker.cancel(&cmd.id, 1).unwrap();
        assert_eq!(tracker.get(&cmd.id).unwrap().state, CommandState::Cancelled);
    }

    #[tokio::test]
    async fn timeout_fires_for_commands_left_pending() {
        let tracker = CommandTracker::new(0);
        let cmd = tracker.issue(dev(), "reboot".to_string(), Value::Null, 0);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(tracker.get(&cmd.id).unwrap().state, CommandState::TimedOut);
    }

    #[tokio::test]
    async fn stats_counts_each_state() {
        let tracker = CommandTracker::new(30);
        let a = tracker.issue(dev(), "x".to_string(), Value::Null, 0);
        tracker.on_result(&a.id, true, None, None, 1).unwrap();
        let _b = tracker.issue(dev(), "y".to_string(), Value::Null, 0);

        let stats = tracker.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn ack_only_expectation_closes_on_ack_without_result() {
        let tracker = CommandTracker::new(30);
        let cmd = tracker.issue_with(dev(), "ping".to_string(), Value::Null, None, Expect::Ack, 0);
        tracker.on_ack(&cmd.id, 1).unwrap();
        assert_eq!(tracker.get(&cmd.id).unwrap().state, CommandState::Succeeded);
    }

    #[tokio::test]
    async fn caller_timeout_override_is_clamped_to_max() {
        let tracker = CommandTracker::with_bounds(30_000, 100);
        let cmd = tracker.issue_with(dev(), "reboot".to_string(), Value::Null, Some(60_000), Expect::Result, 0);
        assert_eq!(cmd.timeout_ms, 100);
    }

    #[test]
    fn recover_marks_past_deadline_commands_timed_out_immediately() {
        let tracker = CommandTracker::new(30);
        let stale = Command::with_expectation(
            "stale-1".to_string(),
            dev(),
            "reboot".to_string(),
            Value::Null,
            1_000,
            Expect::Result,
            0,
        );
        tracker.recover(stale, 5_000);
        assert_eq!(tracker.get("stale-1").unwrap().state, CommandState::TimedOut);
    }

    #[test]
    fn commands_persist_to_and_load_from_storage() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(infrastructure::storage::SledStore::open(dir.path().to_str().unwrap()).unwrap());

        let tracker = CommandTracker::with_bounds_and_store(30_000, 600_000, store.clone());
        let cmd = tracker.issue(dev(), "reboot".to_string(), Value::Null, 0);

        let outstanding = CommandTracker::load_outstanding(store.as_ref()).unwrap();
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].id, cmd.id);
    }

    #[tokio::test]
    async fn recover_leaves_commands_with_time_remaining_pending() {
        let fresh = Command::with_expectation(
            "fresh-1".to_string(),
            dev(),
            "reboot".to_string(),
            Value::Null,
            60_000,
            Expect::Result,
            0,
        );
        let tracker = CommandTracker::new(30);
        tracker.recover(fresh, 5_000);

        let recovered = tracker.get("fresh-1").unwrap();
        assert_eq!(
            recovered.state,
            CommandState::Pending,
            "a command issued before a broker outage whose deadline hasn't elapsed yet must stay pending across recovery"
        );
    }

    #[test]
    fn restart_round_trip_only_recovers_outstanding_commands() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(infrastructure::storage::SledStore::open(dir.path().to_str().unwrap()).unwrap());

        let before_restart = CommandTracker::with_bounds_and_store(60_000, 600_000, store.clone());
        let outstanding_cmd = before_restart.issue(dev(), "reboot".to_string(), Value::Null, 0);
        let finished_cmd = before_restart.issue(dev(), "ping".to_string(), Value::Null, 0);
        before_restart.on_result(&finished_cmd.id, true, None, None, 1).unwrap();

        let loaded = CommandTracker::load_outstanding(store.as_ref()).unwrap();
        assert_eq!(loaded.len(), 1, "only pending/acked commands are recovered, not terminal ones");
        assert_eq!(loaded[0].id, outstanding_cmd.id);

        let after_restart = CommandTracker::with_bounds_and_store(60_000, 600_000, store.clone());
        for command in loaded {
            after_restart.recover(command, 1_000);
        }
        assert_eq!(after_restart.get(&outstanding_cmd.id).unwrap().state, CommandState::Pending);
        assert!(after_restart.get(&finished_cmd.id).is_none());
    }
}
