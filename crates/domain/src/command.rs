//! The outbound command state machine:
//! `pending -> acked -> succeeded | failed | timed_out | cancelled`.

use crate::device::DeviceId;
use crate::error::DomainError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Pending,
    Acked,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// What terminal signal a caller expects after `cmd/ack`: a further
/// `cmd/res`, or whether the ack itself is sufficient to call the command
/// done. Drives whether `on_ack` resets the timeout or closes the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expect {
    Ack,
    Result,
    None,
}

impl CommandState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Validates a transition per the state machine in the component
    /// contract; `Pending` can also terminate directly (e.g. `cmd/res`
    /// arriving without a prior `cmd/ack` — see DESIGN.md's Open Question
    /// decisions).
    pub fn can_transition_to(self, next: CommandState) -> bool {
        use CommandState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Pending, Acked) => true,
            (Pending, Succeeded | Failed | Cancelled | TimedOut) => true,
            (Acked, Succeeded | Failed | Cancelled | TimedOut) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub device: DeviceId,
    pub action: String,
    pub args: Value,
    pub state: CommandState,
    pub created_ts: i64,
    pub updated_ts: i64,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub timeout_ms: u64,
    pub expect: Expect,
}

impl Command {
    pub fn new(id: String, device: DeviceId, action: String, args: Value, now_ts: i64) -> Self {
        Self::with_expectation(id, device, action, args, 30_000, Expect::Result, now_ts)
    }

    pub fn with_expectation(
        id: String,
        device: DeviceId,
        action: String,
        args: Value,
        timeout_ms: u64,
        expect: Expect,
        now_ts: i64,
    ) -> Self {
        Command {
            id,
            device,
            action,
            args,
            state: CommandState::Pending,
            created_ts: now_ts,
            updated_ts: now_ts,
            result: None,
            error: None,
            timeout_ms,
            expect,
        }
    }

    pub fn transition(&mut self, next: CommandState, now_ts: i64) -> Result<(), DomainError> {
        if !self.state.can_transition_to(next) {
            return Err(DomainError::InvalidCommandTransition {
                from: format!("{:?}", self.state),
                to: format!("{:?}", next),
            });
        }
        self.state = next;
        self.updated_ts = now_ts;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd() -> Command {
        Command::new(
            "01J0000000000000000000".to_string(),
            DeviceId::new("a", "b", "c").unwrap(),
            "reboot".to_string(),
            Value::Null,
            0,
        )
    }

    #[test]
    fn pending_to_acked_to_succeeded_is_valid() {
        let mut c = cmd();
        c.transition(CommandState::Acked, 1).unwrap();
        c.transition(CommandState::Succeeded, 2).unwrap();
        assert_eq!(c.state, CommandState::Succeeded);
    }

    #[test]
    fn pending_can_terminate_without_ack() {
        let mut c = cmd();
        c.transition(CommandState::Succeeded, 1).unwrap();
        assert_eq!(c.state, CommandState::Succeeded);
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut c = cmd();
        c.transition(CommandState::Cancelled, 1).unwrap();
        assert!(c.transition(CommandState::Acked, 2).is_err());
    }
}
