//! Connection state for the Broker Client's own link to the MQTT broker
//! (distinct from a device's reported `connection_status`).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn can_connect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }

    pub fn to_connecting(&self) -> Result<Self, &'static str> {
        match self {
            Self::Disconnected | Self::Failed => Ok(Self::Connecting),
            _ => Err("can only connect from Disconnected or Failed state"),
        }
    }

    pub fn to_connected(&self) -> Result<Self, &'static str> {
        match self {
            Self::Connecting | Self::Reconnecting => Ok(Self::Connected),
            _ => Err("can only complete connection from Connecting or Reconnecting state"),
        }
    }

    pub fn to_disconnected(&self) -> Self {
        Self::Disconnected
    }

    pub fn to_reconnecting(&self) -> Result<Self, &'static str> {
        match self {
            Self::Connected | Self::Disconnected => Ok(Self::Reconnecting),
            _ => Err("can only reconnect from Connected or Disconnected state"),
        }
    }

    pub fn to_failed(&self) -> Self {
        Self::Failed
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_disconnected() {
        let state = ConnectionState::default();
        assert_eq!(state, ConnectionState::Disconnected);
        assert!(state.can_connect());
    }

    #[test]
    fn transitions_through_connect_cycle() {
        let state = ConnectionState::Disconnected;
        let state = state.to_connecting().unwrap();
        let state = state.to_connected().unwrap();
        assert!(state.is_connected());
    }

    #[test]
    fn cannot_connect_from_connected() {
        assert!(ConnectionState::Connected.to_connecting().is_err());
    }
}
