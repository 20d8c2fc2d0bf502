use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

/// Bridge connection state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// One instrument found on the bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub bus_address: u8,
    /// Canonical `GPIB0::<address>::INSTR` name
    pub resource: String,
    pub identity: String,
}

/// What a front end shows about the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub port_name: String,
    pub connection_state: ConnectionState,
    pub bus_ready: bool,
    pub last_change: DateTime<Utc>,
}

impl BridgeStatus {
    pub fn new(port_name: String) -> Self {
        Self {
            port_name,
            connection_state: ConnectionState::Disconnected,
            bus_ready: false,
            last_change: Utc::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection_state, ConnectionState::Connected)
    }

    pub fn update_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
        self.last_change = Utc::now();
    }
}
