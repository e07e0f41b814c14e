use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::serial::PortInfo;

/// Lifecycle state of the serial link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-delay, bounded reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            max_retries: 5,
        }
    }
}

/// Snapshot returned by the status query
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub port: Option<String>,
    pub session_id: Option<Uuid>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub dynamic_port_switching: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredPort {
    pub port: PortInfo,
    pub score: u8,
}

/// Result of a port rescan
#[derive(Debug, Clone, Serialize)]
pub struct PortScan {
    pub ports: Vec<ScoredPort>,
    pub best: Option<PortInfo>,
    pub current: Option<String>,
    pub switched: bool,
}
