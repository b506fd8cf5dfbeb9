//! Connection Supervisor States and Commands

use crate::IntakeError;
use std::fmt;

/// Supervisor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No receive connection
    Stopped,
    /// Opening a receive connection
    Starting,
    /// Receive connection open and dispatching
    Connected,
    /// Waiting for a retry timer or an online signal
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Stopped => "stopped",
            ConnectionState::Starting => "starting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Commands handled by the supervisor control loop
///
/// Connection tasks carry the generation they were started with so that
/// reports from a superseded connection are ignored.
#[derive(Debug)]
pub(crate) enum SupervisorCommand {
    /// Start again (retry timer fired or device came online)
    Restart { generation: u64 },
    /// The connection dispatched its first non-error event
    Healthy { generation: u64 },
    /// The connection reported "failed to connect"
    ConnectFailed { generation: u64 },
    /// The event stream ended
    StreamClosed { generation: u64 },
    /// Unmodeled error; the connection stops dispatching
    Fatal { generation: u64, error: IntakeError },
}
