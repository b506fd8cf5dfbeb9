//! Receive Connection Management
//!
//! - [`ConnectionSupervisor`]: lifecycle of the single receive connection
//! - [`transport`]: collaborator traits the connection is opened through
//! - [`replay`]: JSON-lines transport used for offline replays and tests

pub mod events;
pub mod replay;
pub mod supervisor;
pub mod transport;

pub use events::ConnectionState;
pub use replay::ReplayFactory;
pub use supervisor::ConnectionSupervisor;
pub use transport::{
    NetworkMonitor, OpenedConnection, ReceiveConnection, ReceiverFactory, WatchNetworkMonitor,
    NO_CONNECTION_STATUS,
};
