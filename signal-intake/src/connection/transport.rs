//! Transport Collaborator Interfaces
//!
//! The authenticated, decrypting receive connection is provided from outside
//! the core. A [`ReceiverFactory`] opens one per `start`; the supervisor reads
//! raw events from the returned channel and keeps the [`ReceiveConnection`]
//! handle for status queries and closing.

use crate::account::Credentials;
use crate::config::ServiceEndpoint;
use crate::event::RawEvent;
use crate::{IntakeError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Status reported when there is no receive connection at all
pub const NO_CONNECTION_STATUS: i32 = -1;

/// Ready-state codes reported by connections
pub mod status {
    pub const CONNECTING: i32 = 0;
    pub const OPEN: i32 = 1;
    pub const CLOSING: i32 = 2;
    pub const CLOSED: i32 = 3;
}

/// Control handle for an open receive connection
#[async_trait]
pub trait ReceiveConnection: Send + Sync {
    /// Numeric ready-state (see [`status`])
    fn status(&self) -> i32;

    /// Close the connection; the event channel ends afterwards
    async fn close(&self);

    /// Ask the primary device to send its contacts and groups
    ///
    /// Resolves once the primary device has answered.
    async fn request_sync(&self) -> Result<()> {
        Err(IntakeError::invalid_state(
            "connection does not support sync requests",
        ))
    }
}

/// A freshly opened connection
pub struct OpenedConnection {
    pub events: mpsc::Receiver<RawEvent>,
    pub control: Arc<dyn ReceiveConnection>,
}

/// Opens receive connections
#[async_trait]
pub trait ReceiverFactory: Send + Sync {
    async fn open(&self, endpoint: &ServiceEndpoint, credentials: &Credentials) -> Result<OpenedConnection>;
}

/// Reports whether the device is online
pub trait NetworkMonitor: Send + Sync {
    /// Watch the online flag
    fn subscribe(&self) -> watch::Receiver<bool>;

    fn is_online(&self) -> bool {
        *self.subscribe().borrow()
    }
}

/// [`NetworkMonitor`] driven by an explicit setter
#[derive(Debug)]
pub struct WatchNetworkMonitor {
    tx: watch::Sender<bool>,
}

impl WatchNetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    /// Update the online flag; observers wake only on change
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }
}

impl NetworkMonitor for WatchNetworkMonitor {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }
}
