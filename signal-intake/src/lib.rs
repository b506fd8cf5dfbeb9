//! Signal Message Intake
//!
//! Client-side intake dispatcher for a secure messaging client. It owns the
//! lifecycle of the receive connection, classifies inbound events and
//! reconciles them into per-conversation state, with defined retry and
//! reconnection behaviour.
//!
//! Transport, envelope decryption, storage and UI are collaborators reached
//! through the traits in [`connection::transport`] and [`storage`].

pub mod account;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod dispatch;
pub mod event;
pub mod message;
pub mod receipts;
pub mod recovery;
pub mod signals;
pub mod storage;
pub mod sync;

mod error;

pub use account::{AccountManager, Credentials, LocalAccount, Registration};
pub use config::{IntakeConfig, ServiceEndpoint};
pub use connection::{
    ConnectionState, ConnectionSupervisor, NetworkMonitor, OpenedConnection, ReceiveConnection,
    ReceiverFactory, ReplayFactory, WatchNetworkMonitor, NO_CONNECTION_STATUS,
};
pub use conversation::{Conversation, ConversationKind, ConversationReconciler};
pub use dispatch::{DispatchOutcome, IntakeDispatcher};
pub use error::{IntakeError, Result};
pub use event::{classify, EventKind, IntakeEvent, RawEvent};
pub use message::{
    DataMessageDecoder, Message, MessageDirection, MessageError, MessageMaterializer,
    PlainDataMessageDecoder,
};
pub use receipts::{DeliveryReceipt, ReadReceipt, ReceiptTracker};
pub use recovery::RetryPolicy;
pub use signals::{IntakeSignal, SignalBus};
pub use storage::{JsonSettingsStore, MemoryStore, RecordStore, SaveQueue, SettingsStore};
pub use sync::{SyncOrchestrator, SyncOutcome};

/// Device id of the primary (phone) device
pub const PRIMARY_DEVICE_ID: u32 = 1;

/// User agent of the legacy client that defaults to the iOS appearance
pub const LEGACY_USER_AGENT: &str = "OWI";

/// Current local time in milliseconds since the Unix epoch
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_device_id() {
        assert_eq!(PRIMARY_DEVICE_ID, 1);
        assert!(LocalAccount::parse("+1555").is_primary());
    }

    #[test]
    fn test_current_timestamp_is_millis() {
        // after 2020-01-01 in milliseconds
        assert!(current_timestamp() > 1_577_836_800_000);
    }
}
