//! Outbound Signals
//!
//! Observers (UI, notification layer, the daemon) learn about state changes
//! through a [`SignalBus`]. Delivery is fire-and-forget: each emit reaches every
//! subscriber that exists at the time of the call at most once, and emitting
//! with no subscribers is not an error.

use crate::connection::ConnectionState;
use tokio::sync::broadcast;
use tracing::trace;

/// Signal emitted by the intake core
#[derive(Debug, Clone, PartialEq)]
pub enum IntakeSignal {
    /// A message was reconciled into a conversation
    NewMessage {
        /// Conversation the message belongs to
        conversation_id: String,
        /// Message ID
        message_id: String,
    },

    /// Incoming unread message that should raise a local notification
    NotifyUser {
        conversation_id: String,
        message_id: String,
    },

    /// Contact sync attempt finished (success or timeout)
    ContactSyncComplete {
        /// Whether the primary device answered before the timeout
        synced: bool,
    },

    /// Connection supervisor changed state
    ConnectionState(ConnectionState),
}

/// Broadcast fan-out for [`IntakeSignal`]s
#[derive(Debug, Clone)]
pub struct SignalBus {
    sender: broadcast::Sender<IntakeSignal>,
}

impl SignalBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IntakeSignal> {
        self.sender.subscribe()
    }

    pub fn emit(&self, signal: IntakeSignal) {
        trace!("Emitting {:?}", signal);
        // No receivers is fine
        let _ = self.sender.send(signal);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SIGNAL_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber_once() {
        let bus = SignalBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(IntakeSignal::ContactSyncComplete { synced: true });

        assert_eq!(
            first.recv().await.unwrap(),
            IntakeSignal::ContactSyncComplete { synced: true }
        );
        assert_eq!(
            second.recv().await.unwrap(),
            IntakeSignal::ContactSyncComplete { synced: true }
        );
        assert!(first.try_recv().is_err());
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = SignalBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(IntakeSignal::ConnectionState(ConnectionState::Stopped));
    }
}
