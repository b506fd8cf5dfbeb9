//! Event Dispatch
//!
//! Typed dispatch table for classified events. Each variant is routed to
//! exactly one consumer:
//!
//! | Event     | Consumer                                         |
//! |-----------|--------------------------------------------------|
//! | `message` | materializer, then reconciler                    |
//! | `sent`    | materializer, then reconciler                    |
//! | `receipt` | receipt tracker (delivery log)                   |
//! | `read`    | receipt tracker (read log)                       |
//! | `contact` | reconciler                                       |
//! | `group`   | reconciler                                       |
//! | `error`   | handled here, see [`IntakeDispatcher::on_error`] |

use crate::conversation::ConversationReconciler;
use crate::event::{classify, ErrorEvent, IntakeEvent, RawEvent};
use crate::message::{DataMessageDecoder, MessageError, MessageMaterializer};
use crate::receipts::ReceiptTracker;
use crate::{IntakeError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of dispatching one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Routed to its consumer
    Handled,
    /// Intentionally ignored (duplicate delivery, unclassifiable input)
    Dropped,
    /// The transport could not connect; the supervisor decides what happens next
    ConnectionLost,
}

/// Routes classified events to their consumers
pub struct IntakeDispatcher {
    materializer: MessageMaterializer,
    reconciler: Arc<ConversationReconciler>,
    receipts: Arc<ReceiptTracker>,
}

impl IntakeDispatcher {
    pub fn new(
        local_number: impl Into<String>,
        reconciler: Arc<ConversationReconciler>,
        receipts: Arc<ReceiptTracker>,
    ) -> Self {
        Self {
            materializer: MessageMaterializer::new(local_number),
            reconciler,
            receipts,
        }
    }

    pub fn with_decoder(
        local_number: impl Into<String>,
        decoder: Box<dyn DataMessageDecoder>,
        reconciler: Arc<ConversationReconciler>,
        receipts: Arc<ReceiptTracker>,
    ) -> Self {
        Self {
            materializer: MessageMaterializer::with_decoder(local_number, decoder),
            reconciler,
            receipts,
        }
    }

    /// Classify and dispatch a raw event; unclassifiable input is skipped
    pub async fn dispatch_raw(&self, raw: &RawEvent) -> Result<DispatchOutcome> {
        match classify(raw) {
            Ok(event) => self.dispatch(event).await,
            Err(e @ IntakeError::UnclassifiableEvent(_)) => {
                warn!("Skipping event: {}", e);
                Ok(DispatchOutcome::Dropped)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn dispatch(&self, event: IntakeEvent) -> Result<DispatchOutcome> {
        debug!("Dispatching {} event", event.kind());

        match event {
            IntakeEvent::Message(data) => {
                let mut message = self.materializer.incoming(&data.source, data.timestamp);
                self.materializer.apply_data_message(&mut message, &data.message);
                self.reconciler.on_message(message).await?;
            }
            IntakeEvent::Sent(data) => {
                let mut message = self.materializer.sent(
                    &data.destination,
                    data.timestamp,
                    data.expiration_start_timestamp,
                );
                self.materializer.apply_data_message(&mut message, &data.message);
                self.reconciler.on_message(message).await?;
            }
            IntakeEvent::Receipt(receipt) => {
                self.receipts
                    .record_delivery(&receipt.source, receipt.source_device, receipt.timestamp)
                    .await;
            }
            IntakeEvent::Read(read) => {
                self.receipts
                    .record_read(&read.read.sender, read.read.timestamp, read.timestamp)
                    .await;
            }
            IntakeEvent::Contact(details) => {
                self.reconciler.on_contact(&details).await?;
            }
            IntakeEvent::Group(details) => {
                self.reconciler.on_group(&details).await?;
            }
            IntakeEvent::Error(error) => return self.on_error(error).await,
        }

        Ok(DispatchOutcome::Handled)
    }

    /// Error events
    ///
    /// - "failed to connect": [`DispatchOutcome::ConnectionLost`]
    /// - counter mismatch with an envelope: dropped silently
    /// - any other error with an envelope: recorded against a materialized message
    /// - anything else: [`IntakeError::Unhandled`], which is fatal
    pub async fn on_error(&self, event: ErrorEvent) -> Result<DispatchOutcome> {
        let fault = event.error;

        if fault.is_no_connection() {
            debug!("Transport could not connect: {}", fault);
            return Ok(DispatchOutcome::ConnectionLost);
        }

        match event.proto {
            Some(_) if fault.is_counter_mismatch() => {
                debug!("Ignoring duplicate delivery: {}", fault);
                Ok(DispatchOutcome::Dropped)
            }
            Some(envelope) => {
                let message = self.materializer.incoming(&envelope.source, envelope.timestamp);
                self.reconciler
                    .on_error(message, MessageError::from(&fault))
                    .await?;
                Ok(DispatchOutcome::Handled)
            }
            None => Err(IntakeError::Unhandled(fault.to_string())),
        }
    }
}
