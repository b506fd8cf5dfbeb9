//! Message Materializer
//!
//! Builds in-memory [`Message`] records for incoming and locally-originated
//! ("sent") messages, then applies the decoded data payload through a
//! [`DataMessageDecoder`]. Decoder failures never block record creation: the
//! message keeps its shell and the failure is attached to its error list.

use crate::event::{AttachmentPointer, DataMessage, TransportFault};
use crate::{current_timestamp, IntakeError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Direction of a message relative to this account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Incoming,
    Outgoing,
}

/// Failure recorded against a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageError {
    pub name: String,
    pub message: String,
}

impl MessageError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<&TransportFault> for MessageError {
    fn from(fault: &TransportFault) -> Self {
        Self::new(fault.name.clone(), fault.message.clone())
    }
}

impl From<&IntakeError> for MessageError {
    fn from(error: &IntakeError) -> Self {
        let name = match error {
            IntakeError::InvalidPayload(_) => "InvalidPayload",
            IntakeError::Transport { .. } => "TransportError",
            _ => "IntakeError",
        };
        Self::new(name, error.to_string())
    }
}

/// Attachment stored on a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub file_name: Option<String>,
}

/// In-memory message record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Locally generated identifier
    pub id: String,
    /// Sender identifier
    pub source: String,
    /// Origin clock timestamp (ms)
    pub sent_at: i64,
    /// Local clock timestamp (ms)
    pub received_at: i64,
    /// Owning conversation
    pub conversation_id: String,
    pub direction: MessageDirection,
    pub sent: bool,
    /// 1 while unread, 0 otherwise
    pub unread: u8,
    pub expiration_start_timestamp: Option<i64>,
    /// Disappearing-message timer in seconds
    pub expire_timer: Option<u32>,
    pub body: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Set when the data message carried a group context
    pub group_id: Option<String>,
    pub errors: Vec<MessageError>,
}

impl Message {
    pub fn is_incoming(&self) -> bool {
        self.direction == MessageDirection::Incoming
    }

    pub fn is_unread(&self) -> bool {
        self.unread > 0
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Attach a failure to this message
    pub fn attach_error(&mut self, error: MessageError) {
        self.errors.push(error);
    }

    /// Short preview used as a conversation's last message
    pub fn preview(&self) -> Option<String> {
        if let Some(body) = self.body.as_ref().filter(|b| !b.is_empty()) {
            return Some(body.clone());
        }
        if !self.attachments.is_empty() {
            return Some(format!("{} attachment(s)", self.attachments.len()));
        }
        self.errors.first().map(|e| e.name.clone())
    }
}

/// Applies a decoded data message to a message record
///
/// Implemented by the decoding collaborator. The default
/// [`PlainDataMessageDecoder`] copies fields verbatim.
pub trait DataMessageDecoder: Send + Sync {
    fn apply(&self, message: &mut Message, data: &DataMessage) -> Result<()>;
}

/// Copies body, attachments, expire timer and group linkage
#[derive(Debug, Default, Clone)]
pub struct PlainDataMessageDecoder;

impl DataMessageDecoder for PlainDataMessageDecoder {
    fn apply(&self, message: &mut Message, data: &DataMessage) -> Result<()> {
        let attachments = data
            .attachments
            .iter()
            .map(attachment_from_pointer)
            .collect::<Result<Vec<_>>>()?;

        message.body = data.body.clone();
        message.attachments = attachments;
        message.expire_timer = data.expire_timer;

        if let Some(group) = &data.group {
            message.group_id = Some(group.id.clone());
            message.conversation_id = group.id.clone();
        }

        Ok(())
    }
}

fn attachment_from_pointer(pointer: &AttachmentPointer) -> Result<Attachment> {
    if pointer.id.is_empty() {
        return Err(IntakeError::InvalidPayload(
            "attachment pointer without id".to_string(),
        ));
    }
    Ok(Attachment {
        id: pointer.id.clone(),
        content_type: pointer.content_type.clone(),
        size: pointer.size,
        file_name: pointer.file_name.clone(),
    })
}

/// Builds message records for the current account
pub struct MessageMaterializer {
    /// Local account number, used as the source of sent messages
    local_number: String,
    decoder: Box<dyn DataMessageDecoder>,
}

impl MessageMaterializer {
    pub fn new(local_number: impl Into<String>) -> Self {
        Self::with_decoder(local_number, Box::new(PlainDataMessageDecoder))
    }

    pub fn with_decoder(local_number: impl Into<String>, decoder: Box<dyn DataMessageDecoder>) -> Self {
        Self {
            local_number: local_number.into(),
            decoder,
        }
    }

    pub fn local_number(&self) -> &str {
        &self.local_number
    }

    /// Build an unread incoming message from `source`
    pub fn incoming(&self, source: &str, timestamp: i64) -> Message {
        Message {
            id: Uuid::new_v4().to_string(),
            source: source.to_string(),
            sent_at: timestamp,
            received_at: current_timestamp(),
            conversation_id: source.to_string(),
            direction: MessageDirection::Incoming,
            sent: false,
            unread: 1,
            expiration_start_timestamp: None,
            expire_timer: None,
            body: None,
            attachments: Vec::new(),
            group_id: None,
            errors: Vec::new(),
        }
    }

    /// Build an outgoing message this account sent from another device
    pub fn sent(&self, destination: &str, sent_timestamp: i64, expiration_start: Option<i64>) -> Message {
        Message {
            id: Uuid::new_v4().to_string(),
            source: self.local_number.clone(),
            sent_at: sent_timestamp,
            received_at: current_timestamp(),
            conversation_id: destination.to_string(),
            direction: MessageDirection::Outgoing,
            sent: true,
            unread: 0,
            expiration_start_timestamp: expiration_start,
            expire_timer: None,
            body: None,
            attachments: Vec::new(),
            group_id: None,
            errors: Vec::new(),
        }
    }

    /// Apply the decoded payload; a decoder failure is attached, not returned
    pub fn apply_data_message(&self, message: &mut Message, data: &DataMessage) {
        match self.decoder.apply(message, data) {
            Ok(()) => {
                debug!("Applied data message to {}", message.id);
            }
            Err(e) => {
                warn!("Failed to apply data message to {}: {}", message.id, e);
                message.attach_error(MessageError::from(&e));
            }
        }
    }
}
