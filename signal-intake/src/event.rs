//! Inbound Events and Classification
//!
//! The transport collaborator hands over one [`RawEvent`] per decrypted
//! envelope or sync record. A raw event is a JSON object with a `type` tag and
//! a `body` dictionary, framed as one event per line when serialized:
//!
//! ```json
//! {"type":"message","body":{"source":"+15550001","timestamp":1000,"message":{"body":"hi"}}}
//! ```
//!
//! [`classify`] turns a raw event into a typed [`IntakeEvent`] without side
//! effects. Recognized types are `message`, `sent`, `receipt`, `read`,
//! `contact`, `group` and `error`; anything else, or a body that does not
//! match the shape of its type, fails with
//! [`IntakeError::UnclassifiableEvent`].

use crate::{IntakeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Transport error name used for HTTP-level failures
pub const HTTP_ERROR: &str = "HTTPError";

/// HTTP error code the transport uses when it could not connect at all
pub const NO_CONNECTION_CODE: i64 = -1;

/// Error name for a message counter mismatch (duplicate delivery)
pub const MESSAGE_COUNTER_ERROR: &str = "MessageCounterError";

pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_SENT: &str = "sent";
pub const EVENT_RECEIPT: &str = "receipt";
pub const EVENT_READ: &str = "read";
pub const EVENT_CONTACT: &str = "contact";
pub const EVENT_GROUP: &str = "group";
pub const EVENT_ERROR: &str = "error";

/// Untyped event as produced by the transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEvent {
    /// Event type tag
    #[serde(rename = "type")]
    pub event_type: String,

    /// Type-specific fields
    #[serde(default)]
    pub body: Value,
}

impl RawEvent {
    pub fn new(event_type: impl Into<String>, body: Value) -> Self {
        Self {
            event_type: event_type.into(),
            body,
        }
    }

    /// Parse a single JSON line
    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Serialize to a single JSON line (without terminator)
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_type(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }
}

/// Attachment pointer inside a decoded data message
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPointer {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub file_name: Option<String>,
}

/// Group context carried by a data message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupContext {
    pub id: String,
}

/// Decoded data message payload
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentPointer>,
    /// Disappearing-message timer in seconds
    #[serde(default)]
    pub expire_timer: Option<u32>,
    #[serde(default)]
    pub group: Option<GroupContext>,
    #[serde(default)]
    pub flags: u32,
}

/// `message`: a data message from another account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncomingMessageEvent {
    pub source: String,
    pub timestamp: i64,
    pub message: DataMessage,
}

/// `sent`: a message this account sent from another of its devices
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SentMessageEvent {
    pub timestamp: i64,
    pub destination: String,
    pub message: DataMessage,
    #[serde(default)]
    pub expiration_start_timestamp: Option<i64>,
}

/// `receipt`: delivery receipt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceiptEvent {
    pub source: String,
    pub source_device: u32,
    pub timestamp: i64,
}

/// Message reference inside a read sync
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadMarker {
    pub timestamp: i64,
    pub sender: String,
}

/// `read`: read receipt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadReceiptEvent {
    /// Time the message was read
    pub timestamp: i64,
    pub read: ReadMarker,
}

/// `contact`: contact sync record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContactDetails {
    #[serde(default)]
    pub name: Option<String>,
    pub number: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

/// `group`: group sync record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupDetails {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub active: bool,
}

/// Error reported by the transport or decryption layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportFault {
    pub name: String,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
}

impl TransportFault {
    pub fn is_no_connection(&self) -> bool {
        self.name == HTTP_ERROR && self.code == Some(NO_CONNECTION_CODE)
    }

    pub fn is_counter_mismatch(&self) -> bool {
        self.name == MESSAGE_COUNTER_ERROR
    }
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl From<TransportFault> for IntakeError {
    fn from(fault: TransportFault) -> Self {
        IntakeError::Transport {
            name: fault.name,
            code: fault.code,
            message: fault.message,
        }
    }
}

/// Envelope metadata attached to an error event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeInfo {
    pub source: String,
    #[serde(default)]
    pub source_device: Option<u32>,
    pub timestamp: i64,
}

/// `error`: failure, optionally tied to an envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEvent {
    pub error: TransportFault,
    #[serde(default)]
    pub proto: Option<EnvelopeInfo>,
}

/// Event kind discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Sent,
    Receipt,
    Read,
    Contact,
    Group,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => EVENT_MESSAGE,
            EventKind::Sent => EVENT_SENT,
            EventKind::Receipt => EVENT_RECEIPT,
            EventKind::Read => EVENT_READ,
            EventKind::Contact => EVENT_CONTACT,
            EventKind::Group => EVENT_GROUP,
            EventKind::Error => EVENT_ERROR,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified event with its typed payload
#[derive(Debug, Clone, PartialEq)]
pub enum IntakeEvent {
    Message(IncomingMessageEvent),
    Sent(SentMessageEvent),
    Receipt(DeliveryReceiptEvent),
    Read(ReadReceiptEvent),
    Contact(ContactDetails),
    Group(GroupDetails),
    Error(ErrorEvent),
}

impl IntakeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            IntakeEvent::Message(_) => EventKind::Message,
            IntakeEvent::Sent(_) => EventKind::Sent,
            IntakeEvent::Receipt(_) => EventKind::Receipt,
            IntakeEvent::Read(_) => EventKind::Read,
            IntakeEvent::Contact(_) => EventKind::Contact,
            IntakeEvent::Group(_) => EventKind::Group,
            IntakeEvent::Error(_) => EventKind::Error,
        }
    }
}

/// Classify a raw event into its typed variant
pub fn classify(raw: &RawEvent) -> Result<IntakeEvent> {
    let event = match raw.event_type.as_str() {
        EVENT_MESSAGE => IntakeEvent::Message(payload(raw)?),
        EVENT_SENT => IntakeEvent::Sent(payload(raw)?),
        EVENT_RECEIPT => IntakeEvent::Receipt(payload(raw)?),
        EVENT_READ => IntakeEvent::Read(payload(raw)?),
        EVENT_CONTACT => IntakeEvent::Contact(payload(raw)?),
        EVENT_GROUP => IntakeEvent::Group(payload(raw)?),
        EVENT_ERROR => IntakeEvent::Error(payload(raw)?),
        other => {
            return Err(IntakeError::UnclassifiableEvent(format!(
                "unknown event type '{}'",
                other
            )))
        }
    };
    Ok(event)
}

fn payload<T: serde::de::DeserializeOwned>(raw: &RawEvent) -> Result<T> {
    serde_json::from_value(raw.body.clone()).map_err(|e| {
        IntakeError::UnclassifiableEvent(format!("malformed '{}' event: {}", raw.event_type, e))
    })
}
