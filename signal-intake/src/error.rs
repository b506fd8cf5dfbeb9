//! Error handling for the message intake core
//!
//! Every fallible operation in this crate returns [`Result`], an alias over
//! [`IntakeError`]. Errors from underlying libraries convert automatically
//! through `thiserror`'s `#[from]`.
//!
//! ## Error Categories
//!
//! ### Transient connectivity
//! The receive connection could not reach the server. These are recovered
//! automatically by the connection supervisor (timed retry while online,
//! edge-triggered retry once the device comes back online).
//!
//! ### Per-message failures
//! A decryption or decoding failure that arrived together with an envelope.
//! The message shell is still materialized and the failure is attached to it
//! as a [`MessageError`](crate::message::MessageError); it is never surfaced
//! as an `IntakeError` to the caller.
//!
//! ### Fatal
//! An error event with neither a recognized kind nor an envelope. It signals a
//! bug or an unmodeled protocol condition and is propagated to the top-level
//! fault receiver instead of being recovered here.
//!
//! ```rust
//! use signal_intake::IntakeError;
//!
//! let error = IntakeError::Unhandled("SignalError: bad mac".to_string());
//! assert!(error.is_fatal());
//! assert!(!error.is_recoverable());
//! ```

use thiserror::Error;

/// Result type for intake operations
pub type Result<T> = std::result::Result<T, IntakeError>;

/// Errors that can occur while receiving and reconciling events
#[derive(Error, Debug)]
pub enum IntakeError {
    /// I/O error (settings file, replay input)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Raw event carries none of the recognized shapes
    #[error("Unclassifiable event: {0}")]
    UnclassifiableEvent(String),

    /// Decoded payload could not be applied to a message
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Error reported by the transport collaborator
    #[error("Transport error {name} (code {code:?}): {message}")]
    Transport {
        /// Error kind as named by the transport
        name: String,
        /// Optional numeric code
        code: Option<i64>,
        /// Human-readable message
        message: String,
    },

    /// Error event with no recognized kind and no envelope
    #[error("Unhandled error: {0}")]
    Unhandled(String),

    /// Registration has not been completed on this device
    #[error("Registration not complete")]
    NotRegistered,

    /// A credential is missing from persistent settings
    #[error("Missing credential: {0}")]
    MissingCredential(String),

    /// Storage collaborator failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Operation cancelled (shutdown, superseded)
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl IntakeError {
    /// Check if this error is a transient condition that is retried automatically
    pub fn is_recoverable(&self) -> bool {
        match self {
            IntakeError::Transport { .. } => self.is_no_connection(),
            IntakeError::Timeout(_) | IntakeError::Io(_) => true,
            _ => false,
        }
    }

    /// Check if this error must halt the affected subsystem
    pub fn is_fatal(&self) -> bool {
        matches!(self, IntakeError::Unhandled(_))
    }

    /// Check if this is the transport's "failed to connect" sentinel
    pub fn is_no_connection(&self) -> bool {
        matches!(
            self,
            IntakeError::Transport { name, code: Some(code), .. }
                if name == crate::event::HTTP_ERROR && *code == crate::event::NO_CONNECTION_CODE
        )
    }

    /// Get a user-facing description
    pub fn user_message(&self) -> String {
        match self {
            IntakeError::NotRegistered => {
                "This device is not registered yet. Finish setup first.".to_string()
            }
            IntakeError::MissingCredential(key) => {
                format!("Stored account data is incomplete ({}). Re-link this device.", key)
            }
            IntakeError::Transport { .. } if self.is_no_connection() => {
                "Cannot reach the server. Retrying automatically.".to_string()
            }
            IntakeError::Transport { message, .. } => {
                format!("Connection problem: {}.", message)
            }
            IntakeError::Timeout(msg) => {
                format!("Timed out: {}. Check network connection.", msg)
            }
            IntakeError::Storage(msg) => {
                format!("Could not save data: {}.", msg)
            }
            IntakeError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            IntakeError::UnclassifiableEvent(msg) | IntakeError::InvalidPayload(msg) => {
                format!("Invalid data received: {}.", msg)
            }
            IntakeError::Unhandled(msg) => {
                format!("Unexpected error: {}.", msg)
            }
            IntakeError::Cancelled(msg) => {
                format!("Operation cancelled: {}.", msg)
            }
            IntakeError::InvalidState(msg) => {
                format!("Invalid state: {}.", msg)
            }
            IntakeError::Io(e) => {
                format!("I/O error: {}.", e)
            }
            IntakeError::Json(e) => {
                format!("Data format error: {}.", e)
            }
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        IntakeError::InvalidState(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        IntakeError::Storage(msg.into())
    }
}
