//! # Error Types
//!
//! Error handling for the socket engine.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! [`ProtocolError`]. Variants are grouped into the categories reported by
//! [`ProtocolError::category`]:
//!
//! - **Configuration**: invalid endpoint/task settings, raised at construction
//! - **Transient**: I/O failures, timeouts, resets, queue backpressure
//! - **Protocol**: ACK mismatch, bad size indicator, malformed envelopes
//! - **Security**: TLS handshake and AEAD failures
//! - **Cancellation**: cooperative shutdown, never reported as a failure
//!
//! Engine loops catch everything except configuration errors at the cycle
//! boundary, so a single misbehaving peer never aborts a listener.
//!
//! ## Example Usage
//! ```rust
//! use socket_engine::error::{ErrorCategory, ProtocolError};
//!
//! let err = ProtocolError::AckMismatch { retries: 40 };
//! assert_eq!(err.category(), ErrorCategory::Protocol);
//! assert!(!err.is_cancellation());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_TIMEOUT: &str = "Operation timed out";
    pub const ERR_NOT_CONNECTED: &str = "No connection context attached";

    /// Cryptographic errors
    pub const ERR_ENCRYPTION_FAILED: &str = "Encryption failed";
    pub const ERR_DECRYPTION_FAILED: &str = "Decryption failed";
    pub const ERR_PASSPHRASE_REQUIRED: &str =
        "A passphrase of at least 36 characters is required for symmetric security modes";

    /// Envelope errors
    pub const ERR_ENVELOPE_TRUNCATED: &str = "Envelope shorter than its fixed header";
    pub const ERR_ENVELOPE_TYPE_OVERRUN: &str = "Envelope type length exceeds envelope size";
    pub const ERR_ENVELOPE_TYPE_UTF8: &str = "Envelope type is not valid UTF-8";
    pub const ERR_ENVELOPE_TYPE_TOO_LONG: &str = "Envelope type longer than 255 bytes";

    /// Lifecycle errors
    pub const ERR_ALREADY_CLOSED: &str = "Engine already closed";
    pub const ERR_TRANSPORT_MISMATCH: &str =
        "Communication type does not match the attached transport";
    pub const ERR_TASK_RUNNING: &str = "Task already running";
    pub const ERR_BOX_COUNT: &str = "Too few message boxes for the configured cardinality";
    pub const ERR_BUFFER_TOO_SMALL: &str = "Buffer length below the transport minimum";
}

/// Coarse classification of a [`ProtocolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid settings, fatal to the caller
    Configuration,
    /// I/O trouble that a loop can log, count and move past
    Transient,
    /// The peer violated the wire protocol
    Protocol,
    /// TLS or AEAD failure
    Security,
    /// Cooperative shutdown
    Cancellation,
}

// ProtocolError is the primary error type for all engine operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("ACK mismatch after {retries} retries")]
    AckMismatch { retries: u32 },

    #[error("Invalid size indicator after {retries} retries")]
    InvalidSizeIndicator { retries: u32 },

    #[error("Incomplete transmission: expected {expected} bytes, received {received}")]
    IncompleteTransmission { expected: usize, received: usize },

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(&'static str),

    #[error("Unknown message box: {0}")]
    UnknownMessageBox(u16),

    #[error("Message box {0} is full")]
    QueueFull(u16),

    #[error("No message available in box {0}")]
    NoMessage(u16),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Invalid engine state: {0}")]
    InvalidState(&'static str),

    #[error("Admission gate timed out")]
    AdmissionTimeout,

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("TLS error: {0}")]
    TlsError(String),
}

impl ProtocolError {
    /// Map this error onto the engine's error taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProtocolError::ConfigError(_) => ErrorCategory::Configuration,
            ProtocolError::Io(_)
            | ProtocolError::Timeout
            | ProtocolError::ConnectionClosed
            | ProtocolError::IncompleteTransmission { .. }
            | ProtocolError::QueueFull(_)
            | ProtocolError::NoMessage(_)
            | ProtocolError::AdmissionTimeout
            | ProtocolError::ProxyError(_) => ErrorCategory::Transient,
            ProtocolError::AckMismatch { .. }
            | ProtocolError::InvalidSizeIndicator { .. }
            | ProtocolError::InvalidEnvelope(_)
            | ProtocolError::UnknownMessageBox(_)
            | ProtocolError::OversizedPacket(_)
            | ProtocolError::InvalidState(_) => ErrorCategory::Protocol,
            ProtocolError::DecryptionFailure
            | ProtocolError::EncryptionFailure
            | ProtocolError::TlsError(_) => ErrorCategory::Security,
            ProtocolError::Cancelled => ErrorCategory::Cancellation,
        }
    }

    /// Whether this error is a clean cooperative unwind
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ProtocolError::Cancelled)
    }

    /// Fold an `io::Error` into the closest variant.
    ///
    /// Peer hang-ups become [`ProtocolError::ConnectionClosed`], everything else
    /// stays [`ProtocolError::Io`].
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ProtocolError::ConnectionClosed,
            io::ErrorKind::TimedOut => ProtocolError::Timeout,
            _ => ProtocolError::Io(err),
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
