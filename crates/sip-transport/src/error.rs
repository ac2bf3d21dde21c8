//! Error types for the SIP transport layer
//!
//! The RFC 5626 flow signals (`FlowFailed`, `FlowTampered`) and the path MTU
//! signal carry no heap data, so raising them costs nothing beyond the enum
//! discriminant. Callers inside the transport layer convert them into
//! synthesized responses or a transport switch; they never reach the
//! application as raw errors.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type for transport layer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the transport layer
#[derive(Debug, Error)]
pub enum Error {
    /// No connection matches the flow token of an outbound-extension request (RFC 5626)
    #[error("Flow failed")]
    FlowFailed,

    /// The flow token of an outbound-extension request was tampered with
    #[error("Forbidden flow")]
    FlowTampered,

    /// Request is too large for the path MTU of an unreliable transport
    #[error("Message of {size} bytes exceeds path MTU limit of {limit} bytes")]
    PathMtuExceeded { size: usize, limit: usize },

    /// Local validation of a message failed
    #[error("Bad request ({status}): {reason}")]
    BadRequest { status: u16, reason: String },

    /// No connection is available for sending a message
    #[error("No connection: {0}")]
    NoConnection(String),

    /// A connection to a hop could not be established
    #[error("Could not connect to {hop}: {reason}")]
    ConnectionFailed { hop: String, reason: String },

    /// Port outside the connectable range
    #[error("Port out of range: {0}")]
    InvalidPort(u32),

    /// A listening point lookup failed
    #[error("Listening point not found: {0}")]
    ListeningPointNotFound(String),

    /// The connection factory cannot serve this transport
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// The connection is closed
    #[error("Transport closed")]
    TransportClosed,

    /// Sending bytes to a destination failed
    #[error("Failed to send to {destination}: {source}")]
    SendFailed {
        destination: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Binding a listening socket failed
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A message could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// No backup sender could be obtained
    #[error("Backup sender unavailable: {0}")]
    BackupUnavailable(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a bad request error
    pub fn bad_request(status: u16, reason: impl Into<String>) -> Self {
        Self::BadRequest {
            status,
            reason: reason.into(),
        }
    }

    /// Create a connection failure for a hop
    pub fn connection_failed(hop: impl ToString, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            hop: hop.to_string(),
            reason: reason.into(),
        }
    }

    /// The SIP status code a peer should see for this error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::FlowFailed => Some(430),
            Error::FlowTampered => Some(403),
            Error::BadRequest { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether this error is one of the RFC 5626 flow signals
    pub fn is_flow_error(&self) -> bool {
        matches!(self, Error::FlowFailed | Error::FlowTampered)
    }
}
