//! # Error Types
//!
//! Error handling for every layer of the messaging stack.
//!
//! This module defines all error variants that can occur, from low-level framing
//! violations up to RPC failures that are carried back to a caller as values.
//!
//! ## Error Categories
//! - **Protocol violations**: bad frame tag, invalid frame size, missing or forged sender.
//!   Fatal to the connection, never retried.
//! - **Handshake errors**: rejected logins and broken conversations
//! - **RPC failures**: no implementor, ambiguous topology, lost transport, failed implementor
//! - **Integration errors**: capability mismatches and unknown implementors (programmer errors)
//!
//! RPC failures travel across the wire inside result messages as [`RemoteError`],
//! which holds only the variants a peer can act on. [`ProtocolError::to_wire`]
//! converts on the way out and `From<RemoteError>` restores the local variant on
//! the way in.
//!
//! ## Example Usage
//! ```rust
//! use nodewire::error::{ProtocolError, Result};
//! use tracing::error;
//!
//! fn lookup(name: &str) -> Result<u32> {
//!     Err(ProtocolError::RemoteNotFound(name.to_string()))
//! }
//!
//! if let Err(e) = lookup("chat") {
//!     error!(error = %e, "Call failed");
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_TRANSPORT_LOST: &str = "Connection to the hub was lost";
    pub const ERR_NODE_LEFT: &str = "Target node left before replying";

    /// Handshake errors
    pub const ERR_HANDSHAKE_TERMINATED: &str = "Login conversation terminated";
    pub const ERR_NAME_EMPTY: &str = "Name cannot be empty";
    pub const ERR_NAME_CONTROL_CHARS: &str = "Name contains control characters";

    /// Dispatch errors
    pub const ERR_IMPLEMENTOR_PANICKED: &str = "Implementor panicked during dispatch";
    pub const ERR_POOL_SHUT_DOWN: &str = "Worker pool has been shut down";
    pub const ERR_REPLY_DROPPED: &str = "Reply channel dropped before a result arrived";
}

// ProtocolError is the primary error type for all operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid frame header tag: {0:#010x}")]
    InvalidMagic(u32),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Envelope has no sender")]
    MissingSender,

    #[error("Expected sender {expected}, got {actual}")]
    UnexpectedSender { expected: String, actual: String },

    #[error("Unexpected message type")]
    UnexpectedMessage,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Login rejected: {0}")]
    HandshakeRejected(String),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("No implementor found for endpoint {0}")]
    RemoteNotFound(String),

    #[error("Endpoint {endpoint} must have exactly one implementor, found {implementors}")]
    InconsistentTopology { endpoint: String, implementors: usize },

    #[error("Transport lost: {0}")]
    TransportLost(String),

    #[error("Invocation failed: {0}")]
    InvocationFailed(String),

    #[error("Endpoint {endpoint} has no operation {operation}")]
    UnknownOperation { endpoint: String, operation: String },

    #[error("Operation {operation} expects {expected:?}, got {actual:?}")]
    ArgumentMismatch {
        operation: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Capability mismatch on endpoint {endpoint}: {reason}")]
    CapabilityMismatch { endpoint: String, reason: String },

    #[error("Implementor not registered on endpoint {0}")]
    UnknownImplementor(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(u64),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Shut down")]
    Shutdown,

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// True for errors that mean the peer broke the wire protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidMagic(_)
                | ProtocolError::InvalidFrameSize(_)
                | ProtocolError::OversizedFrame(_)
                | ProtocolError::MissingSender
                | ProtocolError::UnexpectedSender { .. }
                | ProtocolError::UnexpectedMessage
        )
    }

    /// Convert into the failure carried by a result message.
    ///
    /// RPC failures keep their variant. Everything else is local to this node and
    /// is flattened into `InvocationFailed` with its display text.
    pub fn to_wire(self) -> RemoteError {
        match self {
            ProtocolError::RemoteNotFound(endpoint) => RemoteError::RemoteNotFound(endpoint),
            ProtocolError::InconsistentTopology {
                endpoint,
                implementors,
            } => RemoteError::InconsistentTopology {
                endpoint,
                implementors,
            },
            ProtocolError::TransportLost(reason) => RemoteError::TransportLost(reason),
            ProtocolError::InvocationFailed(reason) => RemoteError::InvocationFailed(reason),
            ProtocolError::UnknownOperation {
                endpoint,
                operation,
            } => RemoteError::UnknownOperation {
                endpoint,
                operation,
            },
            ProtocolError::ArgumentMismatch {
                operation,
                expected,
                actual,
            } => RemoteError::ArgumentMismatch {
                operation,
                expected,
                actual,
            },
            ProtocolError::Timeout => RemoteError::Timeout,
            ProtocolError::Custom(message) => RemoteError::Custom(message),
            other => RemoteError::InvocationFailed(other.to_string()),
        }
    }
}

/// Failure of a remote call as it travels inside a result message
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    #[error("No implementor found for endpoint {0}")]
    RemoteNotFound(String),

    #[error("Endpoint {endpoint} must have exactly one implementor, found {implementors}")]
    InconsistentTopology { endpoint: String, implementors: usize },

    #[error("Transport lost: {0}")]
    TransportLost(String),

    #[error("Invocation failed: {0}")]
    InvocationFailed(String),

    #[error("Endpoint {endpoint} has no operation {operation}")]
    UnknownOperation { endpoint: String, operation: String },

    #[error("Operation {operation} expects {expected:?}, got {actual:?}")]
    ArgumentMismatch {
        operation: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Timeout occurred")]
    Timeout,

    #[error("Custom error: {0}")]
    Custom(String),
}

impl From<RemoteError> for ProtocolError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::RemoteNotFound(endpoint) => ProtocolError::RemoteNotFound(endpoint),
            RemoteError::InconsistentTopology {
                endpoint,
                implementors,
            } => ProtocolError::InconsistentTopology {
                endpoint,
                implementors,
            },
            RemoteError::TransportLost(reason) => ProtocolError::TransportLost(reason),
            RemoteError::InvocationFailed(reason) => ProtocolError::InvocationFailed(reason),
            RemoteError::UnknownOperation {
                endpoint,
                operation,
            } => ProtocolError::UnknownOperation {
                endpoint,
                operation,
            },
            RemoteError::ArgumentMismatch {
                operation,
                expected,
                actual,
            } => ProtocolError::ArgumentMismatch {
                operation,
                expected,
                actual,
            },
            RemoteError::Timeout => ProtocolError::Timeout,
            RemoteError::Custom(message) => ProtocolError::Custom(message),
        }
    }
}

// Foreign errors are rebuilt from their kind and text so results can be handed
// to every listener of a message.
impl Clone for ProtocolError {
    fn clone(&self) -> Self {
        match self {
            ProtocolError::Io(e) => ProtocolError::Io(io::Error::new(e.kind(), e.to_string())),
            ProtocolError::Serialization(e) => {
                ProtocolError::Serialization(Box::new(bincode::ErrorKind::Custom(e.to_string())))
            }
            ProtocolError::InvalidMagic(h) => ProtocolError::InvalidMagic(*h),
            ProtocolError::InvalidFrameSize(s) => ProtocolError::InvalidFrameSize(*s),
            ProtocolError::OversizedFrame(s) => ProtocolError::OversizedFrame(*s),
            ProtocolError::MissingSender => ProtocolError::MissingSender,
            ProtocolError::UnexpectedSender { expected, actual } => {
                ProtocolError::UnexpectedSender {
                    expected: expected.clone(),
                    actual: actual.clone(),
                }
            }
            ProtocolError::UnexpectedMessage => ProtocolError::UnexpectedMessage,
            ProtocolError::ConnectionClosed => ProtocolError::ConnectionClosed,
            ProtocolError::HandshakeRejected(m) => ProtocolError::HandshakeRejected(m.clone()),
            ProtocolError::HandshakeError(m) => ProtocolError::HandshakeError(m.clone()),
            ProtocolError::RemoteNotFound(e) => ProtocolError::RemoteNotFound(e.clone()),
            ProtocolError::InconsistentTopology {
                endpoint,
                implementors,
            } => ProtocolError::InconsistentTopology {
                endpoint: endpoint.clone(),
                implementors: *implementors,
            },
            ProtocolError::TransportLost(m) => ProtocolError::TransportLost(m.clone()),
            ProtocolError::InvocationFailed(m) => ProtocolError::InvocationFailed(m.clone()),
            ProtocolError::UnknownOperation {
                endpoint,
                operation,
            } => ProtocolError::UnknownOperation {
                endpoint: endpoint.clone(),
                operation: operation.clone(),
            },
            ProtocolError::ArgumentMismatch {
                operation,
                expected,
                actual,
            } => ProtocolError::ArgumentMismatch {
                operation: operation.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            },
            ProtocolError::CapabilityMismatch { endpoint, reason } => {
                ProtocolError::CapabilityMismatch {
                    endpoint: endpoint.clone(),
                    reason: reason.clone(),
                }
            }
            ProtocolError::UnknownImplementor(e) => ProtocolError::UnknownImplementor(e.clone()),
            ProtocolError::UnknownNode(n) => ProtocolError::UnknownNode(n.clone()),
            ProtocolError::UnknownChannel(c) => ProtocolError::UnknownChannel(*c),
            ProtocolError::Timeout => ProtocolError::Timeout,
            ProtocolError::ConfigError(m) => ProtocolError::ConfigError(m.clone()),
            ProtocolError::Shutdown => ProtocolError::Shutdown,
            ProtocolError::Custom(m) => ProtocolError::Custom(m.clone()),
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
