//! Error types for the RPC session layer.

use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::protocol::exception::RemoteException;
use crate::protocol::message::RequestId;
use crate::transport::TransportError;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-related errors.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Protocol-level errors.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Codec errors during serialization/deserialization.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The peer's handler failed.
    #[error("Remote error: {0}")]
    Remote(RemoteException),

    /// No response arrived within the wait budget.
    #[error("Call {id} timed out after {timeout:?}")]
    Timeout {
        /// Id of the call that timed out.
        id: RequestId,
        /// The budget that was exhausted.
        timeout: Duration,
    },

    /// The call was dropped because its session moved to a fresh connection.
    #[error("Call {0} was abandoned")]
    Abandoned(RequestId),
}

/// Connection-specific errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to establish connection.
    #[error("Failed to connect to {address}: {source}")]
    ConnectFailed {
        /// The address we tried to connect to.
        address: Url,
        /// The underlying error.
        #[source]
        source: TransportError,
    },

    /// The transport failed while the connection was running.
    #[error("Transport failure: {0}")]
    Transport(#[source] TransportError),

    /// Operation requires a different lifecycle state.
    #[error("Connection is {actual}, expected {expected}")]
    InvalidState {
        /// State the operation needs.
        expected: &'static str,
        /// State the connection is in.
        actual: &'static str,
    },

    /// The session has no bound connection.
    #[error("Session is not connected")]
    NotConnected,

    /// The outbound queue is gone.
    #[error("Connection closed")]
    Closed,
}

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message has neither `method` nor `result`/`error`.
    #[error("Message has neither method nor result/error")]
    UnknownShape,

    /// A required key is missing or has the wrong type.
    #[error("Invalid field `{field}`: {reason}")]
    InvalidField {
        /// Key name.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// A second response arrived for an id that was already resolved.
    #[error("Duplicate response for request {0}")]
    DuplicateResponse(RequestId),

    /// Frame too large.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Codec-related errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),

    /// Exception envelope names a type outside the known set.
    #[error("Unknown exception type: {0}")]
    UnknownExceptionType(String),

    /// Exception envelope could not be reconstructed.
    #[error("Malformed exception envelope: {0}")]
    MalformedException(String),
}

impl From<ciborium::de::Error<std::io::Error>> for CodecError {
    fn from(err: ciborium::de::Error<std::io::Error>) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for CodecError {
    fn from(err: ciborium::ser::Error<std::io::Error>) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}
