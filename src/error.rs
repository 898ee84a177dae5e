//! Error types for the relay.

use std::time::Duration;

use crate::jobs::JobState;
use crate::message::Opcode;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Installation-descriptor errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read descriptor file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse config option \"{line}\"")]
    Parse { line: String },

    #[error("Configuration option not found: \"{name}\"")]
    OptionNotFound { name: String },
}

/// Errors decoding or encoding a call message.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("IO error on channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message field {field} is {size} bytes, limit is {limit}")]
    TooLarge {
        field: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("Invalid UTF-8 in message field {field}")]
    InvalidUtf8 { field: &'static str },

    #[error("Truncated message: missing {0}")]
    Truncated(&'static str),

    #[error("Malformed init payload: {0}")]
    MalformedInit(String),
}

/// Distributed-transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No endpoint registered under \"{name}\"")]
    NotFound { name: String },

    #[error("Send endpoint is not connected to a peer")]
    NotConnected,

    #[error("Endpoint closed")]
    Closed,

    #[error("Timed out connecting to \"{peer}\" after {timeout:?}")]
    ConnectTimeout { peer: String, timeout: Duration },

    #[error("Timed out waiting for handshake after {timeout:?}")]
    HandshakeTimeout { timeout: Duration },

    #[error("Malformed transport message: {0}")]
    Malformed(String),
}

/// Job submission and lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Failed to spawn worker executable {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Job submission failed: {0}")]
    Submit(String),

    #[error("Failed to cancel job: {0}")]
    Cancel(String),
}

/// Connection-fatal conditions of the worker connection protocol.
///
/// Every kind drives the connection to its terminal state. An error reported
/// by the worker inside a reply is deliberately absent here: it is logged and
/// forwarded to the caller unchanged.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("First call on a worker connection must be init, got {opcode:?}")]
    ProtocolViolation { opcode: Opcode },

    #[error("Worker not started within {} seconds, current job state: {state}", timeout.as_secs())]
    DeploymentTimeout { timeout: Duration, state: JobState },

    #[error("Worker handshake failed: {reason}")]
    HandshakeFailure { reason: String },

    #[error("Lost remote worker proxy: {reason}")]
    TransportLost { reason: String },

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
