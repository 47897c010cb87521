//! Error types for the debugger
//!
//! Errors fall into two groups: those that corrupt session state (transport
//! loss, protocol desync, initial sync timeout) and close the session, and
//! caller mistakes that are rejected without side effects.

use std::io;
use thiserror::Error;

use crate::proto::CodecError;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the debugger
#[derive(Error, Debug)]
pub enum Error {
    // === Transport Errors ===
    #[error("Failed to connect to target at {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to target at {addr} after {secs} seconds")]
    ConnectTimeout { addr: String, secs: u64 },

    #[error("Sending to target timed out after {0} ms")]
    SendTimeout(u64),

    #[error("Target closed the connection")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // === Protocol Errors ===
    #[error("Debug protocol error: {0}")]
    Protocol(CodecError),

    #[error("Message of {size} bytes exceeds the maximum of {max} bytes, not sent")]
    MessageTooLarge { size: usize, max: usize },

    // === Session Errors ===
    #[error("Target did not send its initial thread list within {0} ms")]
    InitializationTimeout(u64),

    #[error("Script buffer '{0}' is not running on any known thread")]
    UnknownScriptBuffer(String),

    #[error("Cannot {action} while session is {state}")]
    InvalidState { action: String, state: String },

    #[error("Debug session is closed")]
    SessionClosed,

    // === Input Errors ===
    #[error("Invalid breakpoint location: {0}")]
    InvalidLocation(String),

    // === Configuration Errors ===
    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        match e {
            // Outbound size violations are a caller problem, not a desync
            CodecError::MessageTooLarge { size, max } => Self::MessageTooLarge { size, max },
            other => Self::Protocol(other),
        }
    }
}

impl Error {
    /// Create an invalid state error
    pub fn invalid_state(action: &str, state: &str) -> Self {
        Self::InvalidState {
            action: action.to_string(),
            state: state.to_string(),
        }
    }

    /// Create an unknown script buffer error
    pub fn unknown_script_buffer(name: &str) -> Self {
        Self::UnknownScriptBuffer(name.to_string())
    }

    /// Whether this error leaves the connection unusable.
    ///
    /// Fatal errors move the session to `Closed`. Everything else is rejected
    /// synchronously and the session stays usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed { .. }
                | Self::ConnectTimeout { .. }
                | Self::SendTimeout(_)
                | Self::ConnectionClosed
                | Self::Io(_)
                | Self::Protocol(_)
                | Self::InitializationTimeout(_)
        )
    }
}
