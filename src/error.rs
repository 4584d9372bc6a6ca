//! Error types for the call client
//!
//! Every fallible operation in the library returns [`CallResult`]. Only the
//! binary wraps these in `anyhow` for top-level reporting.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Result type alias for call operations
pub type CallResult<T> = Result<T, CallError>;

/// Errors that can occur while setting up or running a call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    /// Microphone access refused or the capture device could not be opened.
    /// Fatal to the call, never retried.
    #[error("Microphone unavailable: {0}")]
    PermissionDenied(String),

    /// Credential or transport-open failure while connecting
    #[error("Call setup failed: {0}")]
    SetupFailed(String),

    /// Mid-call network fault
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected inbound message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The service asked for a tool this client does not implement
    #[error("Unknown tool: {0}")]
    ToolDispatchUnknown(String),

    /// Audio output device failure
    #[error("Audio output error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<tungstenite::Error> for CallError {
    fn from(err: tungstenite::Error) -> Self {
        CallError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        CallError::Protocol(err.to_string())
    }
}

impl From<base64::DecodeError> for CallError {
    fn from(err: base64::DecodeError) -> Self {
        CallError::Protocol(format!("invalid base64 payload: {}", err))
    }
}

impl From<reqwest::Error> for CallError {
    fn from(err: reqwest::Error) -> Self {
        CallError::SetupFailed(format!("credential request failed: {}", err))
    }
}

impl From<std::io::Error> for CallError {
    fn from(err: std::io::Error) -> Self {
        CallError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_error_maps_to_protocol() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(CallError::from(err), CallError::Protocol(_)));
    }
}
