//! Control messages exchanged with the speech service

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session configuration sent once per connection
#[derive(Debug, Clone, PartialEq)]
pub struct SetupConfig {
    pub model: String,
    pub voice: String,
    pub system_instruction: Option<String>,
    pub tools: Vec<FunctionDeclaration>,
    pub activity_detection: ActivityDetection,
    /// Ask the service to transcribe the caller and itself
    pub transcribe: bool,
}

/// Server-side voice activity detection tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityDetection {
    pub disabled: bool,
    pub start_sensitivity: String,
    pub end_sensitivity: String,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for ActivityDetection {
    fn default() -> Self {
        Self {
            disabled: false,
            start_sensitivity: "START_SENSITIVITY_HIGH".to_string(),
            end_sensitivity: "END_SENSITIVITY_HIGH".to_string(),
            prefix_padding_ms: 20,
            silence_duration_ms: 500,
        }
    }
}

/// A tool the service may call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Correlated reply to a [`FunctionCall`]
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    /// Echo of the call's id, verbatim
    pub id: Option<String>,
    pub name: String,
    pub response: Value,
}

/// Messages sent from the caller to the service
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Setup(SetupConfig),
    /// One batch of caller audio
    RealtimeAudio { mime_type: String, data: String },
    /// A complete text turn
    ClientTurn { text: String },
    ToolResponse(Vec<ToolResponse>),
}

impl ClientMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Setup(_) => "setup",
            ClientMessage::RealtimeAudio { .. } => "realtime_audio",
            ClientMessage::ClientTurn { .. } => "client_turn",
            ClientMessage::ToolResponse(_) => "tool_response",
        }
    }
}

/// A tool invocation requested by the service
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    /// Provider-issued correlation id
    pub id: Option<String>,
    pub name: String,
    pub args: Value,
}

/// Who said a transcribed phrase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Caller,
    Assistant,
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Speaker::Caller => write!(f, "you"),
            Speaker::Assistant => write!(f, "assistant"),
        }
    }
}

/// Messages received from the service or the proxy
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    SetupComplete,
    /// Decoded PCM16 speech
    AudioOutput(Vec<u8>),
    ModelText(String),
    Transcript { speaker: Speaker, text: String },
    TurnComplete,
    /// The caller started speaking; discard all pending output
    Interrupted,
    ToolCall(Vec<FunctionCall>),
    ToolCallCancellation(Vec<String>),
    GoAway { time_left: Option<String> },
    Error { code: Option<i64>, message: String },
    /// Proxied topology only
    ProxyConnected,
    SessionStarted,
    SessionEnded { reason: Option<String> },
}

impl ServerMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::SetupComplete => "setup_complete",
            ServerMessage::AudioOutput(_) => "audio_output",
            ServerMessage::ModelText(_) => "model_text",
            ServerMessage::Transcript { .. } => "transcript",
            ServerMessage::TurnComplete => "turn_complete",
            ServerMessage::Interrupted => "interrupted",
            ServerMessage::ToolCall(_) => "tool_call",
            ServerMessage::ToolCallCancellation(_) => "tool_call_cancellation",
            ServerMessage::GoAway { .. } => "go_away",
            ServerMessage::Error { .. } => "error",
            ServerMessage::ProxyConnected => "proxy_connected",
            ServerMessage::SessionStarted => "session_started",
            ServerMessage::SessionEnded { .. } => "session_ended",
        }
    }
}
