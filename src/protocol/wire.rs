//! JSON framing of control messages
//!
//! Outbound messages are single JSON objects keyed by their kind
//! (`setup`, `realtimeInput`, `clientContent`, `toolResponse`). Inbound frames
//! may carry several messages at once; they are returned in the order they
//! must be handled. The proxy adds its own `{"type": ...}` lifecycle frames.

use crate::audio::codec::decode_base64;
use crate::error::{CallError, CallResult};
use crate::protocol::messages::{
    ClientMessage, FunctionCall, ServerMessage, SetupConfig, Speaker, ToolResponse,
};
use log::warn;
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Serialize an outbound message
pub fn encode(message: &ClientMessage) -> CallResult<String> {
    let value = match message {
        ClientMessage::Setup(setup) => json!({ "setup": setup_value(setup) }),
        ClientMessage::RealtimeAudio { mime_type, data } => json!({
            "realtimeInput": {
                "mediaChunks": [{ "mimeType": mime_type, "data": data }]
            }
        }),
        ClientMessage::ClientTurn { text } => json!({
            "clientContent": {
                "turns": [{ "role": "user", "parts": [{ "text": text }] }],
                "turnComplete": true
            }
        }),
        ClientMessage::ToolResponse(responses) => json!({
            "toolResponse": {
                "functionResponses": responses.iter().map(response_value).collect::<Vec<_>>()
            }
        }),
    };
    Ok(serde_json::to_string(&value)?)
}

fn setup_value(setup: &SetupConfig) -> Value {
    let mut body = Map::new();
    body.insert("model".into(), json!(setup.model));
    body.insert(
        "generationConfig".into(),
        json!({
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": setup.voice } }
            }
        }),
    );
    if let Some(instruction) = &setup.system_instruction {
        body.insert(
            "systemInstruction".into(),
            json!({ "parts": [{ "text": instruction }] }),
        );
    }
    if !setup.tools.is_empty() {
        body.insert(
            "tools".into(),
            json!([{ "functionDeclarations": setup.tools }]),
        );
    }

    let vad = &setup.activity_detection;
    body.insert(
        "realtimeInputConfig".into(),
        json!({
            "automaticActivityDetection": {
                "disabled": vad.disabled,
                "startOfSpeechSensitivity": vad.start_sensitivity,
                "endOfSpeechSensitivity": vad.end_sensitivity,
                "prefixPaddingMs": vad.prefix_padding_ms,
                "silenceDurationMs": vad.silence_duration_ms
            }
        }),
    );
    if setup.transcribe {
        body.insert("inputAudioTranscription".into(), json!({}));
        body.insert("outputAudioTranscription".into(), json!({}));
    }
    Value::Object(body)
}

fn response_value(response: &ToolResponse) -> Value {
    let mut obj = Map::new();
    if let Some(id) = &response.id {
        obj.insert("id".into(), json!(id));
    }
    obj.insert("name".into(), json!(response.name));
    obj.insert("response".into(), response.response.clone());
    Value::Object(obj)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    reason: Option<String>,
    message: Option<String>,
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    tool_call: Option<ToolCallFrame>,
    tool_call_cancellation: Option<CancellationFrame>,
    go_away: Option<GoAwayFrame>,
    error: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct Transcription {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallFrame {
    #[serde(default)]
    function_calls: Vec<FunctionCallFrame>,
}

#[derive(Debug, Deserialize)]
struct FunctionCallFrame {
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Default, Deserialize)]
struct CancellationFrame {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAwayFrame {
    time_left: Option<String>,
}

/// Decode a text frame
pub fn decode_text(text: &str) -> CallResult<Vec<ServerMessage>> {
    decode_frame(serde_json::from_str(text)?)
}

fn decode_frame(frame: ServerFrame) -> CallResult<Vec<ServerMessage>> {
    let mut out = Vec::new();

    if let Some(kind) = frame.kind.as_deref() {
        match kind {
            "proxy_connected" => out.push(ServerMessage::ProxyConnected),
            "session_started" => out.push(ServerMessage::SessionStarted),
            "session_ended" => out.push(ServerMessage::SessionEnded {
                reason: frame.reason.clone(),
            }),
            "error" => out.push(ServerMessage::Error {
                code: None,
                message: frame
                    .message
                    .clone()
                    .or_else(|| frame.reason.clone())
                    .unwrap_or_else(|| "proxy error".to_string()),
            }),
            other => {
                return Err(CallError::Protocol(format!(
                    "unknown frame type '{}'",
                    other
                )))
            }
        }
    }

    if frame.setup_complete.is_some() {
        out.push(ServerMessage::SetupComplete);
    }

    if let Some(content) = frame.server_content {
        decode_content(content, &mut out);
    }

    if let Some(tool_call) = frame.tool_call {
        let calls: Vec<FunctionCall> = tool_call
            .function_calls
            .into_iter()
            .map(|c| FunctionCall {
                id: c.id,
                name: c.name,
                args: c.args,
            })
            .collect();
        if !calls.is_empty() {
            out.push(ServerMessage::ToolCall(calls));
        }
    }

    if let Some(cancellation) = frame.tool_call_cancellation {
        out.push(ServerMessage::ToolCallCancellation(cancellation.ids));
    }

    if let Some(go_away) = frame.go_away {
        out.push(ServerMessage::GoAway {
            time_left: go_away.time_left,
        });
    }

    if let Some(error) = frame.error {
        out.push(decode_error(error));
    }

    Ok(out)
}

fn decode_content(content: ServerContent, out: &mut Vec<ServerMessage>) {
    if let Some(t) = content.input_transcription.and_then(|t| t.text) {
        if !t.trim().is_empty() {
            out.push(ServerMessage::Transcript {
                speaker: Speaker::Caller,
                text: t,
            });
        }
    }

    // Output riding along with an interruption was already superseded
    if content.interrupted {
        out.push(ServerMessage::Interrupted);
    } else if let Some(turn) = content.model_turn {
        for part in turn.parts {
            if let Some(inline) = part.inline_data {
                if inline.mime_type.is_empty() || inline.mime_type.starts_with("audio/") {
                    match decode_base64(&inline.data) {
                        Ok(pcm) if !pcm.is_empty() => out.push(ServerMessage::AudioOutput(pcm)),
                        Ok(_) => {}
                        Err(e) => warn!("Skipping undecodable audio part: {}", e),
                    }
                }
            }
            if let Some(text) = part.text {
                out.push(ServerMessage::ModelText(text));
            }
        }
    }

    if let Some(t) = content.output_transcription.and_then(|t| t.text) {
        if !t.trim().is_empty() {
            out.push(ServerMessage::Transcript {
                speaker: Speaker::Assistant,
                text: t,
            });
        }
    }

    if content.turn_complete {
        out.push(ServerMessage::TurnComplete);
    }
}

fn decode_error(error: Value) -> ServerMessage {
    match error {
        Value::String(message) => ServerMessage::Error {
            code: None,
            message,
        },
        Value::Object(obj) => ServerMessage::Error {
            code: obj.get("code").and_then(Value::as_i64),
            message: obj
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("service error")
                .to_string(),
        },
        other => ServerMessage::Error {
            code: None,
            message: other.to_string(),
        },
    }
}

/// Decode a binary frame: a JSON object carries control data, anything else
/// is raw PCM16 speech
pub fn decode_binary(bytes: &[u8]) -> CallResult<Vec<ServerMessage>> {
    let first = bytes.iter().find(|b| !b.is_ascii_whitespace());
    match first {
        None => Ok(Vec::new()),
        // PCM whose first byte happens to be `{` is still audio
        Some(b'{') => match serde_json::from_slice::<Map<String, Value>>(bytes) {
            Ok(object) => decode_frame(serde_json::from_value(Value::Object(object))?),
            Err(_) => Ok(vec![ServerMessage::AudioOutput(bytes.to_vec())]),
        },
        Some(_) => Ok(vec![ServerMessage::AudioOutput(bytes.to_vec())]),
    }
}
