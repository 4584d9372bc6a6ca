//! Tools the service may call and how calls are dispatched

use crate::protocol::messages::{FunctionCall, FunctionDeclaration, ToolResponse};
use serde_json::json;

/// Name of the only tool this client implements
pub const END_CALL: &str = "end_call";

/// What the session should do in response to a tool call
#[derive(Debug, Clone, PartialEq)]
pub enum ToolAction {
    /// Say goodbye, then end the call after a grace delay
    EndCall { reason: Option<String> },
    /// Not implemented here; answer with an error so the service moves on
    Unknown { name: String },
}

/// Declarations sent with `Setup`
pub fn declarations() -> Vec<FunctionDeclaration> {
    vec![FunctionDeclaration {
        name: END_CALL.to_string(),
        description: "End the phone call. Call this once the conversation has reached a \
                      natural conclusion or the caller asks to hang up."
            .to_string(),
        parameters: json!({
            "type": "OBJECT",
            "properties": {
                "reason": {
                    "type": "STRING",
                    "description": "Short reason the call is ending"
                }
            }
        }),
    }]
}

pub fn dispatch(call: &FunctionCall) -> ToolAction {
    match call.name.as_str() {
        END_CALL => ToolAction::EndCall {
            reason: call
                .args
                .get("reason")
                .and_then(|r| r.as_str())
                .map(str::to_string),
        },
        other => ToolAction::Unknown {
            name: other.to_string(),
        },
    }
}

/// No-op acknowledgement for a tool this client does not implement
pub fn unknown_tool_response(call: &FunctionCall) -> ToolResponse {
    ToolResponse {
        id: call.id.clone(),
        name: call.name.clone(),
        response: json!({
            "error": format!("Tool '{}' is not available", call.name)
        }),
    }
}

/// Final turn asking the service to say goodbye before the line drops
pub fn closing_turn(reason: Option<&str>) -> String {
    match reason {
        Some(reason) if !reason.trim().is_empty() => format!(
            "The call is ending ({}). Say a brief goodbye in one short sentence.",
            reason.trim()
        ),
        _ => "The call is ending. Say a brief goodbye in one short sentence.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str, name: &str, args: serde_json::Value) -> FunctionCall {
        FunctionCall {
            id: Some(id.to_string()),
            name: name.to_string(),
            args,
        }
    }

    #[test]
    fn test_dispatch_end_call() {
        let action = dispatch(&call("1", "end_call", json!({"reason": "done"})));
        assert_eq!(
            action,
            ToolAction::EndCall {
                reason: Some("done".to_string())
            }
        );

        let action = dispatch(&call("2", "end_call", serde_json::Value::Null));
        assert_eq!(action, ToolAction::EndCall { reason: None });
    }

    #[test]
    fn test_unknown_tool_is_acknowledged_with_same_id() {
        let c = call("xyz-42", "transfer_call", json!({}));
        assert_eq!(
            dispatch(&c),
            ToolAction::Unknown {
                name: "transfer_call".to_string()
            }
        );

        let response = unknown_tool_response(&c);
        assert_eq!(response.id.as_deref(), Some("xyz-42"));
        assert_eq!(response.name, "transfer_call");
        assert!(response.response["error"].is_string());
    }

    #[test]
    fn test_closing_turn_mentions_reason() {
        assert!(closing_turn(Some("caller said bye")).contains("caller said bye"));
        assert!(!closing_turn(Some("  ")).contains("()"));
    }
}
