//! Control-message protocol
//!
//! Message types, their JSON wire framing, and the tool-call bridge.

pub mod messages;
pub mod tools;
pub mod wire;

pub use messages::{
    ActivityDetection, ClientMessage, FunctionCall, FunctionDeclaration, ServerMessage,
    SetupConfig, Speaker, ToolResponse,
};
pub use tools::{ToolAction, END_CALL};
