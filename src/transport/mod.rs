//! Streaming connection to the speech service
//!
//! The session talks to a [`Transport`]; whether that reaches the service
//! directly or through a credential-holding proxy is a property of the
//! transport, not of the session.

pub mod credentials;
pub mod websocket;

use crate::error::CallResult;
use crate::protocol::{ClientMessage, ServerMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use credentials::{Anonymous, Credential, CredentialSource, EnvToken, StaticToken, TokenEndpoint};
pub use websocket::WebSocketTransport;

/// WebSocket close code for a normal closure
pub const NORMAL_CLOSURE: u16 = 1000;

/// Where the connection terminates and who injects the credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// The client holds the credential and connects to the service
    #[default]
    Direct,
    /// A trusted relay holds the credential
    Proxied,
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topology::Direct => write!(f, "direct"),
            Topology::Proxied => write!(f, "proxied"),
        }
    }
}

impl std::str::FromStr for Topology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Topology::Direct),
            "proxied" | "proxy" => Ok(Topology::Proxied),
            other => Err(format!("unknown topology '{}'", other)),
        }
    }
}

/// Inbound activity from an open connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ServerMessage),
    /// A frame that could not be decoded; the call continues
    Malformed(String),
    /// The connection is gone. `code` is the close code, if one was received.
    Closed { code: Option<u16>, reason: String },
}

/// How a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Normal,
    Abnormal,
}

impl CloseKind {
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            Some(NORMAL_CLOSURE) => CloseKind::Normal,
            _ => CloseKind::Abnormal,
        }
    }
}

/// A bidirectional message channel to the service
#[async_trait]
pub trait Transport: Send {
    /// Connect and start delivering inbound events on `events`.
    ///
    /// Returns once the connection can carry `Setup`.
    async fn open(
        &mut self,
        credential: &Credential,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> CallResult<()>;

    /// Whether outbound messages can be sent right now
    fn is_ready(&self) -> bool;

    async fn send(&mut self, message: &ClientMessage) -> CallResult<()>;

    /// Close with a normal closure. Never fails; safe to call when closed.
    async fn close(&mut self);

    fn topology(&self) -> Topology;
}
