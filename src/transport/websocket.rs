//! WebSocket transport using tokio-tungstenite
//!
//! In the direct topology the credential travels as the `access_token` query
//! parameter. In the proxied topology it is sent as a bearer header (when
//! there is one) and the connection only counts as open once the proxy has
//! sent `proxy_connected`.

use crate::error::{CallError, CallResult};
use crate::protocol::{wire, ClientMessage, ServerMessage};
use crate::transport::{Credential, Topology, Transport, TransportEvent};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use reqwest::Url;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Streaming connection over a WebSocket
pub struct WebSocketTransport {
    topology: Topology,
    url: String,
    /// How long to wait for the proxy's `proxy_connected`
    handshake_timeout: Duration,
    writer: Option<SplitSink<WsStream, Message>>,
    reader: Option<JoinHandle<()>>,
    ready: bool,
}

impl WebSocketTransport {
    pub fn new(topology: Topology, url: impl Into<String>) -> Self {
        Self {
            topology,
            url: url.into(),
            handshake_timeout: Duration::from_secs(10),
            writer: None,
            reader: None,
            ready: false,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Connection URL for this topology, without logging the credential
    fn endpoint(&self, credential: &Credential) -> CallResult<Url> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| CallError::Config(format!("invalid service URL '{}': {}", self.url, e)))?;
        if self.topology == Topology::Direct && !credential.is_empty() {
            url.query_pairs_mut()
                .append_pair("access_token", credential.secret());
        }
        Ok(url)
    }

    fn drop_connection(&mut self) {
        self.ready = false;
        self.writer = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(
        &mut self,
        credential: &Credential,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> CallResult<()> {
        self.drop_connection();

        let url = self.endpoint(credential)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| CallError::SetupFailed(format!("invalid request: {}", e)))?;

        if self.topology == Topology::Proxied && !credential.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", credential.secret()))
                .map_err(|_| CallError::SetupFailed("credential is not a valid header".to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        info!(
            "Connecting to {}{} ({})",
            url.host_str().unwrap_or("?"),
            url.path(),
            self.topology
        );

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| CallError::SetupFailed(format!("connection failed: {}", e)))?;
        let (writer, reader) = stream.split();

        let (connected_tx, connected_rx) = oneshot::channel();
        let proxy_ack = (self.topology == Topology::Proxied).then_some(connected_tx);
        self.reader = Some(tokio::spawn(read_loop(reader, events, proxy_ack)));
        self.writer = Some(writer);

        if self.topology == Topology::Proxied {
            match tokio::time::timeout(self.handshake_timeout, connected_rx).await {
                Ok(Ok(())) => debug!("Proxy connected to upstream"),
                Ok(Err(_)) => {
                    self.drop_connection();
                    return Err(CallError::SetupFailed(
                        "proxy closed before connecting upstream".to_string(),
                    ));
                }
                Err(_) => {
                    self.drop_connection();
                    return Err(CallError::SetupFailed(
                        "timed out waiting for the proxy".to_string(),
                    ));
                }
            }
        }

        self.ready = true;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn send(&mut self, message: &ClientMessage) -> CallResult<()> {
        let Some(writer) = self.writer.as_mut().filter(|_| self.ready) else {
            return Err(CallError::Transport("not connected".to_string()));
        };
        let text = wire::encode(message)?;
        trace!("-> {} ({} bytes)", message.kind(), text.len());

        if let Err(e) = writer.send(Message::text(text)).await {
            self.ready = false;
            return Err(e.into());
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.ready = false;
        if let Some(mut writer) = self.writer.take() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "call ended".into(),
            };
            if let Err(e) = writer.send(Message::Close(Some(frame))).await {
                debug!("Close frame not delivered: {}", e);
            }
            let _ = writer.close().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    fn topology(&self) -> Topology {
        self.topology
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.drop_connection();
    }
}

/// Forward inbound frames as events until the connection ends
async fn read_loop(
    mut reader: SplitStream<WsStream>,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut proxy_ack: Option<oneshot::Sender<()>>,
) {
    let closed = loop {
        let frame = match reader.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                break TransportEvent::Closed {
                    code: None,
                    reason: e.to_string(),
                }
            }
            None => {
                break TransportEvent::Closed {
                    code: None,
                    reason: "connection lost".to_string(),
                }
            }
        };

        let decoded = match frame {
            Message::Text(text) => wire::decode_text(text.as_str()),
            Message::Binary(bytes) => wire::decode_binary(&bytes),
            Message::Close(frame) => {
                break match frame {
                    Some(frame) => TransportEvent::Closed {
                        code: Some(u16::from(frame.code)),
                        reason: frame.reason.as_str().to_string(),
                    },
                    None => TransportEvent::Closed {
                        code: None,
                        reason: String::new(),
                    },
                };
            }
            _ => continue,
        };

        match decoded {
            Ok(messages) => {
                for message in messages {
                    if message == ServerMessage::ProxyConnected {
                        if let Some(ack) = proxy_ack.take() {
                            let _ = ack.send(());
                        }
                    }
                    trace!("<- {}", message.kind());
                    if events.send(TransportEvent::Message(message)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                if events.send(TransportEvent::Malformed(e.to_string())).is_err() {
                    return;
                }
            }
        }
    };

    let _ = events.send(closed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CloseKind;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    /// Accept one WebSocket client, record its request line and auth header,
    /// send `greeting` frames, echo the first client frame back as a
    /// `turnComplete`, then close with `close_code`.
    async fn fake_service(
        greeting: Vec<&'static str>,
        close_code: CloseCode,
    ) -> (String, Arc<Mutex<Option<(String, Option<String>)>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(None));
        let seen_by_server = seen.clone();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let auth = req
                    .headers()
                    .get("Authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                *seen_by_server.lock().unwrap() = Some((req.uri().to_string(), auth));
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(socket, callback)
                .await
                .unwrap();

            for frame in greeting {
                ws.send(Message::text(frame)).await.unwrap();
            }
            if let Some(Ok(Message::Text(_))) = ws.next().await {
                ws.send(Message::text(r#"{"serverContent":{"turnComplete":true}}"#))
                    .await
                    .unwrap();
            }
            let _ = ws
                .send(Message::Close(Some(CloseFrame {
                    code: close_code,
                    reason: "bye".into(),
                })))
                .await;
        });

        (format!("ws://{}/live", addr), seen)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_direct_carries_token_in_query() {
        let (url, seen) = fake_service(vec![r#"{"setupComplete":{}}"#], CloseCode::Normal).await;
        let mut transport = WebSocketTransport::new(Topology::Direct, url);
        let (tx, mut rx) = mpsc::unbounded_channel();

        transport.open(&Credential::new("tok"), tx).await.unwrap();
        assert!(transport.is_ready());
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Message(ServerMessage::SetupComplete)
        );

        transport
            .send(&ClientMessage::ClientTurn {
                text: "hi".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Message(ServerMessage::TurnComplete)
        );

        match next_event(&mut rx).await {
            TransportEvent::Closed { code, .. } => {
                assert_eq!(CloseKind::from_code(code), CloseKind::Normal)
            }
            other => panic!("expected close, got {:?}", other),
        }

        let (uri, auth) = seen.lock().unwrap().clone().unwrap();
        assert!(uri.contains("access_token=tok"));
        assert_eq!(auth, None);
        transport.close().await;
        assert!(!transport.is_ready());
    }

    #[tokio::test]
    async fn test_proxied_waits_for_proxy_and_sends_bearer() {
        let (url, seen) = fake_service(
            vec![r#"{"type":"proxy_connected"}"#, r#"{"type":"session_started"}"#],
            CloseCode::Away,
        )
        .await;
        let mut transport = WebSocketTransport::new(Topology::Proxied, url);
        let (tx, mut rx) = mpsc::unbounded_channel();

        transport.open(&Credential::new("tok"), tx).await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Message(ServerMessage::ProxyConnected)
        );
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Message(ServerMessage::SessionStarted)
        );

        let (uri, auth) = seen.lock().unwrap().clone().unwrap();
        assert!(!uri.contains("access_token"));
        assert_eq!(auth.as_deref(), Some("Bearer tok"));

        transport
            .send(&ClientMessage::ClientTurn {
                text: "hi".to_string(),
            })
            .await
            .unwrap();
        let _ = next_event(&mut rx).await;
        match next_event(&mut rx).await {
            TransportEvent::Closed { code, .. } => {
                assert_eq!(CloseKind::from_code(code), CloseKind::Abnormal)
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_is_reported_not_fatal() {
        let (url, _) = fake_service(vec!["{not json", r#"{"setupComplete":{}}"#], CloseCode::Normal)
            .await;
        let mut transport = WebSocketTransport::new(Topology::Direct, url);
        let (tx, mut rx) = mpsc::unbounded_channel();

        transport.open(&Credential::anonymous(), tx).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Malformed(_)));
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Message(ServerMessage::SetupComplete)
        );
        transport.close().await;
    }

    #[tokio::test]
    async fn test_open_failure_is_setup_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut transport = WebSocketTransport::new(Topology::Direct, format!("ws://{}/", addr));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = transport.open(&Credential::anonymous(), tx).await.unwrap_err();
        assert!(matches!(err, CallError::SetupFailed(_)));
        assert!(!transport.is_ready());

        let err = transport
            .send(&ClientMessage::ClientTurn {
                text: "x".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Transport(_)));
    }
}
