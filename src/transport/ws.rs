#![forbid(unsafe_code)]

// WebSocket transport backed by tokio-tungstenite

use super::{Connection, Transport, TransportError};
use crate::config::ClientIdentity;
use crate::protocol::{ClientMessage, InboundEvent};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

/// Connects to the chat service's WebSocket endpoint, passing the bearer token
/// as the `token` query parameter.
#[derive(Debug, Clone)]
pub struct WsTransport {
    server_url: Url,
}

impl WsTransport {
    pub fn new(server_url: &str) -> Result<Self, TransportError> {
        let server_url = Url::parse(server_url)
            .map_err(|e| TransportError::Connect(format!("invalid server url '{server_url}': {e}")))?;
        match server_url.scheme() {
            "ws" | "wss" => Ok(Self { server_url }),
            other => Err(TransportError::Connect(format!(
                "unsupported url scheme '{other}' (expected ws or wss)"
            ))),
        }
    }

    /// Server URL with the credential attached
    pub fn authenticated_url(&self, token: &str) -> Url {
        let mut url = self.server_url.clone();
        url.query_pairs_mut().append_pair("token", token);
        url
    }
}

#[async_trait]
impl Transport for WsTransport {
    type Connection = WsConnection;

    async fn connect(&self, identity: &ClientIdentity) -> Result<WsConnection, TransportError> {
        let url = self.authenticated_url(&identity.token);
        let (stream, response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        debug!("{}: WebSocket handshake complete (status {})", identity.label(), response.status());

        Ok(WsConnection {
            label: identity.label(),
            stream,
        })
    }
}

/// An open WebSocket to the chat service
pub struct WsConnection {
    label: String,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        let json = message.to_json()?;
        self.stream
            .send(Message::Text(json.into()))
            .await
            .map_err(map_ws_error)
    }

    async fn receive(&mut self) -> Result<InboundEvent, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => match InboundEvent::parse(&text) {
                    Ok(event) => return Ok(event),
                    Err(e) => {
                        warn!("{}: Skipping unparseable frame: {}", self.label, e);
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    return Err(TransportError::Closed {
                        reason: frame.as_ref().map(describe_close),
                    });
                }
                Some(Ok(_)) => {} // tungstenite answers pings itself
                Some(Err(e)) => return Err(map_ws_error(e)),
                None => return Err(TransportError::closed()),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(e) => match map_ws_error(e) {
                TransportError::Closed { .. } => Ok(()),
                other => Err(other),
            },
        }
    }
}

fn describe_close(frame: &CloseFrame) -> String {
    let code: u16 = frame.code.into();
    if frame.reason.is_empty() {
        code.to_string()
    } else {
        format!("{} {}", code, frame.reason.as_str())
    }
}

fn map_ws_error(error: WsError) -> TransportError {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::closed(),
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => TransportError::Closed {
            reason: Some("reset without closing handshake".to_string()),
        },
        WsError::Io(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ) =>
        {
            TransportError::Closed {
                reason: Some(e.to_string()),
            }
        }
        other => TransportError::Io(other.to_string()),
    }
}
