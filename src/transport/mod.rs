#![forbid(unsafe_code)]

// Transport module - the narrow connection interface sessions are written against

pub mod ws;

use crate::config::ClientIdentity;
use crate::protocol::{ClientMessage, InboundEvent};
use async_trait::async_trait;
use thiserror::Error;

pub use ws::{WsConnection, WsTransport};

/// Transport-level failures
#[derive(Error, Debug)]
pub enum TransportError {
    /// Could not establish the connection (unreachable, handshake or auth rejected)
    #[error("Connect failed: {0}")]
    Connect(String),

    /// The peer closed the connection, or it is no longer usable
    #[error("Connection closed{}", reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default())]
    Closed { reason: Option<String> },

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn closed() -> Self {
        Self::Closed { reason: None }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

/// Opens authenticated connections to the chat service.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection + 'static;

    /// Connect as `identity`, presenting its bearer token.
    async fn connect(&self, identity: &ClientIdentity) -> Result<Self::Connection, TransportError>;
}

/// One open, bidirectional connection.
///
/// Dropping a connection releases it; `close` additionally performs a graceful
/// shutdown where the transport has one.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError>;

    /// Next event pushed by the service. Fails with `TransportError::Closed` once the
    /// connection has terminated.
    async fn receive(&mut self) -> Result<InboundEvent, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}
