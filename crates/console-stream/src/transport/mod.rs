//! Transport capability: how a session opens physical connections.
//!
//! Sessions only talk to these traits, so tests can substitute a scripted
//! transport for the network stack.

mod http;
mod ws;

use std::fmt;

pub use http::HttpStreamTransport;
pub use ws::WebSocketTransport;

use crate::errors::ConnectionError;

/// What a physical connection can report.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A fragment of a byte stream; record boundaries may fall anywhere in it.
    Chunk(bytes::Bytes),
    /// A self-contained message, such as one WebSocket text frame.
    Message(String),
    /// The peer closed the connection.
    Closed { reason: String },
    /// The connection failed.
    Failed(ConnectionError),
}

/// Parameters for opening one physical connection.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectRequest {
    pub url: String,
    /// Optional JSON body. HTTP transports POST it; WebSocket transports send it
    /// as the first text message after the handshake.
    pub body: Option<serde_json::Value>,
}

impl ConnectRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            body: None,
        }
    }

    pub fn with_body(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            url: url.into(),
            body: Some(body),
        }
    }
}

impl fmt::Display for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Opens physical connections.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Opens a connection. Returning `Ok` means the connection is open.
    async fn open(&self, request: &ConnectRequest) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// One live physical connection. Dropping it releases the underlying handle.
#[async_trait::async_trait]
pub trait Connection: Send {
    /// Waits for the next event. `None` means the connection has ended.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Sends a text message to the peer.
    async fn send(&mut self, text: String) -> Result<(), ConnectionError>;

    /// Closes the connection. Further calls are no-ops.
    async fn close(&mut self);
}
