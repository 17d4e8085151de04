use futures::{SinkExt as _, StreamExt as _};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::errors::ConnectionError;

use super::{ConnectRequest, Connection, Transport, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket transport for push endpoints such as `/ws/logs/{deployment}`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketTransport;

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, request: &ConnectRequest) -> Result<Box<dyn Connection>, ConnectionError> {
        debug!(url = %request.url, "opening websocket");
        let (mut stream, _) = connect_async(request.url.as_str())
            .await
            .map_err(|e| ConnectionError::refused(&request.url, e.to_string()))?;
        if let Some(body) = &request.body {
            stream
                .send(Message::Text(body.to_string()))
                .await
                .map_err(|e| ConnectionError::transport(format!("initial send failed: {e}")))?;
        }
        Ok(Box::new(WebSocketConnection {
            stream: Some(stream),
        }))
    }
}

struct WebSocketConnection {
    stream: Option<WsStream>,
}

#[async_trait::async_trait]
impl Connection for WebSocketConnection {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        let stream = self.stream.as_mut()?;
        loop {
            let event = match stream.next().await {
                Some(Ok(Message::Text(text))) => TransportEvent::Message(text),
                Some(Ok(Message::Binary(data))) => TransportEvent::Chunk(bytes::Bytes::from(data)),
                Some(Ok(Message::Close(frame))) => TransportEvent::Closed {
                    reason: frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by peer".to_string()),
                },
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => TransportEvent::Failed(ConnectionError::transport(e.to_string())),
                None => TransportEvent::Closed {
                    reason: "socket ended".into(),
                },
            };
            if matches!(
                event,
                TransportEvent::Closed { .. } | TransportEvent::Failed(_)
            ) {
                self.stream = None;
            }
            return Some(event);
        }
    }

    async fn send(&mut self, text: String) -> Result<(), ConnectionError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ConnectionError::Protocol("websocket is closed".into()))?;
        stream
            .send(Message::Text(text))
            .await
            .map_err(|e| ConnectionError::transport(e.to_string()))
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}
