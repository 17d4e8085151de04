use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt as _;
use tracing::debug;

use crate::errors::ConnectionError;

use super::{ConnectRequest, Connection, Transport, TransportEvent};

type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// Streaming HTTP transport (chunked responses and server-sent events).
///
/// Requests with a body are POSTed as JSON, others are plain GETs.
/// Connections are receive-only.
#[derive(Clone)]
pub struct HttpStreamTransport {
    client: reqwest::Client,
}

impl HttpStreamTransport {
    /// Builds a transport with a connect timeout. Streams themselves are not
    /// time-limited: a token stream may legitimately stay open for minutes.
    pub fn new(connect_timeout: Duration) -> Result<Self, ConnectionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ConnectionError::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Transport for HttpStreamTransport {
    async fn open(&self, request: &ConnectRequest) -> Result<Box<dyn Connection>, ConnectionError> {
        let http_req = match &request.body {
            Some(body) => self.client.post(&request.url).json(body),
            None => self.client.get(&request.url),
        }
        .header(reqwest::header::ACCEPT, "text/event-stream, application/x-ndjson");
        debug!(url = %request.url, post = request.body.is_some(), "opening HTTP stream");

        let response = http_req
            .send()
            .await
            .map_err(|e| ConnectionError::refused(&request.url, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ConnectionError::refused(
                &request.url,
                format!("request failed with status {status}: {body}"),
            ));
        }

        Ok(Box::new(HttpStreamConnection {
            stream: Some(Box::pin(response.bytes_stream())),
        }))
    }
}

struct HttpStreamConnection {
    stream: Option<ByteStream>,
}

#[async_trait::async_trait]
impl Connection for HttpStreamConnection {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        let stream = self.stream.as_mut()?;
        match stream.next().await {
            Some(Ok(chunk)) => Some(TransportEvent::Chunk(chunk)),
            Some(Err(e)) => {
                self.stream = None;
                Some(TransportEvent::Failed(ConnectionError::transport(format!(
                    "stream read failed: {e}"
                ))))
            }
            None => {
                self.stream = None;
                Some(TransportEvent::Closed {
                    reason: "response stream ended".into(),
                })
            }
        }
    }

    async fn send(&mut self, _text: String) -> Result<(), ConnectionError> {
        Err(ConnectionError::Protocol(
            "HTTP stream connections are receive-only".into(),
        ))
    }

    async fn close(&mut self) {
        self.stream = None;
    }
}
