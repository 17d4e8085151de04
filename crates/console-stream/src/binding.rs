//! Render binding: ties a stream session and its transcript to a consumer's
//! lifetime.
//!
//! A consumer (a page, a terminal view) acquires a [`LiveTranscript`] when it
//! becomes visible, renders from [`LiveTranscript::snapshot`] whenever
//! [`LiveTranscript::changes`] fires, and releases it (or drops it) when it
//! goes away. Releasing stops the session, so no callback runs afterwards.

use std::sync::Arc;

use tokio::sync::watch;

use crate::chat::ChatRequest;
use crate::config::{ConsoleConfig, PodType};
use crate::errors::{ConsoleError, SessionError};
use crate::event::StreamEvent;
use crate::session::{SessionOptions, SessionState, StreamSession, SubscriptionId};
use crate::transcript::{Assembler, Redelivery, Transcript};
use crate::transport::{ConnectRequest, HttpStreamTransport, WebSocketTransport};

/// Log subscription for one deployment over the backend's WebSocket.
pub fn log_session(
    config: &ConsoleConfig,
    deployment_id: &str,
    pod_type: Option<PodType>,
) -> StreamSession {
    StreamSession::new(
        Arc::new(WebSocketTransport),
        ConnectRequest::get(config.logs_url(deployment_id, pod_type)),
        SessionOptions::log_stream().reconnect(config.reconnect.clone()),
    )
}

/// One streamed chat turn POSTed to `url`.
pub fn chat_session(
    config: &ConsoleConfig,
    url: impl Into<String>,
    request: &ChatRequest,
) -> Result<StreamSession, ConsoleError> {
    let transport = HttpStreamTransport::new(config.request_timeout)?;
    Ok(StreamSession::new(
        Arc::new(transport),
        ConnectRequest::with_body(url, request.body()),
        SessionOptions::token_stream(),
    ))
}

/// Log assembler sized from `config`.
pub fn log_assembler(config: &ConsoleConfig, redelivery: Redelivery) -> Assembler {
    Assembler::log(config.log_retention, redelivery)
}

/// A started session feeding an assembler. Dropping it stops the session.
pub struct LiveTranscript {
    session: StreamSession,
    assembler: Assembler,
    subscription: SubscriptionId,
}

impl LiveTranscript {
    /// Attaches `assembler` to `session` and starts the session.
    pub fn acquire(session: StreamSession, assembler: Assembler) -> Result<Self, SessionError> {
        let subscription = assembler.attach(&session);
        if let Err(err) = session.start() {
            session.unsubscribe(subscription);
            return Err(err);
        }
        Ok(Self {
            session,
            assembler,
            subscription,
        })
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    pub fn assembler(&self) -> &Assembler {
        &self.assembler
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn snapshot(&self) -> Transcript {
        self.assembler.snapshot()
    }

    /// Fires after every transcript change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.assembler.changes()
    }

    /// Additional per-event callback, e.g. to print deltas as they arrive.
    pub fn on_event(
        &self,
        callback: impl Fn(&StreamEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.session.on_event(callback)
    }

    /// Waits until the session leaves `Connecting`/`Open`: the stream
    /// finished, was stopped, or lost its connection.
    pub async fn settled(&self) -> SessionState {
        let mut rx = self.session.state_changes();
        match rx
            .wait_for(|s| {
                matches!(
                    s,
                    SessionState::Closed | SessionState::Reconnecting | SessionState::Failed(_)
                )
            })
            .await
        {
            Ok(state) => state.clone(),
            Err(_) => self.session.state(),
        }
    }

    /// Stops the session and returns the final transcript.
    pub fn release(self) -> Transcript {
        self.session.stop();
        self.session.unsubscribe(self.subscription);
        self.assembler.snapshot()
    }
}
