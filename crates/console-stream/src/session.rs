use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{Instrument as _, debug, info, warn};

use crate::decode::{DEFAULT_MAX_RECORD_BYTES, FrameBuffer, FrameDecoder, WireFormat};
use crate::errors::{DecodeError, SessionError};
use crate::event::{ControlSignal, StreamEvent};
use crate::observability::session_span;
use crate::policy::{ReconnectPolicy, RetryDecision};
use crate::transport::{ConnectRequest, Transport, TransportEvent};

/// Lifecycle of a logical session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
    Failed(String),
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connecting => f.write_str("connecting"),
            Self::Open => f.write_str("open"),
            Self::Reconnecting => f.write_str("reconnecting"),
            Self::Closed => f.write_str("closed"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Behavior options for a session.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionOptions {
    /// Wire format of the subscribed endpoint.
    pub format: WireFormat,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// Treat a close after an end-of-stream marker as normal completion
    /// (`Closed`) rather than a lost connection.
    #[serde(default)]
    pub finish_on_end_of_stream: bool,
    /// Longest unterminated record held back before it is dropped as
    /// oversized.
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,
}

fn default_max_record_bytes() -> usize {
    DEFAULT_MAX_RECORD_BYTES
}

impl SessionOptions {
    /// Long-lived log subscription: JSON lines, manual reconnect.
    pub fn log_stream() -> Self {
        Self {
            format: WireFormat::JsonLines,
            reconnect: ReconnectPolicy::Manual,
            finish_on_end_of_stream: false,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }

    /// One-turn token stream: server-sent events, finished by `[DONE]`.
    pub fn token_stream() -> Self {
        Self {
            format: WireFormat::ServerSentEvents,
            reconnect: ReconnectPolicy::Manual,
            finish_on_end_of_stream: true,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn finish_on_end_of_stream(mut self, finish: bool) -> Self {
        self.finish_on_end_of_stream = finish;
        self
    }

    pub fn max_record_bytes(mut self, max_record_bytes: usize) -> Self {
        self.max_record_bytes = max_record_bytes;
        self
    }
}

/// Callback invoked for every event a session forwards.
pub type EventCallback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Handle returned by [`StreamSession::on_event`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Shared {
    id: uuid::Uuid,
    state_tx: watch::Sender<SessionState>,
    subscribers: Mutex<Vec<(SubscriptionId, EventCallback)>>,
    next_subscription: AtomicU64,
    outbound_tx: mpsc::UnboundedSender<String>,
}

impl Shared {
    fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    fn is_live(&self) -> bool {
        !self.state_tx.borrow().is_closed()
    }

    /// Moves to `next` unless the session was stopped. `Closed` is final.
    fn transition(&self, next: SessionState) -> bool {
        self.state_tx.send_if_modified(|current| {
            if current.is_closed() {
                return false;
            }
            if *current != next {
                info!(session = %self.id, from = %current, to = %next, "session state changed");
            }
            *current = next;
            true
        })
    }

    /// Moves to `next` only while the state still satisfies `from`.
    fn transition_from(&self, from: impl Fn(&SessionState) -> bool, next: SessionState) -> bool {
        self.state_tx.send_if_modified(|current| {
            if !from(current) {
                return false;
            }
            info!(session = %self.id, from = %current, to = %next, "session state changed");
            *current = next;
            true
        })
    }

    /// Records a retry request as the `Reconnecting | Failed -> Connecting`
    /// transition. Returns the rejecting state otherwise.
    fn request_retry(&self) -> Result<(), SessionState> {
        let mut rejected = None;
        self.state_tx.send_if_modified(|current| match current {
            SessionState::Reconnecting | SessionState::Failed(_) => {
                info!(session = %self.id, from = %current, to = %SessionState::Connecting, "session state changed");
                *current = SessionState::Connecting;
                true
            }
            other => {
                rejected = Some(other.clone());
                false
            }
        });
        rejected.map_or(Ok(()), Err)
    }

    fn emit(&self, event: &StreamEvent) {
        let callbacks: Vec<EventCallback> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            if !self.is_live() {
                return;
            }
            callback(event);
        }
    }
}

/// One logical subscription kept alive over a chain of physical connections.
///
/// Consumers see a single ordered event sequence through [`on_event`]; the
/// session decodes each chunk, forwards events in arrival order and turns
/// connection loss into `Disconnected` control events. Dropping the session
/// stops it.
///
/// [`on_event`]: StreamSession::on_event
pub struct StreamSession {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    request: ConnectRequest,
    options: SessionOptions,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl StreamSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        request: ConnectRequest,
        options: SessionOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                id: uuid::Uuid::new_v4(),
                state_tx,
                subscribers: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(0),
                outbound_tx,
            }),
            transport,
            request,
            options,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.shared.id
    }

    pub fn request(&self) -> &ConnectRequest {
        &self.request
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Registers a callback for every forwarded event, including control events.
    ///
    /// Callbacks run on the session's driver task, in arrival order. Liveness is
    /// checked before each call, so once `stop()` returns no further callback
    /// starts. A callback already running on another worker thread may still
    /// finish.
    pub fn on_event(
        &self,
        callback: impl Fn(&StreamEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.shared.subscribers.lock().push((id, Arc::new(callback)));
        id
    }

    /// Removes a callback. Returns false when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.shared.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Starts the session: `Idle -> Connecting`, then opens the first
    /// physical connection on a spawned driver task.
    pub fn start(&self) -> Result<(), SessionError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        let mut rejected = None;
        self.shared.state_tx.send_if_modified(|state| match state {
            SessionState::Idle => {
                *state = SessionState::Connecting;
                true
            }
            SessionState::Closed => {
                rejected = Some(SessionError::Closed);
                false
            }
            other => {
                rejected = Some(SessionError::AlreadyStarted(other.clone()));
                false
            }
        });
        if let Some(err) = rejected {
            return Err(err);
        }

        let outbound_rx = self
            .outbound_rx
            .lock()
            .take()
            .ok_or_else(|| SessionError::AlreadyStarted(self.state()))?;
        info!(session = %self.shared.id, url = %self.request, format = ?self.options.format, "starting session");

        let driver = Driver {
            shared: self.shared.clone(),
            transport: self.transport.clone(),
            request: self.request.clone(),
            options: self.options.clone(),
            decoder: self.options.format.decoder(),
            state_rx: self.shared.state_tx.subscribe(),
            outbound_rx,
        };
        let span = session_span(&self.shared.id, self.options.format, &self.request.url);
        runtime.spawn(driver.run().instrument(span));
        Ok(())
    }

    /// Stops the session from any state and closes the live connection.
    /// Idempotent.
    pub fn stop(&self) {
        let stopped = self.shared.state_tx.send_if_modified(|state| {
            if state.is_closed() {
                return false;
            }
            *state = SessionState::Closed;
            true
        });
        if stopped {
            info!(session = %self.shared.id, "session stopped");
        }
    }

    /// Caller-invoked retry while `Reconnecting` or `Failed`: moves the
    /// session to `Connecting` for exactly one attempt. Also cuts a pending
    /// timed retry short.
    pub fn reconnect(&self) -> Result<(), SessionError> {
        match self.shared.request_retry() {
            Ok(()) => {
                debug!(session = %self.shared.id, "reconnect requested");
                Ok(())
            }
            Err(SessionState::Closed) => Err(SessionError::Closed),
            Err(state) => Err(SessionError::InvalidTransition {
                operation: "reconnect",
                state,
            }),
        }
    }

    /// Queues a text message for the live connection.
    pub fn send(&self, text: impl Into<String>) -> Result<(), SessionError> {
        if self.state() != SessionState::Open {
            return Err(SessionError::NotOpen);
        }
        self.shared
            .outbound_tx
            .send(text.into())
            .map_err(|_| SessionError::NotOpen)
    }

    /// Waits until the session is closed, either by `stop()` or by a finished
    /// stream.
    pub async fn closed(&self) {
        let mut rx = self.state_changes();
        let _ = rx.wait_for(SessionState::is_closed).await;
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.stop();
    }
}

enum ConnectionEnd {
    Stopped,
    Finished,
    Lost { reason: String, was_open: bool },
}

struct Driver {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    request: ConnectRequest,
    options: SessionOptions,
    decoder: Arc<dyn FrameDecoder>,
    state_rx: watch::Receiver<SessionState>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
}

impl Driver {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        loop {
            let (reason, was_open) = match self.connect_once().await {
                ConnectionEnd::Stopped => break,
                ConnectionEnd::Finished => {
                    info!(session = %self.shared.id, "stream finished");
                    self.shared.transition(SessionState::Closed);
                    break;
                }
                ConnectionEnd::Lost { reason, was_open } => (reason, was_open),
            };
            failures = if was_open { 1 } else { failures.saturating_add(1) };

            if !self.shared.transition(SessionState::Reconnecting) {
                break;
            }
            warn!(session = %self.shared.id, attempt = failures, %reason, "connection lost");
            self.shared
                .emit(&StreamEvent::control_now(ControlSignal::Disconnected, reason.clone()));

            let retry = match self.options.reconnect.decide(failures) {
                RetryDecision::WaitForCaller => self.wait_for_retry(None).await,
                RetryDecision::After(delay) => {
                    debug!(session = %self.shared.id, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                    self.wait_for_retry(Some(delay)).await
                }
                RetryDecision::GiveUp => {
                    let reason = format!(
                        "retries exhausted after {} attempts: {reason}",
                        failures.saturating_sub(1)
                    );
                    let failed = self.shared.transition_from(
                        |s| *s == SessionState::Reconnecting,
                        SessionState::Failed(reason.clone()),
                    );
                    failures = 0;
                    if failed {
                        self.shared
                            .emit(&StreamEvent::control_now(ControlSignal::RetriesExhausted, reason));
                        self.wait_for_retry(None).await
                    } else {
                        // A caller already asked for another attempt.
                        !self.shared.state().is_closed()
                    }
                }
            };
            if !retry {
                break;
            }
        }
        debug!(session = %self.shared.id, "session driver exited");
    }

    async fn connect_once(&mut self) -> ConnectionEnd {
        let opened = tokio::select! {
            biased;
            _ = wait_closed(&mut self.state_rx) => return ConnectionEnd::Stopped,
            opened = self.transport.open(&self.request) => opened,
        };
        let mut conn = match opened {
            Ok(conn) => conn,
            Err(err) => {
                warn!(session = %self.shared.id, url = %self.request, error = %err, "connect failed");
                return ConnectionEnd::Lost {
                    reason: err.to_string(),
                    was_open: false,
                };
            }
        };
        if !self.shared.transition(SessionState::Open) {
            conn.close().await;
            return ConnectionEnd::Stopped;
        }
        self.shared.emit(&StreamEvent::control_now(
            ControlSignal::Connected,
            self.request.url.clone(),
        ));

        let mut buffer =
            FrameBuffer::with_max_record_bytes(self.decoder.boundary(), self.options.max_record_bytes);
        let mut saw_end = false;
        let reason = loop {
            tokio::select! {
                biased;
                _ = wait_closed(&mut self.state_rx) => {
                    conn.close().await;
                    return ConnectionEnd::Stopped;
                }
                Some(text) = self.outbound_rx.recv() => {
                    if let Err(err) = conn.send(text).await {
                        warn!(session = %self.shared.id, error = %err, "send failed");
                    }
                }
                event = conn.next_event() => match event {
                    Some(TransportEvent::Chunk(bytes)) => {
                        let frames = buffer.push(&bytes);
                        if let Some(records) = frames.records {
                            saw_end |= self.dispatch(&records);
                        }
                        if let Some(err) = frames.oversized {
                            self.report_decode_error(&err);
                        }
                    }
                    Some(TransportEvent::Message(text)) => saw_end |= self.dispatch(text.as_bytes()),
                    Some(TransportEvent::Closed { reason }) => break reason,
                    Some(TransportEvent::Failed(err)) => break err.to_string(),
                    None => break "connection ended".to_string(),
                },
            }
        };

        if let Some(rest) = buffer.finish() {
            saw_end |= self.dispatch(&rest);
        }
        conn.close().await;
        drop(conn);

        let mut dropped = 0_usize;
        while self.outbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(session = %self.shared.id, dropped, "discarded unsent messages");
        }

        if saw_end && self.options.finish_on_end_of_stream {
            ConnectionEnd::Finished
        } else {
            ConnectionEnd::Lost {
                reason,
                was_open: true,
            }
        }
    }

    /// Decodes one chunk and forwards every result. Returns true when the
    /// chunk carried an end-of-stream marker.
    fn dispatch(&self, chunk: &[u8]) -> bool {
        let mut saw_end = false;
        for result in self.decoder.decode(chunk) {
            match result {
                Ok(event) => {
                    saw_end |= event.control_signal() == Some(ControlSignal::EndOfTurn);
                    self.shared.emit(&event);
                }
                Err(err) => self.report_decode_error(&err),
            }
        }
        saw_end
    }

    fn report_decode_error(&self, err: &DecodeError) {
        warn!(session = %self.shared.id, error = %err, "undecodable record");
        self.shared
            .emit(&StreamEvent::control_now(ControlSignal::DecodeFailed, err.to_string()));
    }

    /// Waits until the session leaves `Reconnecting`/`Failed`, either through
    /// `reconnect()` or through the policy timer. Returns false when the
    /// session was stopped.
    async fn wait_for_retry(&mut self, delay: Option<Duration>) -> bool {
        let timer = async {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };
        let requested = wait_retry_requested(&mut self.state_rx);
        tokio::select! {
            biased;
            retry = requested => retry,
            _ = timer => {
                let _ = self.shared.request_retry();
                self.shared.state() == SessionState::Connecting
            }
        }
    }
}

async fn wait_closed(rx: &mut watch::Receiver<SessionState>) {
    let _ = rx.wait_for(SessionState::is_closed).await;
}

/// Resolves once a retry was requested (true) or the session stopped (false).
async fn wait_retry_requested(rx: &mut watch::Receiver<SessionState>) -> bool {
    match rx
        .wait_for(|s| matches!(s, SessionState::Connecting | SessionState::Closed))
        .await
    {
        Ok(state) => !state.is_closed(),
        Err(_) => false,
    }
}
