//! Poll-until-terminal status watching for slow resource transitions
//! (cluster provisioning, deployment rollout).

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument as _, debug, info, warn};

use crate::errors::{FetchError, WatchError};
use crate::observability::watch_span;

/// Default number of consecutive failed fetches tolerated.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// What to poll and when to stop.
///
/// Deserialization goes through the same validation as [`PollTarget::new`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PollTargetConfig", into = "PollTargetConfig")]
pub struct PollTarget {
    resource_id: String,
    terminal_states: BTreeSet<String>,
    poll_interval: Duration,
    timeout: Duration,
    max_consecutive_failures: u32,
}

impl PollTarget {
    pub fn new<S: Into<String>>(
        resource_id: impl Into<String>,
        terminal_states: impl IntoIterator<Item = S>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<Self, WatchError> {
        let resource_id = resource_id.into();
        if resource_id.trim().is_empty() {
            return Err(WatchError::InvalidTarget("resource id is empty".into()));
        }
        let terminal_states: BTreeSet<String> =
            terminal_states.into_iter().map(Into::into).collect();
        if terminal_states.is_empty() {
            return Err(WatchError::InvalidTarget(
                "at least one terminal state is required".into(),
            ));
        }
        if poll_interval.is_zero() {
            return Err(WatchError::InvalidTarget("poll interval must be positive".into()));
        }
        if timeout < poll_interval {
            return Err(WatchError::InvalidTarget(format!(
                "timeout {timeout:?} is shorter than the poll interval {poll_interval:?}"
            )));
        }
        Ok(Self {
            resource_id,
            terminal_states,
            poll_interval,
            timeout,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        })
    }

    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures;
        self
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_consecutive_failures(&self) -> u32 {
        self.max_consecutive_failures
    }

    /// Terminal states compare case-insensitively.
    pub fn is_terminal(&self, state: &str) -> bool {
        self.terminal_states
            .iter()
            .any(|t| t.eq_ignore_ascii_case(state))
    }
}

#[derive(Serialize, Deserialize)]
struct PollTargetConfig {
    resource_id: String,
    terminal_states: Vec<String>,
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default = "default_max_consecutive_failures")]
    max_consecutive_failures: u32,
}

const fn default_poll_interval_ms() -> u64 {
    5_000
}

const fn default_timeout_ms() -> u64 {
    600_000
}

const fn default_max_consecutive_failures() -> u32 {
    DEFAULT_MAX_CONSECUTIVE_FAILURES
}

impl TryFrom<PollTargetConfig> for PollTarget {
    type Error = WatchError;

    fn try_from(config: PollTargetConfig) -> Result<Self, Self::Error> {
        Ok(Self::new(
            config.resource_id,
            config.terminal_states,
            Duration::from_millis(config.poll_interval_ms),
            Duration::from_millis(config.timeout_ms),
        )?
        .with_max_consecutive_failures(config.max_consecutive_failures))
    }
}

impl From<PollTarget> for PollTargetConfig {
    fn from(target: PollTarget) -> Self {
        Self {
            resource_id: target.resource_id,
            terminal_states: target.terminal_states.into_iter().collect(),
            poll_interval_ms: target.poll_interval.as_millis() as u64,
            timeout_ms: target.timeout.as_millis() as u64,
            max_consecutive_failures: target.max_consecutive_failures,
        }
    }
}

/// One observed resource status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub state: String,
    /// Full response body, when the fetcher has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl Status {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// One item of a watch sequence.
#[derive(Clone, Debug, PartialEq)]
pub enum PollUpdate {
    Observed(Status),
    /// A fetch failed; polling continues.
    Error(FetchError),
    /// The timeout elapsed before a terminal state. Ends the sequence.
    TimedOut,
    /// Too many consecutive fetch failures. Ends the sequence.
    Failed { failures: u32, last_error: FetchError },
}

/// Fetches the current status of a resource.
#[async_trait::async_trait]
pub trait StatusFetcher: Send + Sync {
    async fn fetch_status(&self, resource_id: &str) -> Result<Status, FetchError>;
}

/// Adapter returned by [`fetcher_fn`].
pub struct FnFetcher<F>(F);

/// Wraps an async closure as a [`StatusFetcher`].
pub fn fetcher_fn<F, Fut>(f: F) -> FnFetcher<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Status, FetchError>> + Send,
{
    FnFetcher(f)
}

#[async_trait::async_trait]
impl<F, Fut> StatusFetcher for FnFetcher<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Status, FetchError>> + Send,
{
    async fn fetch_status(&self, resource_id: &str) -> Result<Status, FetchError> {
        (self.0)(resource_id.to_string()).await
    }
}

/// Cooperative cancellation flag shared between a watch and its owner.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Polls one target until a terminal state, timeout, repeated failure or
/// cancellation.
#[derive(Clone)]
pub struct StatusWatcher {
    target: Arc<PollTarget>,
    fetcher: Arc<dyn StatusFetcher>,
}

impl StatusWatcher {
    pub fn new(target: PollTarget, fetcher: impl StatusFetcher + 'static) -> Self {
        Self::with_fetcher(target, Arc::new(fetcher))
    }

    pub fn with_fetcher(target: PollTarget, fetcher: Arc<dyn StatusFetcher>) -> Self {
        Self {
            target: Arc::new(target),
            fetcher,
        }
    }

    pub fn target(&self) -> &PollTarget {
        &self.target
    }

    /// Starts a fresh, lazy watch sequence. Nothing is fetched until the
    /// stream is polled; every call restarts the timeout clock.
    pub fn watch(&self) -> BoxStream<'static, PollUpdate> {
        self.watch_until(CancelToken::new())
    }

    /// Like [`watch`](Self::watch), ending early once `cancel` fires.
    pub fn watch_until(&self, cancel: CancelToken) -> BoxStream<'static, PollUpdate> {
        let ticker = Ticker {
            target: self.target.clone(),
            fetcher: self.fetcher.clone(),
            cancel,
            deadline: None,
            failures: 0,
            done: false,
        };
        futures::stream::unfold(ticker, Ticker::next_update).boxed()
    }

    /// Drives a watch on a spawned task and invokes `on_status` for every
    /// update until the sequence ends or the handle is cancelled.
    pub fn subscribe(
        &self,
        on_status: impl Fn(&PollUpdate) + Send + Sync + 'static,
    ) -> Result<WatchHandle, WatchError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| WatchError::NoRuntime)?;
        let cancel = CancelToken::new();
        let mut updates = self.watch_until(cancel.clone());
        let guard = cancel.clone();
        let resource = self.target.resource_id.clone();
        let span = watch_span(&resource);
        let task = runtime.spawn(
            async move {
                while let Some(update) = updates.next().await {
                    if guard.is_cancelled() {
                        break;
                    }
                    on_status(&update);
                }
                debug!(%resource, "status subscription ended");
            }
            .instrument(span),
        );
        Ok(WatchHandle {
            cancel,
            task: Some(task),
        })
    }
}

/// Handle for a subscribed watch. Dropping it cancels the watch.
pub struct WatchHandle {
    cancel: CancelToken,
    task: Option<JoinHandle<()>>,
}

impl WatchHandle {
    /// Stops further ticks. Once this returns no further callback starts; one
    /// already running on another worker thread may still finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the watch to end on its own (terminal state, timeout or
    /// failure).
    pub async fn finished(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Ticker {
    target: Arc<PollTarget>,
    fetcher: Arc<dyn StatusFetcher>,
    cancel: CancelToken,
    deadline: Option<Instant>,
    failures: u32,
    done: bool,
}

impl Ticker {
    async fn next_update(mut self) -> Option<(PollUpdate, Self)> {
        if self.done || self.cancel.is_cancelled() {
            return None;
        }
        let deadline = match self.deadline {
            Some(deadline) => {
                let wake = (Instant::now() + self.target.poll_interval).min(deadline);
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return None,
                    _ = tokio::time::sleep_until(wake) => {}
                }
                deadline
            }
            None => {
                let deadline = Instant::now() + self.target.timeout;
                self.deadline = Some(deadline);
                deadline
            }
        };

        if Instant::now() >= deadline {
            return Some(self.finish(PollUpdate::TimedOut));
        }

        let fetched = tokio::time::timeout_at(
            deadline,
            self.fetcher.fetch_status(&self.target.resource_id),
        )
        .await;
        if self.cancel.is_cancelled() {
            debug!(resource = %self.target.resource_id, "discarding fetch result after cancel");
            return None;
        }

        let update = match fetched {
            Err(_) => return Some(self.finish(PollUpdate::TimedOut)),
            Ok(Ok(status)) => {
                self.failures = 0;
                debug!(resource = %self.target.resource_id, state = %status.state, "status observed");
                if self.target.is_terminal(&status.state) {
                    info!(resource = %self.target.resource_id, state = %status.state, "terminal state reached");
                    self.done = true;
                }
                PollUpdate::Observed(status)
            }
            Ok(Err(err)) => {
                self.failures += 1;
                warn!(resource = %self.target.resource_id, attempt = self.failures, error = %err, "status fetch failed");
                if self.failures > self.target.max_consecutive_failures {
                    self.done = true;
                    PollUpdate::Failed {
                        failures: self.failures,
                        last_error: err,
                    }
                } else {
                    PollUpdate::Error(err)
                }
            }
        };
        Some((update, self))
    }

    fn finish(mut self, update: PollUpdate) -> (PollUpdate, Self) {
        if update == PollUpdate::TimedOut {
            info!(resource = %self.target.resource_id, "watch timed out");
        }
        self.done = true;
        (update, self)
    }
}

/// Which backend status resource an [`HttpStatusFetcher`] reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEndpoint {
    /// `GET {api}/clusters/{id}/progress`
    ClusterProgress,
    /// `GET {api}/deployments/{id}`
    Deployment,
}

/// Reads resource status from the console backend over HTTP.
#[derive(Clone)]
pub struct HttpStatusFetcher {
    client: reqwest::Client,
    base_url: String,
    endpoint: StatusEndpoint,
}

impl HttpStatusFetcher {
    pub fn new(
        base_url: impl Into<String>,
        endpoint: StatusEndpoint,
        request_timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| FetchError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, base_url, endpoint))
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        endpoint: StatusEndpoint,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            endpoint,
        }
    }

    pub fn url(&self, resource_id: &str) -> String {
        match self.endpoint {
            StatusEndpoint::ClusterProgress => {
                format!("{}/clusters/{resource_id}/progress", self.base_url)
            }
            StatusEndpoint::Deployment => format!("{}/deployments/{resource_id}", self.base_url),
        }
    }
}

#[async_trait::async_trait]
impl StatusFetcher for HttpStatusFetcher {
    async fn fetch_status(&self, resource_id: &str) -> Result<Status, FetchError> {
        let url = self.url(resource_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transport(format!("failed to read body: {e}")))?;
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| FetchError::InvalidBody(format!("{e}: {body}")))?;
        parse_status_body(value)
    }
}

/// Maps a backend status body to a [`Status`]. Accepts `status` or `state`;
/// `{"error": ...}` is a server-side failure.
pub(crate) fn parse_status_body(value: serde_json::Value) -> Result<Status, FetchError> {
    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let message = error
            .as_str()
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| error.to_string());
        return Err(FetchError::Server(message));
    }
    let state = value
        .get("status")
        .or_else(|| value.get("state"))
        .and_then(|s| s.as_str())
        .ok_or_else(|| FetchError::InvalidBody(format!("no status field in {value}")))?
        .to_string();
    Ok(Status::new(state).with_detail(value))
}
