//! Live event-stream client for the LLM deployment console.
//!
//! The crate turns the console backend's push streams (pod logs over
//! WebSocket, token streams over server-sent events) into ordered
//! [`StreamEvent`]s, keeps one logical [`StreamSession`] alive across
//! reconnects, folds events into bounded or growing transcripts, and polls
//! slow-moving resources until they reach a terminal state.
//!
//! # Tailing deployment logs
//!
//! ```no_run
//! use console_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ConsoleError> {
//! let config = ConsoleConfig::from_env()?;
//! let live = LiveTranscript::acquire(
//!     log_session(&config, "llama-8b", Some(PodType::Vllm)),
//!     log_assembler(&config, Redelivery::None),
//! )?;
//! live.on_event(|event| println!("{event}"));
//! live.settled().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Waiting for a cluster
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use console_stream::prelude::*;
//! use futures::StreamExt as _;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let target = PollTarget::new(
//!     "cluster-1",
//!     ["RUNNING", "ERROR"],
//!     Duration::from_secs(5),
//!     Duration::from_secs(600),
//! )?;
//! let fetcher = HttpStatusFetcher::new(
//!     "http://localhost:8000",
//!     StatusEndpoint::ClusterProgress,
//!     Duration::from_secs(10),
//! )?;
//! let mut updates = StatusWatcher::new(target, fetcher).watch();
//! while let Some(update) = updates.next().await {
//!     println!("{update:?}");
//! }
//! # Ok(())
//! # }
//! ```

/// Render binding: scoped session lifetime and session factories.
pub mod binding;
/// Streaming chat completion request bodies.
pub mod chat;
/// Backend endpoints and environment configuration.
pub mod config;
/// Wire decoders and per-connection frame reassembly.
pub mod decode;
/// Public error types.
pub mod errors;
/// Decoded stream events.
pub mod event;
/// Process-wide tracing setup.
pub mod observability;
/// Reconnect policies.
pub mod policy;
/// Common imports for typical usage.
pub mod prelude;
/// Reconnecting stream session.
pub mod session;
/// Incremental transcript assembly.
pub mod transcript;
/// Transport capability and its WebSocket/HTTP implementations.
pub mod transport;
/// Poll-until-terminal status watching.
pub mod watch;

pub use binding::{LiveTranscript, chat_session, log_assembler, log_session};
pub use chat::ChatRequest;
pub use config::{ConsoleConfig, PodType};
pub use decode::{
    DEFAULT_MAX_RECORD_BYTES, FrameBuffer, FrameDecoder, Frames, JsonLinesDecoder, SseDecoder,
    WireFormat,
};
pub use errors::{
    ConnectionError, ConsoleError, DecodeError, DecodeErrorKind, FetchError, InvalidPolicy,
    SessionError, WatchError,
};
pub use event::{ControlSignal, EventKind, Level, StreamEvent};
pub use observability::{ObservabilityConfig, init_observability, init_observability_with};
pub use policy::ReconnectPolicy;
pub use session::{SessionOptions, SessionState, StreamSession, SubscriptionId};
pub use transcript::{
    Assembler, ChatSnapshot, ChatTurn, LogSnapshot, Redelivery, Role, Transcript,
};
pub use transport::{ConnectRequest, HttpStreamTransport, Transport, WebSocketTransport};
pub use watch::{
    CancelToken, HttpStatusFetcher, PollTarget, PollUpdate, Status, StatusEndpoint,
    StatusFetcher, StatusWatcher, WatchHandle, fetcher_fn,
};
