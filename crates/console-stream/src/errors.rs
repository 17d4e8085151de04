use crate::session::SessionState;

/// Why a single record could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeErrorKind {
    /// The record is not valid for the wire format (bad JSON, missing fields).
    MalformedRecord,
    /// The record outgrew the frame buffer limit and was dropped.
    OversizedRecord,
}

impl DecodeErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedRecord => "malformed",
            Self::OversizedRecord => "oversized",
        }
    }
}

/// Per-record decode failure. Never fatal for the chunk or the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} record #{index}: {message}", .kind.as_str())]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    /// Zero-based position of the record within its chunk.
    pub index: usize,
    /// The raw record text.
    pub record: String,
    pub message: String,
}

impl DecodeError {
    pub(crate) fn malformed(
        index: usize,
        record: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: DecodeErrorKind::MalformedRecord,
            index,
            record: record.into(),
            message: message.into(),
        }
    }

    pub(crate) fn oversized(head: &[u8], limit: usize) -> Self {
        const SHOWN: usize = 128;
        let shown = &head[..head.len().min(SHOWN)];
        Self {
            kind: DecodeErrorKind::OversizedRecord,
            index: 0,
            record: String::from_utf8_lossy(shown).into_owned(),
            message: format!("no record boundary within {limit} bytes"),
        }
    }
}

/// Failure of a physical connection. Moves the session to `Reconnecting`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The endpoint refused or rejected the connection attempt.
    #[error("connection refused ({url}): {message}")]
    Refused { url: String, message: String },
    /// I/O on an established connection failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// The peer violated the transport protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ConnectionError {
    pub fn refused(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Refused {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

/// Failure of one status fetch. Non-fatal per tick.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum FetchError {
    /// Endpoint answered with a non-success status.
    #[error("status request failed with {status}: {body}")]
    Http { status: u16, body: String },
    /// Request could not be sent or the body could not be read.
    #[error("status request transport error: {0}")]
    Transport(String),
    /// Response body was not a status object.
    #[error("invalid status body: {0}")]
    InvalidBody(String),
    /// Server reported an error in the body.
    #[error("server error: {0}")]
    Server(String),
}

/// Misuse of the session API. Returned synchronously.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("session already started (state: {0})")]
    AlreadyStarted(SessionState),
    #[error("cannot {operation} while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: SessionState,
    },
    #[error("no open connection")]
    NotOpen,
    #[error("no tokio runtime available to drive the session")]
    NoRuntime,
}

/// Misuse of the watcher API. Returned synchronously.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    #[error("invalid poll target: {0}")]
    InvalidTarget(String),
    #[error("no tokio runtime available to drive the watch")]
    NoRuntime,
}

/// Reconnect policy values that would retry without pause or never settle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid reconnect policy: {0}")]
pub struct InvalidPolicy(pub String);

/// Top-level error for configuration and application plumbing.
#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl ConsoleError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
