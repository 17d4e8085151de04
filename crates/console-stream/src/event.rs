use std::fmt;

/// Severity carried by a log record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    /// Parses a wire level name. `WARN` is accepted as an alias of `WARNING`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "INFO" => Some(Self::Info),
            "WARNING" | "WARN" => Some(Self::Warning),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synthetic signals a session or decoder emits alongside data.
///
/// Consumers may render them but must never treat them as transcript data.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    /// A physical connection was opened.
    Connected,
    /// The physical connection closed or failed; the payload carries the reason.
    Disconnected,
    /// The producer signalled the end of the current turn/stream.
    EndOfTurn,
    /// One record in a chunk could not be decoded.
    DecodeFailed,
    /// The server pushed an error message instead of data.
    ServerError,
    /// Automatic reconnects gave up.
    RetriesExhausted,
}

/// What an event carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "signal", rename_all = "snake_case")]
pub enum EventKind {
    LogLine,
    TokenDelta,
    Control(ControlSignal),
}

/// One discrete application event decoded from a transport chunk.
///
/// Events are immutable once constructed; use the accessors to read them.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StreamEvent {
    sequence_hint: Option<u64>,
    timestamp: String,
    level: Option<Level>,
    payload: String,
    kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
}

impl StreamEvent {
    /// Creates a log line event.
    pub fn log_line(
        timestamp: impl Into<String>,
        level: Option<Level>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            sequence_hint: None,
            timestamp: timestamp.into(),
            level,
            payload: payload.into(),
            kind: EventKind::LogLine,
            source: None,
        }
    }

    /// Creates a token delta. Deltas never carry a sequence hint: they are
    /// ordered by arrival within one physical connection.
    pub fn token_delta(payload: impl Into<String>) -> Self {
        Self {
            sequence_hint: None,
            timestamp: String::new(),
            level: None,
            payload: payload.into(),
            kind: EventKind::TokenDelta,
            source: None,
        }
    }

    /// Creates a control event.
    pub fn control(
        signal: ControlSignal,
        timestamp: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        let level = match signal {
            ControlSignal::ServerError
            | ControlSignal::DecodeFailed
            | ControlSignal::RetriesExhausted => Some(Level::Error),
            ControlSignal::Disconnected => Some(Level::Warning),
            ControlSignal::Connected | ControlSignal::EndOfTurn => None,
        };
        Self {
            sequence_hint: None,
            timestamp: timestamp.into(),
            level,
            payload: payload.into(),
            kind: EventKind::Control(signal),
            source: None,
        }
    }

    /// Creates a control event stamped with the current wall-clock time.
    pub(crate) fn control_now(signal: ControlSignal, payload: impl Into<String>) -> Self {
        Self::control(signal, chrono::Utc::now().to_rfc3339(), payload)
    }

    /// Attaches a producer-assigned sequence hint. Ignored for token deltas.
    pub fn with_sequence_hint(mut self, hint: u64) -> Self {
        if self.kind != EventKind::TokenDelta {
            self.sequence_hint = Some(hint);
        }
        self
    }

    /// Attaches the emitting source (pod or container name).
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn sequence_hint(&self) -> Option<u64> {
        self.sequence_hint
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn level(&self) -> Option<Level> {
        self.level
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Returns the control signal for control events.
    pub fn control_signal(&self) -> Option<ControlSignal> {
        match self.kind {
            EventKind::Control(signal) => Some(signal),
            _ => None,
        }
    }

    /// True for log lines and token deltas.
    pub fn is_data(&self) -> bool {
        !matches!(self.kind, EventKind::Control(_))
    }
}

impl fmt::Display for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.timestamp.is_empty() {
            write!(f, "[{}] ", self.timestamp)?;
        }
        if let Some(level) = self.level {
            write!(f, "{level} ")?;
        }
        if let Some(source) = &self.source {
            write!(f, "{source}: ")?;
        }
        f.write_str(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parse_accepts_aliases_and_case() {
        assert_eq!(Level::parse("info"), Some(Level::Info));
        assert_eq!(Level::parse(" WARN "), Some(Level::Warning));
        assert_eq!(Level::parse("Error"), Some(Level::Error));
        assert_eq!(Level::parse("trace"), None);
    }

    #[test]
    fn token_delta_ignores_sequence_hint() {
        let delta = StreamEvent::token_delta("hi").with_sequence_hint(4);
        assert_eq!(delta.sequence_hint(), None);
        let line = StreamEvent::log_line("t", None, "x").with_sequence_hint(4);
        assert_eq!(line.sequence_hint(), Some(4));
    }

    #[test]
    fn control_events_are_not_data() {
        let event = StreamEvent::control(ControlSignal::Disconnected, "t", "socket closed");
        assert!(!event.is_data());
        assert_eq!(event.control_signal(), Some(ControlSignal::Disconnected));
        assert_eq!(event.level(), Some(Level::Warning));
    }

    #[test]
    fn display_includes_source_and_level() {
        let event = StreamEvent::log_line("12:00:01", Some(Level::Info), "ready")
            .with_source("llama-vllm-0");
        assert_eq!(event.to_string(), "[12:00:01] INFO llama-vllm-0: ready");
    }
}
