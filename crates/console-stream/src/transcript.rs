//! Incremental transcript assembly.
//!
//! An [`Assembler`] folds stream events into either a bounded log transcript
//! or a growing chat transcript. Consumers never see the live state: they get
//! immutable snapshots taken under the assembler's lock.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::debug;

use crate::event::{ControlSignal, EventKind, StreamEvent};
use crate::session::{StreamSession, SubscriptionId};

/// Default number of log entries kept.
pub const DEFAULT_LOG_RETENTION: usize = 1000;

/// Whether the source may deliver the same record more than once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Redelivery {
    /// Every data event is appended.
    #[default]
    None,
    /// Data events whose timestamp+payload key is already retained are skipped.
    Possible,
}

/// Point-in-time copy of a log transcript.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LogSnapshot {
    /// Retained entries, oldest first. Control events are included as
    /// renderable markers.
    pub entries: Vec<StreamEvent>,
    /// Entries evicted by the retention bound so far.
    pub evicted: u64,
    pub revision: u64,
}

impl LogSnapshot {
    /// Data entries only, skipping control markers.
    pub fn lines(&self) -> impl Iterator<Item = &StreamEvent> {
        self.entries.iter().filter(|e| e.is_data())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One completed chat turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Point-in-time copy of a chat transcript.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ChatSnapshot {
    pub turns: Vec<ChatTurn>,
    /// Text of the turn still being streamed.
    pub accumulator: String,
    /// Last error the server pushed into the stream.
    pub last_error: Option<String>,
    /// Partial reply set aside when its connection was lost. A retried
    /// request streams the reply again from the start.
    pub interrupted: Option<String>,
    pub revision: u64,
}

/// Immutable transcript snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transcript {
    Log(LogSnapshot),
    Chat(ChatSnapshot),
}

impl Transcript {
    pub fn revision(&self) -> u64 {
        match self {
            Self::Log(log) => log.revision,
            Self::Chat(chat) => chat.revision,
        }
    }

    pub fn as_log(&self) -> Option<&LogSnapshot> {
        match self {
            Self::Log(log) => Some(log),
            Self::Chat(_) => None,
        }
    }

    pub fn as_chat(&self) -> Option<&ChatSnapshot> {
        match self {
            Self::Chat(chat) => Some(chat),
            Self::Log(_) => None,
        }
    }
}

type DedupKey = String;

fn dedup_key(event: &StreamEvent) -> DedupKey {
    let mut hasher = Sha256::new();
    hasher.update(event.timestamp().as_bytes());
    hasher.update([0u8]);
    hasher.update(event.payload().as_bytes());
    hex::encode(hasher.finalize())
}

struct LogState {
    retention: usize,
    redelivery: Redelivery,
    entries: VecDeque<(Option<DedupKey>, StreamEvent)>,
    retained_keys: HashSet<DedupKey>,
    evicted: u64,
}

impl LogState {
    fn apply(&mut self, event: &StreamEvent) -> bool {
        let key = match (self.redelivery, event.is_data()) {
            (Redelivery::Possible, true) => {
                let key = dedup_key(event);
                if self.retained_keys.contains(&key) {
                    debug!(payload = event.payload(), "skipping redelivered record");
                    return false;
                }
                self.retained_keys.insert(key.clone());
                Some(key)
            }
            _ => None,
        };
        self.entries.push_back((key, event.clone()));
        while self.entries.len() > self.retention {
            if let Some((Some(key), _)) = self.entries.pop_front() {
                self.retained_keys.remove(&key);
            }
            self.evicted += 1;
        }
        true
    }

    fn snapshot(&self, revision: u64) -> LogSnapshot {
        LogSnapshot {
            entries: self.entries.iter().map(|(_, e)| e.clone()).collect(),
            evicted: self.evicted,
            revision,
        }
    }
}

#[derive(Default)]
struct ChatState {
    turns: Vec<ChatTurn>,
    accumulator: String,
    last_error: Option<String>,
    interrupted: Option<String>,
}

impl ChatState {
    fn apply(&mut self, event: &StreamEvent) -> bool {
        match event.kind() {
            EventKind::TokenDelta => {
                self.accumulator.push_str(event.payload());
                true
            }
            EventKind::Control(ControlSignal::EndOfTurn) => {
                self.interrupted = None;
                self.turns.push(ChatTurn {
                    role: Role::Assistant,
                    content: std::mem::take(&mut self.accumulator),
                });
                true
            }
            EventKind::Control(ControlSignal::Disconnected) => {
                if self.accumulator.is_empty() {
                    return false;
                }
                debug!(len = self.accumulator.len(), "setting aside interrupted reply");
                self.interrupted = Some(std::mem::take(&mut self.accumulator));
                true
            }
            EventKind::Control(ControlSignal::ServerError) => {
                self.last_error = Some(event.payload().to_string());
                true
            }
            EventKind::Control(_) => false,
            EventKind::LogLine => {
                debug!("ignoring log line in chat transcript");
                false
            }
        }
    }

    fn snapshot(&self, revision: u64) -> ChatSnapshot {
        ChatSnapshot {
            turns: self.turns.clone(),
            accumulator: self.accumulator.clone(),
            last_error: self.last_error.clone(),
            interrupted: self.interrupted.clone(),
            revision,
        }
    }
}

enum TranscriptState {
    Log(LogState),
    Chat(ChatState),
}

struct Inner {
    state: Mutex<TranscriptState>,
    revision_tx: watch::Sender<u64>,
}

/// Folds events into a transcript. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Assembler {
    inner: Arc<Inner>,
}

impl Assembler {
    /// Log transcript keeping at most `retention` entries (minimum 1).
    pub fn log(retention: usize, redelivery: Redelivery) -> Self {
        Self::with_state(TranscriptState::Log(LogState {
            retention: retention.max(1),
            redelivery,
            entries: VecDeque::new(),
            retained_keys: HashSet::new(),
            evicted: 0,
        }))
    }

    pub fn chat() -> Self {
        Self::with_state(TranscriptState::Chat(ChatState::default()))
    }

    fn with_state(state: TranscriptState) -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                revision_tx,
            }),
        }
    }

    /// Applies one event. Returns true when the transcript changed.
    pub fn apply(&self, event: &StreamEvent) -> bool {
        let mut state = self.inner.state.lock();
        let changed = match &mut *state {
            TranscriptState::Log(log) => log.apply(event),
            TranscriptState::Chat(chat) => chat.apply(event),
        };
        if changed {
            self.bump();
        }
        changed
    }

    /// Records a user prompt as a completed turn. No-op for log transcripts.
    pub fn push_user_turn(&self, content: impl Into<String>) -> bool {
        let mut state = self.inner.state.lock();
        let TranscriptState::Chat(chat) = &mut *state else {
            return false;
        };
        chat.turns.push(ChatTurn {
            role: Role::User,
            content: content.into(),
        });
        self.bump();
        true
    }

    /// Keeps the reply cut off by a lost connection as a finished assistant
    /// turn, instead of waiting for a retried request to stream it again.
    /// Returns false when nothing was cut off.
    pub fn keep_interrupted_reply(&self) -> bool {
        let mut state = self.inner.state.lock();
        let TranscriptState::Chat(chat) = &mut *state else {
            return false;
        };
        let content = match chat.interrupted.take() {
            Some(partial) => partial,
            None if !chat.accumulator.is_empty() => std::mem::take(&mut chat.accumulator),
            None => return false,
        };
        chat.turns.push(ChatTurn {
            role: Role::Assistant,
            content,
        });
        self.bump();
        true
    }

    /// Immutable copy of the transcript.
    pub fn snapshot(&self) -> Transcript {
        let state = self.inner.state.lock();
        let revision = *self.inner.revision_tx.borrow();
        match &*state {
            TranscriptState::Log(log) => Transcript::Log(log.snapshot(revision)),
            TranscriptState::Chat(chat) => Transcript::Chat(chat.snapshot(revision)),
        }
    }

    pub fn revision(&self) -> u64 {
        *self.inner.revision_tx.borrow()
    }

    /// Receiver notified with the new revision after every change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision_tx.subscribe()
    }

    /// Subscribes to `session`; every forwarded event is applied in order.
    pub fn attach(&self, session: &StreamSession) -> SubscriptionId {
        let assembler = self.clone();
        session.on_event(move |event| {
            assembler.apply(event);
        })
    }

    // Callers hold the state lock.
    fn bump(&self) {
        self.inner.revision_tx.send_modify(|rev| *rev += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{FakeTransport, log_line, wait_state};
    use crate::session::{SessionOptions, SessionState};
    use crate::transport::{ConnectRequest, TransportEvent};
    use std::time::Duration;

    fn line(ts: &str, payload: &str) -> StreamEvent {
        StreamEvent::log_line(ts, None, payload)
    }

    #[test]
    fn retention_keeps_last_entries_oldest_first() {
        let assembler = Assembler::log(100, Redelivery::None);
        for i in 0..150 {
            assembler.apply(&line(&format!("t{i}"), &format!("line {i}")));
        }
        let snapshot = assembler.snapshot();
        let log = snapshot.as_log().expect("log transcript");
        assert_eq!(log.entries.len(), 100);
        assert_eq!(log.entries[0].payload(), "line 50");
        assert_eq!(log.entries[99].payload(), "line 149");
        assert_eq!(log.evicted, 50);
        assert_eq!(log.revision, 150);
    }

    #[test]
    fn token_deltas_finalize_into_one_turn() {
        let assembler = Assembler::chat();
        for delta in ["Hel", "lo, ", "world"] {
            assembler.apply(&StreamEvent::token_delta(delta));
        }
        assembler.apply(&StreamEvent::control(ControlSignal::EndOfTurn, "", ""));

        let snapshot = assembler.snapshot();
        let chat = snapshot.as_chat().expect("chat transcript");
        assert_eq!(
            chat.turns,
            vec![ChatTurn {
                role: Role::Assistant,
                content: "Hello, world".into()
            }]
        );
        assert!(chat.accumulator.is_empty());
    }

    #[test]
    fn end_of_turn_with_empty_accumulator_appends_empty_turn() {
        let assembler = Assembler::chat();
        assert!(assembler.push_user_turn("hi"));
        assembler.apply(&StreamEvent::control(ControlSignal::EndOfTurn, "", ""));
        let snapshot = assembler.snapshot();
        let chat = snapshot.as_chat().expect("chat transcript");
        assert_eq!(chat.turns.len(), 2);
        assert_eq!(chat.turns[0].role, Role::User);
        assert_eq!(chat.turns[1].content, "");
    }

    #[test]
    fn server_error_is_kept_on_chat_snapshot() {
        let assembler = Assembler::chat();
        assembler.apply(&StreamEvent::token_delta("partial"));
        assembler.apply(&StreamEvent::control(ControlSignal::ServerError, "", "model not loaded"));
        let snapshot = assembler.snapshot();
        let chat = snapshot.as_chat().expect("chat transcript");
        assert_eq!(chat.last_error.as_deref(), Some("model not loaded"));
        assert_eq!(chat.accumulator, "partial");
    }

    #[test]
    fn disconnect_sets_partial_reply_aside() {
        let assembler = Assembler::chat();
        assembler.apply(&StreamEvent::token_delta("Hel"));
        assert!(assembler.apply(&StreamEvent::control(ControlSignal::Disconnected, "", "reset")));
        assert!(!assembler.apply(&StreamEvent::control(ControlSignal::Disconnected, "", "reset")));

        let snapshot = assembler.snapshot();
        let chat = snapshot.as_chat().expect("chat transcript");
        assert!(chat.accumulator.is_empty());
        assert_eq!(chat.interrupted.as_deref(), Some("Hel"));

        assert!(assembler.keep_interrupted_reply());
        assert!(!assembler.keep_interrupted_reply());
        let snapshot = assembler.snapshot();
        let chat = snapshot.as_chat().expect("chat transcript");
        assert_eq!(chat.turns[0].content, "Hel");
        assert_eq!(chat.interrupted, None);
    }

    #[tokio::test]
    async fn retried_token_stream_replaces_interrupted_reply() {
        let transport = Arc::new(FakeTransport::default());
        let first = transport.push_connection();
        let second = transport.push_connection();
        let session = StreamSession::new(
            transport.clone(),
            ConnectRequest::get("fake://chat"),
            SessionOptions::token_stream(),
        );
        let assembler = Assembler::chat();
        assembler.attach(&session);

        session.start().expect("start");
        wait_state(&session, SessionState::Open).await;
        first
            .send(TransportEvent::Chunk(bytes::Bytes::from_static(b"data: Hel\n\n")))
            .expect("send");
        drop(first);
        wait_state(&session, SessionState::Reconnecting).await;
        session.reconnect().expect("reconnect");

        wait_state(&session, SessionState::Open).await;
        second
            .send(TransportEvent::Chunk(bytes::Bytes::from_static(
                b"data: Hello, world\n\ndata: [DONE]\n\n",
            )))
            .expect("send");
        drop(second);
        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .expect("closed in time");

        let snapshot = assembler.snapshot();
        let chat = snapshot.as_chat().expect("chat transcript");
        assert_eq!(
            chat.turns,
            vec![ChatTurn {
                role: Role::Assistant,
                content: "Hello, world".into()
            }]
        );
        assert!(chat.accumulator.is_empty());
        assert_eq!(chat.interrupted, None);
    }

    #[test]
    fn redelivered_records_are_skipped_when_possible() {
        let assembler = Assembler::log(10, Redelivery::Possible);
        assert!(assembler.apply(&line("t1", "a")));
        assert!(!assembler.apply(&line("t1", "a")));
        assert!(assembler.apply(&line("t2", "a")));
        let marker = StreamEvent::control(ControlSignal::Disconnected, "t3", "gone");
        assert!(assembler.apply(&marker));
        assert!(assembler.apply(&marker), "control markers are never deduplicated");

        let snapshot = assembler.snapshot();
        assert_eq!(snapshot.as_log().expect("log").entries.len(), 4);
    }

    #[test]
    fn duplicates_are_kept_without_redelivery() {
        let assembler = Assembler::log(10, Redelivery::None);
        assembler.apply(&line("t1", "a"));
        assembler.apply(&line("t1", "a"));
        let snapshot = assembler.snapshot();
        assert_eq!(snapshot.as_log().expect("log").entries.len(), 2);
    }

    #[test]
    fn evicted_keys_are_forgotten() {
        let assembler = Assembler::log(1, Redelivery::Possible);
        assembler.apply(&line("t1", "a"));
        assembler.apply(&line("t2", "b"));
        assert!(assembler.apply(&line("t1", "a")));
    }

    #[test]
    fn user_turn_is_ignored_by_log_transcripts() {
        let assembler = Assembler::log(5, Redelivery::None);
        assert!(!assembler.push_user_turn("hello"));
        assert_eq!(assembler.revision(), 0);
    }

    #[tokio::test]
    async fn changes_observe_each_revision() {
        let assembler = Assembler::chat();
        let mut changes = assembler.changes();
        assembler.apply(&StreamEvent::token_delta("x"));
        changes.changed().await.expect("revision");
        assert_eq!(*changes.borrow_and_update(), 1);
        assert!(!assembler.apply(&StreamEvent::control(ControlSignal::Connected, "", "")));
        assert!(!changes.has_changed().expect("sender alive"));
    }

    #[tokio::test]
    async fn order_survives_two_forced_reconnects() {
        let transport = Arc::new(FakeTransport::default());
        let first = transport.push_connection();
        let second = transport.push_connection();
        let third = transport.push_connection();
        let session = StreamSession::new(
            transport.clone(),
            ConnectRequest::get("fake://logs"),
            SessionOptions::log_stream(),
        );
        let assembler = Assembler::log(DEFAULT_LOG_RETENTION, Redelivery::None);
        assembler.attach(&session);

        session.start().expect("start");
        wait_state(&session, SessionState::Open).await;
        first.send(log_line("a")).expect("send");
        first.send(log_line("b")).expect("send");
        drop(first);
        wait_state(&session, SessionState::Reconnecting).await;
        session.reconnect().expect("reconnect");

        wait_state(&session, SessionState::Open).await;
        second.send(log_line("c")).expect("send");
        second.send(log_line("d")).expect("send");
        drop(second);
        wait_state(&session, SessionState::Reconnecting).await;
        session.reconnect().expect("reconnect");

        wait_state(&session, SessionState::Open).await;
        third.send(log_line("e")).expect("send");

        let mut changes = assembler.changes();
        tokio::time::timeout(Duration::from_secs(5), changes.wait_for(|rev| *rev >= 10))
            .await
            .expect("all events applied")
            .expect("revision channel");

        let snapshot = assembler.snapshot();
        let log = snapshot.as_log().expect("log");
        let data: Vec<&str> = log.lines().map(|e| e.payload()).collect();
        assert_eq!(data, vec!["a", "b", "c", "d", "e"]);
        let disconnects = log
            .entries
            .iter()
            .filter(|e| e.control_signal() == Some(ControlSignal::Disconnected))
            .count();
        assert_eq!(disconnects, 2);
        assert_eq!(log.entries[3].control_signal(), Some(ControlSignal::Disconnected));
    }
}
