//! Common imports for typical console-stream usage.
pub use crate::{
    Assembler, ChatRequest, ConsoleConfig, ConsoleError, ControlSignal, HttpStatusFetcher,
    LiveTranscript, PodType, PollTarget, PollUpdate, Redelivery, SessionOptions, SessionState,
    Status, StatusEndpoint, StatusWatcher, StreamEvent, StreamSession, Transcript, chat_session,
    log_assembler, log_session,
};
