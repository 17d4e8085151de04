use crate::errors::DecodeError;
use crate::event::{ControlSignal, StreamEvent};

use super::{DecodeResult, FrameDecoder, RecordBoundary};

/// Decoder for server-sent-event token streams.
///
/// Only `data:` lines are significant; every other line is ignored. The
/// data lines of one event are joined with `\n` into a single payload. The
/// sentinel payload (`[DONE]`) ends the turn. JSON payloads in the
/// chat-completions shape are unwrapped to their delta text, any other
/// payload is a verbatim text delta.
#[derive(Clone, Debug)]
pub struct SseDecoder {
    data_prefix: String,
    done_sentinel: String,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self {
            data_prefix: "data:".to_string(),
            done_sentinel: "[DONE]".to_string(),
        }
    }
}

impl SseDecoder {
    /// Overrides the end-of-stream sentinel.
    pub fn done_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.done_sentinel = sentinel.into();
        self
    }

    fn decode_payload(&self, index: usize, payload: &str) -> Option<DecodeResult> {
        if payload.trim() == self.done_sentinel {
            return Some(Ok(StreamEvent::control(
                ControlSignal::EndOfTurn,
                "",
                payload.trim(),
            )));
        }
        if !payload.trim_start().starts_with('{') {
            if payload.is_empty() {
                return None;
            }
            return Some(Ok(StreamEvent::token_delta(payload)));
        }

        let value: serde_json::Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                return Some(Err(DecodeError::malformed(
                    index,
                    payload,
                    format!("invalid SSE JSON frame: {e}"),
                )));
            }
        };
        map_json_payload(&value).map(Ok)
    }
}

impl FrameDecoder for SseDecoder {
    fn decode(&self, chunk: &[u8]) -> Vec<DecodeResult> {
        let text = String::from_utf8_lossy(chunk);
        let mut payloads = Vec::new();
        let mut data: Option<String> = None;
        for line in text.split('\n').map(|line| line.trim_end_matches('\r')) {
            if line.is_empty() {
                payloads.extend(data.take());
                continue;
            }
            let Some(rest) = line.strip_prefix(self.data_prefix.as_str()) else {
                continue;
            };
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            match &mut data {
                Some(joined) => {
                    joined.push('\n');
                    joined.push_str(rest);
                }
                None => data = Some(rest.to_string()),
            }
        }
        payloads.extend(data);

        payloads
            .iter()
            .enumerate()
            .filter_map(|(index, payload)| self.decode_payload(index, payload))
            .collect()
    }

    fn boundary(&self) -> RecordBoundary {
        RecordBoundary::BlankLine
    }
}

fn map_json_payload(value: &serde_json::Value) -> Option<StreamEvent> {
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .or_else(|| error.as_str())
            .unwrap_or("stream error");
        return Some(StreamEvent::control(ControlSignal::ServerError, "", message));
    }
    let choice = value.get("choices")?.as_array()?.first()?;
    let text = choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(|v| v.as_str())
        .or_else(|| choice.get("text").and_then(|v| v.as_str()))?;
    if text.is_empty() {
        return None;
    }
    Some(StreamEvent::token_delta(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn payloads(results: &[DecodeResult]) -> Vec<String> {
        results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|e| e.payload().to_string())
            .collect()
    }

    #[test]
    fn only_data_lines_are_significant() {
        let chunk = b": keep-alive\nevent: message\nid: 3\ndata: Hel\n\nretry: 10\ndata: lo\n\n";
        let results = SseDecoder::default().decode(chunk);
        assert_eq!(payloads(&results), vec!["Hel", "lo"]);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn payload_whitespace_is_preserved_after_single_prefix_space() {
        let results = SseDecoder::default().decode(b"data:  world \n\n");
        assert_eq!(payloads(&results), vec![" world "]);
    }

    #[test]
    fn data_lines_of_one_event_keep_their_line_breaks() {
        let chunk = b"data: first line\ndata: second line\n\ndata: {\"choices\":\ndata: [{\"text\":\"json\"}]}\n\n";
        let results = SseDecoder::default().decode(chunk);
        assert_eq!(payloads(&results), vec!["first line\nsecond line", "json"]);
    }

    #[test]
    fn done_sentinel_is_end_of_turn_control() {
        let results = SseDecoder::default().decode(b"data: Hi\n\ndata: [DONE]\n\n");
        let kinds: Vec<EventKind> = results
            .iter()
            .map(|r| r.as_ref().expect("decodes").kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::TokenDelta,
                EventKind::Control(ControlSignal::EndOfTurn)
            ]
        );
    }

    #[test]
    fn unwraps_chat_completion_deltas() {
        let chunk = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        );
        let results = SseDecoder::default().decode(chunk.as_bytes());
        assert_eq!(payloads(&results), vec!["Hello"]);
    }

    #[test]
    fn error_payload_is_server_error_and_broken_json_is_malformed() {
        let chunk = b"data: {\"error\":{\"message\":\"model overloaded\"}}\n\ndata: {\"choices\":\n\n";
        let results = SseDecoder::default().decode(chunk);
        assert_eq!(results.len(), 2);
        let first = results[0].as_ref().expect("error frame decodes");
        assert_eq!(first.control_signal(), Some(ControlSignal::ServerError));
        assert_eq!(first.payload(), "model overloaded");
        let err = results[1].as_ref().expect_err("truncated JSON");
        assert_eq!(err.index, 1);
    }

    #[test]
    fn custom_sentinel_is_honoured() {
        let decoder = SseDecoder::default().done_sentinel("<eos>");
        let results = decoder.decode(b"data: [DONE]\n\ndata: <eos>\n\n");
        assert_eq!(results[0].as_ref().expect("delta").kind(), EventKind::TokenDelta);
        assert_eq!(
            results[1].as_ref().expect("control").control_signal(),
            Some(ControlSignal::EndOfTurn)
        );
    }
}
