use crate::errors::DecodeError;
use crate::event::{ControlSignal, Level, StreamEvent};

use super::{DecodeResult, FrameDecoder, RecordBoundary};

/// Decoder for newline-delimited JSON log records.
///
/// Accepts both `{timestamp, level, message}` records and the pod log shape
/// `{timestamp, pod_name, container_name, log}`. `{"error": ...}` records are
/// surfaced as `ServerError` control events.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonLinesDecoder;

#[derive(serde::Deserialize)]
struct LogRecord {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    log: Option<String>,
    #[serde(default)]
    pod_name: Option<String>,
    #[serde(default)]
    container_name: Option<String>,
    #[serde(default)]
    seq: Option<u64>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

impl FrameDecoder for JsonLinesDecoder {
    fn decode(&self, chunk: &[u8]) -> Vec<DecodeResult> {
        let text = String::from_utf8_lossy(chunk);
        text.split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(index, line)| decode_record(index, line))
            .collect()
    }

    fn boundary(&self) -> RecordBoundary {
        RecordBoundary::Newline
    }
}

fn decode_record(index: usize, line: &str) -> DecodeResult {
    let record: LogRecord = serde_json::from_str(line)
        .map_err(|e| DecodeError::malformed(index, line, format!("invalid JSON record: {e}")))?;
    let timestamp = record.timestamp.unwrap_or_default();

    if let Some(error) = record.error {
        let message = match error {
            serde_json::Value::String(s) => s,
            other => other
                .get("message")
                .and_then(|v| v.as_str())
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| other.to_string()),
        };
        return Ok(StreamEvent::control(
            ControlSignal::ServerError,
            timestamp,
            message,
        ));
    }

    let level = match record.level.as_deref() {
        None => None,
        Some(raw) => Some(Level::parse(raw).ok_or_else(|| {
            DecodeError::malformed(index, line, format!("unknown level `{raw}`"))
        })?),
    };
    let payload = record
        .message
        .or(record.log)
        .ok_or_else(|| DecodeError::malformed(index, line, "record has no message"))?;

    let mut event = StreamEvent::log_line(timestamp, level, payload);
    if let Some(seq) = record.seq {
        event = event.with_sequence_hint(seq);
    }
    if let Some(source) = record.pod_name.or(record.container_name) {
        event = event.with_source(source);
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DecodeErrorKind;
    use crate::event::EventKind;

    #[test]
    fn malformed_record_does_not_abort_chunk() {
        let chunk = concat!(
            "{\"timestamp\":\"t1\",\"level\":\"INFO\",\"message\":\"one\"}\n",
            "{\"timestamp\":\"t2\",\"level\":\"INFO\",\"message\":\"two\"}\n",
            "{not json}\n",
            "{\"timestamp\":\"t3\",\"level\":\"ERROR\",\"message\":\"three\"}\n",
        );
        let results = JsonLinesDecoder.decode(chunk.as_bytes());
        assert_eq!(results.len(), 4);

        let payloads: Vec<Option<&str>> = results
            .iter()
            .map(|r| r.as_ref().ok().map(|e| e.payload()))
            .collect();
        assert_eq!(payloads, vec![Some("one"), Some("two"), None, Some("three")]);

        let err = results[2].as_ref().expect_err("third record is malformed");
        assert_eq!(err.kind, DecodeErrorKind::MalformedRecord);
        assert_eq!(err.index, 2);
        assert_eq!(err.record, "{not json}");
    }

    #[test]
    fn decodes_pod_log_shape_with_source() {
        let chunk = br#"{"pod_name":"llama-vllm-0","container_name":"vllm","log":"loaded weights","timestamp":"2025-01-01T10:00:00"}"#;
        let results = JsonLinesDecoder.decode(chunk);
        let event = results[0].as_ref().expect("decodes");
        assert_eq!(event.kind(), EventKind::LogLine);
        assert_eq!(event.payload(), "loaded weights");
        assert_eq!(event.source(), Some("llama-vllm-0"));
        assert_eq!(event.level(), None);
    }

    #[test]
    fn error_record_becomes_server_error_control() {
        let results = JsonLinesDecoder.decode(br#"{"error":"No pods found"}"#);
        let event = results[0].as_ref().expect("decodes");
        assert_eq!(event.control_signal(), Some(ControlSignal::ServerError));
        assert_eq!(event.payload(), "No pods found");
    }

    #[test]
    fn rejects_unknown_level_and_missing_message() {
        let chunk = b"{\"level\":\"LOUD\",\"message\":\"x\"}\r\n{\"timestamp\":\"t\"}\r\n";
        let results = JsonLinesDecoder.decode(chunk);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_err()));
    }

    #[test]
    fn sequence_hint_is_read_from_seq_field() {
        let results = JsonLinesDecoder.decode(br#"{"seq":7,"timestamp":"t","message":"m"}"#);
        assert_eq!(results[0].as_ref().expect("decodes").sequence_hint(), Some(7));
    }

    #[test]
    fn decoding_is_deterministic() {
        let chunk = b"{\"timestamp\":\"t\",\"message\":\"a\"}\n\n{\"timestamp\":\"t\",\"message\":\"b\"}";
        assert_eq!(JsonLinesDecoder.decode(chunk), JsonLinesDecoder.decode(chunk));
    }
}
