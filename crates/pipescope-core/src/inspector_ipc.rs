use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;
pub const GSTREAMER_DOMAIN: &str = "GStreamer";

/// Wire protocol version, a plain integer. Frames without one are read as
/// the current version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// One NDJSON frame on the inspector socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub session_id: String,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

impl WireEnvelope {
    pub fn new(
        session_id: &str,
        sender_id: &str,
        request_id: Option<String>,
        msg: WireMsg,
    ) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            session_id: session_id.to_string(),
            sender_id: sender_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            request_id,
            msg,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    Hello(HelloPayload),
    Ready(ReadyPayload),
    ListPipelineNames,
    PipelineNames(PipelineNames),
    ListChildBinNames(BinQuery),
    ChildBinNames(ChildBinNames),
    DumpPipeline(BinQuery),
    PipelineDump(PipelineDump),
    Error(ErrorPayload),
    ActivePipelinesChanged,
}

impl WireMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMsg::Hello(_) => "hello",
            WireMsg::Ready(_) => "ready",
            WireMsg::ListPipelineNames => "list_pipeline_names",
            WireMsg::PipelineNames(_) => "pipeline_names",
            WireMsg::ListChildBinNames(_) => "list_child_bin_names",
            WireMsg::ChildBinNames(_) => "child_bin_names",
            WireMsg::DumpPipeline(_) => "dump_pipeline",
            WireMsg::PipelineDump(_) => "pipeline_dump",
            WireMsg::Error(_) => "error",
            WireMsg::ActivePipelinesChanged => "active_pipelines_changed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub client_id: String,
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadyPayload {
    pub agent_id: String,
    #[serde(default)]
    pub domains: Vec<String>,
}

impl ReadyPayload {
    pub fn has_domain(&self, domain: &str) -> bool {
        self.domains.iter().any(|value| value == domain)
    }
}

/// Addresses a pipeline or one of its bins. An empty `bin_name` means the
/// pipeline itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BinQuery {
    pub pipeline_name: String,
    #[serde(default)]
    pub bin_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineNames {
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChildBinNames {
    #[serde(default)]
    pub bin_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineDump {
    pub graph_representation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let raw = trim_line_ending(bytes);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

fn trim_line_ending(bytes: &[u8]) -> &[u8] {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    raw
}

/// Incremental newline-delimited JSON decoder. Malformed or oversized lines
/// are reported and skipped; decoding resumes at the next newline.
pub struct NdjsonFrameDecoder<T> {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    marker: PhantomData<T>,
}

impl<T> NdjsonFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            marker: PhantomData,
        }
    }
}

impl<T> Default for NdjsonFrameDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> NdjsonFrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            let frame = trim_line_ending(&line);
            if frame.iter().all(|byte| byte.is_ascii_whitespace()) {
                continue;
            }
            self.decode_raw_frame(frame, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    pub fn finish(&mut self) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        let final_frame = std::mem::take(&mut self.pending);
        if !final_frame.iter().all(|byte| byte.is_ascii_whitespace()) {
            self.decode_raw_frame(&final_frame, &mut report);
        }
        report
    }

    fn decode_raw_frame(&self, frame: &[u8], report: &mut DecodeReport<T>) {
        if frame.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match serde_json::from_slice(frame) {
            Ok(parsed) => report.frames.push(parsed),
            Err(err) => report.errors.push(FrameError::Decode(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(msg: WireMsg) -> WireEnvelope {
        WireEnvelope {
            version: ProtocolVersion::CURRENT,
            session_id: "session-alpha".to_string(),
            sender_id: "panel-1".to_string(),
            timestamp: "2026-02-07T21:00:00Z".to_string(),
            request_id: Some("req-1".to_string()),
            msg,
        }
    }

    #[test]
    fn requests_and_responses_survive_framing() {
        let messages = [
            WireMsg::Hello(HelloPayload {
                client_id: "panel-1".to_string(),
                role: "inspector".to_string(),
                capabilities: vec!["dump_pipeline".to_string()],
            }),
            WireMsg::ListPipelineNames,
            WireMsg::DumpPipeline(BinQuery {
                pipeline_name: "playbin0".to_string(),
                bin_name: "uridecodebin0".to_string(),
            }),
            WireMsg::PipelineDump(PipelineDump {
                graph_representation: "digraph p {\n  a -> b;\n}\n".to_string(),
            }),
            WireMsg::ActivePipelinesChanged,
        ];

        for msg in messages {
            let message = envelope(msg);
            let frame = encode_frame(&message, DEFAULT_MAX_FRAME_BYTES).expect("encode");
            let decoded: WireEnvelope =
                decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn unit_messages_encode_without_payload() {
        let encoded = serde_json::to_value(envelope(WireMsg::ListPipelineNames)).expect("json");
        assert_eq!(encoded["type"], "list_pipeline_names");
        assert!(encoded.get("payload").is_none());
    }

    #[test]
    fn bin_query_defaults_to_root_pipeline() {
        let parsed: WireEnvelope = serde_json::from_str(
            r#"{
                "type": "list_child_bin_names",
                "session_id": "session-alpha",
                "sender_id": "panel-1",
                "timestamp": "2026-02-07T21:00:00Z",
                "payload": {"pipeline_name": "playbin0"}
            }"#,
        )
        .expect("parse");
        assert_eq!(
            parsed.msg,
            WireMsg::ListChildBinNames(BinQuery {
                pipeline_name: "playbin0".to_string(),
                bin_name: String::new(),
            })
        );
        assert_eq!(parsed.version, ProtocolVersion::CURRENT);
    }

    #[test]
    fn version_is_a_plain_integer_on_the_wire() {
        let encoded =
            serde_json::to_value(envelope(WireMsg::ActivePipelinesChanged)).expect("json");
        assert_eq!(encoded["version"], CURRENT_PROTOCOL_VERSION);

        let frame = |version: &str| {
            format!(
                r#"{{"version": {version}, "type": "active_pipelines_changed",
                    "session_id": "s", "sender_id": "agent", "timestamp": "t"}}"#
            )
        };
        let newer: WireEnvelope = serde_json::from_str(&frame("2")).expect("parse");
        assert_eq!(newer.version, ProtocolVersion(2));
        assert!(serde_json::from_str::<WireEnvelope>(&frame("\"1\"")).is_err());
        assert!(serde_json::from_str::<WireEnvelope>(&frame("70000")).is_err());
    }

    #[test]
    fn decoder_recovers_after_malformed_json_line() {
        let valid_a = encode_frame(&envelope(WireMsg::ListPipelineNames), DEFAULT_MAX_FRAME_BYTES)
            .expect("encode first");
        let malformed = b"{\"not\":\"valid\"\n";
        let valid_b = encode_frame(
            &envelope(WireMsg::PipelineNames(PipelineNames {
                names: vec!["playbin0".to_string()],
            })),
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("encode second");

        let mut decoder = NdjsonFrameDecoder::<WireEnvelope>::default();
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&valid_a);
        chunk.extend_from_slice(malformed);
        chunk.extend_from_slice(&valid_b);

        let report = decoder.push_chunk(&chunk);
        assert_eq!(report.frames.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], FrameError::Decode(_)));
    }

    #[test]
    fn decoder_joins_frames_split_across_chunks() {
        let frame = encode_frame(&envelope(WireMsg::ActivePipelinesChanged), 1024).expect("encode");
        let (head, tail) = frame.split_at(frame.len() / 2);

        let mut decoder = NdjsonFrameDecoder::<WireEnvelope>::new(1024);
        assert!(decoder.push_chunk(head).frames.is_empty());
        let report = decoder.push_chunk(tail);
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.frames[0].msg, WireMsg::ActivePipelinesChanged);
        assert!(decoder.finish().frames.is_empty());
    }

    #[test]
    fn encoder_rejects_oversized_dump() {
        let message = envelope(WireMsg::PipelineDump(PipelineDump {
            graph_representation: "x".repeat(256),
        }));
        let result = encode_frame(&message, 64);
        assert!(matches!(result, Err(FrameError::OversizedFrame { .. })));
    }

    #[test]
    fn ready_payload_reports_domains() {
        let ready = ReadyPayload {
            agent_id: "agent".to_string(),
            domains: vec![GSTREAMER_DOMAIN.to_string()],
        };
        assert!(ready.has_domain("GStreamer"));
        assert!(!ready.has_domain("Network"));
    }
}
