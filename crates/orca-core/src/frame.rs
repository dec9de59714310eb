//! The wire protocol: one JSON object per line on a stream socket (§4.1, §6).
//!
//! Frames are modeled as a tagged variant over a closed set of types with an
//! unparsed `payload` blob for the cases the controller forwards verbatim
//! without inspecting (e.g. `port_data`) — see design note in §9
//! ("Heterogeneous message bodies carried uniformly").

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::OrcaError;
use crate::worker::WorkerId;

/// Default maximum size of a single framed JSON message, per §4.1.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    // client -> controller
    SubmitJob,
    Exec,
    Shell,
    Status,
    Shutdown,
    // client -> controller, forwarded to the worker
    Stdin,
    Resize,
    // controller -> worker (and worker -> controller, then forwarded)
    PortOpen,
    PortData,
    PortClose,
    // worker -> controller, then forwarded
    Stdout,
    Stderr,
    Exit,
    Error,
    Heartbeat,
}

/// One line-delimited JSON object on the wire (the `Frame` of §3/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameType,
    pub id: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub ref_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, with = "opt_base64", skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Frame {
    pub fn new(kind: FrameType, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            ref_: None,
            payload: None,
            data: None,
            exit_code: None,
            worker_id: None,
            error: None,
        }
    }

    pub fn with_ref(mut self, ref_: impl Into<String>) -> Self {
        self.ref_ = Some(ref_.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Build the synthesized `error` frame the router/scheduler send on
    /// failure paths (worker death, target VM not found, shutdown, ...).
    pub fn error_reply(ref_id: impl Into<String>, message: impl Into<String>) -> Self {
        Frame::new(FrameType::Error, uuid::Uuid::new_v4().to_string())
            .with_ref(ref_id)
            .with_error(message)
    }

    pub fn exit_reply(ref_id: impl Into<String>, exit_code: i32) -> Self {
        Frame::new(FrameType::Exit, uuid::Uuid::new_v4().to_string())
            .with_ref(ref_id)
            .with_exit_code(exit_code)
    }
}

mod opt_base64 {
    use super::*;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_str(&B64.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            Some(s) => B64
                .decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Length-agnostic newline-delimited JSON codec with an upper size bound.
///
/// On read, bytes accumulate until `\n`; the line is parsed as a single JSON
/// object. A parse error on one frame is unrecoverable for that connection —
/// framing state cannot be trusted after a malformed object, so the caller is
/// expected to close the connection (see §4.1). Writes serialize-then-append
/// `\n`; callers are responsible for serializing writes to a connection from
/// a single point (the per-connection write mutex described in §5).
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = OrcaError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, OrcaError> {
        let Some(newline_at) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > self.max_frame_bytes {
                let size = src.len();
                src.clear();
                return Err(OrcaError::FrameTooLarge {
                    size,
                    limit: self.max_frame_bytes,
                });
            }
            return Ok(None);
        };

        if newline_at > self.max_frame_bytes {
            let size = newline_at;
            src.advance(newline_at + 1);
            return Err(OrcaError::FrameTooLarge {
                size,
                limit: self.max_frame_bytes,
            });
        }

        let line = src.split_to(newline_at + 1);
        let line = &line[..line.len() - 1];
        if line.is_empty() {
            return self.decode(src);
        }

        let frame = serde_json::from_slice::<Frame>(line).map_err(|source| OrcaError::FrameDecode {
            context: "frame codec".to_string(),
            source,
        })?;
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = OrcaError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), OrcaError> {
        let json = serde_json::to_vec(&item).map_err(|source| OrcaError::FrameDecode {
            context: "frame codec".to_string(),
            source,
        })?;
        if json.len() > self.max_frame_bytes {
            return Err(OrcaError::FrameTooLarge {
                size: json.len(),
                limit: self.max_frame_bytes,
            });
        }
        dst.extend_from_slice(&json);
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}
