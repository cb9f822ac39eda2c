//! Wire protocol for the host-to-guest vsock RPC channel.
//!
//! ## Framing
//!
//! ```text
//! [4-byte big-endian length][UTF-8 JSON body]
//! ```
//!
//! The length covers the JSON body only, not the 4-byte prefix itself.
//! Frames whose declared length exceeds the configured maximum are rejected
//! without reading the body.
//!
//! ## Request / response shape
//!
//! Requests are tagged by an `action` field (`{"action": "exec", ...}`).
//! Responses always carry `success`; unsuccessful responses additionally
//! carry `error`, successful ones carry action-specific fields.

use serde::{Deserialize, Serialize};

/// Length-prefix size in bytes.
pub const HEADER_SIZE: usize = 4;

/// Default maximum frame size (10 MiB), matching the guest agent's own limit.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Default guest vsock port the agent listens on.
pub const DEFAULT_VSOCK_PORT: u32 = 5000;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too large: {0} bytes exceeds limit of {1} bytes")]
    FrameTooLarge(usize, usize),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("invalid JSON in frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// A request sent from the host to the guest agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    Exec {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
        #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
        env: std::collections::HashMap<String, String>,
    },
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: String,
        #[serde(default)]
        is_base64: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
    },
    DeleteFile {
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    ListFiles {
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    Mkdir {
        path: String,
        #[serde(default = "default_true")]
        parents: bool,
    },
    Stat {
        path: String,
    },
    Ping,
}

fn default_true() -> bool {
    true
}

/// A directory entry as reported by `list_files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(default)]
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    #[serde(default)]
    pub modified: Option<f64>,
}

/// The response envelope. Guest error strings travel inside `error` and are
/// never promoted to a transport-level [`ProtocolError`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<FileEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_file: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_dir: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Encode a single JSON value as a length-prefixed frame.
pub fn encode<T: Serialize>(value: &T, max_message_size: usize) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(value)?;
    if body.len() > max_message_size {
        return Err(ProtocolError::FrameTooLarge(body.len(), max_message_size));
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Buffered streaming decoder: feed arbitrary chunks, get back complete
/// JSON frame bodies as they become available. Partial trailing bytes are
/// retained across calls.
pub struct Decoder {
    buf: Vec<u8>,
    max_message_size: usize,
}

impl Decoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(64 * 1024),
            max_message_size,
        }
    }

    /// Feed newly-read bytes and return any complete frame bodies.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut offset = 0;

        while offset + HEADER_SIZE <= self.buf.len() {
            let Some(len_bytes) = self.buf.get(offset..offset + HEADER_SIZE) else {
                break;
            };
            let Ok(len_arr): Result<[u8; 4], _> = len_bytes.try_into() else {
                break;
            };
            let len = u32::from_be_bytes(len_arr) as usize;

            if len > self.max_message_size {
                self.buf.clear();
                return Err(ProtocolError::FrameTooLarge(len, self.max_message_size));
            }

            let total = HEADER_SIZE + len;
            if offset + total > self.buf.len() {
                break;
            }

            let body = self
                .buf
                .get(offset + HEADER_SIZE..offset + total)
                .ok_or(ProtocolError::Malformed("frame body out of bounds"))?
                .to_vec();
            frames.push(body);
            offset += total;
        }

        if offset > 0 {
            self.buf.drain(..offset);
        }

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let req = Request::Ping;
        let frame = encode(&req, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let mut dec = Decoder::new(DEFAULT_MAX_MESSAGE_SIZE);
        let frames = dec.decode(&frame).unwrap();
        assert_eq!(frames.len(), 1);
        let decoded: Request = serde_json::from_slice(&frames[0]).unwrap();
        assert!(matches!(decoded, Request::Ping));
    }

    #[test]
    fn exec_request_serializes_action_tag() {
        let req = Request::Exec {
            command: "echo hi".into(),
            timeout: Some(5),
            working_dir: None,
            env: Default::default(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["action"], "exec");
        assert_eq!(json["command"], "echo hi");
        assert_eq!(json["timeout"], 5);
        assert!(json.get("working_dir").is_none());
    }

    #[test]
    fn response_round_trips_success_payload() {
        let resp = Response {
            success: true,
            exit_code: Some(0),
            stdout: Some("ok\n".into()),
            stderr: Some(String::new()),
            ..Default::default()
        };
        let json = serde_json::to_vec(&resp).unwrap();
        let back: Response = serde_json::from_slice(&json).unwrap();
        assert!(back.success);
        assert_eq!(back.exit_code, Some(0));
    }

    #[test]
    fn decoder_handles_partial_reads() {
        let frame = encode(&Request::Ping, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let mut dec = Decoder::new(DEFAULT_MAX_MESSAGE_SIZE);

        let frames = dec.decode(&frame[..2]).unwrap();
        assert!(frames.is_empty());
        let frames = dec.decode(&frame[2..]).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn decoder_handles_multiple_frames_in_one_chunk() {
        let mut data = encode(&Request::Ping, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        data.extend_from_slice(
            &encode(
                &Request::Stat {
                    path: "/workspace".into(),
                },
                DEFAULT_MAX_MESSAGE_SIZE,
            )
            .unwrap(),
        );
        let mut dec = Decoder::new(DEFAULT_MAX_MESSAGE_SIZE);
        let frames = dec.decode(&data).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn decoder_rejects_oversized_frame_without_reading_body() {
        let mut dec = Decoder::new(1024);
        let huge_len = (2048_u32).to_be_bytes();
        let err = dec.decode(&huge_len).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(2048, 1024)));
    }

    #[test]
    fn encode_rejects_body_over_limit() {
        let req = Request::WriteFile {
            path: "/workspace/big".into(),
            content: "x".repeat(64),
            is_base64: false,
            mode: None,
        };
        let err = encode(&req, 8).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_, 8)));
    }
}
