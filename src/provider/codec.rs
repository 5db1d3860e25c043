//! Newline-delimited JSON-RPC 2.0 codec for tokio I/O.
//!
//! Framing: one JSON document per line, `\n`-terminated. Requests are
//! encoded from [`RpcRequest`]. Inbound lines are returned raw by
//! [`LineCodec`] and classified with [`decode_frame`], so a single
//! malformed line never poisons the stream.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProviderRpcError;

/// Maximum line length (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Codec error type.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outbound JSON-RPC request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: String, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

/// Every field an inbound frame may carry.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ProviderRpcError>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

/// A classified inbound frame.
#[derive(Debug, PartialEq)]
pub enum DecodeResult {
    /// Reply to a request we sent.
    Response {
        id: u64,
        result: Result<Value, ProviderRpcError>,
    },
    /// Unsolicited notification from the wallet.
    Notification { method: String, params: Value },
    /// Not valid JSON-RPC.
    Malformed(String),
}

/// Classify one inbound line.
pub fn decode_frame(line: &[u8]) -> DecodeResult {
    let raw: RawFrame = match serde_json::from_slice(line) {
        Ok(raw) => raw,
        Err(e) => return DecodeResult::Malformed(e.to_string()),
    };

    match (raw.id, raw.method) {
        (Some(id), None) => {
            let Some(id) = id.as_u64() else {
                return DecodeResult::Malformed(format!("non-numeric id: {id}"));
            };
            let result = match (raw.error, raw.result) {
                (Some(err), _) => Err(err),
                (None, Some(value)) => Ok(value),
                (None, None) => Ok(Value::Null),
            };
            DecodeResult::Response { id, result }
        }
        (None, Some(method)) => DecodeResult::Notification {
            method,
            params: raw.params.unwrap_or(Value::Null),
        },
        (Some(_), Some(method)) => {
            DecodeResult::Malformed(format!("wallet-originated request not supported: {method}"))
        }
        (None, None) => DecodeResult::Malformed("frame has neither id nor method".into()),
    }
}

/// Line-level codec: handles only newline framing.
///
/// Returns raw `BytesMut` lines without the terminator. Empty lines are
/// skipped.
#[derive(Debug, Default)]
pub struct LineCodec {
    /// Bytes of the buffer already scanned for a newline.
    scanned: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self { scanned: 0 }
    }
}

impl Decoder for LineCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(offset) = src[self.scanned..].iter().position(|b| *b == b'\n') else {
                self.scanned = src.len();
                if src.len() > MAX_FRAME_SIZE {
                    return Err(CodecError::FrameTooLarge(src.len()));
                }
                return Ok(None);
            };

            let end = self.scanned + offset;
            self.scanned = 0;
            let mut line = src.split_to(end + 1);
            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(end - 1);
            }
            if line.len() > MAX_FRAME_SIZE {
                return Err(CodecError::FrameTooLarge(line.len()));
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line));
        }
    }
}

impl Encoder<RpcRequest> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: RpcRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        dst.reserve(payload.len() + 1);
        dst.extend_from_slice(&payload);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lines(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(line) = codec.decode(buf).unwrap() {
            out.push(line.to_vec());
        }
        out
    }

    #[test]
    fn encode_appends_newline() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(RpcRequest::new(7, "eth_accounts".into(), json!([])), &mut buf)
            .unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));
        let value: Value = serde_json::from_slice(&buf[..buf.len() - 1]).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "eth_accounts");
    }

    #[test]
    fn decode_multiple_lines_in_one_buffer() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"{\"id\":1,\"result\":[]}\n\n{\"id\":2,\"result\":\"0x1\"}\r\n"[..]);
        let out = lines(&mut codec, &mut buf);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], b"{\"id\":2,\"result\":\"0x1\"}");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_partial_line_waits_for_newline() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"{\"id\":1,"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\"result\":null}\n");
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decode_frame(&line), DecodeResult::Response {
            id: 1,
            result: Ok(Value::Null)
        });
    }

    #[test]
    fn oversized_line_rejected() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(vec![b'a'; MAX_FRAME_SIZE + 1].as_slice());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn classify_error_response() {
        let frame = br#"{"jsonrpc":"2.0","id":3,"error":{"code":4001,"message":"User rejected"}}"#;
        match decode_frame(frame) {
            DecodeResult::Response { id, result } => {
                assert_eq!(id, 3);
                assert_eq!(result.unwrap_err().code, 4001);
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn classify_notification() {
        let frame = br#"{"jsonrpc":"2.0","method":"chainChanged","params":["0xaa36a7"]}"#;
        assert_eq!(decode_frame(frame), DecodeResult::Notification {
            method: "chainChanged".into(),
            params: json!(["0xaa36a7"]),
        });
    }

    #[test]
    fn classify_malformed() {
        assert!(matches!(decode_frame(b"not json"), DecodeResult::Malformed(_)));
        assert!(matches!(decode_frame(b"{}"), DecodeResult::Malformed(_)));
        assert!(matches!(
            decode_frame(br#"{"id":"abc","result":1}"#),
            DecodeResult::Malformed(_)
        ));
        assert!(matches!(
            decode_frame(br#"{"id":1,"method":"eth_sign"}"#),
            DecodeResult::Malformed(_)
        ));
    }
}
