//! Binary wire protocol for the collaboration channel.
//!
//! Frames use the y-protocol variable-length integer encoding so document
//! sync messages stay byte-compatible with standard Yjs sync servers. Every
//! frame starts with a message type varint:
//!
//! ```text
//! [msg_type][payload...]
//!
//! SYNC        [sync_type][byte_array]          document handshake + updates
//! AWARENESS   [byte_array]                     presence payload (JSON)
//! RPC_REQUEST [id][method string][byte_array]  request/reply side-channel
//! RPC_REPLY   [id][status][byte_array]
//! ```
//!
//! Servers may concatenate several frames into one transport message (the
//! usual reply to SyncStep1 is SyncStep2 followed by a reciprocal
//! SyncStep1); [`ProtocolMessage::decode_all`] handles that.

use crate::error::{CoflowError, Result};

/// Top-level message type discriminants.
pub mod msg_type {
    pub const SYNC: u64 = 0;
    pub const AWARENESS: u64 = 1;
    pub const RPC_REQUEST: u64 = 2;
    pub const RPC_REPLY: u64 = 3;
}

/// Document sync sub-types, matching the y-sync protocol.
pub mod sync_type {
    pub const STEP1: u64 = 0;
    pub const STEP2: u64 = 1;
    pub const UPDATE: u64 = 2;
}

// ==================== Varint framing primitives ====================

/// Append a variable-length unsigned integer (7 bits per byte, high bit
/// marks continuation).
pub fn write_var_uint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Read a variable-length unsigned integer, advancing `pos`.
pub fn read_var_uint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| CoflowError::Protocol("truncated varint".into()))?;
        *pos += 1;
        if shift >= 64 {
            return Err(CoflowError::Protocol("varint overflows u64".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Append a length-prefixed byte array.
pub fn write_var_byte_array(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var_uint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Read a length-prefixed byte array, advancing `pos`.
pub fn read_var_byte_array<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    let len = read_var_uint(data, pos)? as usize;
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| CoflowError::Protocol("truncated byte array".into()))?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

pub fn write_var_string(buf: &mut Vec<u8>, value: &str) {
    write_var_byte_array(buf, value.as_bytes());
}

pub fn read_var_string(data: &[u8], pos: &mut usize) -> Result<String> {
    let bytes = read_var_byte_array(data, pos)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| CoflowError::Protocol("string is not valid utf-8".into()))
}

// ==================== Document sync messages ====================

/// A y-sync document message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Handshake step 1: the sender's state vector.
    Step1(Vec<u8>),
    /// Handshake step 2: the updates the receiver was missing.
    Step2(Vec<u8>),
    /// A live incremental update.
    Update(Vec<u8>),
}

impl SyncMessage {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        write_var_uint(buf, msg_type::SYNC);
        let (sub, payload) = match self {
            SyncMessage::Step1(payload) => (sync_type::STEP1, payload),
            SyncMessage::Step2(payload) => (sync_type::STEP2, payload),
            SyncMessage::Update(payload) => (sync_type::UPDATE, payload),
        };
        write_var_uint(buf, sub);
        write_var_byte_array(buf, payload);
    }

    fn decode_body(data: &[u8], pos: &mut usize) -> Result<Self> {
        let sub = read_var_uint(data, pos)?;
        let payload = read_var_byte_array(data, pos)?.to_vec();
        match sub {
            sync_type::STEP1 => Ok(SyncMessage::Step1(payload)),
            sync_type::STEP2 => Ok(SyncMessage::Step2(payload)),
            sync_type::UPDATE => Ok(SyncMessage::Update(payload)),
            other => Err(CoflowError::Protocol(format!(
                "unknown sync sub-type {other}"
            ))),
        }
    }
}

// ==================== RPC side-channel ====================

/// A request on the command side-channel (e.g. `save_workflow`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    /// JSON-encoded parameters.
    pub params: Vec<u8>,
}

/// Reply status discriminants on the wire.
mod rpc_status {
    pub const OK: u64 = 0;
    pub const ERROR: u64 = 1;
    pub const UNAUTHORIZED: u64 = 2;
}

/// The server's answer to an [`RpcRequest`], correlated by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcReply {
    /// JSON-encoded result payload.
    Ok { id: u64, payload: Vec<u8> },
    /// Server-reported failure message.
    Error { id: u64, message: String },
    /// The session lacks permission for the method.
    Unauthorized { id: u64, message: String },
}

impl RpcReply {
    pub fn id(&self) -> u64 {
        match self {
            RpcReply::Ok { id, .. }
            | RpcReply::Error { id, .. }
            | RpcReply::Unauthorized { id, .. } => *id,
        }
    }
}

// ==================== Top-level frames ====================

/// Any frame on the collaboration channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Sync(SyncMessage),
    /// Presence payload, JSON-encoded. Kept outside the document so cursor
    /// movement never pollutes document history.
    Awareness(Vec<u8>),
    RpcRequest(RpcRequest),
    RpcReply(RpcReply),
}

impl ProtocolMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            ProtocolMessage::Sync(msg) => msg.encode_into(buf),
            ProtocolMessage::Awareness(payload) => {
                write_var_uint(buf, msg_type::AWARENESS);
                write_var_byte_array(buf, payload);
            }
            ProtocolMessage::RpcRequest(req) => {
                write_var_uint(buf, msg_type::RPC_REQUEST);
                write_var_uint(buf, req.id);
                write_var_string(buf, &req.method);
                write_var_byte_array(buf, &req.params);
            }
            ProtocolMessage::RpcReply(reply) => {
                write_var_uint(buf, msg_type::RPC_REPLY);
                write_var_uint(buf, reply.id());
                match reply {
                    RpcReply::Ok { payload, .. } => {
                        write_var_uint(buf, rpc_status::OK);
                        write_var_byte_array(buf, payload);
                    }
                    RpcReply::Error { message, .. } => {
                        write_var_uint(buf, rpc_status::ERROR);
                        write_var_string(buf, message);
                    }
                    RpcReply::Unauthorized { message, .. } => {
                        write_var_uint(buf, rpc_status::UNAUTHORIZED);
                        write_var_string(buf, message);
                    }
                }
            }
        }
    }

    /// Encode several frames into one transport message.
    pub fn encode_all(messages: &[ProtocolMessage]) -> Vec<u8> {
        let mut buf = Vec::new();
        for msg in messages {
            msg.encode_into(&mut buf);
        }
        buf
    }

    /// Decode a single frame. Fails if trailing bytes remain; use
    /// [`decode_all`](Self::decode_all) for concatenated frames.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let msg = Self::decode_one(data, &mut pos)?;
        if pos != data.len() {
            return Err(CoflowError::Protocol(format!(
                "{} trailing bytes after frame",
                data.len() - pos
            )));
        }
        Ok(msg)
    }

    /// Decode every frame in a transport message.
    pub fn decode_all(data: &[u8]) -> Result<Vec<Self>> {
        let mut messages = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            messages.push(Self::decode_one(data, &mut pos)?);
        }
        Ok(messages)
    }

    fn decode_one(data: &[u8], pos: &mut usize) -> Result<Self> {
        let kind = read_var_uint(data, pos)?;
        match kind {
            msg_type::SYNC => Ok(ProtocolMessage::Sync(SyncMessage::decode_body(data, pos)?)),
            msg_type::AWARENESS => Ok(ProtocolMessage::Awareness(
                read_var_byte_array(data, pos)?.to_vec(),
            )),
            msg_type::RPC_REQUEST => {
                let id = read_var_uint(data, pos)?;
                let method = read_var_string(data, pos)?;
                let params = read_var_byte_array(data, pos)?.to_vec();
                Ok(ProtocolMessage::RpcRequest(RpcRequest {
                    id,
                    method,
                    params,
                }))
            }
            msg_type::RPC_REPLY => {
                let id = read_var_uint(data, pos)?;
                let status = read_var_uint(data, pos)?;
                let reply = match status {
                    rpc_status::OK => RpcReply::Ok {
                        id,
                        payload: read_var_byte_array(data, pos)?.to_vec(),
                    },
                    rpc_status::ERROR => RpcReply::Error {
                        id,
                        message: read_var_string(data, pos)?,
                    },
                    rpc_status::UNAUTHORIZED => RpcReply::Unauthorized {
                        id,
                        message: read_var_string(data, pos)?,
                    },
                    other => {
                        return Err(CoflowError::Protocol(format!(
                            "unknown rpc status {other}"
                        )));
                    }
                };
                Ok(ProtocolMessage::RpcReply(reply))
            }
            other => Err(CoflowError::Protocol(format!(
                "unknown message type {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_uint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_var_uint(&mut buf, value);
            let mut pos = 0;
            assert_eq!(read_var_uint(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_var_uint_truncated() {
        // Continuation bit set but no following byte.
        let mut pos = 0;
        assert!(read_var_uint(&[0x80], &mut pos).is_err());
        let mut pos = 0;
        assert!(read_var_uint(&[], &mut pos).is_err());
    }

    #[test]
    fn test_byte_array_truncated() {
        let mut buf = Vec::new();
        write_var_byte_array(&mut buf, &[1, 2, 3, 4]);
        buf.truncate(buf.len() - 1);
        let mut pos = 0;
        assert!(read_var_byte_array(&buf, &mut pos).is_err());
    }

    #[test]
    fn test_sync_frames_round_trip() {
        for msg in [
            SyncMessage::Step1(vec![1, 2, 3]),
            SyncMessage::Step2(vec![]),
            SyncMessage::Update(vec![9; 300]),
        ] {
            let encoded = ProtocolMessage::Sync(msg.clone()).encode();
            assert_eq!(
                ProtocolMessage::decode(&encoded).unwrap(),
                ProtocolMessage::Sync(msg)
            );
        }
    }

    #[test]
    fn test_awareness_frame_round_trip() {
        let payload = br#"{"user_id":"u1"}"#.to_vec();
        let encoded = ProtocolMessage::Awareness(payload.clone()).encode();
        assert_eq!(
            ProtocolMessage::decode(&encoded).unwrap(),
            ProtocolMessage::Awareness(payload)
        );
    }

    #[test]
    fn test_rpc_frames_round_trip() {
        let request = ProtocolMessage::RpcRequest(RpcRequest {
            id: 42,
            method: "save_workflow".into(),
            params: br#"{"workflow_id":"w1"}"#.to_vec(),
        });
        assert_eq!(
            ProtocolMessage::decode(&request.encode()).unwrap(),
            request
        );

        for reply in [
            RpcReply::Ok {
                id: 42,
                payload: b"{}".to_vec(),
            },
            RpcReply::Error {
                id: 43,
                message: "boom".into(),
            },
            RpcReply::Unauthorized {
                id: 44,
                message: "read-only session".into(),
            },
        ] {
            let frame = ProtocolMessage::RpcReply(reply.clone());
            assert_eq!(ProtocolMessage::decode(&frame.encode()).unwrap(), frame);
        }
    }

    #[test]
    fn test_decode_all_concatenated() {
        // A server answering Step1 typically sends Step2 + its own Step1
        // in one transport message.
        let combined = ProtocolMessage::encode_all(&[
            ProtocolMessage::Sync(SyncMessage::Step2(vec![5, 6])),
            ProtocolMessage::Sync(SyncMessage::Step1(vec![7])),
        ]);
        let decoded = ProtocolMessage::decode_all(&combined).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(matches!(
            decoded[0],
            ProtocolMessage::Sync(SyncMessage::Step2(_))
        ));
        assert!(matches!(
            decoded[1],
            ProtocolMessage::Sync(SyncMessage::Step1(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut buf = Vec::new();
        write_var_uint(&mut buf, 99);
        assert!(matches!(
            ProtocolMessage::decode(&buf).unwrap_err(),
            CoflowError::Protocol(_)
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut encoded = ProtocolMessage::Awareness(vec![1]).encode();
        encoded.push(0);
        assert!(ProtocolMessage::decode(&encoded).is_err());
        // decode_all treats the trailing byte as the start of another frame
        // and fails there too, but cleanly.
        assert!(ProtocolMessage::decode_all(&encoded).is_err());
    }
}
