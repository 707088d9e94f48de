//! Protocol messages and their binary wire encoding.
//!
//! Encoding is length-delimited so that a byte stream can be decoded
//! incrementally ([`Message::decode`]) while a datagram must carry exactly one
//! message ([`Message::from_bytes`]).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::capabilities::{CapabilityDescriptor, TENSOR_LIMIT};
use super::frame::{Frame, SessionId};
use crate::error::{NegotiationError, QueryError, Result, TransportError};

/// Upper bound for one encoded message.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Message type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum MessageKind {
    /// Capability offer from client
    Capability = 0x01,
    /// Positive handshake response
    Accept = 0x02,
    /// Negative handshake response
    Reject = 0x03,
    /// Tensor frame
    Data = 0x04,
    /// HYBRID endpoint lookup
    Discover = 0x05,
    /// HYBRID lookup answer
    Endpoint = 0x06,
    /// Session termination
    Close = 0x07,
}

impl MessageKind {
    /// Decode the type byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Capability),
            0x02 => Some(Self::Accept),
            0x03 => Some(Self::Reject),
            0x04 => Some(Self::Data),
            0x05 => Some(Self::Discover),
            0x06 => Some(Self::Endpoint),
            0x07 => Some(Self::Close),
            _ => None,
        }
    }

    /// Name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Capability => "CAPABILITY",
            Self::Accept => "ACCEPT",
            Self::Reject => "REJECT",
            Self::Data => "DATA",
            Self::Discover => "DISCOVER",
            Self::Endpoint => "ENDPOINT",
            Self::Close => "CLOSE",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Rejection reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum RejectReason {
    /// Tensor count differs
    TensorCount = 1,
    /// A dimension differs
    Dimension = 2,
    /// An element type differs
    Type = 3,
    /// No offer within the negotiation window
    Timeout = 4,
    /// Malformed or duplicate offer
    Invalid = 5,
}

impl RejectReason {
    /// Decode a reason byte. Unknown codes collapse to `Invalid`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::TensorCount,
            2 => Self::Dimension,
            3 => Self::Type,
            4 => Self::Timeout,
            _ => Self::Invalid,
        }
    }

    /// Reason matching a local negotiation failure.
    pub fn for_error(err: &NegotiationError) -> Self {
        match err {
            NegotiationError::MismatchTensorCount(_) => Self::TensorCount,
            NegotiationError::MismatchDimension(_) => Self::Dimension,
            NegotiationError::MismatchType(_) => Self::Type,
            NegotiationError::Timeout => Self::Timeout,
            NegotiationError::Unexpected(_) => Self::Invalid,
        }
    }

    /// Negotiation error reported to the rejected side.
    pub fn into_error(self, message: String) -> NegotiationError {
        match self {
            Self::TensorCount => NegotiationError::MismatchTensorCount(message),
            Self::Dimension => NegotiationError::MismatchDimension(message),
            Self::Type => NegotiationError::MismatchType(message),
            Self::Timeout => NegotiationError::Timeout,
            Self::Invalid => NegotiationError::Unexpected(message),
        }
    }
}

/// Protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Client offer; `nonce` distinguishes handshakes from one UDP peer
    Capability {
        /// Client-chosen handshake nonce
        nonce: u32,
        /// Offered stream contract
        descriptor: CapabilityDescriptor,
    },
    /// Server acceptance
    Accept {
        /// Assigned session
        session_id: SessionId,
        /// Negotiated stream contract
        descriptor: CapabilityDescriptor,
    },
    /// Server rejection
    Reject {
        /// Reason code
        reason: RejectReason,
        /// Human-readable detail
        message: String,
    },
    /// Tensor frame
    Data(Frame),
    /// HYBRID lookup request
    Discover {
        /// Stream contract the client intends to offer
        descriptor: CapabilityDescriptor,
    },
    /// HYBRID lookup answer
    Endpoint {
        /// Host to connect the stream channel to
        host: String,
        /// Port to connect the stream channel to
        port: u16,
    },
    /// Session termination
    Close {
        /// Session being closed
        session_id: SessionId,
    },
}

impl Message {
    /// Create a CAPABILITY message
    pub fn capability(nonce: u32, descriptor: CapabilityDescriptor) -> Self {
        Self::Capability { nonce, descriptor }
    }

    /// Create an ACCEPT message
    pub fn accept(session_id: SessionId, descriptor: CapabilityDescriptor) -> Self {
        Self::Accept {
            session_id,
            descriptor,
        }
    }

    /// Create a REJECT message for a negotiation failure
    pub fn reject(err: &NegotiationError) -> Self {
        Self::Reject {
            reason: RejectReason::for_error(err),
            message: err.to_string(),
        }
    }

    /// Create a CLOSE message
    pub fn close(session_id: SessionId) -> Self {
        Self::Close { session_id }
    }

    /// Message type
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Capability { .. } => MessageKind::Capability,
            Self::Accept { .. } => MessageKind::Accept,
            Self::Reject { .. } => MessageKind::Reject,
            Self::Data(_) => MessageKind::Data,
            Self::Discover { .. } => MessageKind::Discover,
            Self::Endpoint { .. } => MessageKind::Endpoint,
            Self::Close { .. } => MessageKind::Close,
        }
    }

    /// Append the encoded message to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        if let Err(err) = self.encode_body(dst) {
            dst.truncate(start);
            return Err(err);
        }

        let size = dst.len() - start;
        if size > MAX_MESSAGE_SIZE {
            dst.truncate(start);
            return Err(TransportError::MessageTooLarge {
                size,
                limit: MAX_MESSAGE_SIZE,
            }
            .into());
        }
        Ok(())
    }

    fn encode_body(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(self.kind() as u8);

        match self {
            Self::Capability { nonce, descriptor } => {
                dst.put_u32(*nonce);
                put_text(dst, &descriptor.to_string())?;
            },
            Self::Accept {
                session_id,
                descriptor,
            } => {
                dst.put_u64(session_id.as_u64());
                put_text(dst, &descriptor.to_string())?;
            },
            Self::Reject { reason, message } => {
                dst.put_u8(*reason as u8);
                put_text(dst, message)?;
            },
            Self::Data(frame) => {
                if frame.payload.len() > TENSOR_LIMIT {
                    return Err(QueryError::InvalidMessage(format!(
                        "frame carries {} tensors, limit is {TENSOR_LIMIT}",
                        frame.payload.len()
                    )));
                }
                dst.put_u64(frame.session_id.as_u64());
                dst.put_u64(frame.sequence_ordinal);
                dst.put_u8(frame.payload.len() as u8);
                for tensor in &frame.payload {
                    put_len(dst, tensor.len())?;
                    dst.put_slice(tensor);
                }
            },
            Self::Discover { descriptor } => put_text(dst, &descriptor.to_string())?,
            Self::Endpoint { host, port } => {
                dst.put_u16(*port);
                put_text(dst, host)?;
            },
            Self::Close { session_id } => dst.put_u64(session_id.as_u64()),
        }
        Ok(())
    }

    /// Encode into a standalone buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one message from the front of a stream buffer.
    ///
    /// Returns `Ok(None)` until a complete message is buffered; consumed bytes
    /// are removed from `src`.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>> {
        let Some(len) = encoded_length(src)? else {
            return Ok(None);
        };
        let mut buf = src.split_to(len).freeze();
        parse(&mut buf).map(Some)
    }

    /// Decode a buffer that holds exactly one message (a datagram).
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let len = encoded_length(data)?
            .ok_or_else(|| QueryError::InvalidMessage("truncated message".to_string()))?;
        if len != data.len() {
            return Err(QueryError::InvalidMessage(format!(
                "{} trailing byte(s) after message",
                data.len() - len
            )));
        }
        parse(&mut Bytes::copy_from_slice(data))
    }
}

fn put_len(dst: &mut BytesMut, len: usize) -> Result<()> {
    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge {
            size: len,
            limit: MAX_MESSAGE_SIZE,
        }
        .into());
    }
    dst.put_u32(len as u32);
    Ok(())
}

fn put_text(dst: &mut BytesMut, text: &str) -> Result<()> {
    put_len(dst, text.len())?;
    dst.put_slice(text.as_bytes());
    Ok(())
}

/// Walks a buffer's length fields without consuming it.
struct Peek<'a> {
    src: &'a [u8],
    pos: usize,
}

impl Peek<'_> {
    fn skip(&mut self, n: usize) -> Option<()> {
        let end = self.pos.checked_add(n)?;
        if end > self.src.len() {
            return None;
        }
        self.pos = end;
        Some(())
    }

    fn u8(&mut self) -> Option<u8> {
        let byte = *self.src.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn length(&mut self) -> Result<Option<usize>> {
        let Some(raw) = self.src.get(self.pos..self.pos + 4) else {
            return Ok(None);
        };
        self.pos += 4;
        let len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(QueryError::InvalidMessage(format!(
                "field of {len} bytes exceeds limit of {MAX_MESSAGE_SIZE}"
            )));
        }
        Ok(Some(len))
    }

    fn field(&mut self) -> Result<Option<()>> {
        Ok(match self.length()? {
            Some(len) => self.skip(len),
            None => None,
        })
    }
}

/// Total encoded length of the message at the front of `src`, if complete.
fn encoded_length(src: &[u8]) -> Result<Option<usize>> {
    let Some(&byte) = src.first() else {
        return Ok(None);
    };
    let kind = MessageKind::from_byte(byte)
        .ok_or_else(|| QueryError::InvalidMessage(format!("unknown message kind 0x{byte:02x}")))?;

    let mut peek = Peek { src, pos: 1 };
    let complete = match kind {
        MessageKind::Capability => peek.skip(4).is_some() && peek.field()?.is_some(),
        MessageKind::Accept => peek.skip(8).is_some() && peek.field()?.is_some(),
        MessageKind::Reject => peek.skip(1).is_some() && peek.field()?.is_some(),
        MessageKind::Discover => peek.field()?.is_some(),
        MessageKind::Endpoint => peek.skip(2).is_some() && peek.field()?.is_some(),
        MessageKind::Close => peek.skip(8).is_some(),
        MessageKind::Data => {
            if peek.skip(16).is_none() {
                return Ok(None);
            }
            let Some(count) = peek.u8() else {
                return Ok(None);
            };
            if count as usize > TENSOR_LIMIT {
                return Err(QueryError::InvalidMessage(format!(
                    "frame carries {count} tensors, limit is {TENSOR_LIMIT}"
                )));
            }
            let mut complete = true;
            for _ in 0..count {
                if peek.field()?.is_none() {
                    complete = false;
                    break;
                }
                if peek.pos > MAX_MESSAGE_SIZE {
                    return Err(QueryError::InvalidMessage(
                        "frame exceeds message size limit".to_string(),
                    ));
                }
            }
            complete
        },
    };

    Ok(complete.then_some(peek.pos))
}

fn take_text(buf: &mut Bytes) -> Result<String> {
    let len = buf.get_u32() as usize;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| QueryError::InvalidMessage("text field is not UTF-8".to_string()))
}

/// Parse a buffer already known to hold one complete message.
fn parse(buf: &mut Bytes) -> Result<Message> {
    let byte = buf.get_u8();
    let kind = MessageKind::from_byte(byte)
        .ok_or_else(|| QueryError::InvalidMessage(format!("unknown message kind 0x{byte:02x}")))?;

    let message = match kind {
        MessageKind::Capability => {
            let nonce = buf.get_u32();
            let descriptor = take_text(buf)?.parse()?;
            Message::Capability { nonce, descriptor }
        },
        MessageKind::Accept => {
            let session_id = SessionId::new(buf.get_u64());
            let descriptor = take_text(buf)?.parse()?;
            Message::Accept {
                session_id,
                descriptor,
            }
        },
        MessageKind::Reject => {
            let reason = RejectReason::from_code(buf.get_u8());
            let message = take_text(buf)?;
            Message::Reject { reason, message }
        },
        MessageKind::Data => {
            let session_id = SessionId::new(buf.get_u64());
            let sequence_ordinal = buf.get_u64();
            let count = buf.get_u8() as usize;
            let mut payload = Vec::with_capacity(count);
            for _ in 0..count {
                let len = buf.get_u32() as usize;
                payload.push(buf.split_to(len));
            }
            Message::Data(Frame::new(session_id, sequence_ordinal, payload))
        },
        MessageKind::Discover => Message::Discover {
            descriptor: take_text(buf)?.parse()?,
        },
        MessageKind::Endpoint => {
            let port = buf.get_u16();
            let host = take_text(buf)?;
            Message::Endpoint { host, port }
        },
        MessageKind::Close => Message::Close {
            session_id: SessionId::new(buf.get_u64()),
        },
    };

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn caps() -> CapabilityDescriptor {
        "other/tensors,num_tensors=1,dimensions=3:4,types=float32"
            .parse()
            .unwrap()
    }

    #[test]
    fn test_close_wire_layout() {
        let bytes = Message::close(SessionId::new(0x0102)).to_bytes().unwrap();
        assert_eq!(&bytes[..], &hex!("07 0000000000000102")[..]);
    }

    #[test]
    fn test_data_wire_layout() {
        let frame = Frame::new(SessionId::new(1), 2, vec![Bytes::from_static(b"abc")]);
        let bytes = Message::Data(frame.clone()).to_bytes().unwrap();
        assert_eq!(
            &bytes[..],
            &hex!("04 0000000000000001 0000000000000002 01 00000003 616263")[..]
        );
        assert_eq!(Message::from_bytes(&bytes).unwrap(), Message::Data(frame));
    }

    #[test]
    fn test_handshake_messages_survive_encoding() {
        for message in [
            Message::capability(77, caps()),
            Message::accept(SessionId::new(5), caps()),
            Message::reject(&NegotiationError::MismatchType("float32".to_string())),
            Message::Discover { descriptor: caps() },
            Message::Endpoint {
                host: "10.0.0.2".to_string(),
                port: 3001,
            },
        ] {
            let bytes = message.to_bytes().unwrap();
            assert_eq!(Message::from_bytes(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn test_incremental_decode() {
        let first = Message::capability(1, caps());
        let second = Message::close(SessionId::new(9));
        let mut wire = BytesMut::new();
        first.encode(&mut wire).unwrap();
        second.encode(&mut wire).unwrap();

        let mut src = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            src.put_u8(*byte);
            if let Some(message) = Message::decode(&mut src).unwrap() {
                decoded.push(message);
            }
        }
        assert_eq!(decoded, vec![first, second]);
        assert!(src.is_empty());
    }

    #[test]
    fn test_reject_reason_maps_back_to_error() {
        let err = NegotiationError::MismatchDimension("3:4 vs 3:5".to_string());
        let Message::Reject { reason, message } = Message::reject(&err) else {
            panic!("expected REJECT");
        };
        assert_eq!(reason, RejectReason::Dimension);
        assert!(matches!(
            reason.into_error(message),
            NegotiationError::MismatchDimension(_)
        ));
        assert_eq!(RejectReason::from_code(200), RejectReason::Invalid);
    }

    #[test]
    fn test_malformed_input() {
        assert!(Message::from_bytes(&hex!("ff 00")).is_err());
        assert!(Message::from_bytes(&hex!("07 0000")).is_err());
        assert!(Message::from_bytes(&hex!("07 0000000000000001 00")).is_err());

        // 17 tensors
        let mut src = BytesMut::from(&hex!("04 0000000000000001 0000000000000001 11")[..]);
        assert!(Message::decode(&mut src).is_err());

        // declared field larger than the limit
        let mut src = BytesMut::from(&hex!("05 ffffffff")[..]);
        assert!(Message::decode(&mut src).is_err());
    }

    #[test]
    fn test_too_many_tensors_not_encoded() {
        let frame = Frame::new(SessionId::new(1), 1, vec![Bytes::new(); TENSOR_LIMIT + 1]);
        let mut dst = BytesMut::new();
        assert!(Message::Data(frame).encode(&mut dst).is_err());
        assert!(dst.is_empty());
    }
}
