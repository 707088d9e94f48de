//! Session-tagged tensor frames.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque session identifier.
///
/// Derived from the transport identity of the connection (see
/// [`crate::session::SessionKey`]). The value `0` never names a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Reserved "no session" value.
    pub const NONE: SessionId = SessionId(0);

    /// Wrap a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value as carried on the wire.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether this is the reserved "no session" value.
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// One unit of tensor data travelling through a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Session the frame belongs to
    pub session_id: SessionId,
    /// Per-session, per-direction sequence number
    pub sequence_ordinal: u64,
    /// Tensor buffers, one per tensor of the negotiated descriptor
    pub payload: Vec<Bytes>,
}

impl Frame {
    /// Create a frame.
    pub fn new(session_id: SessionId, sequence_ordinal: u64, payload: Vec<Bytes>) -> Self {
        Self {
            session_id,
            sequence_ordinal,
            payload,
        }
    }

    /// Same payload, re-tagged for another session.
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = session_id;
        self
    }

    /// Total payload size in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.iter().map(Bytes::len).sum()
    }

    /// Number of tensors carried.
    pub fn tensor_count(&self) -> usize {
        self.payload.len()
    }
}

/// Rejects ordinals that do not strictly increase.
///
/// Datagram transports may reorder or duplicate frames; the receiver keeps
/// only frames newer than the last one it accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceGuard {
    last: Option<u64>,
}

impl SequenceGuard {
    /// Guard that has seen nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `ordinal` if it is newer than anything seen; report whether it was.
    pub fn admit(&mut self, ordinal: u64) -> bool {
        match self.last {
            Some(last) if ordinal <= last => false,
            _ => {
                self.last = Some(ordinal);
                true
            },
        }
    }

    /// Highest ordinal admitted so far.
    pub fn last(&self) -> Option<u64> {
        self.last
    }
}
