//! Server-side session records.
//!
//! A session is one negotiated client stream. Its record lives only in the
//! [`SessionRegistry`]; everything else refers to it by [`SessionId`].

mod registry;

pub use registry::SessionRegistry;

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::{CapabilityDescriptor, SequenceGuard, SessionId};

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Offer received, verdict pending
    Negotiating,
    /// Accepted; frames flow
    Active,
    /// Client sent CLOSE
    Closing,
    /// Idle longer than the timeout
    TimedOut,
    /// Transport failed
    Error,
    /// Offer rejected
    Failed,
    /// No longer registered
    Removed,
}

impl SessionState {
    /// States a registered session may be in.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Negotiating | Self::Active)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Negotiating => "negotiating",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::TimedOut => "timed out",
            Self::Error => "error",
            Self::Failed => "failed",
            Self::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// Transport identity a session id is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    /// A TCP connection, named by its 4-tuple
    Stream {
        /// Server-side address
        local: SocketAddr,
        /// Client address
        peer: SocketAddr,
    },
    /// A UDP peer; the nonce tells apart successive handshakes
    Datagram {
        /// Server port
        local_port: u16,
        /// Client address
        peer: SocketAddr,
        /// Handshake nonce chosen by the client
        nonce: u32,
    },
}

impl SessionKey {
    /// Session id for this identity. Never [`SessionId::NONE`].
    pub fn session_id(&self) -> SessionId {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        match hasher.finish() {
            0 => SessionId::new(1),
            raw => SessionId::new(raw),
        }
    }

    /// Client address.
    pub fn peer(&self) -> SocketAddr {
        match self {
            Self::Stream { peer, .. } | Self::Datagram { peer, .. } => *peer,
        }
    }

    /// Whether the session runs over datagrams.
    pub fn is_datagram(&self) -> bool {
        matches!(self, Self::Datagram { .. })
    }
}

/// Per-session traffic counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Frames accepted from the client
    pub frames_in: u64,
    /// Frames routed to the client
    pub frames_out: u64,
    /// Payload bytes accepted from the client
    pub bytes_in: u64,
    /// Payload bytes routed to the client
    pub bytes_out: u64,
    /// Datagrams discarded as duplicate or stale
    pub stale_dropped: u64,
    /// Routed frames discarded because the session queue was full
    pub queue_dropped: u64,
}

/// Session record
#[derive(Debug, Clone)]
pub struct Session {
    /// Session ID
    pub id: SessionId,
    /// Transport identity
    pub key: SessionKey,
    /// Server descriptor until an offer arrives, then the offered one,
    /// then the negotiated one once active
    pub negotiated_capability: CapabilityDescriptor,
    /// Last send or receive
    pub last_activity: Instant,
    /// Current state
    pub state: SessionState,
    /// Wall-clock creation time
    pub created_at: DateTime<Utc>,
    /// Traffic counters
    pub stats: SessionStats,
    inbound: SequenceGuard,
    next_outbound: u64,
}

impl Session {
    /// New record in `Negotiating`.
    pub fn new(id: SessionId, key: SessionKey, offered: CapabilityDescriptor) -> Self {
        Self {
            id,
            key,
            negotiated_capability: offered,
            last_activity: Instant::now(),
            state: SessionState::Negotiating,
            created_at: Utc::now(),
            stats: SessionStats::default(),
            inbound: SequenceGuard::new(),
            next_outbound: 1,
        }
    }

    /// Highest inbound ordinal accepted.
    pub fn last_inbound_ordinal(&self) -> Option<u64> {
        self.inbound.last()
    }

    /// Ordinal the next routed frame will carry.
    pub fn next_outbound_ordinal(&self) -> u64 {
        self.next_outbound
    }

    /// Idle time as of `now`; zero if touched after `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Whether the session has been idle longer than `timeout`.
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.idle_for(now) > timeout
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
