//! Tensor query error types.
//!
//! # Error Classification
//!
//! Errors are grouped by the layer that raises them and by how far their
//! effect reaches:
//!
//! - **Setup-time** ([`BindError`], [`QueryError::Config`]): surfaced from
//!   `bind`/`connect` before any data flows.
//! - **Per-connection** ([`ConnectError`], [`NegotiationError`]): terminal for
//!   one connection attempt, never retried internally.
//! - **Per-session** ([`TransportError`]): terminal for the affected session
//!   only, except [`TransportError::WouldBlock`] which the caller may retry.
//! - **Expected** ([`RoutingError`]): a frame whose session has already gone.
//!   Logged and dropped, never treated as a fault.

use thiserror::Error;

use crate::protocol::SessionId;

/// Failure to establish an outbound connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Host name could not be resolved to an address.
    #[error("cannot resolve host '{0}'")]
    ResolveFailure(String),

    /// Peer actively refused the connection.
    #[error("connection refused by {0}")]
    Refused(String),

    /// Connection attempt did not complete within the timeout.
    #[error("connection to {0} timed out")]
    Timeout(String),

    /// HYBRID discovery got no usable answer.
    #[error("discovery failed after {attempts} attempt(s) to {target}")]
    DiscoveryFailed {
        /// Address the discovery datagrams were sent to.
        target: String,
        /// Number of attempts made.
        attempts: u32,
    },
}

/// Failure to bind a listening endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    /// Requested address/port is already taken.
    #[error("address {0} already in use")]
    AddressInUse(String),

    /// Not allowed to bind the requested address/port.
    #[error("permission denied binding {0}")]
    Permission(String),

    /// Bind host could not be resolved.
    #[error("cannot resolve bind host '{0}'")]
    Resolve(String),

    /// Any other bind failure.
    #[error("bind {addr} failed: {reason}")]
    Other {
        /// Address being bound.
        addr: String,
        /// OS-level reason.
        reason: String,
    },
}

/// Channel-level I/O failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Peer went away while writing.
    #[error("broken pipe")]
    BrokenPipe,

    /// Channel was closed (locally or by the peer).
    #[error("channel closed")]
    Closed,

    /// Operation exceeded the channel's I/O timeout.
    #[error("operation timed out")]
    Timeout,

    /// Operation could not proceed right now; retry later.
    #[error("operation would block")]
    WouldBlock,

    /// Encoded message does not fit the transport's size limit.
    #[error("message of {size} bytes exceeds transport limit of {limit}")]
    MessageTooLarge {
        /// Encoded size.
        size: usize,
        /// Transport limit.
        limit: usize,
    },
}

impl TransportError {
    /// Whether the caller may simply retry the operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }

    /// Map an I/O error raised by a socket operation.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::WouldBlock => Self::WouldBlock,
            ErrorKind::TimedOut => Self::Timeout,
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                Self::BrokenPipe
            },
            _ => Self::Closed,
        }
    }
}

/// Capability negotiation failure. Terminal for the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// Tensor counts differ.
    #[error("tensor count mismatch: {0}")]
    MismatchTensorCount(String),

    /// A tensor dimension differs.
    #[error("dimension mismatch: {0}")]
    MismatchDimension(String),

    /// A tensor element type differs.
    #[error("type mismatch: {0}")]
    MismatchType(String),

    /// No reply within the negotiation window.
    #[error("negotiation timed out")]
    Timeout,

    /// Peer sent something other than the expected handshake message.
    #[error("unexpected handshake message: {0}")]
    Unexpected(String),
}

/// Routing failure on the server's send half.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Originating session is no longer registered.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
}

/// Tensor query errors.
#[derive(Error, Debug)]
pub enum QueryError {
    /// Outbound connection failed.
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Listening endpoint could not be bound.
    #[error("Bind error: {0}")]
    Bind(#[from] BindError),

    /// Channel I/O failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Capability negotiation failed.
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Frame could not be routed.
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// A session with this id is already active.
    #[error("Duplicate session: {0}")]
    DuplicateSession(SessionId),

    /// Operation requires an active session.
    #[error("Session not active")]
    SessionNotActive,

    /// Operation not allowed in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed wire message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Malformed capability descriptor or payload.
    #[error("Invalid capability: {0}")]
    InvalidCapability(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for tensor query operations
pub type Result<T> = std::result::Result<T, QueryError>;

impl QueryError {
    /// Whether the failing operation may be retried as-is.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_recoverable())
    }
}

impl From<toml::de::Error> for QueryError {
    fn from(err: toml::de::Error) -> Self {
        QueryError::Config(format!("Failed to parse config: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_only_would_block_is_recoverable() {
        assert!(TransportError::WouldBlock.is_recoverable());
        assert!(!TransportError::Closed.is_recoverable());
        assert!(!TransportError::Timeout.is_recoverable());
        assert!(!TransportError::BrokenPipe.is_recoverable());

        let err: QueryError = TransportError::WouldBlock.into();
        assert!(err.is_recoverable());
        let err: QueryError = NegotiationError::Timeout.into();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_io_error_mapping() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(TransportError::from_io(&reset), TransportError::BrokenPipe);

        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert_eq!(TransportError::from_io(&eof), TransportError::Closed);

        let wb = io::Error::from(io::ErrorKind::WouldBlock);
        assert_eq!(TransportError::from_io(&wb), TransportError::WouldBlock);
    }

    #[test]
    fn test_display_messages() {
        let err: QueryError = ConnectError::ResolveFailure("f.a.i.l".to_string()).into();
        assert_eq!(err.to_string(), "Connect error: cannot resolve host 'f.a.i.l'");

        let err: QueryError = RoutingError::UnknownSession(SessionId::new(7)).into();
        assert!(err.to_string().contains("unknown session"));
    }
}
