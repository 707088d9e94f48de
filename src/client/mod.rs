//! Query client.
//!
//! Offloads frames to a remote query server and reads the processed results
//! back. One client holds at most one session.
//!
//! ```text
//! Disconnected -> Connecting -> Negotiating -> Active -> Closing -> Disconnected
//!                      |             |            |
//!                      +-------------+------------+--> Error
//! ```
//!
//! Errors are terminal for the session: the client never reconnects on its
//! own. Call [`QueryClient::connect`] again from `Error` or `Disconnected`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ConnectError, QueryError, Result, TransportError};
use crate::protocol::{CapabilityDescriptor, Frame, Message, Negotiator, SequenceGuard, SessionId};
use crate::transport::{self, Channel, ChannelKind};

/// Bound on the best-effort CLOSE sent by [`QueryClient::close`].
const CLOSE_NOTICE_TIMEOUT: Duration = Duration::from_millis(200);

/// Client connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    /// No session
    #[default]
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Offer sent, verdict pending
    Negotiating,
    /// Session established
    Active,
    /// Shutting the session down
    Closing,
    /// Session ended by a failure
    Error,
}

impl ClientState {
    /// States from which `connect` may be called.
    pub fn can_connect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Negotiating => "negotiating",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

struct Connection {
    channel: Arc<dyn Channel>,
    session_id: SessionId,
    negotiated: CapabilityDescriptor,
    next_ordinal: u64,
    inbound: SequenceGuard,
}

/// Query client
pub struct QueryClient {
    config: ClientConfig,
    pending: Option<ClientConfig>,
    capability: CapabilityDescriptor,
    state: watch::Sender<ClientState>,
    connection: Option<Connection>,
}

impl QueryClient {
    /// Client offering `capability` to the server in `config`.
    pub fn new(config: ClientConfig, capability: CapabilityDescriptor) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            config,
            pending: None,
            capability,
            state,
            connection: None,
        }
    }

    /// Current state
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    /// Session id while connected
    pub fn session_id(&self) -> Option<SessionId> {
        self.connection.as_ref().map(|c| c.session_id)
    }

    /// Descriptor the server accepted
    pub fn negotiated(&self) -> Option<&CapabilityDescriptor> {
        self.connection.as_ref().map(|c| &c.negotiated)
    }

    /// Descriptor offered on connect
    pub fn capability(&self) -> &CapabilityDescriptor {
        &self.capability
    }

    /// Configuration in effect for the current or next connection.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Replace the configuration.
    ///
    /// While a session is open the change is held back until the next
    /// `connect`; the live connection keeps its host, port and transport.
    pub fn set_config(&mut self, config: ClientConfig) {
        if self.connection.is_some() {
            debug!("Deferring config change until the next connect");
            self.pending = Some(config);
        } else {
            self.config = config;
        }
    }

    fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
    }

    /// Open the transport and negotiate a session.
    pub async fn connect(&mut self) -> Result<SessionId> {
        let current = self.state();
        if !current.can_connect() {
            return Err(QueryError::InvalidState(format!(
                "cannot connect while {current}"
            )));
        }
        if let Some(config) = self.pending.take() {
            self.config = config;
        }
        self.config.validate()?;
        self.capability.validate()?;

        let endpoint = &self.config.endpoint;
        info!(
            addr = %endpoint.address(),
            transport = %endpoint.connect_type,
            caps = %self.capability,
            "Connecting to query server"
        );

        self.set_state(ClientState::Connecting);
        let channel = match transport::connect_with(
            endpoint,
            &self.capability,
            self.config.discovery_attempts,
        )
        .await
        {
            Ok(channel) => channel,
            Err(e) => {
                warn!(addr = %endpoint.address(), error = %e, "Connect failed");
                self.set_state(ClientState::Error);
                return Err(e);
            },
        };

        self.set_state(ClientState::Negotiating);
        let negotiator = Negotiator::new(self.capability.clone(), endpoint.timeout());
        let nonce = handshake_nonce();
        let (session_id, negotiated) = match negotiator.initiate(channel.as_ref(), nonce).await {
            Ok(verdict) => verdict,
            Err(e) => {
                channel.close();
                self.set_state(ClientState::Error);
                let e = refine_handshake_error(e, channel.as_ref(), &endpoint.address());
                warn!(addr = %endpoint.address(), error = %e, "Negotiation failed");
                return Err(e);
            },
        };

        info!(
            session = %session_id,
            peer = %channel.peer_addr(),
            transport = channel.name(),
            caps = %negotiated,
            "Session active"
        );
        self.connection = Some(Connection {
            channel,
            session_id,
            negotiated,
            next_ordinal: 1,
            inbound: SequenceGuard::new(),
        });
        self.set_state(ClientState::Active);
        Ok(session_id)
    }

    fn active(&self) -> Result<&Connection> {
        match (&self.connection, self.state()) {
            (Some(connection), ClientState::Active) => Ok(connection),
            _ => Err(QueryError::SessionNotActive),
        }
    }

    /// End the session after a terminal failure.
    fn fail(&mut self, err: QueryError) -> QueryError {
        if let Some(connection) = self.connection.take() {
            warn!(session = %connection.session_id, error = %err, "Session failed");
            connection.channel.close();
        }
        self.set_state(ClientState::Error);
        err
    }

    /// Send one frame. Returns the ordinal it carried.
    ///
    /// The payload must match the negotiated descriptor: one buffer per
    /// tensor, each of the exact size when the dimensions are fixed.
    pub async fn send(&mut self, payload: Vec<Bytes>) -> Result<u64> {
        let connection = self.active()?;
        connection.negotiated.check_payload(&payload)?;

        let channel = connection.channel.clone();
        let ordinal = connection.next_ordinal;
        let frame = Frame::new(connection.session_id, ordinal, payload);
        let bytes = frame.payload_len();

        match channel.send(&Message::Data(frame)).await {
            Ok(()) => {},
            Err(e @ QueryError::Transport(TransportError::MessageTooLarge { .. })) => return Err(e),
            Err(e) if e.is_recoverable() => return Err(e),
            Err(e) => return Err(self.fail(e)),
        }

        if let Some(connection) = self.connection.as_mut() {
            connection.next_ordinal += 1;
        }
        if !self.config.silent {
            debug!(ordinal, bytes, "Frame sent");
        }
        Ok(ordinal)
    }

    /// Next frame for this session.
    ///
    /// Frames tagged with another session and stale datagrams are skipped.
    /// A server CLOSE, a closed transport or a read exceeding the timeout
    /// ends the session.
    pub async fn receive(&mut self) -> Result<Frame> {
        let connection = self.active()?;
        let channel = connection.channel.clone();
        let session_id = connection.session_id;
        let datagram = channel.kind() == ChannelKind::Datagram;

        loop {
            let message = match channel.receive().await {
                Ok(message) => message,
                Err(e) => return Err(self.fail(e)),
            };

            match message {
                Message::Data(frame) => {
                    if frame.session_id != session_id {
                        warn!(
                            session = %session_id,
                            tagged = %frame.session_id,
                            "Dropping frame for another session"
                        );
                        continue;
                    }
                    let fresh = self
                        .connection
                        .as_mut()
                        .is_some_and(|c| c.inbound.admit(frame.sequence_ordinal));
                    if datagram && !fresh {
                        debug!(ordinal = frame.sequence_ordinal, "Dropping stale datagram");
                        continue;
                    }
                    if !self.config.silent {
                        debug!(
                            ordinal = frame.sequence_ordinal,
                            bytes = frame.payload_len(),
                            "Frame received"
                        );
                    }
                    return Ok(frame);
                },
                Message::Close { session_id: closed } if closed != session_id => {
                    debug!(session = %session_id, closed = %closed, "Ignoring CLOSE for another session");
                },
                Message::Close { .. } => {
                    info!(session = %session_id, "Server closed session");
                    return Err(self.fail(TransportError::Closed.into()));
                },
                // ACCEPT repeated for a retransmitted offer
                Message::Accept { .. } if datagram => {},
                other => {
                    warn!(session = %session_id, kind = %other.kind(), "Ignoring unexpected message");
                },
            }
        }
    }

    /// Send one frame and wait for the next result.
    pub async fn query(&mut self, payload: Vec<Bytes>) -> Result<Frame> {
        self.send(payload).await?;
        self.receive().await
    }

    /// Close the session. Closing a disconnected client is a no-op.
    pub async fn close(&mut self) {
        let Some(connection) = self.connection.take() else {
            self.set_state(ClientState::Disconnected);
            return;
        };

        self.set_state(ClientState::Closing);
        let notice = Message::close(connection.session_id);
        match tokio::time::timeout(CLOSE_NOTICE_TIMEOUT, connection.channel.send(&notice)).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => debug!(error = %e, "CLOSE not delivered"),
            Err(_) => debug!("CLOSE timed out"),
        }
        connection.channel.close();

        info!(session = %connection.session_id, "Session closed");
        self.set_state(ClientState::Disconnected);
    }
}

impl Drop for QueryClient {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.channel.close();
        }
    }
}

fn handshake_nonce() -> u32 {
    // leading bytes of a v4 uuid carry no version bits
    let bytes = Uuid::new_v4().into_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// A datagram handshake that dies on a closed socket means nothing is
/// listening (ICMP port unreachable).
fn refine_handshake_error(err: QueryError, channel: &dyn Channel, address: &str) -> QueryError {
    match err {
        QueryError::Transport(TransportError::Closed | TransportError::BrokenPipe)
            if channel.kind() == ChannelKind::Datagram =>
        {
            ConnectError::Refused(address.to_string()).into()
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectType;
    use crate::protocol::TensorType;

    fn caps() -> CapabilityDescriptor {
        CapabilityDescriptor::single(&[4], TensorType::UInt8).unwrap()
    }

    #[test]
    fn test_new_client_is_disconnected() {
        let client = QueryClient::new(ClientConfig::default(), caps());
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.session_id().is_none());
        assert!(client.negotiated().is_none());
        assert_eq!(client.config().endpoint.port, 3001);
        assert!(client.config().silent);
    }

    #[tokio::test]
    async fn test_send_requires_session() {
        let mut client = QueryClient::new(ClientConfig::default(), caps());
        let err = client.send(vec![Bytes::from_static(b"abcd")]).await.unwrap_err();
        assert!(matches!(err, QueryError::SessionNotActive));
        assert!(matches!(
            client.receive().await.unwrap_err(),
            QueryError::SessionNotActive
        ));
    }

    #[tokio::test]
    async fn test_invalid_host_fails_fast() {
        let config = ClientConfig::default().with_host("f.a.i.l").with_timeout(2);
        let mut client = QueryClient::new(config, caps());
        let mut states = client.subscribe();

        let err = client.connect().await.unwrap_err();
        assert!(matches!(
            err,
            QueryError::Connect(ConnectError::ResolveFailure(_))
        ));
        assert_eq!(client.state(), ClientState::Error);
        assert!(states.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_set_config_while_idle_applies() {
        let mut client = QueryClient::new(ClientConfig::default(), caps());
        client.set_config(ClientConfig::default().with_connect_type(ConnectType::Udp));
        assert_eq!(client.config().endpoint.connect_type, ConnectType::Udp);
    }

    #[tokio::test]
    async fn test_close_when_disconnected() {
        let mut client = QueryClient::new(ClientConfig::default(), caps());
        client.close().await;
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_for_another_session_is_ignored() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let id = SessionId::new(41);

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let channel = crate::transport::TcpChannel::new(stream, None).unwrap();
            let offer = channel.receive().await.unwrap();
            assert!(matches!(offer, Message::Capability { .. }));
            channel.send(&Message::accept(id, caps())).await.unwrap();
            channel.send(&Message::close(SessionId::new(40))).await.unwrap();
            let frame = Frame::new(id, 1, vec![Bytes::from_static(b"abcd")]);
            channel.send(&Message::Data(frame)).await.unwrap();
            channel.send(&Message::close(id)).await.unwrap();
            channel
        });

        let config = ClientConfig::default()
            .with_host("127.0.0.1")
            .with_port(port)
            .with_timeout(2);
        let mut client = QueryClient::new(config, caps());
        assert_eq!(client.connect().await.unwrap(), id);

        let frame = client.receive().await.unwrap();
        assert_eq!(frame.session_id, id);
        assert_eq!(client.state(), ClientState::Active);

        let err = client.receive().await.unwrap_err();
        assert!(matches!(err, QueryError::Transport(TransportError::Closed)));
        assert_eq!(client.state(), ClientState::Error);
        drop(server.await.unwrap());
    }

    #[test]
    fn test_can_connect() {
        assert!(ClientState::Disconnected.can_connect());
        assert!(ClientState::Error.can_connect());
        assert!(!ClientState::Active.can_connect());
        assert_eq!(ClientState::Negotiating.to_string(), "negotiating");
    }
}
