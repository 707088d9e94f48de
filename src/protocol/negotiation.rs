//! Capability negotiation.
//!
//! The client sends its descriptor in a CAPABILITY message; the server checks
//! it against its own and answers ACCEPT (echoing the negotiated descriptor
//! with the assigned session id) or REJECT. Over datagram channels the offer
//! is retransmitted with the same nonce until a reply arrives, and the server
//! answers duplicates idempotently.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Instant};
use tracing::debug;

use super::capabilities::CapabilityDescriptor;
use super::frame::SessionId;
use super::message::Message;
use crate::error::{NegotiationError, QueryError, Result, TransportError};
use crate::transport::{Channel, ChannelKind};

/// Offers sent over a datagram channel before giving up.
pub const DATAGRAM_HANDSHAKE_ATTEMPTS: u32 = 3;

/// Server-side matching rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationPolicy {
    /// Treat a `0` extent in the server descriptor as "any"
    #[serde(default)]
    pub allow_wildcard: bool,
}

impl NegotiationPolicy {
    /// Allow wildcard extents.
    pub fn with_wildcard(mut self) -> Self {
        self.allow_wildcard = true;
        self
    }
}

/// Runs one side of the capability handshake.
#[derive(Debug, Clone)]
pub struct Negotiator {
    local: CapabilityDescriptor,
    policy: NegotiationPolicy,
    timeout: Duration,
}

impl Negotiator {
    /// Negotiator for `local` with the given handshake window.
    pub fn new(local: CapabilityDescriptor, timeout: Duration) -> Self {
        Self {
            local,
            policy: NegotiationPolicy::default(),
            timeout,
        }
    }

    /// Set matching policy.
    pub fn with_policy(mut self, policy: NegotiationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Descriptor this side negotiates with.
    pub fn local(&self) -> &CapabilityDescriptor {
        &self.local
    }

    /// Handshake window.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Decide on an offer; the negotiated descriptor is the offer itself.
    pub fn evaluate(
        &self,
        offered: &CapabilityDescriptor,
    ) -> std::result::Result<CapabilityDescriptor, NegotiationError> {
        self.local.check_compatible(offered, self.policy)?;
        Ok(offered.clone())
    }

    /// Decide on an offer and build the reply to send.
    pub fn answer(
        &self,
        session_id: SessionId,
        offered: &CapabilityDescriptor,
    ) -> (Message, std::result::Result<CapabilityDescriptor, NegotiationError>) {
        match self.evaluate(offered) {
            Ok(negotiated) => (Message::accept(session_id, negotiated.clone()), Ok(negotiated)),
            Err(err) => (Message::reject(&err), Err(err)),
        }
    }

    /// Server side: wait for the client's offer.
    ///
    /// Returns the handshake nonce and the offered descriptor.
    pub async fn await_offer(&self, channel: &dyn Channel) -> Result<(u32, CapabilityDescriptor)> {
        match timeout(self.timeout, channel.receive()).await {
            Err(_) | Ok(Err(QueryError::Transport(TransportError::Timeout))) => {
                Err(NegotiationError::Timeout.into())
            },
            Ok(Err(err)) => Err(err),
            Ok(Ok(Message::Capability { nonce, descriptor })) => Ok((nonce, descriptor)),
            Ok(Ok(other)) => Err(NegotiationError::Unexpected(format!(
                "expected CAPABILITY, got {}",
                other.kind()
            ))
            .into()),
        }
    }

    /// Client side: offer the local descriptor and wait for the verdict.
    pub async fn initiate(
        &self,
        channel: &dyn Channel,
        nonce: u32,
    ) -> Result<(SessionId, CapabilityDescriptor)> {
        let datagram = channel.kind() == ChannelKind::Datagram;
        let attempts = if datagram {
            DATAGRAM_HANDSHAKE_ATTEMPTS
        } else {
            1
        };
        let window = self.timeout / attempts;
        let offer = Message::capability(nonce, self.local.clone());

        for attempt in 1..=attempts {
            channel.send(&offer).await?;
            let deadline = Instant::now() + window;

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let reply = match timeout(remaining, channel.receive()).await {
                    Err(_) | Ok(Err(QueryError::Transport(TransportError::Timeout))) => break,
                    Ok(Err(err)) => return Err(err),
                    Ok(Ok(reply)) => reply,
                };

                match reply {
                    Message::Accept {
                        session_id,
                        descriptor,
                    } => {
                        if session_id.is_none() || descriptor.tensor_count != self.local.tensor_count
                        {
                            return Err(NegotiationError::Unexpected(format!(
                                "ACCEPT for session {session_id} carries {descriptor}"
                            ))
                            .into());
                        }
                        return Ok((session_id, descriptor));
                    },
                    Message::Reject { reason, message } => {
                        return Err(reason.into_error(message).into());
                    },
                    other if datagram => {
                        debug!(kind = %other.kind(), "Ignoring datagram during handshake");
                    },
                    other => {
                        return Err(NegotiationError::Unexpected(format!(
                            "expected ACCEPT or REJECT, got {}",
                            other.kind()
                        ))
                        .into());
                    },
                }
            }

            if attempt < attempts {
                debug!(attempt, nonce, "No handshake reply, retransmitting offer");
            }
        }

        Err(NegotiationError::Timeout.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelFuture;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::{mpsc, Mutex};

    /// In-memory channel; drops the first `lose` sends to mimic datagram loss.
    struct MemoryChannel {
        kind: ChannelKind,
        tx: mpsc::UnboundedSender<Message>,
        rx: Mutex<mpsc::UnboundedReceiver<Message>>,
        lose: AtomicU32,
        closed: AtomicBool,
    }

    fn pair(kind: ChannelKind, lose: u32) -> (MemoryChannel, MemoryChannel) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let client = MemoryChannel {
            kind,
            tx: a_tx,
            rx: Mutex::new(b_rx),
            lose: AtomicU32::new(lose),
            closed: AtomicBool::new(false),
        };
        let server = MemoryChannel {
            kind,
            tx: b_tx,
            rx: Mutex::new(a_rx),
            lose: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        };
        (client, server)
    }

    impl Channel for MemoryChannel {
        fn send<'a>(&'a self, message: &'a Message) -> ChannelFuture<'a, ()> {
            Box::pin(async move {
                let lost = self
                    .lose
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if !lost {
                    self.tx
                        .send(message.clone())
                        .map_err(|_| TransportError::Closed)?;
                }
                Ok(())
            })
        }

        fn receive(&self) -> ChannelFuture<'_, Message> {
            Box::pin(async move {
                let mut rx = self.rx.lock().await;
                rx.recv().await.ok_or_else(|| TransportError::Closed.into())
            })
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn peer_addr(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 1))
        }

        fn local_addr(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 2))
        }

        fn kind(&self) -> ChannelKind {
            self.kind
        }

        fn name(&self) -> &'static str {
            "memory"
        }
    }

    fn caps(s: &str) -> CapabilityDescriptor {
        s.parse().unwrap()
    }

    const SERVER_CAPS: &str = "other/tensors,num_tensors=1,dimensions=3:300:300:1,types=uint8";

    async fn serve_once(server: MemoryChannel, negotiator: Negotiator, replies: usize) {
        for _ in 0..replies {
            let (_, offered) = negotiator.await_offer(&server).await.unwrap();
            let (reply, _) = negotiator.answer(SessionId::new(42), &offered);
            server.send(&reply).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_stream_handshake_accepts() {
        let (client, server) = pair(ChannelKind::Stream, 0);
        let timeout = Duration::from_secs(2);
        let server_side = Negotiator::new(caps(SERVER_CAPS), timeout);
        tokio::spawn(serve_once(server, server_side, 1));

        let client_side = Negotiator::new(caps(SERVER_CAPS), timeout);
        let (id, negotiated) = client_side.initiate(&client, 7).await.unwrap();
        assert_eq!(id, SessionId::new(42));
        assert_eq!(negotiated, caps(SERVER_CAPS));
    }

    #[tokio::test]
    async fn test_mismatch_is_rejected_with_reason() {
        let (client, server) = pair(ChannelKind::Stream, 0);
        let timeout = Duration::from_secs(2);
        tokio::spawn(serve_once(server, Negotiator::new(caps(SERVER_CAPS), timeout), 1));

        let offered = caps("other/tensors,num_tensors=1,dimensions=3:300:300:1,types=float32");
        let err = Negotiator::new(offered, timeout)
            .initiate(&client, 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueryError::Negotiation(NegotiationError::MismatchType(_))
        ));
    }

    #[tokio::test]
    async fn test_datagram_offer_is_retransmitted() {
        let (client, server) = pair(ChannelKind::Datagram, 1);
        let timeout = Duration::from_millis(900);
        tokio::spawn(serve_once(server, Negotiator::new(caps(SERVER_CAPS), timeout), 1));

        let (id, _) = Negotiator::new(caps(SERVER_CAPS), timeout)
            .initiate(&client, 3)
            .await
            .unwrap();
        assert_eq!(id, SessionId::new(42));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (client, _server) = pair(ChannelKind::Stream, 0);
        let err = Negotiator::new(caps(SERVER_CAPS), Duration::from_millis(100))
            .initiate(&client, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Negotiation(NegotiationError::Timeout)));
    }

    #[tokio::test]
    async fn test_await_offer_rejects_non_capability() {
        let (client, server) = pair(ChannelKind::Stream, 0);
        client.send(&Message::close(SessionId::new(1))).await.unwrap();
        let err = Negotiator::new(caps(SERVER_CAPS), Duration::from_secs(1))
            .await_offer(&server)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueryError::Negotiation(NegotiationError::Unexpected(_))
        ));
    }
}
