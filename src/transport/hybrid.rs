//! HYBRID connect type: UDP endpoint discovery, then a TCP stream.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::udp::wildcard_for;
use super::{resolve, MAX_DATAGRAM_SIZE};
use crate::config::EndpointConfig;
use crate::error::{ConnectError, QueryError, Result};
use crate::protocol::{CapabilityDescriptor, Message, Negotiator};

/// Ask the server where to open the stream channel.
///
/// Sends up to `attempts` DISCOVER datagrams, each waiting
/// `timeout / attempts` for an ENDPOINT answer.
pub async fn discover(
    config: &EndpointConfig,
    descriptor: &CapabilityDescriptor,
    attempts: u32,
) -> Result<SocketAddr> {
    let timeout = config.timeout();
    let target = *resolve(&config.host, config.port, timeout)
        .await?
        .first()
        .ok_or_else(|| ConnectError::ResolveFailure(config.host.clone()))?;

    let attempts = attempts.max(1);
    let window = timeout / attempts;
    let socket = UdpSocket::bind(wildcard_for(&target)).await?;
    let request = Message::Discover {
        descriptor: descriptor.clone(),
    }
    .to_bytes()?;
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    for attempt in 1..=attempts {
        socket.send_to(&request, target).await?;

        let answer = tokio::time::timeout(window, async {
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    // ICMP unreachable from an earlier attempt
                    Err(e) => {
                        debug!(error = %e, "Discovery receive failed");
                        tokio::time::sleep(window / 4).await;
                        continue;
                    },
                };
                if from.ip() != target.ip() {
                    continue;
                }
                match Message::from_bytes(&buf[..len]) {
                    Ok(message) => return (message, from),
                    Err(e) => debug!(%from, error = %e, "Ignoring malformed discovery answer"),
                }
            }
        })
        .await;

        match answer {
            Ok((Message::Endpoint { host, port }, from)) => {
                let endpoint = endpoint_addr(&host, port, from, timeout).await?;
                debug!(attempt, %endpoint, "Discovered stream endpoint");
                return Ok(endpoint);
            },
            Ok((Message::Reject { reason, message }, _)) => {
                return Err(reason.into_error(message).into());
            },
            Ok((other, from)) => {
                debug!(%from, kind = %other.kind(), "Unexpected discovery answer");
            },
            Err(_) => debug!(attempt, %target, "No discovery answer"),
        }
    }

    Err(ConnectError::DiscoveryFailed {
        target: target.to_string(),
        attempts,
    }
    .into())
}

async fn endpoint_addr(
    host: &str,
    port: u16,
    from: SocketAddr,
    timeout: Duration,
) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        let ip = if ip.is_unspecified() { from.ip() } else { ip };
        return Ok(SocketAddr::new(ip, port));
    }
    let addrs = resolve(host, port, timeout).await?;
    addrs
        .iter()
        .find(|a| a.is_ipv4() == from.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| QueryError::Connect(ConnectError::ResolveFailure(host.to_string())))
}

/// Answers DISCOVER datagrams with the stream endpoint.
///
/// Offers the server could never accept are answered with REJECT so the
/// client fails before opening a stream.
#[derive(Debug)]
pub struct DiscoveryResponder {
    socket: UdpSocket,
    host: String,
    port: u16,
    negotiator: Arc<Negotiator>,
}

impl DiscoveryResponder {
    /// Responder advertising `host:port` as the stream endpoint.
    pub fn new(
        socket: UdpSocket,
        host: impl Into<String>,
        port: u16,
        negotiator: Arc<Negotiator>,
    ) -> Self {
        Self {
            socket,
            host: host.into(),
            port,
            negotiator,
        }
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        info!(host = %self.host, port = self.port, "Discovery responder started");

        loop {
            let received = tokio::select! {
                () = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            let (len, from) = match received {
                Ok(received) => received,
                Err(e) => {
                    debug!(error = %e, "Discovery socket error");
                    continue;
                },
            };

            let descriptor = match Message::from_bytes(&buf[..len]) {
                Ok(Message::Discover { descriptor }) => descriptor,
                Ok(other) => {
                    debug!(%from, kind = %other.kind(), "Ignoring non-discovery datagram");
                    continue;
                },
                Err(e) => {
                    warn!(%from, error = %e, "Malformed discovery datagram");
                    continue;
                },
            };

            let reply = match self.negotiator.evaluate(&descriptor) {
                Ok(_) => Message::Endpoint {
                    host: self.host.clone(),
                    port: self.port,
                },
                Err(err) => {
                    warn!(%from, error = %err, "Discovery offer cannot be accepted");
                    Message::reject(&err)
                },
            };

            match reply.to_bytes() {
                Ok(bytes) => {
                    if let Err(e) = self.socket.send_to(&bytes, from).await {
                        debug!(%from, error = %e, "Discovery reply failed");
                    }
                },
                Err(e) => warn!(error = %e, "Cannot encode discovery reply"),
            }
        }

        debug!("Discovery responder stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NegotiationError;

    fn caps(s: &str) -> CapabilityDescriptor {
        s.parse().unwrap()
    }

    const CAPS: &str = "other/tensors,num_tensors=1,dimensions=4,types=float32";

    async fn responder() -> (u16, CancellationToken) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let negotiator = Arc::new(Negotiator::new(caps(CAPS), Duration::from_secs(1)));
        let shutdown = CancellationToken::new();
        tokio::spawn(DiscoveryResponder::new(socket, "0.0.0.0", 4242, negotiator).run(shutdown.clone()));
        (port, shutdown)
    }

    #[tokio::test]
    async fn test_unspecified_host_replaced_by_sender() {
        let (port, shutdown) = responder().await;
        let config = EndpointConfig::default().with_host("127.0.0.1").with_port(port);

        let endpoint = discover(&config, &caps(CAPS), 3).await.unwrap();
        assert_eq!(endpoint, SocketAddr::from(([127, 0, 0, 1], 4242)));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_incompatible_offer_rejected() {
        let (port, shutdown) = responder().await;
        let config = EndpointConfig::default().with_host("127.0.0.1").with_port(port);

        let offered = caps("other/tensors,num_tensors=1,dimensions=4,types=int8");
        let err = discover(&config, &offered, 3).await.unwrap_err();
        assert!(matches!(
            err,
            QueryError::Negotiation(NegotiationError::MismatchType(_))
        ));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_no_responder_fails_after_attempts() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = EndpointConfig::default()
            .with_host("127.0.0.1")
            .with_port(silent.local_addr().unwrap().port())
            .with_timeout(1);

        let err = discover(&config, &caps(CAPS), 2).await.unwrap_err();
        assert!(matches!(
            err,
            QueryError::Connect(ConnectError::DiscoveryFailed { attempts: 2, .. })
        ));
    }
}
