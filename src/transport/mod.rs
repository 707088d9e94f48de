//! Transport layer abstraction for tensor queries.
//!
//! Provides message channels over three connect types:
//! - **TCP**: one stream per client, framed by [`MessageCodec`]
//! - **UDP**: connectionless datagrams, one message per datagram
//! - **HYBRID**: UDP endpoint discovery, then a TCP stream
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      QueryClient / QueryServer          │
//! │       (Transport-Agnostic)              │
//! └──────────────────┬──────────────────────┘
//!                    │  Arc<dyn Channel>
//!          ┌────────┴────────┐
//!          ▼                 ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │   TcpChannel    │ │   UdpChannel    │
//! │ (FramedRead/    │ │ (socket + peer, │
//! │  FramedWrite)   │ │  demux inbox)   │
//! └─────────────────┘ └─────────────────┘
//! ```
//!
//! Every channel owns a [`CancellationToken`]; [`Channel::close`] cancels it
//! and any suspended `send`/`receive` returns [`TransportError::Closed`].

mod codec;
mod hybrid;
mod tcp;
mod udp;

pub use codec::MessageCodec;
pub use hybrid::{discover, DiscoveryResponder};
pub use tcp::TcpChannel;
pub use udp::{UdpChannel, MAX_DATAGRAM_SIZE};

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ConnectType, EndpointConfig, DEFAULT_DISCOVERY_ATTEMPTS};
use crate::error::{BindError, ConnectError, QueryError, Result, TransportError};
use crate::protocol::{CapabilityDescriptor, Message};

/// Boxed future returned by [`Channel`] operations.
pub type ChannelFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Delivery semantics of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Reliable and ordered
    Stream,
    /// Unreliable, may reorder or duplicate
    Datagram,
}

/// Bidirectional message channel to one peer.
///
/// Implementations are shared between a session's receive and writer tasks,
/// so `send` and `receive` may run concurrently.
pub trait Channel: Send + Sync {
    /// Send one message, bounded by the channel's I/O timeout.
    fn send<'a>(&'a self, message: &'a Message) -> ChannelFuture<'a, ()>;

    /// Receive the next message, bounded by the channel's I/O timeout.
    fn receive(&self) -> ChannelFuture<'_, Message>;

    /// Close the channel. Suspended operations return `Closed`.
    fn close(&self);

    /// Whether [`Channel::close`] has been called.
    fn is_closed(&self) -> bool;

    /// Remote address.
    fn peer_addr(&self) -> SocketAddr;

    /// Local address.
    fn local_addr(&self) -> SocketAddr;

    /// Delivery semantics.
    fn kind(&self) -> ChannelKind;

    /// Transport name for logging.
    fn name(&self) -> &'static str;
}

/// Run `op` under the channel's timeout; cancellation wins over completion.
pub(crate) async fn guarded<T, F>(
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    op: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(TransportError::Closed.into());
    }
    let bounded = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, op)
                .await
                .map_err(|_| QueryError::Transport(TransportError::Timeout))?,
            None => op.await,
        }
    };
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(TransportError::Closed.into()),
        result = bounded => result,
    }
}

/// Map a socket error to the channel error space.
pub(crate) fn io_to_transport(err: &std::io::Error) -> QueryError {
    TransportError::from_io(err).into()
}

/// Syntactic host name check (RFC 1123 labels, or an IP literal).
pub(crate) fn is_valid_host(host: &str) -> bool {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        return true;
    }
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Resolve `host:port` within `within`.
pub(crate) async fn resolve(
    host: &str,
    port: u16,
    within: Duration,
) -> std::result::Result<Vec<SocketAddr>, ConnectError> {
    if !is_valid_host(host) {
        return Err(ConnectError::ResolveFailure(host.to_string()));
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    match tokio::time::timeout(within, lookup_host((host, port))).await {
        Ok(Ok(addrs)) => {
            let addrs: Vec<SocketAddr> = addrs.collect();
            if addrs.is_empty() {
                Err(ConnectError::ResolveFailure(host.to_string()))
            } else {
                Ok(addrs)
            }
        },
        Ok(Err(e)) => {
            debug!(host, error = %e, "Host lookup failed");
            Err(ConnectError::ResolveFailure(host.to_string()))
        },
        Err(_) => {
            debug!(host, "Host lookup timed out");
            Err(ConnectError::ResolveFailure(host.to_string()))
        },
    }
}

/// Open a channel to the endpoint.
pub async fn connect(
    config: &EndpointConfig,
    descriptor: &CapabilityDescriptor,
) -> Result<Arc<dyn Channel>> {
    connect_with(config, descriptor, DEFAULT_DISCOVERY_ATTEMPTS).await
}

/// Open a channel to the endpoint with an explicit HYBRID attempt count.
///
/// `descriptor` is only used by HYBRID discovery.
pub async fn connect_with(
    config: &EndpointConfig,
    descriptor: &CapabilityDescriptor,
    discovery_attempts: u32,
) -> Result<Arc<dyn Channel>> {
    config.validate()?;
    let timeout = config.timeout();

    let channel: Arc<dyn Channel> = match config.connect_type {
        ConnectType::Tcp => {
            let addrs = resolve(&config.host, config.port, timeout).await?;
            Arc::new(tcp::connect(&addrs, timeout).await?)
        },
        ConnectType::Udp => {
            let addrs = resolve(&config.host, config.port, timeout).await?;
            Arc::new(udp::connect(&addrs, timeout).await?)
        },
        ConnectType::Hybrid => {
            let endpoint = discover(config, descriptor, discovery_attempts).await?;
            Arc::new(tcp::connect(&[endpoint], timeout).await?)
        },
    };

    debug!(
        transport = channel.name(),
        peer = %channel.peer_addr(),
        "Channel connected"
    );
    Ok(channel)
}

/// Bound listening endpoint, ready for the server's accept/demux loop.
#[derive(Debug)]
pub enum Listener {
    /// TCP listener
    Tcp(TcpListener),
    /// Shared UDP socket
    Udp(UdpSocket),
    /// TCP listener plus discovery socket on the same port
    Hybrid {
        /// Stream listener
        stream: TcpListener,
        /// Discovery socket
        discovery: UdpSocket,
    },
}

impl Listener {
    /// Address actually bound (real port when 0 was requested).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = match self {
            Self::Tcp(listener) | Self::Hybrid {
                stream: listener, ..
            } => listener.local_addr()?,
            Self::Udp(socket) => socket.local_addr()?,
        };
        Ok(addr)
    }

    /// Connect type served.
    pub fn connect_type(&self) -> ConnectType {
        match self {
            Self::Tcp(_) => ConnectType::Tcp,
            Self::Udp(_) => ConnectType::Udp,
            Self::Hybrid { .. } => ConnectType::Hybrid,
        }
    }
}

fn bind_error(addr: SocketAddr, err: &std::io::Error) -> BindError {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::AddrInUse => BindError::AddressInUse(addr.to_string()),
        ErrorKind::PermissionDenied => BindError::Permission(addr.to_string()),
        _ => BindError::Other {
            addr: addr.to_string(),
            reason: err.to_string(),
        },
    }
}

/// Bind the endpoint for its connect type.
pub async fn listen(config: &EndpointConfig) -> Result<Listener> {
    config.validate()?;
    let addr = resolve(&config.host, config.port, config.timeout())
        .await
        .map_err(|_| BindError::Resolve(config.host.clone()))?
        .into_iter()
        .next()
        .ok_or_else(|| BindError::Resolve(config.host.clone()))?;

    let listener = match config.connect_type {
        ConnectType::Tcp => Listener::Tcp(
            TcpListener::bind(addr)
                .await
                .map_err(|e| bind_error(addr, &e))?,
        ),
        ConnectType::Udp => Listener::Udp(
            UdpSocket::bind(addr)
                .await
                .map_err(|e| bind_error(addr, &e))?,
        ),
        ConnectType::Hybrid => {
            let stream = TcpListener::bind(addr)
                .await
                .map_err(|e| bind_error(addr, &e))?;
            let discovery_addr = SocketAddr::new(addr.ip(), stream.local_addr()?.port());
            let discovery = UdpSocket::bind(discovery_addr)
                .await
                .map_err(|e| bind_error(discovery_addr, &e))?;
            Listener::Hybrid { stream, discovery }
        },
    };

    info!(
        connect_type = %config.connect_type,
        addr = %listener.local_addr()?,
        "Listening"
    );
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_syntax() {
        assert!(is_valid_host("localhost"));
        assert!(is_valid_host("127.0.0.1"));
        assert!(is_valid_host("[::1]"));
        assert!(is_valid_host("node-1.cluster.local."));
        assert!(!is_valid_host(""));
        assert!(!is_valid_host("bad host"));
        assert!(!is_valid_host("-leading.example"));
        assert!(!is_valid_host("a..b"));
    }

    #[tokio::test]
    async fn test_resolve_ip_literal_skips_lookup() {
        let addrs = resolve("127.0.0.1", 9, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(addrs, vec![SocketAddr::from(([127, 0, 0, 1], 9))]);
    }

    #[tokio::test]
    async fn test_resolve_invalid_syntax_fails_fast() {
        let err = resolve("no such host!", 1, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::ResolveFailure(_)));
    }

    #[tokio::test]
    async fn test_listen_reports_ephemeral_port() {
        for connect_type in [ConnectType::Tcp, ConnectType::Udp, ConnectType::Hybrid] {
            let config = EndpointConfig::default()
                .with_host("127.0.0.1")
                .with_port(0)
                .with_connect_type(connect_type);
            let listener = listen(&config).await.unwrap();
            assert_ne!(listener.local_addr().unwrap().port(), 0);
            assert_eq!(listener.connect_type(), connect_type);
        }
    }

    #[tokio::test]
    async fn test_listen_on_used_port_fails() {
        let config = EndpointConfig::default().with_host("127.0.0.1").with_port(0);
        let first = listen(&config).await.unwrap();
        let port = first.local_addr().unwrap().port();

        let err = listen(&config.clone().with_port(port)).await.unwrap_err();
        assert!(matches!(err, QueryError::Bind(BindError::AddressInUse(_))));
    }
}
