//! UDP transport: one message per datagram.
//!
//! A client owns a connected socket. On the server every session shares the
//! listening socket; the demultiplexer reads it and feeds each session's
//! inbox, so a server-side channel only ever reads from its inbox.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{guarded, io_to_transport, Channel, ChannelFuture, ChannelKind};
use crate::error::{ConnectError, QueryError, Result, TransportError};
use crate::protocol::Message;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Receive buffer; one byte over the limit so oversized datagrams are noticed.
const RECV_BUFFER_SIZE: usize = MAX_DATAGRAM_SIZE + 1;

#[derive(Debug)]
enum Inbound {
    /// Read the (connected) socket directly.
    Socket,
    /// Read what the demultiplexer forwards.
    Inbox(Mutex<mpsc::Receiver<Message>>),
}

/// Datagram channel: a socket plus a default peer.
#[derive(Debug)]
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    local: SocketAddr,
    inbound: Inbound,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl UdpChannel {
    /// Client channel over a socket already connected to its peer.
    pub fn connected(socket: UdpSocket, timeout: Option<Duration>) -> Result<Self> {
        let peer = socket.peer_addr()?;
        let local = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            peer,
            local,
            inbound: Inbound::Socket,
            timeout,
            cancel: CancellationToken::new(),
        })
    }

    /// Server channel sharing the listening socket.
    pub fn demultiplexed(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        inbox: mpsc::Receiver<Message>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let local = socket.local_addr()?;
        Ok(Self {
            socket,
            peer,
            local,
            inbound: Inbound::Inbox(Mutex::new(inbox)),
            timeout,
            cancel: CancellationToken::new(),
        })
    }

    async fn send_datagram(&self, message: &Message) -> Result<()> {
        let bytes = message.to_bytes()?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::MessageTooLarge {
                size: bytes.len(),
                limit: MAX_DATAGRAM_SIZE,
            }
            .into());
        }

        let sent = match self.inbound {
            Inbound::Socket => self.socket.send(&bytes).await,
            Inbound::Inbox(_) => self.socket.send_to(&bytes, self.peer).await,
        };
        sent.map_err(|e| io_to_transport(&e))?;
        Ok(())
    }

    async fn receive_datagram(&self) -> Result<Message> {
        match &self.inbound {
            Inbound::Inbox(inbox) => {
                let mut inbox = inbox.lock().await;
                inbox
                    .recv()
                    .await
                    .ok_or_else(|| TransportError::Closed.into())
            },
            Inbound::Socket => {
                let mut buf = vec![0u8; RECV_BUFFER_SIZE];
                loop {
                    let len = self
                        .socket
                        .recv(&mut buf)
                        .await
                        .map_err(|e| io_to_transport(&e))?;
                    if len > MAX_DATAGRAM_SIZE {
                        warn!(peer = %self.peer, len, "Dropping oversized datagram");
                        continue;
                    }
                    match Message::from_bytes(&buf[..len]) {
                        Ok(message) => return Ok(message),
                        Err(e) => warn!(peer = %self.peer, error = %e, "Dropping malformed datagram"),
                    }
                }
            },
        }
    }
}

impl Channel for UdpChannel {
    fn send<'a>(&'a self, message: &'a Message) -> ChannelFuture<'a, ()> {
        Box::pin(guarded(&self.cancel, self.timeout, self.send_datagram(message)))
    }

    fn receive(&self) -> ChannelFuture<'_, Message> {
        Box::pin(guarded(&self.cancel, self.timeout, self.receive_datagram()))
    }

    fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(peer = %self.peer, "Closing UDP channel");
            self.cancel.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Datagram
    }

    fn name(&self) -> &'static str {
        "UDP"
    }
}

/// Unspecified address of the same family as `peer`, port 0.
pub(super) fn wildcard_for(peer: &SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}

/// Bind an ephemeral socket and connect it to the first usable address.
///
/// UDP has no handshake; an absent server shows up later as a refused or
/// timed out negotiation.
pub(super) async fn connect(addrs: &[SocketAddr], timeout: Duration) -> Result<UdpChannel> {
    let mut last = None;
    for addr in addrs {
        let attempt = async {
            let socket = UdpSocket::bind(wildcard_for(addr)).await?;
            socket.connect(addr).await?;
            Ok::<_, std::io::Error>(socket)
        };
        match attempt.await {
            Ok(socket) => return UdpChannel::connected(socket, Some(timeout)),
            Err(e) => {
                debug!(%addr, error = %e, "UDP connect failed");
                last = Some(ConnectError::Refused(addr.to_string()));
            },
        }
    }
    Err(QueryError::Connect(
        last.unwrap_or_else(|| ConnectError::Refused("no address".to_string())),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, SessionId};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_connected_pair() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let client = connect(&[addr], Duration::from_secs(1)).await.unwrap();

        client.send(&Message::close(SessionId::new(2))).await.unwrap();
        let mut buf = vec![0u8; 128];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, client.local_addr());
        assert_eq!(
            Message::from_bytes(&buf[..len]).unwrap(),
            Message::close(SessionId::new(2))
        );

        let reply = Message::close(SessionId::new(3)).to_bytes().unwrap();
        server.send_to(&reply, from).await.unwrap();
        assert_eq!(
            client.receive().await.unwrap(),
            Message::close(SessionId::new(3))
        );
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = connect(&[server.local_addr().unwrap()], Duration::from_secs(1))
            .await
            .unwrap();

        let frame = Frame::new(
            SessionId::new(1),
            1,
            vec![Bytes::from(vec![0u8; MAX_DATAGRAM_SIZE])],
        );
        let err = client.send(&Message::Data(frame)).await.unwrap_err();
        assert!(matches!(
            err,
            QueryError::Transport(TransportError::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_demultiplexed_reads_inbox() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (tx, rx) = mpsc::channel(4);
        let peer = SocketAddr::from(([127, 0, 0, 1], 9));
        let channel = UdpChannel::demultiplexed(socket, peer, rx, Some(Duration::from_millis(200)))
            .unwrap();

        tx.send(Message::close(SessionId::new(8))).await.unwrap();
        assert_eq!(
            channel.receive().await.unwrap(),
            Message::close(SessionId::new(8))
        );

        let err = channel.receive().await.unwrap_err();
        assert!(matches!(err, QueryError::Transport(TransportError::Timeout)));

        drop(tx);
        let err = channel.receive().await.unwrap_err();
        assert!(matches!(err, QueryError::Transport(TransportError::Closed)));
    }
}
