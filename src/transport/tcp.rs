//! TCP transport: one framed stream per session.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{guarded, io_to_transport, Channel, ChannelFuture, ChannelKind, MessageCodec};
use crate::error::{ConnectError, QueryError, Result, TransportError};
use crate::protocol::Message;

/// Framed TCP stream.
///
/// Read and write halves are locked independently so a session's receive
/// task and writer task never wait on each other.
#[derive(Debug)]
pub struct TcpChannel {
    reader: Mutex<FramedRead<OwnedReadHalf, MessageCodec>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, MessageCodec>>,
    peer: SocketAddr,
    local: SocketAddr,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl TcpChannel {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream, timeout: Option<Duration>) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let (read, write) = stream.into_split();

        Ok(Self {
            reader: Mutex::new(FramedRead::new(read, MessageCodec)),
            writer: Mutex::new(FramedWrite::new(write, MessageCodec)),
            peer,
            local,
            timeout,
            cancel: CancellationToken::new(),
        })
    }
}

/// Socket and decode failures both end the stream; keep the transport error
/// when there is one.
fn stream_error(err: QueryError) -> QueryError {
    match err {
        QueryError::Io(e) => io_to_transport(&e),
        other => other,
    }
}

impl Channel for TcpChannel {
    fn send<'a>(&'a self, message: &'a Message) -> ChannelFuture<'a, ()> {
        Box::pin(guarded(&self.cancel, self.timeout, async move {
            let mut writer = self.writer.lock().await;
            writer.send(message).await.map_err(stream_error)
        }))
    }

    fn receive(&self) -> ChannelFuture<'_, Message> {
        Box::pin(guarded(&self.cancel, self.timeout, async move {
            let mut reader = self.reader.lock().await;
            match reader.next().await {
                Some(Ok(message)) => Ok(message),
                Some(Err(err)) => Err(stream_error(err)),
                None => Err(TransportError::Closed.into()),
            }
        }))
    }

    fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(peer = %self.peer, "Closing TCP channel");
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
        ChannelKind::Stream
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}

/// Connect to the first address that accepts.
pub(super) async fn connect(addrs: &[SocketAddr], timeout: Duration) -> Result<TcpChannel> {
    let mut last = None;
    for addr in addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return TcpChannel::new(stream, Some(timeout)),
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "TCP connect failed");
                last = Some(ConnectError::Refused(addr.to_string()));
            },
            Err(_) => last = Some(ConnectError::Timeout(addr.to_string())),
        }
    }
    Err(last
        .unwrap_or_else(|| ConnectError::Refused("no address".to_string()))
        .into())
}
