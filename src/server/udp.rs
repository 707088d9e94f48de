//! Datagram demultiplexer.
//!
//! One task owns the receive side of the shared UDP socket and forwards each
//! datagram to the inbox of the session its sender belongs to. A CAPABILITY
//! with a new nonce starts a new session for that peer and retires the old
//! one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::dispatcher::Dispatcher;
use crate::protocol::{Message, SessionId};
use crate::session::SessionKey;
use crate::transport::{UdpChannel, MAX_DATAGRAM_SIZE};

/// Datagrams buffered per session before new ones are dropped.
const INBOX_CAPACITY: usize = 64;

struct Peer {
    session_id: SessionId,
    inbox: mpsc::Sender<Message>,
}

pub(crate) async fn run_datagram(dispatcher: Arc<Dispatcher>, socket: Arc<UdpSocket>) {
    let local_port = match socket.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            warn!(error = %e, "Datagram socket has no local address");
            return;
        },
    };
    let timeout = Some(dispatcher.config().endpoint.timeout());
    let shutdown = dispatcher.shutdown_token().clone();
    let mut peers: HashMap<SocketAddr, Peer> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];

    loop {
        let received = tokio::select! {
            () = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, from) = match received {
            Ok(received) => received,
            // ICMP errors from earlier sends surface here
            Err(e) => {
                debug!(error = %e, "Datagram receive failed");
                continue;
            },
        };
        if len > MAX_DATAGRAM_SIZE {
            warn!(%from, len, "Dropping oversized datagram");
            continue;
        }

        let message = match Message::from_bytes(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                warn!(%from, error = %e, "Dropping malformed datagram");
                continue;
            },
        };

        let nonce = match &message {
            Message::Capability { nonce, .. } => *nonce,
            Message::Data(_) | Message::Close { .. } => {
                forward(&mut peers, from, message);
                continue;
            },
            other => {
                debug!(%from, kind = %other.kind(), "Ignoring datagram");
                continue;
            },
        };

        let key = SessionKey::Datagram {
            local_port,
            peer: from,
            nonce,
        };
        let session_id = key.session_id();

        if let Some(peer) = peers.get(&from) {
            if peer.session_id == session_id && !peer.inbox.is_closed() {
                // retransmitted offer for a running handshake or session
                forward(&mut peers, from, message);
                continue;
            }
            if peer.session_id != session_id {
                debug!(%from, old = %peer.session_id, "Peer started a new session");
                dispatcher.close_session(peer.session_id);
            }
        }

        peers.retain(|_, peer| !peer.inbox.is_closed());

        let (inbox, rx) = mpsc::channel(INBOX_CAPACITY);
        let channel = match UdpChannel::demultiplexed(socket.clone(), from, rx, timeout) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(%from, error = %e, "Cannot set up datagram session");
                continue;
            },
        };
        // the session task reads the offer from its inbox
        let _ = inbox.try_send(message);
        peers.insert(from, Peer { session_id, inbox });
        tokio::spawn(dispatcher.clone().run_session(Arc::new(channel), key));
    }

    debug!("Datagram demultiplexer stopped");
}

fn forward(peers: &mut HashMap<SocketAddr, Peer>, from: SocketAddr, message: Message) {
    let Some(peer) = peers.get(&from) else {
        debug!(%from, kind = %message.kind(), "Dropping datagram from unknown peer");
        return;
    };

    match peer.inbox.try_send(message) {
        Ok(()) => {},
        Err(TrySendError::Full(message)) => {
            warn!(%from, session = %peer.session_id, kind = %message.kind(), "Session inbox full, dropping datagram");
        },
        Err(TrySendError::Closed(message)) => {
            debug!(%from, kind = %message.kind(), "Dropping datagram for ended session");
            peers.remove(&from);
        },
    }
}
