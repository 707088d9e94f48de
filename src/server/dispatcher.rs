//! Session dispatch.
//!
//! Every accepted channel is registered as negotiating at once and gets its
//! own task that negotiates, then reads frames into the shared inbound
//! queue, plus a writer task draining that session's outbound queue. Routing looks the session up by id; a slow or
//! stalled client only ever fills its own queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::ServerConfig;
use crate::error::{QueryError, Result, RoutingError, TransportError};
use crate::protocol::{CapabilityDescriptor, Frame, Message, Negotiator, RejectReason, SessionId};
use crate::session::{Session, SessionKey, SessionRegistry, SessionState};
use crate::transport::{Channel, TcpChannel};

const EVENT_CAPACITY: usize = 64;

/// Bound on best-effort notices (CLOSE, REJECT) to a peer that may be gone.
const NOTICE_TIMEOUT: Duration = Duration::from_millis(200);

/// What happened to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    /// Offer accepted; session active
    Connected,
    /// Offer rejected
    Rejected(RejectReason),
    /// Client closed, or closed locally
    Closed,
    /// Removed by the idle sweep
    TimedOut,
    /// Transport failure
    Failed(String),
}

/// Session lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    /// Session concerned
    pub session_id: SessionId,
    /// What happened
    pub kind: SessionEventKind,
}

/// Result of routing one outbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Queued for the session's writer with this ordinal
    Queued(u64),
    /// Session is gone; frame discarded
    Dropped(RoutingError),
}

struct Route {
    channel: Arc<dyn Channel>,
    outbound: mpsc::Sender<Frame>,
}

enum Ending {
    /// Client sent CLOSE
    Graceful,
    /// Server shutting down
    Shutdown,
    /// Channel failed or ended without CLOSE
    Failed(String),
}

pub(crate) struct Dispatcher {
    config: ServerConfig,
    negotiator: Arc<Negotiator>,
    registry: SessionRegistry,
    routes: DashMap<SessionId, Route>,
    inbound: mpsc::Sender<Frame>,
    events: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn new(
        config: ServerConfig,
        inbound: mpsc::Sender<Frame>,
        shutdown: CancellationToken,
    ) -> Self {
        let negotiator = Negotiator::new(config.capability.clone(), config.endpoint.timeout())
            .with_policy(config.policy);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            config,
            negotiator: Arc::new(negotiator),
            registry: SessionRegistry::new(),
            routes: DashMap::new(),
            inbound,
            events,
            shutdown,
        }
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn negotiator(&self) -> Arc<Negotiator> {
        self.negotiator.clone()
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, session_id: SessionId, kind: SessionEventKind) {
        // no subscribers is fine
        let _ = self.events.send(SessionEvent { session_id, kind });
    }

    /// Accept TCP connections until shutdown.
    pub(crate) async fn run_stream(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    match TcpChannel::new(stream, Some(self.config.endpoint.timeout())) {
                        Ok(channel) => {
                            let key = SessionKey::Stream {
                                local: channel.local_addr(),
                                peer,
                            };
                            debug!(%peer, "Accepted connection");
                            tokio::spawn(self.clone().run_session(Arc::new(channel), key));
                        },
                        Err(e) => warn!(%peer, error = %e, "Cannot set up connection"),
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                },
            }
        }
        debug!("Accept loop stopped");
    }

    /// Expire idle sessions every `sweep_interval` until shutdown.
    pub(crate) async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_once(Instant::now());
                }
            }
        }
    }

    /// One sweep pass against `now`. Returns the expired sessions.
    pub(crate) fn sweep_once(&self, now: Instant) -> Vec<SessionId> {
        let expired = self
            .registry
            .sweep(now, self.config.endpoint.timeout_secs);

        for id in &expired {
            if let Some((_, route)) = self.routes.remove(id) {
                notify_and_close(route.channel, Message::close(*id));
            }
            info!(session = %id, "Session timed out");
            self.emit(*id, SessionEventKind::TimedOut);
        }
        expired
    }

    /// Close a session from the server side.
    pub(crate) fn close_session(&self, id: SessionId) -> bool {
        if let Some((_, route)) = self.routes.remove(&id) {
            notify_and_close(route.channel, Message::close(id));
        }
        match self.registry.finish(id, SessionState::Closing) {
            Some(_) => {
                info!(session = %id, "Session closed by server");
                self.emit(id, SessionEventKind::Closed);
                true
            },
            None => false,
        }
    }

    /// Queue a processed frame for its originating session.
    pub(crate) fn route(&self, frame: Frame) -> Result<RouteOutcome> {
        let id = frame.session_id;
        let Some(route) = self.routes.get(&id) else {
            debug!(session = %id, "Dropping frame for unknown session");
            return Ok(RouteOutcome::Dropped(RoutingError::UnknownSession(id)));
        };

        let permit = match route.outbound.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => return Err(TransportError::WouldBlock.into()),
            Err(TrySendError::Closed(())) => {
                debug!(session = %id, "Dropping frame for closing session");
                return Ok(RouteOutcome::Dropped(RoutingError::UnknownSession(id)));
            },
        };

        let ordinal = match self.registry.next_outbound(id, frame.payload_len()) {
            Ok(ordinal) => ordinal,
            Err(e) => {
                debug!(session = %id, error = %e, "Dropping frame for inactive session");
                return Ok(RouteOutcome::Dropped(RoutingError::UnknownSession(id)));
            },
        };

        permit.send(Frame {
            sequence_ordinal: ordinal,
            ..frame
        });
        Ok(RouteOutcome::Queued(ordinal))
    }

    /// Drive one channel from handshake to removal.
    pub(crate) async fn run_session(self: Arc<Self>, channel: Arc<dyn Channel>, key: SessionKey) {
        let Some((id, negotiated)) = self.handshake(channel.as_ref(), key).await else {
            channel.close();
            return;
        };

        let (outbound, queue) = mpsc::channel(self.config.outbound_capacity);
        self.routes.insert(
            id,
            Route {
                channel: channel.clone(),
                outbound,
            },
        );
        tokio::spawn(self.clone().write_loop(id, channel.clone(), queue));

        let ending = self.receive_loop(id, channel.as_ref(), &negotiated).await;
        self.routes.remove(&id);

        let (state, kind) = match ending {
            Ending::Graceful => (SessionState::Closing, SessionEventKind::Closed),
            Ending::Shutdown => {
                let notice = Message::close(id);
                let _ = tokio::time::timeout(NOTICE_TIMEOUT, channel.send(&notice)).await;
                (SessionState::Closing, SessionEventKind::Closed)
            },
            Ending::Failed(reason) => (SessionState::Error, SessionEventKind::Failed(reason)),
        };
        channel.close();

        // Already swept or closed elsewhere when absent; that path reported it.
        if let Some(session) = self.registry.finish(id, state) {
            info!(
                session = %id,
                peer = %session.key.peer(),
                state = %state,
                frames_in = session.stats.frames_in,
                frames_out = session.stats.frames_out,
                "Session ended"
            );
            self.emit(id, kind);
        }
    }

    async fn handshake(
        &self,
        channel: &dyn Channel,
        key: SessionKey,
    ) -> Option<(SessionId, CapabilityDescriptor)> {
        let peer = channel.peer_addr();
        let id = key.session_id();
        if let Err(e) = self.registry.create(id, key, self.config.capability.clone()) {
            warn!(session = %id, %peer, error = %e, "Refusing connection");
            let notice = Message::Reject {
                reason: RejectReason::Invalid,
                message: e.to_string(),
            };
            let _ = tokio::time::timeout(NOTICE_TIMEOUT, channel.send(&notice)).await;
            return None;
        }

        let offered = match self.negotiator.await_offer(channel).await {
            Ok((_, offered)) => offered,
            Err(QueryError::Negotiation(err)) => {
                warn!(session = %id, %peer, error = %err, "Negotiation failed");
                self.registry.finish(id, SessionState::Failed);
                let notice = Message::reject(&err);
                let _ = tokio::time::timeout(NOTICE_TIMEOUT, channel.send(&notice)).await;
                return None;
            },
            Err(e) => {
                debug!(session = %id, %peer, error = %e, "Channel ended before negotiation");
                self.registry.finish(id, SessionState::Error);
                return None;
            },
        };

        if !self.registry.record_offer(id, offered.clone()) {
            debug!(session = %id, %peer, "Session expired before its offer");
            return None;
        }

        let (reply, verdict) = self.negotiator.answer(id, &offered);
        match verdict {
            Ok(negotiated) => {
                if let Err(e) = self.registry.activate(id, negotiated.clone()) {
                    warn!(session = %id, error = %e, "Cannot activate session");
                    self.registry.finish(id, SessionState::Error);
                    return None;
                }
                if let Err(e) = channel.send(&reply).await {
                    warn!(session = %id, %peer, error = %e, "Cannot send ACCEPT");
                    self.registry.finish(id, SessionState::Error);
                    return None;
                }
                info!(
                    session = %id,
                    %peer,
                    transport = channel.name(),
                    caps = %negotiated,
                    "Session connected"
                );
                self.emit(id, SessionEventKind::Connected);
                Some((id, negotiated))
            },
            Err(err) => {
                warn!(session = %id, %peer, error = %err, "Offer rejected");
                self.registry.finish(id, SessionState::Failed);
                let _ = tokio::time::timeout(NOTICE_TIMEOUT, channel.send(&reply)).await;
                self.emit(id, SessionEventKind::Rejected(RejectReason::for_error(&err)));
                None
            },
        }
    }

    async fn receive_loop(
        &self,
        id: SessionId,
        channel: &dyn Channel,
        negotiated: &CapabilityDescriptor,
    ) -> Ending {
        loop {
            let received = tokio::select! {
                () = self.shutdown.cancelled() => return Ending::Shutdown,
                received = channel.receive() => received,
            };

            match received {
                Ok(Message::Data(frame)) => {
                    if !self.accept_frame(id, negotiated, frame).await {
                        return Ending::Shutdown;
                    }
                },
                Ok(Message::Close { .. }) => {
                    debug!(session = %id, "Client closed session");
                    return Ending::Graceful;
                },
                Ok(Message::Capability { descriptor, .. }) if descriptor == *negotiated => {
                    // retransmitted offer; the ACCEPT was lost
                    let accept = Message::accept(id, negotiated.clone());
                    if let Err(e) = channel.send(&accept).await {
                        debug!(session = %id, error = %e, "Cannot repeat ACCEPT");
                    }
                },
                Ok(other) => {
                    warn!(session = %id, kind = %other.kind(), "Ignoring unexpected message");
                },
                // idle expiry belongs to the sweeper
                Err(QueryError::Transport(TransportError::Timeout)) if self.registry.contains(id) => {},
                Err(e) => return Ending::Failed(e.to_string()),
            }
        }
    }

    /// Returns false once the inbound queue is gone.
    async fn accept_frame(
        &self,
        id: SessionId,
        negotiated: &CapabilityDescriptor,
        frame: Frame,
    ) -> bool {
        if frame.session_id != id {
            warn!(
                session = %id,
                tagged = %frame.session_id,
                "Dropping frame tagged with another session"
            );
            return true;
        }
        if let Err(e) = negotiated.check_payload(&frame.payload) {
            warn!(session = %id, error = %e, "Dropping frame outside negotiated capability");
            return true;
        }

        let ordinal = frame.sequence_ordinal;
        let bytes = frame.payload_len();
        match self.registry.accept_inbound(id, ordinal, bytes) {
            Ok(true) => {},
            Ok(false) => {
                debug!(session = %id, ordinal, "Dropping stale datagram");
                return true;
            },
            Err(e) => {
                debug!(session = %id, error = %e, "Dropping frame for unregistered session");
                return true;
            },
        }

        debug!(session = %id, ordinal, bytes, "Frame received");
        tokio::select! {
            () = self.shutdown.cancelled() => false,
            sent = self.inbound.send(frame) => sent.is_ok(),
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        id: SessionId,
        channel: Arc<dyn Channel>,
        mut queue: mpsc::Receiver<Frame>,
    ) {
        loop {
            let frame = tokio::select! {
                () = self.shutdown.cancelled() => break,
                frame = queue.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let ordinal = frame.sequence_ordinal;
            let bytes = frame.payload_len();
            match channel.send(&Message::Data(frame)).await {
                Ok(()) => {
                    self.registry.touch(id);
                    debug!(session = %id, ordinal, bytes, "Frame sent");
                },
                Err(QueryError::Transport(TransportError::MessageTooLarge { size, limit })) => {
                    warn!(session = %id, ordinal, size, limit, "Dropping oversized frame");
                },
                Err(e) if e.is_recoverable() => {
                    warn!(session = %id, ordinal, error = %e, "Dropping frame");
                },
                Err(e) => {
                    if !channel.is_closed() {
                        warn!(session = %id, error = %e, "Session write failed");
                        channel.close();
                    }
                    break;
                },
            }
        }
    }

    /// Snapshots of registered sessions.
    pub(crate) fn sessions(&self) -> Vec<Session> {
        self.registry.snapshot()
    }
}

/// Send a best-effort notice, then close, without holding up the caller.
fn notify_and_close(channel: Arc<dyn Channel>, notice: Message) {
    tokio::spawn(async move {
        let _ = tokio::time::timeout(NOTICE_TIMEOUT, channel.send(&notice)).await;
        channel.close();
    });
}
