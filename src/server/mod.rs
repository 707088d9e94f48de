//! Query server.
//!
//! Binds one endpoint and serves any number of client sessions. The server
//! splits into two halves that share one dispatcher:
//!
//! - [`ServerSource`] yields inbound frames, each tagged with the session it
//!   came from.
//! - [`ServerSink`] routes processed frames back to their session.
//!
//! Whatever runs between the two is the bound pipeline segment.
//!
//! # Example
//!
//! ```rust,ignore
//! use tensor_query::server::{QueryServer, ServerConfig};
//!
//! let caps = "other/tensors,num_tensors=1,dimensions=3:300:300:1,types=uint8".parse()?;
//! let server = QueryServer::bind(ServerConfig::new(caps).with_port(3001)).await?;
//! let (mut source, sink) = server.split();
//!
//! while let Some(frame) = source.next_frame().await {
//!     sink.route(frame)?;
//! }
//! ```

mod config;
mod dispatcher;
mod udp;

pub use config::ServerConfig;
pub use dispatcher::{RouteOutcome, SessionEvent, SessionEventKind};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::config::ConnectType;
use crate::error::{QueryError, Result, TransportError};
use crate::protocol::{Frame, SessionId};
use crate::session::Session;
use crate::transport::{self, DiscoveryResponder, Listener};
use dispatcher::Dispatcher;

/// A bound query server
pub struct QueryServer {
    source: ServerSource,
    sink: ServerSink,
}

impl QueryServer {
    /// Bind the configured endpoint and start serving.
    ///
    /// Starts the accept loop (TCP), the datagram demultiplexer (UDP) or the
    /// accept loop plus discovery responder (HYBRID), and the idle sweeper.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.capability.validate()?;
        let listener = transport::listen(&config.endpoint).await?;
        let local_addr = listener.local_addr()?;
        let connect_type = listener.connect_type();

        let shutdown = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        let advertised_host = config.endpoint.host.clone();
        let dispatcher = Arc::new(Dispatcher::new(config, inbound_tx, shutdown.clone()));

        match listener {
            Listener::Tcp(listener) => {
                tokio::spawn(dispatcher.clone().run_stream(listener));
            },
            Listener::Udp(socket) => {
                tokio::spawn(udp::run_datagram(dispatcher.clone(), Arc::new(socket)));
            },
            Listener::Hybrid { stream, discovery } => {
                let responder = DiscoveryResponder::new(
                    discovery,
                    advertised_host,
                    local_addr.port(),
                    dispatcher.negotiator(),
                );
                tokio::spawn(responder.run(shutdown.clone()));
                tokio::spawn(dispatcher.clone().run_stream(stream));
            },
        }
        tokio::spawn(dispatcher.clone().sweep_loop());

        info!(
            addr = %local_addr,
            transport = %connect_type,
            caps = %dispatcher.config().capability,
            "Query server listening"
        );

        Ok(Self {
            source: ServerSource {
                inbound: inbound_rx,
                _shutdown: shutdown.drop_guard(),
            },
            sink: ServerSink {
                dispatcher,
                local_addr,
                connect_type,
            },
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.sink.local_addr
    }

    /// Connect type served
    pub fn connect_type(&self) -> ConnectType {
        self.sink.connect_type
    }

    /// Subscribe to session lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sink.subscribe()
    }

    /// Number of registered sessions
    pub fn session_count(&self) -> usize {
        self.sink.session_count()
    }

    /// Snapshots of registered sessions
    pub fn sessions(&self) -> Vec<Session> {
        self.sink.sessions()
    }

    /// A routing handle that outlives the split.
    pub fn sink(&self) -> ServerSink {
        self.sink.clone()
    }

    /// Stop serving. Live sessions are sent CLOSE.
    pub fn shutdown(&self) {
        self.sink.shutdown();
    }

    /// Split into the inbound and outbound halves.
    ///
    /// Dropping the [`ServerSource`] shuts the server down.
    pub fn split(self) -> (ServerSource, ServerSink) {
        (self.source, self.sink)
    }
}

/// A pipeline segment bound between [`ServerSource`] and [`ServerSink`].
///
/// Output frames keep the session id of the frame they answer; returning
/// nothing consumes the frame.
pub trait PipelineSegment: Send {
    /// Process one inbound frame
    fn process(&mut self, frame: Frame) -> Vec<Frame>;
}

impl<F> PipelineSegment for F
where
    F: FnMut(Frame) -> Vec<Frame> + Send,
{
    fn process(&mut self, frame: Frame) -> Vec<Frame> {
        self(frame)
    }
}

/// Inbound half of a query server
pub struct ServerSource {
    inbound: mpsc::Receiver<Frame>,
    _shutdown: DropGuard,
}

impl ServerSource {
    /// Next frame from any session; `None` once the server has shut down.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    /// Feed every inbound frame through `segment` and route its output.
    ///
    /// Returns when the server shuts down. The loop never waits on a single
    /// session: a frame whose session queue is full is dropped and counted
    /// in that session's `queue_dropped`.
    pub async fn drive<S: PipelineSegment>(mut self, sink: ServerSink, mut segment: S) {
        while let Some(frame) = self.next_frame().await {
            for output in segment.process(frame) {
                sink.route_or_drop(output);
            }
        }
        debug!("Pipeline drive finished");
    }
}

/// Outbound half of a query server
#[derive(Clone)]
pub struct ServerSink {
    dispatcher: Arc<Dispatcher>,
    local_addr: SocketAddr,
    connect_type: ConnectType,
}

impl ServerSink {
    /// Queue `frame` for the session it is tagged with.
    ///
    /// Frames for sessions that no longer exist are dropped, not failed. A
    /// full session queue fails with [`TransportError::WouldBlock`].
    pub fn route(&self, frame: Frame) -> Result<RouteOutcome> {
        self.dispatcher.route(frame)
    }

    /// Route without waiting: a full session queue drops the frame.
    fn route_or_drop(&self, frame: Frame) {
        let id = frame.session_id;
        match self.route(frame) {
            Ok(_) => {},
            Err(QueryError::Transport(TransportError::WouldBlock)) => {
                self.dispatcher.registry().record_queue_drop(id);
                warn!(session = %id, "Session queue full, dropping frame");
            },
            Err(e) => warn!(session = %id, error = %e, "Routing failed"),
        }
    }

    /// Close one session from the server side. Returns false if absent.
    pub fn close_session(&self, id: SessionId) -> bool {
        self.dispatcher.close_session(id)
    }

    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subscribe to session lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.dispatcher.subscribe()
    }

    /// Number of registered sessions
    pub fn session_count(&self) -> usize {
        self.dispatcher.registry().len()
    }

    /// Snapshots of registered sessions
    pub fn sessions(&self) -> Vec<Session> {
        self.dispatcher.sessions()
    }

    /// Stop serving. Live sessions are sent CLOSE.
    pub fn shutdown(&self) {
        if !self.dispatcher.shutdown_token().is_cancelled() {
            info!(addr = %self.local_addr, "Query server shutting down");
            self.dispatcher.shutdown_token().cancel();
        }
    }
}
