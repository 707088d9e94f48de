//! # tensor-query - Tensor Query Offloading
//!
//! Client/server session protocol for offloading tensor processing to a
//! remote pipeline segment. A client forwards multi-tensor frames to a
//! server, the server runs its bound segment on each frame and routes the
//! result back to the same client.
//!
//! ## Features
//!
//! - **Three transports**: TCP stream, UDP datagram, and HYBRID (UDP
//!   discovery, then TCP)
//! - **Capability negotiation**: tensor count, dimensions and element types
//!   are agreed before any data flows
//! - **Session routing**: any number of clients share one server; every
//!   result goes back to the session its input came from
//! - **Idle sweep**: sessions idle past the timeout are closed
//!
//! ## Protocol Overview
//!
//! ```text
//! Client                               Server
//!    |                                    |
//!    |------ CAPABILITY (nonce, caps) --->|
//!    |<----- ACCEPT (session, caps) ------|   or REJECT (reason)
//!    |                                    |
//!    |====== DATA (session, ordinal) ====>|--> ServerSource
//!    |<===== DATA (session, ordinal) =====|<-- ServerSink
//!    |                                    |
//!    |------ CLOSE ---------------------->|
//! ```
//!
//! HYBRID clients first send DISCOVER over UDP and receive the stream
//! endpoint in an ENDPOINT reply.
//!
//! ### Session State Machine
//!
//! ```text
//!     [Negotiating] --accept--> [Active] --close--> [Closing] --+
//!          |                       |                            |
//!          | reject                +--idle--> [TimedOut] -------+--> [Removed]
//!          v                       |                            |
//!      [Failed]                    +--I/O---> [Error] ----------+
//! ```
//!
//! ## Quick Start
//!
//! ### Server
//!
//! ```rust,ignore
//! use tensor_query::server::{QueryServer, ServerConfig};
//!
//! let caps = "other/tensors,num_tensors=1,dimensions=3:300:300:1,types=uint8".parse()?;
//! let server = QueryServer::bind(ServerConfig::new(caps).with_port(3001)).await?;
//! let (source, sink) = server.split();
//!
//! // echo every frame back to its session
//! source.drive(sink, |frame| vec![frame]).await;
//! ```
//!
//! ### Client
//!
//! ```rust,ignore
//! use tensor_query::{ClientConfig, QueryClient};
//!
//! let caps = "other/tensors,num_tensors=1,dimensions=3:300:300:1,types=uint8".parse()?;
//! let mut client = QueryClient::new(ClientConfig::default(), caps);
//! client.connect().await?;
//!
//! let result = client.query(vec![payload]).await?;
//! client.close().await;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use client::{ClientState, QueryClient};
pub use config::{ClientConfig, Config, ConnectType, EndpointConfig};
pub use error::{QueryError, Result};
pub use protocol::{CapabilityDescriptor, Frame, Message, SessionId, TensorType, PROTOCOL_VERSION};
pub use server::{QueryServer, RouteOutcome, ServerConfig, ServerSink, ServerSource};
pub use session::{Session, SessionRegistry, SessionState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
