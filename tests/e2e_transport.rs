//! End-to-end transport layer tests.
//!
//! These tests open real sockets on the loopback interface: connect and bind
//! failures, HYBRID discovery, and datagram ordering against a live server.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tensor_query::error::{BindError, ConnectError, NegotiationError};
use tensor_query::protocol::{Message, RejectReason};
use tensor_query::server::{QueryServer, ServerConfig};
use tensor_query::transport::{self, Channel, ChannelKind, Listener};
use tensor_query::{CapabilityDescriptor, ConnectType, EndpointConfig, Frame, QueryError};
use tokio::time::timeout;

/// Find an available port for testing
async fn find_available_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn caps() -> CapabilityDescriptor {
    "other/tensors,num_tensors=1,dimensions=4,types=uint8"
        .parse()
        .unwrap()
}

fn endpoint(connect_type: ConnectType, port: u16) -> EndpointConfig {
    EndpointConfig::default()
        .with_host("127.0.0.1")
        .with_port(port)
        .with_connect_type(connect_type)
        .with_timeout(2)
}

async fn server(connect_type: ConnectType) -> QueryServer {
    let config = ServerConfig::new(caps())
        .with_host("127.0.0.1")
        .with_port(0)
        .with_connect_type(connect_type)
        .with_timeout(5);
    QueryServer::bind(config).await.unwrap()
}

#[tokio::test]
async fn test_listen_reports_real_port() {
    let listener = transport::listen(&endpoint(ConnectType::Tcp, 0)).await.unwrap();
    assert!(matches!(listener, Listener::Tcp(_)));
    assert_ne!(listener.local_addr().unwrap().port(), 0);

    let hybrid = transport::listen(&endpoint(ConnectType::Hybrid, 0)).await.unwrap();
    match hybrid {
        Listener::Hybrid { stream, discovery } => {
            assert_eq!(
                stream.local_addr().unwrap().port(),
                discovery.local_addr().unwrap().port()
            );
        },
        _ => panic!("expected hybrid listener"),
    }
}

#[tokio::test]
async fn test_bind_address_in_use() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let config = ServerConfig::new(caps())
        .with_host("127.0.0.1")
        .with_port(port);
    let err = QueryServer::bind(config).await.err().unwrap();
    assert!(matches!(err, QueryError::Bind(BindError::AddressInUse(_))));
}

#[tokio::test]
async fn test_bind_invalid_host() {
    let config = ServerConfig::new(caps())
        .with_host("f.a.i.l")
        .with_port(0)
        .with_timeout(2);
    let err = QueryServer::bind(config).await.err().unwrap();
    assert!(matches!(err, QueryError::Bind(BindError::Resolve(_))));
}

#[tokio::test]
async fn test_connect_unresolvable_host() {
    let mut config = endpoint(ConnectType::Tcp, 3001);
    config.host = "f.a.i.l".to_string();

    let result = timeout(Duration::from_secs(5), transport::connect(&config, &caps()))
        .await
        .expect("resolution not bounded by the timeout");
    assert!(matches!(
        result.err().unwrap(),
        QueryError::Connect(ConnectError::ResolveFailure(_))
    ));
}

#[tokio::test]
async fn test_connect_refused_without_server() {
    let port = find_available_port().await;
    let err = transport::connect(&endpoint(ConnectType::Tcp, port), &caps())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, QueryError::Connect(ConnectError::Refused(_))));
}

#[tokio::test]
async fn test_hybrid_discovery_without_server() {
    let port = find_available_port().await;
    let err = transport::connect_with(&endpoint(ConnectType::Hybrid, port), &caps(), 2)
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        QueryError::Connect(ConnectError::DiscoveryFailed { attempts: 2, .. })
            | QueryError::Connect(ConnectError::Refused(_))
    ));
}

#[tokio::test]
async fn test_hybrid_discovery_opens_stream() {
    let server = server(ConnectType::Hybrid).await;
    let config = endpoint(ConnectType::Hybrid, server.local_addr().port());

    let endpoint = transport::discover(&config, &caps(), 3).await.unwrap();
    assert_eq!(endpoint.port(), server.local_addr().port());

    let channel = transport::connect(&config, &caps()).await.unwrap();
    assert_eq!(channel.kind(), ChannelKind::Stream);
    assert_eq!(channel.name(), "TCP");

    channel.send(&Message::capability(9, caps())).await.unwrap();
    assert!(matches!(
        channel.receive().await.unwrap(),
        Message::Accept { .. }
    ));
}

#[tokio::test]
async fn test_hybrid_discovery_rejects_mismatch() {
    let server = server(ConnectType::Hybrid).await;
    let config = endpoint(ConnectType::Hybrid, server.local_addr().port());
    let offer: CapabilityDescriptor = "other/tensors,num_tensors=1,dimensions=4,types=int16"
        .parse()
        .unwrap();

    let err = transport::connect(&config, &offer).await.err().unwrap();
    assert!(matches!(
        err,
        QueryError::Negotiation(NegotiationError::MismatchType(_))
    ));
}

#[tokio::test]
async fn test_tcp_reject_reason_on_wire() {
    let server = server(ConnectType::Tcp).await;
    let config = endpoint(ConnectType::Tcp, server.local_addr().port());
    let channel = transport::connect(&config, &caps()).await.unwrap();

    let offer: CapabilityDescriptor =
        r#"other/tensors,num_tensors=2,dimensions="4,4",types="uint8,uint8""#
            .parse()
            .unwrap();
    channel.send(&Message::capability(1, offer)).await.unwrap();
    match channel.receive().await.unwrap() {
        Message::Reject { reason, .. } => assert_eq!(reason, RejectReason::TensorCount),
        other => panic!("expected REJECT, got {other:?}"),
    }
    assert_eq!(server.session_count(), 0);
}

#[tokio::test]
async fn test_udp_stale_ordinals_discarded() {
    let server = server(ConnectType::Udp).await;
    let config = endpoint(ConnectType::Udp, server.local_addr().port());
    let (mut source, _sink) = server.split();

    let channel = transport::connect(&config, &caps()).await.unwrap();
    assert_eq!(channel.kind(), ChannelKind::Datagram);
    channel.send(&Message::capability(77, caps())).await.unwrap();
    let id = match channel.receive().await.unwrap() {
        Message::Accept { session_id, .. } => session_id,
        other => panic!("expected ACCEPT, got {other:?}"),
    };

    for ordinal in [1u64, 3, 2] {
        let payload = vec![Bytes::from(vec![ordinal as u8; 4])];
        channel
            .send(&Message::Data(Frame::new(id, ordinal, payload)))
            .await
            .unwrap();
    }

    let first = timeout(Duration::from_secs(2), source.next_frame())
        .await
        .unwrap()
        .unwrap();
    let second = timeout(Duration::from_secs(2), source.next_frame())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.sequence_ordinal, 1);
    assert_eq!(second.sequence_ordinal, 3);
    assert!(timeout(Duration::from_millis(300), source.next_frame())
        .await
        .is_err());
}

#[tokio::test]
async fn test_udp_retransmitted_offer_gets_same_accept() {
    let server = server(ConnectType::Udp).await;
    let config = endpoint(ConnectType::Udp, server.local_addr().port());
    let channel = transport::connect(&config, &caps()).await.unwrap();

    let offer = Message::capability(5, caps());
    channel.send(&offer).await.unwrap();
    let first = channel.receive().await.unwrap();
    channel.send(&offer).await.unwrap();
    let second = channel.receive().await.unwrap();

    assert!(matches!(first, Message::Accept { .. }));
    assert_eq!(first, second);
    assert_eq!(server.session_count(), 1);
}

#[tokio::test]
async fn test_udp_new_nonce_replaces_session() {
    let server = server(ConnectType::Udp).await;
    let config = endpoint(ConnectType::Udp, server.local_addr().port());
    let channel = transport::connect(&config, &caps()).await.unwrap();

    channel.send(&Message::capability(1, caps())).await.unwrap();
    let first = match channel.receive().await.unwrap() {
        Message::Accept { session_id, .. } => session_id,
        other => panic!("expected ACCEPT, got {other:?}"),
    };

    channel.send(&Message::capability(2, caps())).await.unwrap();
    // the old session's CLOSE may arrive before the new ACCEPT
    let second = loop {
        match channel.receive().await.unwrap() {
            Message::Accept { session_id, .. } => break session_id,
            Message::Close { session_id } => assert_eq!(session_id, first),
            other => panic!("unexpected {other:?}"),
        }
    };

    assert_ne!(first, second);
    let ids: Vec<_> = server.sessions().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![second]);
}

#[tokio::test]
async fn test_closed_channel_fails_promptly() {
    let server = server(ConnectType::Tcp).await;
    let addr: SocketAddr = server.local_addr();
    let channel = transport::connect(&endpoint(ConnectType::Tcp, addr.port()), &caps())
        .await
        .unwrap();

    let reader = channel.clone();
    let pending = tokio::spawn(async move { reader.receive().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    channel.close();

    let result = timeout(Duration::from_millis(500), pending)
        .await
        .expect("receive not cancelled")
        .unwrap();
    assert!(result.is_err());
    assert!(channel.is_closed());
}
