use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tungstenite::protocol::Message as WsMessage;

use super::channel::{ChannelOptions, ChannelState, FrameQueue, FramedChannel, Shutdown};
use super::codec::{self, DecodeError};
use super::message::{Confirmation, RpcRequest, RpcResponse, ServingStatus};
use super::rpc_client::RpcClient;
use super::rpc_server::{RpcHandler, RpcServer};
use crate::utils::error::Error;

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// --- codec ---

#[test]
fn test_encode_layout() {
    let frame = codec::encode("TestMessage", b"abc").unwrap();
    let body_len = "TestMessage".len() + 1 + 3;
    assert_eq!(&frame[..2], &(body_len as u16).to_be_bytes());
    assert_eq!(&frame[2..13], b"TestMessage");
    assert_eq!(frame[13], b'\n');
    assert_eq!(&frame[14..], b"abc");
}

#[test]
fn test_decode_roundtrip() {
    let cases: [(&str, &[u8]); 3] = [
        ("TestMessage", br#"{"test_string":"hello"}"#),
        ("Empty", b""),
        ("Binary", &[0u8, 10, 255, 10, 1]),
    ];
    for (type_name, payload) in cases {
        let frame = codec::encode(type_name, payload).unwrap();
        assert_eq!(codec::decode(&frame).unwrap(), (type_name, payload));
    }
}

#[test]
fn test_encode_rejects_bad_type_names() {
    assert!(matches!(
        codec::encode("", b"x"),
        Err(Error::InvalidTypeName(_))
    ));
    assert!(matches!(
        codec::encode("Bad\nName", b"x"),
        Err(Error::InvalidTypeName(_))
    ));
}

#[test]
fn test_encode_rejects_oversized_frames() {
    let payload = vec![0u8; codec::MAX_BODY_LEN];
    assert!(matches!(
        codec::encode("T", &payload),
        Err(Error::FrameTooLarge { .. })
    ));

    let fits = vec![0u8; codec::MAX_BODY_LEN - 2];
    assert!(codec::encode("T", &fits).is_ok());
}

#[test]
fn test_decode_errors() {
    assert_eq!(
        codec::decode(&[0]),
        Err(DecodeError::Truncated {
            expected: 2,
            actual: 1
        })
    );
    assert_eq!(
        codec::decode(&[0, 10, b'a']),
        Err(DecodeError::Truncated {
            expected: 10,
            actual: 1
        })
    );
    assert_eq!(codec::split(b"no delimiter"), Err(DecodeError::MissingDelimiter));
    assert_eq!(codec::split(b"\npayload"), Err(DecodeError::EmptyTypeName));
    assert_eq!(
        codec::split(&[0xff, 0xfe, b'\n', 1]),
        Err(DecodeError::InvalidTypeName)
    );
}

#[test]
fn test_intro_frames() {
    let frame = codec::encode_intro("node-a").unwrap();
    assert_eq!(codec::parse_intro(&frame[2..]), Some("node-a".to_string()));

    let other = codec::encode("TestMessage", b"{}").unwrap();
    assert_eq!(codec::parse_intro(&other[2..]), None);
}

#[tokio::test]
async fn test_read_frame_from_stream() {
    let (mut client, mut server) = tokio::io::duplex(256);
    let first = codec::encode("A", b"one").unwrap();
    let second = codec::encode("B", b"two").unwrap();
    client.write_all(&first).await.unwrap();
    client.write_all(&second).await.unwrap();
    drop(client);

    let body = codec::read_frame(&mut server).await.unwrap().unwrap();
    assert_eq!(codec::split(&body).unwrap(), ("A", &b"one"[..]));
    let body = codec::read_frame(&mut server).await.unwrap().unwrap();
    assert_eq!(codec::split(&body).unwrap(), ("B", &b"two"[..]));
    assert!(codec::read_frame(&mut server).await.unwrap().is_none());
}

#[tokio::test]
async fn test_read_frame_truncated_body_is_an_error() {
    let (mut client, mut server) = tokio::io::duplex(256);
    client.write_all(&[0, 20, b'A', b'\n']).await.unwrap();
    drop(client);

    let err = codec::read_frame(&mut server).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Decode(DecodeError::Truncated { expected: 20, .. })
    ));
}

#[tokio::test]
async fn test_read_frame_truncated_header_is_an_error() {
    let (mut client, mut server) = tokio::io::duplex(256);
    client.write_all(&[0]).await.unwrap();
    drop(client);

    let err = codec::read_frame(&mut server).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Decode(DecodeError::Truncated {
            expected: 2,
            actual: 1
        })
    ));
}

// --- queues and shutdown ---

#[test]
fn test_frame_queue_is_fifo() {
    let queue = FrameQueue::new();
    assert!(queue.try_pop().is_none());
    queue.push(vec![1]);
    queue.push(vec![2]);
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.try_pop(), Some(vec![1]));
    assert_eq!(queue.try_pop(), Some(vec![2]));
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_frame_queue_pop_wakes_on_push_and_shutdown() {
    let queue = Arc::new(FrameQueue::new());
    let shutdown = Shutdown::new();

    let waiter = {
        let queue = queue.clone();
        let mut listener = shutdown.listener();
        tokio::spawn(async move { queue.pop(&mut listener).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.push(vec![7]);
    assert_eq!(waiter.await.unwrap(), Some(vec![7]));

    let waiter = {
        let queue = queue.clone();
        let mut listener = shutdown.listener();
        tokio::spawn(async move { queue.pop(&mut listener).await })
    };
    shutdown.trigger();
    assert_eq!(waiter.await.unwrap(), None);
}

#[tokio::test]
async fn test_shutdown_fires_once() {
    let shutdown = Shutdown::new();
    assert!(!shutdown.is_triggered());
    assert!(shutdown.trigger());
    assert!(!shutdown.trigger());
    assert!(shutdown.is_triggered());

    // a listener created after the fact resolves immediately
    let mut late = shutdown.listener();
    tokio::time::timeout(Duration::from_secs(1), late.wait())
        .await
        .expect("late listener should not wait");
}

// --- framed channel ---

#[tokio::test(flavor = "multi_thread")]
async fn test_channel_introduces_and_exchanges_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_inbound = Arc::new(FrameQueue::new());

    let accept = {
        let inbound = server_inbound.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            FramedChannel::accept(stream, Some(inbound), ChannelOptions::default())
                .await
                .unwrap()
        })
    };

    let client_inbound = Arc::new(FrameQueue::new());
    let client = FramedChannel::connect(
        "client-node",
        "server-node",
        addr,
        Some(client_inbound.clone()),
        ChannelOptions::default(),
    )
    .await
    .unwrap();
    let server = accept.await.unwrap();

    assert_eq!(server.name(), "client-node");
    assert!(server.is_initialized());
    assert_eq!(server.state(), ChannelState::Connected);

    client.send("Greeting", b"hi").unwrap();
    assert!(eventually(|| !server_inbound.is_empty()).await);
    let body = server.dequeue_inbound().unwrap();
    assert_eq!(codec::split(&body).unwrap(), ("Greeting", &b"hi"[..]));

    server.send("Reply", b"ho").unwrap();
    assert!(eventually(|| !client_inbound.is_empty()).await);
    let body = client.dequeue_inbound().unwrap();
    assert_eq!(codec::split(&body).unwrap(), ("Reply", &b"ho"[..]));

    client.trigger_shutdown().await;
    server.trigger_shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_channel_skips_malformed_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let inbound = Arc::new(FrameQueue::new());

    let accept = {
        let inbound = inbound.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            FramedChannel::accept(stream, Some(inbound), ChannelOptions::default())
                .await
                .unwrap()
        })
    };

    let mut raw = tokio::net::TcpStream::connect(addr).await.unwrap();
    raw.write_all(&codec::encode_intro("raw").unwrap())
        .await
        .unwrap();
    // well-framed garbage without a type delimiter, then a valid frame
    raw.write_all(&[0, 3, 1, 2, 3]).await.unwrap();
    raw.write_all(&codec::encode("Ok", b"1").unwrap())
        .await
        .unwrap();

    let server = accept.await.unwrap();
    assert!(eventually(|| !inbound.is_empty()).await);
    let body = inbound.try_pop().unwrap();
    assert_eq!(codec::split(&body).unwrap(), ("Ok", &b"1"[..]));
    assert!(server.is_connected());

    server.trigger_shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_channel_rejects_missing_intro() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        FramedChannel::accept(stream, None, ChannelOptions::default()).await
    });

    let mut raw = tokio::net::TcpStream::connect(addr).await.unwrap();
    raw.write_all(&codec::encode("NotIntro", b"x").unwrap())
        .await
        .unwrap();

    let result = accept.await.unwrap();
    assert!(matches!(result, Err(Error::HandshakeFailed(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_channel_is_not_connected_until_introduced() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _raw = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (stream, _) = listener.accept().await.unwrap();

    let (channel, _reader) = FramedChannel::pending(stream, None, ChannelOptions::default())
        .unwrap();
    assert_eq!(channel.state(), ChannelState::NotConnected);
    assert!(!channel.is_initialized());
    assert_eq!(channel.name(), "");
    assert!(matches!(channel.send("T", b""), Err(Error::ChannelClosed)));

    channel.introduce("peer".to_string());
    assert_eq!(channel.state(), ChannelState::Connected);
    assert!(channel.is_initialized());
    assert_eq!(channel.name(), "peer");

    // the first name sticks
    channel.introduce("other".to_string());
    assert_eq!(channel.name(), "peer");
    channel.trigger_shutdown().await;
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_channel_trigger_shutdown_twice() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        FramedChannel::accept(stream, None, ChannelOptions::default())
            .await
            .unwrap()
    });

    let client = FramedChannel::connect("a", "b", addr, None, ChannelOptions::default())
        .await
        .unwrap();
    let server = accept.await.unwrap();

    client.trigger_shutdown().await;
    client.trigger_shutdown().await;
    assert_eq!(client.state(), ChannelState::Disconnected);
    assert!(matches!(client.send("T", b""), Err(Error::ChannelClosed)));

    // the peer notices the closed socket
    assert!(eventually(|| !server.is_connected()).await);
    server.trigger_shutdown().await;
}

// --- rpc ---

#[derive(Default)]
struct CountingHandler {
    calls: AtomicUsize,
}

impl RpcHandler for CountingHandler {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match request {
            RpcRequest::HealthCheck => RpcResponse::Health {
                status: ServingStatus::Serving,
            },
            RpcRequest::DeregisterClient { client_id } => {
                RpcResponse::Confirmation(Confirmation::rejected(1, client_id))
            }
            _ => RpcResponse::Error {
                message: "unsupported".to_string(),
            },
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rpc_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let handler = Arc::new(CountingHandler::default());
    let server = RpcServer::start(listener, handler.clone()).unwrap();
    let client = RpcClient::new(server.local_addr().to_string(), Duration::from_secs(2));

    assert_eq!(client.health_check().await.unwrap(), ServingStatus::Serving);
    let confirmation = client.deregister_client("ghost").await.unwrap();
    assert_eq!(confirmation, Confirmation::rejected(1, "ghost"));
    assert!(matches!(
        client.list_topics().await,
        Err(Error::UnexpectedResponse(message)) if message == "unsupported"
    ));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

    server.shutdown().await;
    server.shutdown().await;
    assert!(!server.is_running());
    assert!(client.health_check().await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rpc_invalid_request_keeps_connection_open() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = RpcServer::start(listener, Arc::new(CountingHandler::default())).unwrap();
    let url = format!("ws://{}", server.local_addr());
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

    ws.send(WsMessage::text("not json")).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert!(reply.to_text().unwrap().contains("\"error\""));

    ws.send(WsMessage::text(
        r#"{"id":"1","request":{"type":"health_check"}}"#,
    ))
    .await
    .unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert!(reply.to_text().unwrap().contains("serving"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_rpc_client_unreachable() {
    // bind then drop to get a port nobody listens on
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let client = RpcClient::new(format!("127.0.0.1:{port}"), Duration::from_millis(500));
    assert!(client.health_check().await.is_err());
}

#[test]
fn test_rpc_wire_format() {
    let json = serde_json::to_string(&RpcRequest::ListTopics).unwrap();
    assert_eq!(json, r#"{"type":"list_topics"}"#);

    let response = RpcResponse::Confirmation(Confirmation::ok("done"));
    let json = serde_json::to_string(&response).unwrap();
    assert_eq!(json, r#"{"type":"confirmation","code":0,"status":"done"}"#);
    assert_eq!(
        serde_json::from_str::<RpcResponse>(&json).unwrap(),
        response
    );
}
