//! Legacy wire revision (`EIO=3`) interoperability over polling: the
//! length-prefixed payload framing and the reversed heartbeat direction.

use bytes::Bytes;
use engine_io::parser::{decode_payload, PROTOCOL_V3};
use engine_io::server::{Server, ServerEvent};
use engine_io::session::{Handshake, SocketEvent};
use engine_io::transport::RawRequest;
use engine_io::{PacketData, PacketType, ServerOptions, TransportKind};
use http::{HeaderMap, Method};
use std::collections::HashMap;
use std::time::Duration;

fn request(method: Method, query: &str, body: &[u8]) -> RawRequest {
    let query: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    RawRequest {
        method,
        path: "/engine.io/".to_string(),
        query,
        headers: HeaderMap::new(),
        body: Bytes::from(body.to_vec()),
        remote_addr: None,
    }
}

fn v3_server() -> Server {
    Server::new(ServerOptions {
        allow_eio3: true,
        transports: vec![TransportKind::Polling],
        ..ServerOptions::default()
    })
}

async fn v3_handshake(server: &Server, query: &str) -> Handshake {
    let response = server.handle_request(request(Method::GET, query, b"")).await;
    assert_eq!(response.status.as_u16(), 200);

    let (packets, error) = decode_payload(&response.body, PROTOCOL_V3);
    assert!(error.is_none(), "decode error: {:?}", error);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].kind, PacketType::Open);

    let json = packets[0]
        .data
        .as_ref()
        .and_then(|d| d.as_text())
        .expect("handshake json");
    serde_json::from_str(json).expect("handshake shape")
}

#[tokio::test]
async fn v3_handshake_uses_length_prefixed_framing() {
    let server = v3_server();
    let handshake = v3_handshake(&server, "EIO=3&transport=polling&b64=1").await;
    assert!(!handshake.sid.is_empty());
    assert!(handshake.upgrades.is_empty());
    assert_eq!(server.session_count(), 1);
}

#[tokio::test]
async fn v3_client_pings_and_the_server_pongs() {
    let server = v3_server();
    let handshake = v3_handshake(&server, "EIO=3&transport=polling&b64=1").await;
    let sid = handshake.sid;

    // the v3 heartbeat direction is reversed: the client sends the probe
    let response = server
        .handle_request(request(
            Method::POST,
            &format!("EIO=3&transport=polling&sid={}&b64=1", sid),
            b"1:2",
        ))
        .await;
    assert_eq!(&response.body[..], b"ok");

    let response = server
        .handle_request(request(
            Method::GET,
            &format!("EIO=3&transport=polling&sid={}&b64=1", sid),
            b"",
        ))
        .await;
    assert_eq!(&response.body[..], b"1:3");
}

#[tokio::test]
async fn v3_binary_capable_peer_receives_binary_framing() {
    let server = v3_server();
    let mut server_events = server.events().expect("server events");

    // no b64 flag: the peer can take the binary payload framing
    let handshake = v3_handshake(&server, "EIO=3&transport=polling").await;
    let sid = handshake.sid;
    let socket = match server_events.recv().await {
        Some(ServerEvent::Connection(socket)) => socket,
        other => panic!("expected a connection event, got {:?}", other),
    };

    socket.send(vec![0xdeu8, 0xad]).await;
    let response = server
        .handle_request(request(
            Method::GET,
            &format!("EIO=3&transport=polling&sid={}", sid),
            b"",
        ))
        .await;
    assert_eq!(response.content_type, "application/octet-stream");
    // 1-marker record, length 3: raw type byte plus the two payload bytes
    assert_eq!(&response.body[..], &[1, 3, 0xff, 4, 0xde, 0xad][..]);

    let (packets, error) = decode_payload(&response.body, PROTOCOL_V3);
    assert!(error.is_none());
    assert_eq!(packets.len(), 1);
    assert_eq!(
        packets[0].data,
        Some(PacketData::from(vec![0xdeu8, 0xad]))
    );
}

#[tokio::test]
async fn v3_client_round_trip_over_loopback() {
    let server = v3_server();
    let addr = server
        .serve("127.0.0.1:0".parse().unwrap())
        .await
        .expect("serve");

    // echo worker
    let mut server_events = server.events().expect("server events");
    tokio::spawn(async move {
        while let Some(event) = server_events.recv().await {
            if let ServerEvent::Connection(socket) = event {
                tokio::spawn(async move {
                    let Some(mut events) = socket.events() else {
                        return;
                    };
                    while let Some(event) = events.recv().await {
                        match event {
                            SocketEvent::Message(data) => socket.send(data).await,
                            SocketEvent::Close { .. } => break,
                            _ => {}
                        }
                    }
                });
            }
        }
    });

    let opts = engine_io::ClientOptions {
        protocol: 3,
        transports: vec![TransportKind::Polling],
        ..engine_io::ClientOptions::default()
    };
    let socket = engine_io::client::connect(&format!("http://{}", addr), opts)
        .await
        .expect("client connect");
    let mut events = socket.events().expect("client events");

    let open = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("client event") {
                SocketEvent::Open(handshake) => break handshake,
                _ => continue,
            }
        }
    })
    .await
    .expect("open event");
    assert!(!open.sid.is_empty());

    socket.send("legacy hello").await;
    let echoed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("client event") {
                SocketEvent::Message(data) => break data,
                _ => continue,
            }
        }
    })
    .await
    .expect("echoed message");
    assert_eq!(echoed.as_text(), Some("legacy hello"));

    server.close().await;
}

#[tokio::test]
async fn v3_message_round_trip() {
    let server = v3_server();
    let mut server_events = server.events().expect("server events");

    let handshake = v3_handshake(&server, "EIO=3&transport=polling&b64=1").await;
    let sid = handshake.sid;
    let socket = match server_events.recv().await {
        Some(ServerEvent::Connection(socket)) => socket,
        other => panic!("expected a connection event, got {:?}", other),
    };
    let mut socket_events = socket.events().expect("socket events");

    let response = server
        .handle_request(request(
            Method::POST,
            &format!("EIO=3&transport=polling&sid={}&b64=1", sid),
            b"6:4hello",
        ))
        .await;
    assert_eq!(&response.body[..], b"ok");

    let received = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match socket_events.recv().await.expect("socket event") {
                SocketEvent::Message(data) => break data,
                _ => continue,
            }
        }
    })
    .await
    .expect("message event");
    assert_eq!(received.as_text(), Some("hello"));

    socket.send("world").await;
    let response = server
        .handle_request(request(
            Method::GET,
            &format!("EIO=3&transport=polling&sid={}&b64=1", sid),
            b"",
        ))
        .await;
    assert_eq!(&response.body[..], b"6:4world");
}
