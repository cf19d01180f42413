//! End-to-end polling scenarios driven through the dispatcher's request
//! entry point, without a network in between.

use bytes::Bytes;
use engine_io::parser::{decode_payload, PROTOCOL_V4};
use engine_io::server::ServerEvent;
use engine_io::session::{CloseReason, Handshake, SocketEvent};
use engine_io::transport::RawRequest;
use engine_io::{PacketType, Server, ServerOptions};
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

fn get(query: &str) -> RawRequest {
    request(Method::GET, query, b"")
}

fn post(query: &str, body: &[u8]) -> RawRequest {
    request(Method::POST, query, body)
}

/// Complete a polling handshake and return the handshake payload
async fn handshake(server: &Server) -> Handshake {
    let response = server.handle_request(get("EIO=4&transport=polling")).await;
    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.content_type, "text/plain; charset=UTF-8");

    let (packets, error) = decode_payload(&response.body, PROTOCOL_V4);
    assert!(error.is_none());
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
async fn handshake_over_polling_advertises_the_configuration() {
    let server = Server::new(ServerOptions::default());
    let handshake = handshake(&server).await;

    assert!(!handshake.sid.is_empty());
    assert_eq!(handshake.upgrades, vec!["websocket".to_string()]);
    assert_eq!(handshake.ping_interval, 25_000);
    assert_eq!(handshake.ping_timeout, 20_000);
    assert_eq!(handshake.max_payload, 1_000_000);
    assert_eq!(server.session_count(), 1);
}

#[tokio::test]
async fn messages_flow_both_ways_over_polling() {
    let server = Server::new(ServerOptions::default());
    let mut server_events = server.events().expect("server events");

    let handshake = handshake(&server).await;
    let sid = handshake.sid;

    let socket = match server_events.recv().await {
        Some(ServerEvent::Connection(socket)) => socket,
        other => panic!("expected a connection event, got {:?}", other),
    };
    let mut socket_events = socket.events().expect("socket events");

    // upload a message
    let response = server
        .handle_request(post(&format!("EIO=4&transport=polling&sid={}", sid), b"4hello"))
        .await;
    assert_eq!(&response.body[..], b"ok");
    assert_eq!(response.content_type, "text/html");

    let received = loop {
        match socket_events.recv().await.expect("socket event") {
            SocketEvent::Message(data) => break data,
            _ => continue,
        }
    };
    assert_eq!(received.as_text(), Some("hello"));

    // download a message
    socket.send("world").await;
    let response = server
        .handle_request(get(&format!("EIO=4&transport=polling&sid={}", sid)))
        .await;
    assert_eq!(&response.body[..], b"4world");
}

#[tokio::test]
async fn max_payload_splits_the_write_buffer_across_polls() {
    let opts = ServerOptions {
        max_payload: 10,
        ..ServerOptions::default()
    };
    let server = Server::new(opts);
    let mut server_events = server.events().expect("server events");

    let handshake = handshake(&server).await;
    let sid = handshake.sid;
    let socket = match server_events.recv().await {
        Some(ServerEvent::Connection(socket)) => socket,
        other => panic!("expected a connection event, got {:?}", other),
    };

    socket.send("abcdefgh").await;
    socket.send("ijklmn").await;

    // 9 encoded bytes fit the 10-byte budget alone; the second message
    // must wait for the next cycle
    let first = server
        .handle_request(get(&format!("EIO=4&transport=polling&sid={}", sid)))
        .await;
    assert_eq!(&first.body[..], b"4abcdefgh");

    let second = server
        .handle_request(get(&format!("EIO=4&transport=polling&sid={}", sid)))
        .await;
    assert_eq!(&second.body[..], b"4ijklmn");
}

#[tokio::test]
async fn binary_rides_base64_over_polling() {
    let server = Server::new(ServerOptions::default());
    let mut server_events = server.events().expect("server events");

    let handshake = handshake(&server).await;
    let sid = handshake.sid;
    let socket = match server_events.recv().await {
        Some(ServerEvent::Connection(socket)) => socket,
        other => panic!("expected a connection event, got {:?}", other),
    };

    socket.send(vec![0x01u8, 0x02, 0x03]).await;
    let response = server
        .handle_request(get(&format!("EIO=4&transport=polling&sid={}", sid)))
        .await;
    assert_eq!(&response.body[..], b"bAQID");
}

#[tokio::test]
async fn overlapping_requests_close_the_session() {
    let server = Server::new(ServerOptions::default());
    let mut server_events = server.events().expect("server events");

    let handshake = handshake(&server).await;
    let sid = handshake.sid;
    let socket = match server_events.recv().await {
        Some(ServerEvent::Connection(socket)) => socket,
        other => panic!("expected a connection event, got {:?}", other),
    };
    let mut socket_events = socket.events().expect("socket events");

    // park the legitimate poll
    let parked_server = server.clone();
    let parked_sid = sid.clone();
    let parked = tokio::spawn(async move {
        parked_server
            .handle_request(get(&format!("EIO=4&transport=polling&sid={}", parked_sid)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // the overlapping poll is a protocol violation
    let overlap = server
        .handle_request(get(&format!("EIO=4&transport=polling&sid={}", sid)))
        .await;
    assert_eq!(overlap.status.as_u16(), 400);
    assert_eq!(&overlap.body[..], br#"{"code":3,"message":"Bad request"}"#);

    // the session closes with a transport error and the parked poll is
    // completed with a close packet
    let close = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match socket_events.recv().await.expect("socket event") {
                SocketEvent::Close { reason, .. } => break reason,
                _ => continue,
            }
        }
    })
    .await
    .expect("close event");
    assert_eq!(close, CloseReason::TransportError);

    let parked = parked.await.expect("parked poll");
    assert_eq!(&parked.body[..], b"1");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.session_count(), 0);
}

#[tokio::test]
async fn handshake_sets_the_sticky_cookie() {
    let opts = ServerOptions {
        cookie: Some(engine_io::config::CookieOptions::default()),
        ..ServerOptions::default()
    };
    let server = Server::new(opts);

    let response = server.handle_request(get("EIO=4&transport=polling")).await;
    assert_eq!(response.status.as_u16(), 200);

    let (packets, _) = decode_payload(&response.body, PROTOCOL_V4);
    let handshake: Handshake = serde_json::from_str(
        packets[0]
            .data
            .as_ref()
            .and_then(|d| d.as_text())
            .expect("handshake json"),
    )
    .expect("handshake shape");

    let cookie = response
        .headers
        .iter()
        .find(|(name, _)| *name == http::header::SET_COOKIE)
        .map(|(_, value)| value.to_str().expect("cookie value").to_string())
        .expect("set-cookie header");
    assert_eq!(cookie, format!("io={}; Path=/; HttpOnly", handshake.sid));
}

#[tokio::test]
async fn close_is_idempotent_and_empties_the_buffer() {
    let server = Server::new(ServerOptions::default());
    let mut server_events = server.events().expect("server events");

    let _handshake = handshake(&server).await;
    let socket = match server_events.recv().await {
        Some(ServerEvent::Connection(socket)) => socket,
        other => panic!("expected a connection event, got {:?}", other),
    };
    let mut socket_events = socket.events().expect("socket events");

    socket.close().await;
    socket.close().await;

    let mut closes = 0;
    let drained = tokio::time::timeout(Duration::from_millis(500), async {
        while let Some(event) = socket_events.recv().await {
            if matches!(event, SocketEvent::Close { .. }) {
                closes += 1;
            }
        }
    })
    .await;
    // either the stream ended or the timeout elapsed; both are fine as
    // long as exactly one close was observed
    let _ = drained;
    assert_eq!(closes, 1);
    assert_eq!(server.session_count(), 0);
}
