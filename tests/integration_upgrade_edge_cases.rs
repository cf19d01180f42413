//! Upgrade failure paths: a probe that never commits must not take the
//! session down, and the bootstrap options that shortcut or enrich the
//! handshake must hold.

use engine_io::client;
use engine_io::parser::{decode_payload, PROTOCOL_V4};
use engine_io::server::{Server, ServerEvent};
use engine_io::session::SocketEvent;
use engine_io::transport::RawRequest;
use engine_io::{ClientOptions, PacketType, ReadyState, ServerOptions, TransportKind};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

async fn wait_for<F>(events: &mut mpsc::Receiver<SocketEvent>, pred: F) -> SocketEvent
where
    F: Fn(&SocketEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn silent_probe_times_out_and_the_session_survives() {
    let server = Server::new(ServerOptions {
        upgrade_timeout: Duration::from_millis(300),
        ..ServerOptions::default()
    });
    let addr = server
        .serve("127.0.0.1:0".parse().unwrap())
        .await
        .expect("serve");

    // a real client holds the session over polling
    let opts = ClientOptions {
        transports: vec![TransportKind::Polling],
        upgrade: false,
        ..ClientOptions::default()
    };
    let socket = client::connect(&format!("http://{}", addr), opts)
        .await
        .expect("client connect");
    let mut events = socket.events().expect("client events");
    wait_for(&mut events, |e| matches!(e, SocketEvent::Open(_))).await;
    let sid = socket.sid().expect("sid");

    // a probing transport attaches to the same sid and then says nothing
    let url = format!("ws://{}/engine.io/?EIO=4&transport=websocket&sid={}", addr, sid);
    let (mut ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .expect("ws connect");

    // the server abandons the probe after the upgrade timeout
    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "probe transport was not closed");

    // the session is untouched
    assert_eq!(server.session_count(), 1);
    assert_eq!(socket.ready_state(), ReadyState::Open);
    socket.send("still here").await;

    server.close().await;
}

#[tokio::test]
async fn stray_packet_aborts_the_probe() {
    let server = Server::new(ServerOptions::default());
    let addr = server
        .serve("127.0.0.1:0".parse().unwrap())
        .await
        .expect("serve");

    let opts = ClientOptions {
        transports: vec![TransportKind::Polling],
        upgrade: false,
        ..ClientOptions::default()
    };
    let socket = client::connect(&format!("http://{}", addr), opts)
        .await
        .expect("client connect");
    let mut events = socket.events().expect("client events");
    wait_for(&mut events, |e| matches!(e, SocketEvent::Open(_))).await;
    let sid = socket.sid().expect("sid");

    let url = format!("ws://{}/engine.io/?EIO=4&transport=websocket&sid={}", addr, sid);
    let (mut ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .expect("ws connect");

    // a message before the probe handshake is a protocol violation on the
    // candidate transport
    ws.send(tokio_tungstenite::tungstenite::Message::Text(
        "4too early".to_string(),
    ))
    .await
    .expect("send");

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "probe transport was not closed");
    assert_eq!(server.session_count(), 1);

    server.close().await;
}

#[tokio::test]
async fn remember_upgrade_dials_websocket_first() {
    let server = Server::new(ServerOptions::default());
    let _events = server.events();
    let addr = server
        .serve("127.0.0.1:0".parse().unwrap())
        .await
        .expect("serve");

    let opts = ClientOptions {
        transports: vec![TransportKind::Polling, TransportKind::Websocket],
        remember_upgrade: true,
        ..ClientOptions::default()
    };
    let socket = client::connect(&format!("http://{}", addr), opts)
        .await
        .expect("client connect");
    let mut events = socket.events().expect("client events");

    wait_for(&mut events, |e| matches!(e, SocketEvent::Open(_))).await;
    // no polling bootstrap happened
    assert_eq!(socket.transport_kind(), Some(TransportKind::Websocket));

    server.close().await;
}

#[tokio::test]
async fn initial_packet_rides_in_the_handshake_payload() {
    let server = Server::new(ServerOptions {
        initial_packet: Some(engine_io::PacketData::Text("welcome".to_string())),
        ..ServerOptions::default()
    });

    let query: HashMap<String, String> =
        url::form_urlencoded::parse(b"EIO=4&transport=polling")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
    let response = server
        .handle_request(RawRequest {
            method: http::Method::GET,
            path: "/engine.io/".to_string(),
            query,
            headers: http::HeaderMap::new(),
            body: bytes::Bytes::new(),
            remote_addr: None,
        })
        .await;

    let (packets, error) = decode_payload(&response.body, PROTOCOL_V4);
    assert!(error.is_none());
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].kind, PacketType::Open);
    assert!(packets[1].has_text("welcome"));
}

#[tokio::test]
async fn same_transport_upgrade_request_is_rejected() {
    let server = Server::new(ServerOptions::default());
    let _events = server.events();
    let addr = server
        .serve("127.0.0.1:0".parse().unwrap())
        .await
        .expect("serve");

    // establish a direct websocket session
    let opts = ClientOptions {
        transports: vec![TransportKind::Websocket],
        ..ClientOptions::default()
    };
    let socket = client::connect(&format!("http://{}", addr), opts)
        .await
        .expect("client connect");
    let mut events = socket.events().expect("client events");
    wait_for(&mut events, |e| matches!(e, SocketEvent::Open(_))).await;
    let sid = socket.sid().expect("sid");

    // websocket cannot upgrade to websocket
    let url = format!("ws://{}/engine.io/?EIO=4&transport=websocket&sid={}", addr, sid);
    let result = tokio_tungstenite::connect_async(url).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 400);
        }
        other => panic!("expected an http rejection, got {:?}", other),
    }

    server.close().await;
}

#[tokio::test]
async fn connection_error_events_carry_the_request_context() {
    let server = Server::new(ServerOptions::default());
    let mut server_events = server.events().expect("server events");

    let query: HashMap<String, String> =
        url::form_urlencoded::parse(b"EIO=4&transport=rocket")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
    let _ = server
        .handle_request(RawRequest {
            method: http::Method::GET,
            path: "/engine.io/".to_string(),
            query,
            headers: http::HeaderMap::new(),
            body: bytes::Bytes::new(),
            remote_addr: None,
        })
        .await;

    match server_events.recv().await {
        Some(ServerEvent::ConnectionError { kind, method, path }) => {
            assert_eq!(kind.code(), 0);
            assert_eq!(method, http::Method::GET);
            assert_eq!(path, "/engine.io/");
        }
        other => panic!("expected a connection error event, got {:?}", other),
    }
}
