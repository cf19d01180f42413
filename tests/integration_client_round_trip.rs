//! Full client ↔ server round trips over loopback HTTP.

use engine_io::client::{self, ClientSocket};
use engine_io::server::{Server, ServerEvent};
use engine_io::session::{CloseReason, SocketEvent};
use engine_io::{ClientOptions, ServerOptions, TransportKind};
use std::time::Duration;
use tokio::sync::mpsc;

/// Spawn an echo worker for every incoming session
fn spawn_echo(server: &Server) {
    let mut events = server.events().expect("server events");
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
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
}

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

async fn connect_polling_only(addr: std::net::SocketAddr) -> ClientSocket {
    let opts = ClientOptions {
        transports: vec![TransportKind::Polling],
        ..ClientOptions::default()
    };
    client::connect(&format!("http://{}", addr), opts)
        .await
        .expect("client connect")
}

#[tokio::test]
async fn polling_round_trip() {
    let server = Server::new(ServerOptions {
        transports: vec![TransportKind::Polling],
        ..ServerOptions::default()
    });
    spawn_echo(&server);
    let addr = server
        .serve("127.0.0.1:0".parse().unwrap())
        .await
        .expect("serve");

    let socket = connect_polling_only(addr).await;
    let mut events = socket.events().expect("client events");

    let open = wait_for(&mut events, |e| matches!(e, SocketEvent::Open(_))).await;
    match open {
        SocketEvent::Open(handshake) => {
            assert!(!handshake.sid.is_empty());
            // no upgrades on a polling-only server
            assert!(handshake.upgrades.is_empty());
        }
        _ => unreachable!(),
    }
    assert_eq!(socket.transport_kind(), Some(TransportKind::Polling));

    socket.send("hello").await;
    let echoed = wait_for(&mut events, |e| matches!(e, SocketEvent::Message(_))).await;
    match echoed {
        SocketEvent::Message(data) => assert_eq!(data.as_text(), Some("hello")),
        _ => unreachable!(),
    }

    socket.close().await;
    let close = wait_for(&mut events, |e| matches!(e, SocketEvent::Close { .. })).await;
    match close {
        SocketEvent::Close { reason, .. } => assert_eq!(reason, CloseReason::ForcedClose),
        _ => unreachable!(),
    }

    server.close().await;
}

#[tokio::test]
async fn messages_preserve_order() {
    let server = Server::new(ServerOptions {
        transports: vec![TransportKind::Polling],
        ..ServerOptions::default()
    });
    spawn_echo(&server);
    let addr = server
        .serve("127.0.0.1:0".parse().unwrap())
        .await
        .expect("serve");

    let socket = connect_polling_only(addr).await;
    let mut events = socket.events().expect("client events");
    wait_for(&mut events, |e| matches!(e, SocketEvent::Open(_))).await;

    for i in 0..10 {
        socket.send(format!("message-{}", i)).await;
    }

    let mut received = Vec::new();
    while received.len() < 10 {
        let event = wait_for(&mut events, |e| matches!(e, SocketEvent::Message(_))).await;
        if let SocketEvent::Message(data) = event {
            received.push(data.as_text().expect("text message").to_string());
        }
    }
    let expected: Vec<String> = (0..10).map(|i| format!("message-{}", i)).collect();
    assert_eq!(received, expected);

    server.close().await;
}

#[tokio::test]
async fn local_send_callback_fires_on_drain() {
    let server = Server::new(ServerOptions {
        transports: vec![TransportKind::Polling],
        ..ServerOptions::default()
    });
    spawn_echo(&server);
    let addr = server
        .serve("127.0.0.1:0".parse().unwrap())
        .await
        .expect("serve");

    let socket = connect_polling_only(addr).await;
    let mut events = socket.events().expect("client events");
    wait_for(&mut events, |e| matches!(e, SocketEvent::Open(_))).await;

    let (ack_tx, mut ack_rx) = mpsc::channel::<()>(1);
    socket
        .send_with(
            "with-ack",
            Default::default(),
            Some(Box::new(move || {
                let _ = ack_tx.try_send(());
            })),
        )
        .await;

    tokio::time::timeout(Duration::from_secs(5), ack_rx.recv())
        .await
        .expect("send callback")
        .expect("send callback channel");

    server.close().await;
}

#[tokio::test]
async fn try_all_transports_falls_back_after_a_failed_dial() {
    let server = Server::new(ServerOptions {
        transports: vec![TransportKind::Polling],
        ..ServerOptions::default()
    });
    spawn_echo(&server);
    let addr = server
        .serve("127.0.0.1:0".parse().unwrap())
        .await
        .expect("serve");

    // webtransport first: the default dialer reaches the HTTP port, where
    // the framed hello is garbage and the stream dies; the client must
    // fall through to polling instead of failing
    let opts = ClientOptions {
        transports: vec![TransportKind::Webtransport, TransportKind::Polling],
        try_all_transports: true,
        ..ClientOptions::default()
    };
    let socket = client::connect(&format!("http://{}", addr), opts)
        .await
        .expect("client connect");
    let mut events = socket.events().expect("client events");

    wait_for(&mut events, |e| matches!(e, SocketEvent::Open(_))).await;
    assert_eq!(socket.transport_kind(), Some(TransportKind::Polling));

    socket.send("made it").await;
    let echoed = wait_for(&mut events, |e| matches!(e, SocketEvent::Message(_))).await;
    match echoed {
        SocketEvent::Message(data) => assert_eq!(data.as_text(), Some("made it")),
        _ => unreachable!(),
    }

    server.close().await;
}

#[tokio::test]
async fn failing_fast_without_try_all_transports() {
    // nothing is listening on this port
    let opts = ClientOptions {
        transports: vec![TransportKind::Websocket],
        ..ClientOptions::default()
    };
    let socket = client::connect("http://127.0.0.1:9", opts)
        .await
        .expect("client constructs");
    let mut events = socket.events().expect("client events");

    let close = wait_for(&mut events, |e| matches!(e, SocketEvent::Close { .. })).await;
    match close {
        SocketEvent::Close { reason, .. } => {
            assert_eq!(reason, CloseReason::TransportError)
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn server_close_reaches_the_client() {
    let server = Server::new(ServerOptions {
        transports: vec![TransportKind::Polling],
        ..ServerOptions::default()
    });
    let mut server_events = server.events().expect("server events");
    let addr = server
        .serve("127.0.0.1:0".parse().unwrap())
        .await
        .expect("serve");

    let socket = connect_polling_only(addr).await;
    let mut events = socket.events().expect("client events");
    wait_for(&mut events, |e| matches!(e, SocketEvent::Open(_))).await;

    let server_socket = loop {
        match server_events.recv().await {
            Some(ServerEvent::Connection(socket)) => break socket,
            Some(_) => continue,
            None => panic!("server event stream ended"),
        }
    };
    server_socket.close().await;

    let close = wait_for(&mut events, |e| matches!(e, SocketEvent::Close { .. })).await;
    match close {
        // the close packet arrives over the parked poll
        SocketEvent::Close { reason, .. } => assert_eq!(reason, CloseReason::TransportClose),
        _ => unreachable!(),
    }

    server.close().await;
}
