//! WebSocket scenarios: direct connection and in-session upgrade from
//! polling, over real loopback HTTP.

use engine_io::client::{self, ClientSocket};
use engine_io::server::{Server, ServerEvent};
use engine_io::session::SocketEvent;
use engine_io::{ClientOptions, PacketData, ServerOptions, TransportKind};
use std::time::Duration;
use tokio::sync::mpsc;

fn spawn_echo(server: &Server) -> mpsc::Receiver<engine_io::server::Socket> {
    let mut events = server.events().expect("server events");
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ServerEvent::Connection(socket) = event {
                let _ = tx.send(socket.clone()).await;
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
    rx
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

async fn serve_default() -> (Server, std::net::SocketAddr) {
    let server = Server::new(ServerOptions::default());
    let addr = server
        .serve("127.0.0.1:0".parse().unwrap())
        .await
        .expect("serve");
    (server, addr)
}

#[tokio::test]
async fn direct_websocket_connection() {
    let (server, addr) = serve_default().await;
    let _sockets = spawn_echo(&server);

    let opts = ClientOptions {
        transports: vec![TransportKind::Websocket],
        ..ClientOptions::default()
    };
    let socket: ClientSocket = client::connect(&format!("http://{}", addr), opts)
        .await
        .expect("client connect");
    let mut events = socket.events().expect("client events");

    wait_for(&mut events, |e| matches!(e, SocketEvent::Open(_))).await;
    assert_eq!(socket.transport_kind(), Some(TransportKind::Websocket));

    socket.send("over websocket").await;
    let echoed = wait_for(&mut events, |e| matches!(e, SocketEvent::Message(_))).await;
    match echoed {
        SocketEvent::Message(data) => assert_eq!(data.as_text(), Some("over websocket")),
        _ => unreachable!(),
    }

    server.close().await;
}

#[tokio::test]
async fn polling_upgrades_to_websocket() {
    let (server, addr) = serve_default().await;
    let mut sockets = spawn_echo(&server);

    let socket = client::connect(&format!("http://{}", addr), ClientOptions::default())
        .await
        .expect("client connect");
    let mut events = socket.events().expect("client events");

    let open = wait_for(&mut events, |e| matches!(e, SocketEvent::Open(_))).await;
    match open {
        SocketEvent::Open(handshake) => {
            assert_eq!(handshake.upgrades, vec!["websocket".to_string()])
        }
        _ => unreachable!(),
    }
    assert_eq!(socket.transport_kind(), Some(TransportKind::Polling));

    // the probe runs on its own; wait for the handover
    wait_for(&mut events, |e| matches!(e, SocketEvent::Upgrading(_))).await;
    let upgrade = wait_for(&mut events, |e| matches!(e, SocketEvent::Upgrade(_))).await;
    match upgrade {
        SocketEvent::Upgrade(kind) => assert_eq!(kind, TransportKind::Websocket),
        _ => unreachable!(),
    }
    assert!(socket.upgraded());
    assert_eq!(socket.transport_kind(), Some(TransportKind::Websocket));

    // traffic keeps flowing on the new transport
    socket.send("after upgrade").await;
    let echoed = wait_for(&mut events, |e| matches!(e, SocketEvent::Message(_))).await;
    match echoed {
        SocketEvent::Message(data) => assert_eq!(data.as_text(), Some("after upgrade")),
        _ => unreachable!(),
    }

    // the server side observed the same handover
    let server_socket = tokio::time::timeout(Duration::from_secs(5), sockets.recv())
        .await
        .expect("server socket")
        .expect("server socket channel");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server_socket.upgraded());
    assert_eq!(
        server_socket.transport_kind(),
        Some(TransportKind::Websocket)
    );

    server.close().await;
}

#[tokio::test]
async fn binary_round_trip_over_websocket() {
    let (server, addr) = serve_default().await;
    let _sockets = spawn_echo(&server);

    let opts = ClientOptions {
        transports: vec![TransportKind::Websocket],
        ..ClientOptions::default()
    };
    let socket = client::connect(&format!("http://{}", addr), opts)
        .await
        .expect("client connect");
    let mut events = socket.events().expect("client events");
    wait_for(&mut events, |e| matches!(e, SocketEvent::Open(_))).await;

    let payload = vec![0u8, 1, 2, 253, 254, 255];
    socket.send(payload.clone()).await;

    let echoed = wait_for(&mut events, |e| matches!(e, SocketEvent::Message(_))).await;
    match echoed {
        SocketEvent::Message(PacketData::Binary(bytes)) => {
            assert_eq!(&bytes[..], &payload[..]);
        }
        other => panic!("expected a binary message, got {:?}", other),
    }

    server.close().await;
}

#[tokio::test]
async fn websocket_upgrade_with_unknown_sid_is_rejected() {
    let (server, addr) = serve_default().await;

    let url = format!(
        "ws://{}/engine.io/?EIO=4&transport=websocket&sid=does-not-exist",
        addr
    );
    let result = tokio_tungstenite::connect_async(url).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 400);
        }
        other => panic!("expected an http rejection, got {:?}", other),
    }

    server.close().await;
}
