//! WebTransport scenarios over a loopback stream listener standing in for
//! the QUIC plumbing: fresh handshake directly on WebTransport, and the
//! polling → WebTransport upgrade with its 200 ms probe priority.

use async_trait::async_trait;
use engine_io::client::transport::WebTransportDialer;
use engine_io::client::{self};
use engine_io::server::{Server, ServerEvent};
use engine_io::session::SocketEvent;
use engine_io::transport::BidiStream;
use engine_io::{ClientOptions, ServerOptions, TransportKind};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Accept loopback TCP connections and feed them to the engine as
/// WebTransport bidirectional streams
async fn spawn_stream_listener(server: Server) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                break;
            };
            let server = server.clone();
            tokio::spawn(async move {
                let _ = server.on_webtransport_stream(Box::new(stream)).await;
            });
        }
    });
    addr
}

/// Dialer pinned to the stream listener's address
struct FixedDialer(SocketAddr);

#[async_trait]
impl WebTransportDialer for FixedDialer {
    async fn dial(&self, _url: &str, _authority: &str) -> io::Result<Box<dyn BidiStream>> {
        let stream = TcpStream::connect(self.0).await?;
        Ok(Box::new(stream))
    }
}

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

#[tokio::test]
async fn fresh_handshake_directly_on_webtransport() {
    let server = Server::new(ServerOptions {
        transports: vec![TransportKind::Polling, TransportKind::Webtransport],
        ..ServerOptions::default()
    });
    spawn_echo(&server);
    let wt_addr = spawn_stream_listener(server.clone()).await;

    let opts = ClientOptions {
        transports: vec![TransportKind::Webtransport],
        webtransport_dialer: Some(Arc::new(FixedDialer(wt_addr))),
        ..ClientOptions::default()
    };
    let socket = client::connect(&format!("https://{}", wt_addr), opts)
        .await
        .expect("client connect");
    let mut events = socket.events().expect("client events");

    let open = wait_for(&mut events, |e| matches!(e, SocketEvent::Open(_))).await;
    match open {
        SocketEvent::Open(handshake) => assert!(!handshake.sid.is_empty()),
        _ => unreachable!(),
    }
    assert_eq!(socket.transport_kind(), Some(TransportKind::Webtransport));

    socket.send("over webtransport").await;
    let echoed = wait_for(&mut events, |e| matches!(e, SocketEvent::Message(_))).await;
    match echoed {
        SocketEvent::Message(data) => {
            assert_eq!(data.as_text(), Some("over webtransport"))
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn polling_upgrades_to_webtransport() {
    let server = Server::new(ServerOptions {
        transports: vec![TransportKind::Polling, TransportKind::Webtransport],
        ..ServerOptions::default()
    });
    spawn_echo(&server);
    let http_addr = server
        .serve("127.0.0.1:0".parse().unwrap())
        .await
        .expect("serve");
    let wt_addr = spawn_stream_listener(server.clone()).await;

    let opts = ClientOptions {
        transports: vec![TransportKind::Polling, TransportKind::Webtransport],
        webtransport_dialer: Some(Arc::new(FixedDialer(wt_addr))),
        ..ClientOptions::default()
    };
    let socket = client::connect(&format!("http://{}", http_addr), opts)
        .await
        .expect("client connect");
    let mut events = socket.events().expect("client events");

    let open = wait_for(&mut events, |e| matches!(e, SocketEvent::Open(_))).await;
    match open {
        SocketEvent::Open(handshake) => {
            assert_eq!(handshake.upgrades, vec!["webtransport".to_string()])
        }
        _ => unreachable!(),
    }

    let upgrade = wait_for(&mut events, |e| matches!(e, SocketEvent::Upgrade(_))).await;
    match upgrade {
        SocketEvent::Upgrade(kind) => assert_eq!(kind, TransportKind::Webtransport),
        _ => unreachable!(),
    }
    assert!(socket.upgraded());
    assert_eq!(socket.transport_kind(), Some(TransportKind::Webtransport));

    socket.send("after upgrade").await;
    let echoed = wait_for(&mut events, |e| matches!(e, SocketEvent::Message(_))).await;
    match echoed {
        SocketEvent::Message(data) => assert_eq!(data.as_text(), Some("after upgrade")),
        _ => unreachable!(),
    }

    server.close().await;
}
