//! # Client WebTransport Transport
//!
//! Speaks the engine over one bidirectional stream obtained from a
//! [`WebTransportDialer`]. The QUIC/TLS plumbing lives behind the dialer
//! seam; the engine itself only needs ordered reliable bytes and applies
//! the message framing from [`crate::transport::framing`].
//!
//! The first frame after dialing is an `open` packet: with a JSON
//! `{"sid"}` payload it requests the upgrade of an existing session, with
//! no payload it asks for a fresh handshake directly on WebTransport.

use crate::client::Endpoint;
use crate::config::ClientOptions;
use crate::error::EngineError;
use crate::packet::{Packet, PacketType};
use crate::parser;
use crate::transport::framing::{read_frame, write_frame};
use crate::transport::{
    event_channel, BidiStream, Transport, TransportEvent, TransportEventRx, TransportEventTx,
    TransportKind, TransportState,
};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Produces the bidirectional stream a WebTransport session runs on.
///
/// Implementations wrap whatever QUIC stack the embedding application
/// uses; the engine hands them the request URL and expects ordered,
/// reliable bytes back.
#[async_trait]
pub trait WebTransportDialer: Send + Sync {
    /// Open a bidirectional stream to the given endpoint URL
    async fn dial(&self, url: &str, authority: &str) -> io::Result<Box<dyn BidiStream>>;
}

/// Plain TCP dialer.
///
/// Stands in for a QUIC stack in tests and closed deployments where the
/// stream does not need QUIC semantics.
pub struct TcpDialer;

#[async_trait]
impl WebTransportDialer for TcpDialer {
    async fn dial(&self, _url: &str, authority: &str) -> io::Result<Box<dyn BidiStream>> {
        let stream = TcpStream::connect(authority).await?;
        Ok(Box::new(stream))
    }
}

struct Inner {
    endpoint: Endpoint,
    protocol: u8,
    dialer: Arc<dyn WebTransportDialer>,
    events: TransportEventTx,
    state: StdMutex<TransportState>,
    writable: AtomicBool,
    sid: StdMutex<Option<String>>,
    writer: Mutex<Option<WriteHalf<Box<dyn BidiStream>>>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl Inner {
    async fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event).await;
    }

    fn transition_closed(&self) -> bool {
        let mut state = self.state.lock().expect("state lock");
        if *state == TransportState::Closed {
            false
        } else {
            *state = TransportState::Closed;
            true
        }
    }

    async fn fail_open(&self, err: EngineError) {
        self.emit(TransportEvent::Error(err)).await;
        if self.transition_closed() {
            self.emit(TransportEvent::Close).await;
        }
    }
}

/// WebTransport transport, client side.
pub struct ClientWebTransport {
    inner: Arc<Inner>,
}

impl ClientWebTransport {
    pub(crate) fn new(
        endpoint: Endpoint,
        opts: &ClientOptions,
        sid: Option<String>,
        dialer: Arc<dyn WebTransportDialer>,
    ) -> (Arc<Self>, TransportEventRx) {
        let (events, rx) = event_channel();
        let transport = Arc::new(Self {
            inner: Arc::new(Inner {
                endpoint,
                protocol: opts.protocol,
                dialer,
                events,
                state: StdMutex::new(TransportState::Opening),
                writable: AtomicBool::new(false),
                sid: StdMutex::new(sid),
                writer: Mutex::new(None),
                pump: StdMutex::new(None),
            }),
        });
        (transport, rx)
    }
}

#[async_trait]
impl Transport for ClientWebTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Webtransport
    }

    fn state(&self) -> TransportState {
        *self.inner.state.lock().expect("state lock")
    }

    fn writable(&self) -> bool {
        self.inner.writable.load(Ordering::SeqCst)
    }

    fn supports_binary(&self) -> bool {
        true
    }

    fn supports_framing(&self) -> bool {
        true
    }

    fn set_sid(&self, sid: &str) {
        *self.inner.sid.lock().expect("sid lock") = Some(sid.to_string());
    }

    async fn open(&self) {
        let inner = &self.inner;
        let url = inner
            .endpoint
            .request_url(TransportKind::Webtransport, None, false, false);
        debug!(url = %url, "dialing webtransport");

        let stream = match inner.dialer.dial(&url, &inner.endpoint.authority()).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "webtransport dial failed");
                inner
                    .fail_open(EngineError::transport("webtransport error", err))
                    .await;
                return;
            }
        };

        let (reader, mut writer) = tokio::io::split(stream);

        // announce ourselves: an upgrade request carries the session id,
        // a fresh handshake carries a bare open packet
        let hello = {
            let sid = inner.sid.lock().expect("sid lock").clone();
            match sid {
                Some(sid) => Packet::new(
                    PacketType::Open,
                    serde_json::json!({ "sid": sid }).to_string(),
                ),
                None => Packet::empty(PacketType::Open),
            }
        };
        let frame = match parser::encode_packet(&hello, inner.protocol, true) {
            Ok(frame) => frame,
            Err(err) => {
                inner.fail_open(err.into()).await;
                return;
            }
        };
        if let Err(err) = write_frame(&mut writer, &frame).await {
            inner
                .fail_open(EngineError::transport("webtransport error", err))
                .await;
            return;
        }

        *inner.writer.lock().await = Some(writer);
        *inner.state.lock().expect("state lock") = TransportState::Open;
        inner.writable.store(true, Ordering::SeqCst);
        inner.emit(TransportEvent::Open).await;

        let pump_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            read_pump(pump_inner, reader).await;
        });
        *inner.pump.lock().expect("pump lock") = Some(handle);
    }

    async fn send(&self, packets: Vec<Packet>) {
        let inner = &self.inner;
        inner.writable.store(false, Ordering::SeqCst);

        {
            let mut writer_slot = inner.writer.lock().await;
            let Some(writer) = writer_slot.as_mut() else {
                warn!("send on a webtransport stream that is not open");
                return;
            };

            for packet in &packets {
                let frame = match parser::encode_packet(packet, inner.protocol, true) {
                    Ok(frame) => frame,
                    Err(err) => {
                        inner.emit(TransportEvent::Error(err.into())).await;
                        continue;
                    }
                };
                if let Err(err) = write_frame(writer, &frame).await {
                    inner
                        .emit(TransportEvent::Error(EngineError::transport(
                            "webtransport error",
                            err,
                        )))
                        .await;
                    return;
                }
            }
        }

        inner.writable.store(true, Ordering::SeqCst);
        inner.emit(TransportEvent::Drain).await;
    }

    async fn close(&self) {
        let inner = &self.inner;
        if !inner.transition_closed() {
            return;
        }

        {
            let mut writer_slot = inner.writer.lock().await;
            if let Some(writer) = writer_slot.as_mut() {
                let _ = writer.shutdown().await;
            }
        }

        inner.emit(TransportEvent::Close).await;
    }

    async fn discard(&self) {
        if let Some(handle) = self.inner.pump.lock().expect("pump lock").take() {
            handle.abort();
        }
        self.inner.transition_closed();
        debug!("webtransport transport discarded");
    }
}

async fn read_pump(inner: Arc<Inner>, mut reader: ReadHalf<Box<dyn BidiStream>>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => match parser::decode_packet(&frame, inner.protocol) {
                Ok(packet) => inner.emit(TransportEvent::Packet(packet)).await,
                Err(err) => inner.emit(TransportEvent::Error(err.into())).await,
            },
            Ok(None) => {
                debug!("webtransport stream ended");
                break;
            }
            Err(err) => {
                inner
                    .emit(TransportEvent::Error(EngineError::transport(
                        "webtransport error",
                        err,
                    )))
                    .await;
                break;
            }
        }
    }

    if inner.transition_closed() {
        inner.emit(TransportEvent::Close).await;
    }
}
