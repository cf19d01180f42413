//! # Server WebTransport Transport
//!
//! Carries a session over one bidirectional stream. The stream itself is
//! supplied by the embedding QUIC layer; the engine only assumes ordered,
//! reliable bytes and applies its own message framing on top (see
//! [`crate::transport::framing`]).
//!
//! The very first frame of a fresh stream is an `open` packet read by the
//! dispatcher before this type is constructed: a JSON `{"sid": ...}`
//! payload requests the upgrade of an existing session, no payload asks
//! for a fresh handshake directly on WebTransport.

use crate::error::EngineError;
use crate::packet::Packet;
use crate::parser;
use crate::transport::framing::{read_frame, write_frame};
use crate::transport::{
    event_channel, BidiStream, Transport, TransportEvent, TransportEventRx, TransportEventTx,
    TransportKind, TransportState,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct Inner {
    protocol: u8,
    events: TransportEventTx,
    state: StdMutex<TransportState>,
    writable: AtomicBool,
    writer: Mutex<WriteHalf<Box<dyn BidiStream>>>,
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
}

/// WebTransport transport, server side.
pub struct WebTransportTransport {
    inner: Arc<Inner>,
}

impl WebTransportTransport {
    /// Wrap an accepted bidirectional stream. The dispatcher has already
    /// consumed the initial `open` frame.
    pub fn new(stream: Box<dyn BidiStream>, protocol: u8) -> (Arc<Self>, TransportEventRx) {
        let (events, rx) = event_channel();
        let (reader, writer) = tokio::io::split(stream);

        let inner = Arc::new(Inner {
            protocol,
            events,
            state: StdMutex::new(TransportState::Open),
            writable: AtomicBool::new(true),
            writer: Mutex::new(writer),
            pump: StdMutex::new(None),
        });

        let pump_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            read_pump(pump_inner, reader).await;
        });
        *inner.pump.lock().expect("pump lock") = Some(handle);

        (Arc::new(Self { inner }), rx)
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
                warn!(error = %err, "webtransport read failed");
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

#[async_trait]
impl Transport for WebTransportTransport {
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

    async fn send(&self, packets: Vec<Packet>) {
        let inner = &self.inner;
        inner.writable.store(false, Ordering::SeqCst);

        {
            let mut writer = inner.writer.lock().await;
            for packet in &packets {
                let frame = match parser::encode_packet(packet, inner.protocol, true) {
                    Ok(frame) => frame,
                    Err(err) => {
                        inner.emit(TransportEvent::Error(err.into())).await;
                        continue;
                    }
                };
                if let Err(err) = write_frame(&mut *writer, &frame).await {
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
            let mut writer = inner.writer.lock().await;
            let _ = writer.shutdown().await;
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
