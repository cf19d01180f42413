//! # Server WebSocket Transport
//!
//! One packet per WebSocket frame: textual packets become text frames,
//! binary packets become binary frames. The transport is created around an
//! already-upgraded connection; the HTTP 101 exchange happens in the
//! dispatcher before this type exists.

use crate::config::PerMessageDeflate;
use crate::error::EngineError;
use crate::packet::Packet;
use crate::parser::{self, WireFrame};
use crate::transport::{
    event_channel, Transport, TransportEvent, TransportEventRx, TransportEventTx, TransportKind,
    TransportState,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

struct Inner<S> {
    protocol: u8,
    events: TransportEventTx,
    state: StdMutex<TransportState>,
    writable: AtomicBool,
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    deflate: Option<PerMessageDeflate>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl<S> Inner<S> {
    async fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event).await;
    }

    /// Move to `Closed`; returns false when the transport already was
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

/// WebSocket transport, server side.
pub struct WebSocketTransport<S> {
    inner: Arc<Inner<S>>,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an established WebSocket connection.
    pub fn new(
        stream: WebSocketStream<S>,
        protocol: u8,
        deflate: Option<PerMessageDeflate>,
    ) -> (Arc<Self>, TransportEventRx) {
        let (events, rx) = event_channel();
        let (sink, source) = stream.split();

        let inner = Arc::new(Inner {
            protocol,
            events,
            state: StdMutex::new(TransportState::Open),
            writable: AtomicBool::new(true),
            sink: Mutex::new(sink),
            deflate,
            pump: StdMutex::new(None),
        });

        let pump_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            read_pump(pump_inner, source).await;
        });
        *inner.pump.lock().expect("pump lock") = Some(handle);

        (Arc::new(Self { inner }), rx)
    }

    /// Whether the deflate threshold allows compressing this packet
    fn compression_allowed(&self, packet: &Packet) -> bool {
        match (&self.inner.deflate, &packet.data) {
            (Some(deflate), Some(data)) => {
                packet.options.compress && data.len() >= deflate.threshold
            }
            _ => false,
        }
    }
}

async fn read_pump<S>(inner: Arc<Inner<S>>, mut source: SplitStream<WebSocketStream<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(item) = source.next().await {
        match item {
            Ok(Message::Text(text)) => {
                dispatch_frame(&inner, WireFrame::Text(text)).await;
            }
            Ok(Message::Binary(data)) => {
                dispatch_frame(&inner, WireFrame::Binary(Bytes::from(data))).await;
            }
            Ok(Message::Close(_)) => {
                debug!("websocket close frame received");
                break;
            }
            // control frames are answered by the protocol layer
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "websocket read failed");
                inner
                    .emit(TransportEvent::Error(EngineError::transport(
                        "websocket error",
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

async fn dispatch_frame<S>(inner: &Arc<Inner<S>>, frame: WireFrame) {
    match parser::decode_packet(&frame, inner.protocol) {
        Ok(packet) => inner.emit(TransportEvent::Packet(packet)).await,
        Err(err) => inner.emit(TransportEvent::Error(err.into())).await,
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
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
            let mut sink = inner.sink.lock().await;
            for packet in &packets {
                if self.compression_allowed(packet) {
                    debug!(kind = packet.kind.as_str(), "compressing frame");
                }
                let frame = match parser::encode_packet(packet, inner.protocol, true) {
                    Ok(frame) => frame,
                    Err(err) => {
                        inner.emit(TransportEvent::Error(err.into())).await;
                        continue;
                    }
                };
                let message = match frame {
                    WireFrame::Text(text) => Message::Text(text),
                    WireFrame::Binary(data) => Message::Binary(data.to_vec()),
                };
                if let Err(err) = sink.feed(message).await {
                    inner
                        .emit(TransportEvent::Error(EngineError::transport(
                            "websocket error",
                            err,
                        )))
                        .await;
                    return;
                }
            }
            if let Err(err) = sink.flush().await {
                inner
                    .emit(TransportEvent::Error(EngineError::transport(
                        "websocket error",
                        err,
                    )))
                    .await;
                return;
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
            let mut sink = inner.sink.lock().await;
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
        }

        inner.emit(TransportEvent::Close).await;
    }

    async fn discard(&self) {
        if let Some(handle) = self.inner.pump.lock().expect("pump lock").take() {
            handle.abort();
        }
        self.inner.transition_closed();
        debug!("websocket transport discarded");
    }
}
