//! # Client WebSocket Transport
//!
//! Dials the endpoint's WebSocket URL and maps packets one-to-one onto
//! frames: textual packets ride text frames, binary packets ride binary
//! frames. Used both for direct connections and as the probe target of an
//! upgrade, in which case the session id travels in the query string.

use crate::client::Endpoint;
use crate::config::{ClientOptions, PerMessageDeflate};
use crate::error::EngineError;
use crate::packet::Packet;
use crate::parser::{self, WireFrame};
use crate::transport::{
    event_channel, Transport, TransportEvent, TransportEventRx, TransportEventTx, TransportKind,
    TransportState,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderName, HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct Inner {
    endpoint: Endpoint,
    protocol: u8,
    force_base64: bool,
    extra_headers: Vec<(String, String)>,
    subprotocols: Vec<String>,
    deflate: Option<PerMessageDeflate>,
    events: TransportEventTx,
    state: StdMutex<TransportState>,
    writable: AtomicBool,
    sid: StdMutex<Option<String>>,
    sink: Mutex<Option<WsSink>>,
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

/// WebSocket transport, client side.
pub struct ClientWebSocketTransport {
    inner: Arc<Inner>,
}

impl ClientWebSocketTransport {
    pub(crate) fn new(
        endpoint: Endpoint,
        opts: &ClientOptions,
        sid: Option<String>,
    ) -> (Arc<Self>, TransportEventRx) {
        let (events, rx) = event_channel();
        let transport = Arc::new(Self {
            inner: Arc::new(Inner {
                endpoint,
                protocol: opts.protocol,
                force_base64: opts.force_base64,
                extra_headers: opts.extra_headers_for(TransportKind::Websocket),
                subprotocols: opts.protocols.clone(),
                deflate: opts.per_message_deflate,
                events,
                state: StdMutex::new(TransportState::Opening),
                writable: AtomicBool::new(false),
                sid: StdMutex::new(sid),
                sink: Mutex::new(None),
                pump: StdMutex::new(None),
            }),
        });
        (transport, rx)
    }

    fn compression_allowed(&self, packet: &Packet) -> bool {
        match (&self.inner.deflate, &packet.data) {
            (Some(deflate), Some(data)) => {
                packet.options.compress && data.len() >= deflate.threshold
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Transport for ClientWebSocketTransport {
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
        !self.inner.force_base64
    }

    fn supports_framing(&self) -> bool {
        true
    }

    fn set_sid(&self, sid: &str) {
        *self.inner.sid.lock().expect("sid lock") = Some(sid.to_string());
    }

    async fn open(&self) {
        let inner = &self.inner;
        let url = {
            let sid = inner.sid.lock().expect("sid lock").clone();
            inner
                .endpoint
                .request_url(TransportKind::Websocket, sid.as_deref(), false, false)
        };
        debug!(url = %url, "dialing websocket");

        let mut request = match url.as_str().into_client_request() {
            Ok(request) => request,
            Err(err) => {
                inner
                    .emit(TransportEvent::Error(EngineError::transport(
                        "websocket error",
                        err,
                    )))
                    .await;
                if inner.transition_closed() {
                    inner.emit(TransportEvent::Close).await;
                }
                return;
            }
        };
        for (name, value) in &inner.extra_headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    request.headers_mut().insert(name, value);
                }
                _ => warn!(header = %name, "skipping invalid extra header"),
            }
        }
        if !inner.subprotocols.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&inner.subprotocols.join(", ")) {
                request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
            }
        }

        let stream = match connect_async(request).await {
            Ok((stream, _response)) => stream,
            Err(err) => {
                warn!(error = %err, "websocket dial failed");
                inner
                    .emit(TransportEvent::Error(EngineError::transport(
                        "websocket error",
                        err,
                    )))
                    .await;
                if inner.transition_closed() {
                    inner.emit(TransportEvent::Close).await;
                }
                return;
            }
        };

        let (sink, mut source) = stream.split();
        *inner.sink.lock().await = Some(sink);
        *inner.state.lock().expect("state lock") = TransportState::Open;
        inner.writable.store(true, Ordering::SeqCst);
        inner.emit(TransportEvent::Open).await;

        let pump_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            while let Some(item) = source.next().await {
                match item {
                    Ok(Message::Text(text)) => {
                        dispatch_frame(&pump_inner, WireFrame::Text(text)).await;
                    }
                    Ok(Message::Binary(data)) => {
                        dispatch_frame(&pump_inner, WireFrame::Binary(Bytes::from(data))).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        pump_inner
                            .emit(TransportEvent::Error(EngineError::transport(
                                "websocket error",
                                err,
                            )))
                            .await;
                        break;
                    }
                }
            }
            if pump_inner.transition_closed() {
                pump_inner.emit(TransportEvent::Close).await;
            }
        });
        *inner.pump.lock().expect("pump lock") = Some(handle);
    }

    async fn send(&self, packets: Vec<Packet>) {
        let inner = &self.inner;
        inner.writable.store(false, Ordering::SeqCst);

        {
            let mut sink_slot = inner.sink.lock().await;
            let Some(sink) = sink_slot.as_mut() else {
                warn!("send on a websocket that is not open");
                return;
            };

            for packet in &packets {
                if self.compression_allowed(packet) {
                    debug!(kind = packet.kind.as_str(), "compressing frame");
                }
                let frame =
                    match parser::encode_packet(packet, inner.protocol, !inner.force_base64) {
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
            let mut sink_slot = inner.sink.lock().await;
            if let Some(sink) = sink_slot.as_mut() {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
            }
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

async fn dispatch_frame(inner: &Arc<Inner>, frame: WireFrame) {
    match parser::decode_packet(&frame, inner.protocol) {
        Ok(packet) => inner.emit(TransportEvent::Packet(packet)).await,
        Err(err) => inner.emit(TransportEvent::Error(err.into())).await,
    }
}
