//! # Client Polling Transport
//!
//! HTTP long-polling from the dialing side: a poll GET loop pulls payloads
//! down, data POSTs push payloads up. At most one of each runs at a time;
//! `pause` waits for both to go quiet before reporting paused, which is how
//! the session quiesces this transport ahead of an upgrade handover.

use crate::client::Endpoint;
use crate::config::ClientOptions;
use crate::error::EngineError;
use crate::packet::{Packet, PacketType};
use crate::parser;
use crate::transport::{
    event_channel, Transport, TransportEvent, TransportEventRx, TransportEventTx, TransportKind,
    TransportState,
};
use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

struct Inner {
    endpoint: Endpoint,
    protocol: u8,
    force_base64: bool,
    timestamp_requests: bool,
    request_timeout: Option<Duration>,
    extra_headers: Vec<(String, String)>,
    client: Client<HttpConnector, Body>,
    events: TransportEventTx,
    state: StdMutex<TransportState>,
    writable: AtomicBool,
    sid: StdMutex<Option<String>>,
    poll_in_flight: AtomicBool,
    write_in_flight: AtomicBool,
    quiesce: Notify,
    /// Signaled when the session attaches the sid after the handshake;
    /// the poll loop holds off until then so a second sid-less request
    /// cannot race the handshake
    sid_set: Notify,
}

impl Inner {
    async fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event).await;
    }

    fn state(&self) -> TransportState {
        *self.state.lock().expect("state lock")
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock().expect("state lock") = state;
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

    fn request_url(&self) -> String {
        let sid = self.sid.lock().expect("sid lock").clone();
        self.endpoint.request_url(
            TransportKind::Polling,
            sid.as_deref(),
            self.force_base64,
            self.timestamp_requests,
        )
    }

    fn apply_headers(&self, mut builder: http::request::Builder) -> http::request::Builder {
        for (name, value) in &self.extra_headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => warn!(header = %name, "skipping invalid extra header"),
            }
        }
        builder
    }

    async fn execute(&self, request: Request<Body>) -> Result<bytes::Bytes, EngineError> {
        let future = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|err| EngineError::transport("poll request error", err))?;
            if !response.status().is_success() {
                return Err(EngineError::transport_msg(format!(
                    "unexpected status: {}",
                    response.status()
                )));
            }
            hyper::body::to_bytes(response.into_body())
                .await
                .map_err(|err| EngineError::transport("fetch read error", err))
        };

        match self.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, future)
                .await
                .map_err(|_| EngineError::transport_msg("request timeout"))?,
            None => future.await,
        }
    }
}

/// HTTP long-polling transport, client side.
pub struct ClientPollingTransport {
    inner: Arc<Inner>,
}

impl ClientPollingTransport {
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
                timestamp_requests: opts.timestamp_requests_for(TransportKind::Polling),
                request_timeout: opts.request_timeout_for(TransportKind::Polling),
                extra_headers: opts.extra_headers_for(TransportKind::Polling),
                client: Client::new(),
                events,
                state: StdMutex::new(TransportState::Opening),
                writable: AtomicBool::new(false),
                sid: StdMutex::new(sid),
                poll_in_flight: AtomicBool::new(false),
                write_in_flight: AtomicBool::new(false),
                quiesce: Notify::new(),
                sid_set: Notify::new(),
            }),
        });
        (transport, rx)
    }

    /// One poll cycle: GET, decode, dispatch. Returns false when polling
    /// must stop.
    async fn poll_once(inner: &Arc<Inner>) -> bool {
        let url = inner.request_url();
        debug!(url = %url, "polling");

        inner.poll_in_flight.store(true, Ordering::SeqCst);
        let builder = inner.apply_headers(Request::builder().method(Method::GET).uri(&url));
        let request = match builder.body(Body::empty()) {
            Ok(request) => request,
            Err(err) => {
                inner.poll_in_flight.store(false, Ordering::SeqCst);
                inner
                    .emit(TransportEvent::Error(EngineError::transport(
                        "poll request error",
                        err,
                    )))
                    .await;
                return false;
            }
        };

        let result = inner.execute(request).await;
        inner.poll_in_flight.store(false, Ordering::SeqCst);
        inner.quiesce.notify_waiters();

        let body = match result {
            Ok(body) => body,
            Err(err) => {
                if inner.state() == TransportState::Closed {
                    // the request was torn down by a local close
                    return false;
                }
                inner.emit(TransportEvent::Error(err)).await;
                if inner.transition_closed() {
                    inner.emit(TransportEvent::Close).await;
                }
                return false;
            }
        };

        let (packets, error) = parser::decode_payload(&body, inner.protocol);
        for packet in packets {
            if packet.kind == PacketType::Close {
                debug!("transport closed by the server");
                if inner.transition_closed() {
                    inner.emit(TransportEvent::Close).await;
                }
                return false;
            }
            inner.emit(TransportEvent::Packet(packet)).await;
        }
        if let Some(err) = error {
            inner.emit(TransportEvent::Error(err.into())).await;
        }

        true
    }
}

#[async_trait]
impl Transport for ClientPollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn state(&self) -> TransportState {
        self.inner.state()
    }

    fn writable(&self) -> bool {
        self.inner.writable.load(Ordering::SeqCst)
    }

    fn supports_binary(&self) -> bool {
        // the payload framing is textual; binary rides as base64
        false
    }

    fn supports_framing(&self) -> bool {
        false
    }

    fn set_sid(&self, sid: &str) {
        *self.inner.sid.lock().expect("sid lock") = Some(sid.to_string());
        self.inner.sid_set.notify_waiters();
    }

    async fn open(&self) {
        self.inner.set_state(TransportState::Open);
        self.inner.writable.store(true, Ordering::SeqCst);
        self.inner.emit(TransportEvent::Open).await;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                if inner.state() != TransportState::Open {
                    break;
                }
                let awaiting_handshake =
                    inner.sid.lock().expect("sid lock").is_none();
                if !ClientPollingTransport::poll_once(&inner).await {
                    break;
                }
                if awaiting_handshake {
                    // the handshake response is in flight to the session;
                    // do not issue another sid-less request
                    loop {
                        let notified = inner.sid_set.notified();
                        if inner.sid.lock().expect("sid lock").is_some()
                            || inner.state() != TransportState::Open
                        {
                            break;
                        }
                        notified.await;
                    }
                }
            }
            debug!("poll loop ended");
        });
    }

    async fn send(&self, packets: Vec<Packet>) {
        let inner = &self.inner;
        inner.writable.store(false, Ordering::SeqCst);
        inner.write_in_flight.store(true, Ordering::SeqCst);

        let result = async {
            let body = parser::encode_payload(&packets, inner.protocol, false)
                .map_err(EngineError::from)?;
            let url = inner.request_url();
            let builder = inner
                .apply_headers(Request::builder().method(Method::POST).uri(&url))
                .header(CONTENT_TYPE, "text/plain;charset=UTF-8");
            let request = builder
                .body(Body::from(body))
                .map_err(|err| EngineError::transport("data request error", err))?;
            inner.execute(request).await
        }
        .await;

        inner.write_in_flight.store(false, Ordering::SeqCst);
        inner.quiesce.notify_waiters();

        match result {
            Ok(_ack) => {
                inner.writable.store(true, Ordering::SeqCst);
                inner.emit(TransportEvent::Drain).await;
            }
            Err(err) => {
                if inner.state() != TransportState::Closed {
                    inner.emit(TransportEvent::Error(err)).await;
                    if inner.transition_closed() {
                        inner.emit(TransportEvent::Close).await;
                    }
                }
            }
        }
    }

    async fn pause(&self) {
        let inner = &self.inner;
        inner.set_state(TransportState::Pausing);
        debug!("pausing polling transport");

        loop {
            let notified = inner.quiesce.notified();
            if !inner.poll_in_flight.load(Ordering::SeqCst)
                && !inner.write_in_flight.load(Ordering::SeqCst)
            {
                break;
            }
            notified.await;
        }

        inner.set_state(TransportState::Paused);
        debug!("polling transport paused");
    }

    async fn close(&self) {
        let inner = &self.inner;
        let was_open = inner.state() == TransportState::Open;
        if !inner.transition_closed() {
            return;
        }

        if was_open {
            // best-effort orderly close notice
            if let Ok(body) =
                parser::encode_payload(&[Packet::close()], inner.protocol, false)
            {
                let url = inner.request_url();
                let builder = inner
                    .apply_headers(Request::builder().method(Method::POST).uri(&url))
                    .header(CONTENT_TYPE, "text/plain;charset=UTF-8");
                if let Ok(request) = builder.body(Body::from(body)) {
                    let _ = inner.execute(request).await;
                }
            }
        }

        inner.emit(TransportEvent::Close).await;
    }

    async fn discard(&self) {
        self.inner.transition_closed();
        debug!("polling transport discarded");
    }
}
