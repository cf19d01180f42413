//! # Server Polling Transport
//!
//! HTTP long-polling from the accepting side. The transport interlocks two
//! disjoint half-connections: a poll GET carrying server → client payloads
//! and a data POST carrying client → server payloads. At most one of each
//! may be in flight per session; overlap is a protocol violation that
//! closes the session.
//!
//! A poll GET parks until the session flushes (or until the transport has
//! to complete the cycle itself with a `noop` or `close` packet). Payload
//! sizing against the advertised `maxPayload` happens in the session's
//! flush; this transport writes whatever batch it is handed in one body.

use crate::error::{EngineError, ProtocolErrorKind};
use crate::packet::{Packet, PacketType};
use crate::parser;
use crate::transport::{
    event_channel, RawRequest, RawResponse, Transport, TransportEvent, TransportEventRx,
    TransportEventTx, TransportKind, TransportState,
};
use crate::util::Timer;
use async_trait::async_trait;
use http::Method;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, warn};

/// Shared request-interlock state.
struct PollShared {
    /// Sender completing the parked poll GET, when one is in flight
    pending_get: Option<oneshot::Sender<RawResponse>>,
    /// A data POST is currently being processed
    post_in_flight: bool,
    /// An orderly close was requested while no poll was parked; the next
    /// poll cycle delivers the `close` packet
    should_close: bool,
}

struct Inner {
    protocol: u8,
    supports_binary: bool,
    max_http_buffer_size: usize,
    close_timeout: Duration,
    events: TransportEventTx,
    state: StdMutex<TransportState>,
    writable: AtomicBool,
    poll: Mutex<PollShared>,
    /// Signaled whenever a half-connection completes; `pause` waits on it
    quiesce: Notify,
    close_timer: StdMutex<Option<Timer>>,
}

impl Inner {
    fn set_state(&self, state: TransportState) {
        *self.state.lock().expect("state lock") = state;
    }

    async fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event).await;
    }

    /// Encode a payload body for the poll response
    fn encode_body(&self, packets: &[Packet]) -> Result<(bytes::Bytes, bool), EngineError> {
        let body = parser::encode_payload(packets, self.protocol, self.supports_binary)?;
        let binary = self.protocol == parser::PROTOCOL_V3 && self.supports_binary;
        Ok((body, binary))
    }
}

/// HTTP long-polling transport, server side.
pub struct PollingTransport {
    inner: Arc<Inner>,
}

impl PollingTransport {
    /// Create the transport for one session.
    ///
    /// `supports_binary` is false when the peer asked for base64 wrapping
    /// via `b64=1`; the v4 payload form is textual either way.
    pub fn new(
        protocol: u8,
        supports_binary: bool,
        max_http_buffer_size: usize,
        close_timeout: Duration,
    ) -> (Arc<Self>, TransportEventRx) {
        let (events, rx) = event_channel();
        let transport = Arc::new(Self {
            inner: Arc::new(Inner {
                protocol,
                supports_binary,
                max_http_buffer_size,
                close_timeout,
                events,
                state: StdMutex::new(TransportState::Open),
                writable: AtomicBool::new(false),
                poll: Mutex::new(PollShared {
                    pending_get: None,
                    post_in_flight: false,
                    should_close: false,
                }),
                quiesce: Notify::new(),
                close_timer: StdMutex::new(None),
            }),
        });
        (transport, rx)
    }

    /// Handle the next poll GET for this session.
    async fn on_poll_request(&self) -> RawResponse {
        let inner = &self.inner;
        let receiver = {
            let mut poll = inner.poll.lock().await;

            if poll.pending_get.is_some() {
                drop(poll);
                warn!("overlapping poll request");
                inner
                    .emit(TransportEvent::Error(EngineError::transport_msg(
                        "overlap from client",
                    )))
                    .await;
                return RawResponse::protocol_error(ProtocolErrorKind::BadRequest);
            }

            if poll.should_close {
                poll.should_close = false;
                drop(poll);
                if let Some(timer) = inner.close_timer.lock().expect("timer lock").take() {
                    timer.cancel();
                }
                debug!("completing deferred close over poll cycle");
                let (body, binary) = match inner.encode_body(&[Packet::close()]) {
                    Ok(encoded) => encoded,
                    Err(_) => (bytes::Bytes::new(), false),
                };
                inner.set_state(TransportState::Closed);
                inner.emit(TransportEvent::Close).await;
                return RawResponse::payload(body, binary);
            }

            let (tx, rx) = oneshot::channel();
            poll.pending_get = Some(tx);
            rx
        };

        inner.writable.store(true, Ordering::SeqCst);
        inner.emit(TransportEvent::Ready).await;

        match receiver.await {
            Ok(response) => response,
            // the sender side vanished without answering (discarded
            // transport); complete the cycle with a noop
            Err(_) => {
                let (body, binary) = self
                    .inner
                    .encode_body(&[Packet::noop()])
                    .unwrap_or((bytes::Bytes::new(), false));
                RawResponse::payload(body, binary)
            }
        }
    }

    /// Handle a data POST for this session.
    async fn on_data_request(&self, request: RawRequest) -> RawResponse {
        let inner = &self.inner;
        {
            let mut poll = inner.poll.lock().await;
            if poll.post_in_flight {
                drop(poll);
                warn!("overlapping data request");
                inner
                    .emit(TransportEvent::Error(EngineError::transport_msg(
                        "data request overlap from client",
                    )))
                    .await;
                return RawResponse::protocol_error(ProtocolErrorKind::BadRequest);
            }
            poll.post_in_flight = true;
        }

        let response = self.process_data(&request).await;

        {
            let mut poll = inner.poll.lock().await;
            poll.post_in_flight = false;
        }
        inner.quiesce.notify_waiters();
        response
    }

    async fn process_data(&self, request: &RawRequest) -> RawResponse {
        let inner = &self.inner;

        if request.body.len() > inner.max_http_buffer_size {
            inner
                .emit(TransportEvent::Error(EngineError::transport_msg(
                    "payload too large",
                )))
                .await;
            return RawResponse::protocol_error(ProtocolErrorKind::BadRequest);
        }

        let (packets, error) = parser::decode_payload(&request.body, inner.protocol);
        debug!(count = packets.len(), "decoded data request payload");
        for packet in packets {
            if packet.kind == PacketType::Close {
                debug!("close packet received over data request");
                inner.set_state(TransportState::Closed);
                inner.emit(TransportEvent::Close).await;
                return RawResponse::post_ack();
            }
            inner.emit(TransportEvent::Packet(packet)).await;
        }
        if let Some(err) = error {
            inner.emit(TransportEvent::Error(err.into())).await;
            return RawResponse::protocol_error(ProtocolErrorKind::BadRequest);
        }

        RawResponse::post_ack()
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn state(&self) -> TransportState {
        *self.inner.state.lock().expect("state lock")
    }

    fn writable(&self) -> bool {
        self.inner.writable.load(Ordering::SeqCst)
    }

    fn supports_binary(&self) -> bool {
        self.inner.supports_binary
    }

    fn supports_framing(&self) -> bool {
        false
    }

    async fn send(&self, packets: Vec<Packet>) {
        let inner = &self.inner;
        inner.writable.store(false, Ordering::SeqCst);

        let sender = {
            let mut poll = inner.poll.lock().await;
            poll.pending_get.take()
        };

        let Some(sender) = sender else {
            warn!("send without a parked poll request");
            return;
        };

        match inner.encode_body(&packets) {
            Ok((body, binary)) => {
                debug!(bytes = body.len(), "completing poll cycle");
                let _ = sender.send(RawResponse::payload(body, binary));
                inner.quiesce.notify_waiters();
                inner.emit(TransportEvent::Drain).await;
            }
            Err(err) => {
                inner.emit(TransportEvent::Error(err)).await;
            }
        }
    }

    async fn pause(&self) {
        let inner = &self.inner;
        inner.set_state(TransportState::Pausing);
        debug!("pausing polling transport");

        loop {
            let notified = inner.quiesce.notified();
            {
                let poll = inner.poll.lock().await;
                if poll.pending_get.is_none() && !poll.post_in_flight {
                    break;
                }
            }
            notified.await;
        }

        inner.set_state(TransportState::Paused);
        debug!("polling transport paused");
    }

    async fn close(&self) {
        let inner = &self.inner;
        if self.state() == TransportState::Closed {
            return;
        }

        let sender = {
            let mut poll = inner.poll.lock().await;
            poll.pending_get.take()
        };

        if let Some(sender) = sender {
            debug!("closing polling transport over parked poll");
            let (body, binary) = inner
                .encode_body(&[Packet::close()])
                .unwrap_or((bytes::Bytes::new(), false));
            let _ = sender.send(RawResponse::payload(body, binary));
            inner.set_state(TransportState::Closed);
            inner.emit(TransportEvent::Close).await;
        } else {
            debug!("deferring close to the next poll cycle");
            {
                let mut poll = inner.poll.lock().await;
                poll.should_close = true;
            }
            let deferred = Arc::clone(inner);
            let timer = Timer::after(inner.close_timeout, async move {
                let pending = {
                    let mut poll = deferred.poll.lock().await;
                    poll.should_close = false;
                    poll.pending_get.take()
                };
                drop(pending);
                warn!("polling close timed out; force-closing");
                deferred.set_state(TransportState::Closed);
                deferred.emit(TransportEvent::Close).await;
            });
            *inner.close_timer.lock().expect("timer lock") = Some(timer);
        }
    }

    async fn discard(&self) {
        let inner = &self.inner;
        if let Some(timer) = inner.close_timer.lock().expect("timer lock").take() {
            timer.cancel();
        }

        let sender = {
            let mut poll = inner.poll.lock().await;
            poll.should_close = false;
            poll.pending_get.take()
        };
        if let Some(sender) = sender {
            // complete the client's cycle without waking the session
            let (body, binary) = inner
                .encode_body(&[Packet::noop()])
                .unwrap_or((bytes::Bytes::new(), false));
            let _ = sender.send(RawResponse::payload(body, binary));
        }
        inner.set_state(TransportState::Closed);
        debug!("polling transport discarded");
    }

    async fn handle_request(&self, request: RawRequest) -> RawResponse {
        if self.state() == TransportState::Closed && request.method == Method::GET {
            // a poll may still arrive while the deferred close is pending;
            // answer it with an empty cycle
            let (body, binary) = self
                .inner
                .encode_body(&[Packet::noop()])
                .unwrap_or((bytes::Bytes::new(), false));
            return RawResponse::payload(body, binary);
        }

        match request.method {
            Method::GET => self.on_poll_request().await,
            Method::POST => self.on_data_request(request).await,
            _ => RawResponse::protocol_error(ProtocolErrorKind::BadRequest),
        }
    }
}

/// Estimate the encoded payload cost of a packet batch, mirroring the
/// session's flush budgeting.
pub fn estimated_payload_size(packets: &[Packet]) -> usize {
    let separators = packets.len().saturating_sub(1);
    packets
        .iter()
        .map(Packet::encoded_size_estimate)
        .sum::<usize>()
        + separators
}
