//! # Server Session
//!
//! One [`Socket`] per logical connection. The socket owns its transport,
//! consumes the transport's event channel, runs the heartbeat appropriate
//! for the negotiated wire revision, buffers outbound packets, and
//! orchestrates the server half of the upgrade protocol.
//!
//! All mutation goes through the socket: transports only report events.
//! Swapping transports bumps a generation counter so that events still
//! queued from a discarded transport are dropped instead of being applied
//! to session state.

use crate::config::ServerOptions;
use crate::error::EngineError;
use crate::packet::{Packet, PacketData, PacketOptions, PacketType};
use crate::parser::PROTOCOL_V3;
use crate::server::transport::polling::estimated_payload_size;
use crate::server::SessionRegistry;
use crate::session::{CloseReason, Handshake, ReadyState, SendCallback, SocketEvent};
use crate::transport::{Transport, TransportEvent, TransportEventRx, TransportKind};
use crate::util::{RefreshableTimer, Timer};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outcome of a probe supervision loop
enum ProbeOutcome {
    Commit,
    Abort,
    Timeout,
}

struct MutableState {
    ready_state: ReadyState,
    upgrading: bool,
    upgraded: bool,
    /// A user close is waiting for the buffer to drain or for an upgrade
    /// to settle
    close_pending: bool,
    write_buffer: VecDeque<(Packet, Option<SendCallback>)>,
    /// Callbacks of the batch currently with the transport; fired on drain
    pending_callbacks: Vec<SendCallback>,
}

struct HeartbeatTimers {
    /// v4: schedules the next server ping
    ping_interval: Option<Timer>,
    /// v4: window for the client's pong
    pong_timeout: Option<Timer>,
    /// v3: rolling window covering the client's ping cadence
    check: Option<RefreshableTimer>,
}

struct SocketInner {
    sid: String,
    protocol: u8,
    remote_addr: Option<SocketAddr>,
    opts: ServerOptions,
    state: StdMutex<MutableState>,
    transport: StdMutex<Option<Arc<dyn Transport>>>,
    /// Incremented on every transport attach/detach; stale pump events
    /// compare against it and are dropped
    generation: AtomicU64,
    flush_lock: tokio::sync::Mutex<()>,
    event_tx: mpsc::Sender<SocketEvent>,
    event_rx: StdMutex<Option<mpsc::Receiver<SocketEvent>>>,
    heartbeat: StdMutex<HeartbeatTimers>,
    registry: SessionRegistry,
}

/// A server-side session handle. Cheap to clone; all clones refer to the
/// same session.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("sid", &self.inner.sid)
            .field("ready_state", &self.ready_state().as_str())
            .finish()
    }
}

impl Socket {
    /// Create the session around its first transport, register it, send
    /// the handshake and start the heartbeat.
    pub(crate) async fn open(
        sid: String,
        protocol: u8,
        transport: Arc<dyn Transport>,
        events: TransportEventRx,
        opts: ServerOptions,
        registry: SessionRegistry,
        remote_addr: Option<SocketAddr>,
    ) -> Socket {
        let (event_tx, event_rx) = mpsc::channel(crate::defaults::EVENT_CHANNEL_CAPACITY);
        let kind = transport.kind();

        let socket = Socket {
            inner: Arc::new(SocketInner {
                sid: sid.clone(),
                protocol,
                remote_addr,
                opts,
                state: StdMutex::new(MutableState {
                    ready_state: ReadyState::Open,
                    upgrading: false,
                    upgraded: false,
                    close_pending: false,
                    write_buffer: VecDeque::new(),
                    pending_callbacks: Vec::new(),
                }),
                transport: StdMutex::new(None),
                generation: AtomicU64::new(0),
                flush_lock: tokio::sync::Mutex::new(()),
                event_tx,
                event_rx: StdMutex::new(Some(event_rx)),
                heartbeat: StdMutex::new(HeartbeatTimers {
                    ping_interval: None,
                    pong_timeout: None,
                    check: None,
                }),
                registry,
            }),
        };

        socket.attach_transport(transport, events);
        debug!(sid = %sid, transport = %kind, "session opened");

        let handshake = Handshake {
            sid: sid.clone(),
            upgrades: socket.inner.opts.upgrades_for(kind),
            ping_interval: socket.inner.opts.ping_interval.as_millis() as u64,
            ping_timeout: socket.inner.opts.ping_timeout.as_millis() as u64,
            max_payload: socket.inner.opts.max_payload as u64,
        };
        let handshake_json =
            serde_json::to_string(&handshake).expect("handshake serialization");
        socket
            .send_packet(Packet::open(handshake_json), None)
            .await;

        if let Some(initial) = socket.inner.opts.initial_packet.clone() {
            socket
                .send_packet(Packet::message(initial), None)
                .await;
        }

        socket.start_heartbeat();
        socket
    }

    /// Unique session identifier
    pub fn sid(&self) -> &str {
        &self.inner.sid
    }

    /// Negotiated wire revision
    pub fn protocol(&self) -> u8 {
        self.inner.protocol
    }

    /// Peer address, when known
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Current lifecycle state
    pub fn ready_state(&self) -> ReadyState {
        self.inner.state.lock().expect("state lock").ready_state
    }

    /// Name of the currently active transport
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.inner
            .transport
            .lock()
            .expect("transport lock")
            .as_ref()
            .map(|t| t.kind())
    }

    /// True once the session has committed an upgrade
    pub fn upgraded(&self) -> bool {
        self.inner.state.lock().expect("state lock").upgraded
    }

    /// Take the session event stream. Yields `None` after the first call.
    pub fn events(&self) -> Option<mpsc::Receiver<SocketEvent>> {
        self.inner.event_rx.lock().expect("event rx lock").take()
    }

    /// Queue an application message for delivery
    pub async fn send(&self, data: impl Into<PacketData>) {
        self.send_with(data, PacketOptions::default(), None).await;
    }

    /// Queue an application message with options and an optional local
    /// send acknowledgement, invoked once the packet reaches the transport
    pub async fn send_with(
        &self,
        data: impl Into<PacketData>,
        options: PacketOptions,
        callback: Option<SendCallback>,
    ) {
        let mut packet = Packet::message(data);
        packet.options = options;
        self.send_packet(packet, callback).await;
    }

    /// Orderly close initiated by the application.
    ///
    /// Pending writes drain first; an in-flight upgrade settles first.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().expect("state lock");
            match state.ready_state {
                ReadyState::Open => {}
                _ => return,
            }
            state.ready_state = ReadyState::Closing;

            if state.upgrading || !state.write_buffer.is_empty() {
                state.close_pending = true;
                return;
            }
        }
        self.close_transport().await;
    }

    // ---- internal machinery ----

    async fn emit(&self, event: SocketEvent) {
        let _ = self.inner.event_tx.send(event).await;
    }

    pub(crate) fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner
            .transport
            .lock()
            .expect("transport lock")
            .clone()
    }

    /// Install a transport and start consuming its events
    fn attach_transport(&self, transport: Arc<dyn Transport>, events: TransportEventRx) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.transport.lock().expect("transport lock") = Some(transport);
        self.spawn_pump(generation, events);
    }

    /// Detach the current transport; its remaining events are dropped
    fn detach_transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.transport.lock().expect("transport lock").take()
    }

    fn spawn_pump(&self, generation: u64, mut events: TransportEventRx) {
        let socket = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if socket.inner.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                socket.handle_transport_event(event).await;
            }
        });
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Ready => self.flush().await,
            TransportEvent::Drain => self.on_drain().await,
            TransportEvent::Packet(packet) => self.on_packet(packet).await,
            TransportEvent::Error(err) => self.on_transport_error(err).await,
            TransportEvent::Close => {
                self.on_close(CloseReason::TransportClose, None).await;
            }
            TransportEvent::Open => {}
        }
    }

    async fn on_packet(&self, packet: Packet) {
        if self.ready_state() != ReadyState::Open && self.ready_state() != ReadyState::Closing {
            debug!(sid = %self.inner.sid, "packet received on non-open session");
            return;
        }

        match packet.kind {
            PacketType::Ping if self.inner.protocol == PROTOCOL_V3 => {
                debug!(sid = %self.inner.sid, "heartbeat ping");
                self.refresh_v3_heartbeat();
                self.send_packet(Packet::pong(), None).await;
                self.emit(SocketEvent::Heartbeat).await;
            }
            PacketType::Pong if self.inner.protocol != PROTOCOL_V3 => {
                debug!(sid = %self.inner.sid, "heartbeat pong");
                {
                    let mut hb = self.inner.heartbeat.lock().expect("heartbeat lock");
                    if let Some(timer) = hb.pong_timeout.take() {
                        timer.cancel();
                    }
                }
                self.schedule_ping();
                self.emit(SocketEvent::Heartbeat).await;
            }
            PacketType::Message => {
                let data = packet
                    .data
                    .unwrap_or_else(|| PacketData::Text(String::new()));
                self.emit(SocketEvent::Message(data)).await;
            }
            PacketType::Error => {
                self.on_close(CloseReason::ParseError, None).await;
            }
            PacketType::Close => {
                self.on_close(CloseReason::TransportClose, None).await;
            }
            // stray heartbeat or upgrade control packets are ignored
            _ => {}
        }
    }

    async fn on_transport_error(&self, err: EngineError) {
        warn!(sid = %self.inner.sid, error = %err, "transport error");
        let reason = match &err {
            EngineError::Parse(_) => CloseReason::ParseError,
            _ => CloseReason::TransportError,
        };
        let description = err.description();
        if let Some(transport) = self.detach_transport() {
            transport.close().await;
        }
        self.on_close(reason, Some(description)).await;
    }

    async fn on_drain(&self) {
        let callbacks = {
            let mut state = self.inner.state.lock().expect("state lock");
            std::mem::take(&mut state.pending_callbacks)
        };
        for callback in callbacks {
            callback();
        }
        self.emit(SocketEvent::Drain).await;

        let should_close = {
            let state = self.inner.state.lock().expect("state lock");
            state.close_pending
                && !state.upgrading
                && state.write_buffer.is_empty()
                && state.ready_state == ReadyState::Closing
        };
        if should_close {
            self.close_transport().await;
        } else {
            // more packets may have queued while the batch was in flight
            self.flush().await;
        }
    }

    async fn send_packet(&self, packet: Packet, callback: Option<SendCallback>) {
        {
            let mut state = self.inner.state.lock().expect("state lock");
            match state.ready_state {
                ReadyState::Open => {}
                // the closing drain only flushes what was already queued
                _ => return,
            }
            state.write_buffer.push_back((packet, callback));
        }
        self.flush().await;
    }

    /// Hand a contiguous prefix of the write buffer to the transport.
    ///
    /// Critical section: runs under the per-session flush lock, and only
    /// when the session is not closed, the transport is writable and no
    /// upgrade handover is in progress. Polling batches are bounded by the
    /// advertised `maxPayload`.
    pub(crate) async fn flush(&self) {
        let _guard = self.inner.flush_lock.lock().await;

        let Some(transport) = self.current_transport() else {
            return;
        };

        let batch: Vec<Packet> = {
            let mut state = self.inner.state.lock().expect("state lock");
            if state.ready_state == ReadyState::Closed
                || state.upgrading
                || state.write_buffer.is_empty()
                || !transport.writable()
            {
                return;
            }

            let count = if transport.supports_framing() {
                state.write_buffer.len()
            } else {
                let mut size = 0usize;
                let mut count = 0usize;
                for (packet, _) in state.write_buffer.iter() {
                    let cost = packet.encoded_size_estimate() + usize::from(count > 0);
                    if count > 0 && size + cost > self.inner.opts.max_payload {
                        break;
                    }
                    size += cost;
                    count += 1;
                }
                count
            };

            let mut batch = Vec::with_capacity(count);
            for _ in 0..count {
                let (packet, callback) = state.write_buffer.pop_front().expect("buffer entry");
                if let Some(callback) = callback {
                    state.pending_callbacks.push(callback);
                }
                batch.push(packet);
            }
            batch
        };

        debug!(
            sid = %self.inner.sid,
            count = batch.len(),
            bytes = estimated_payload_size(&batch),
            "flushing write buffer"
        );
        self.emit(SocketEvent::Flush).await;
        transport.send(batch).await;
    }

    // ---- heartbeat ----

    fn start_heartbeat(&self) {
        if self.inner.protocol == PROTOCOL_V3 {
            // v3 reverses the direction: the client pings, the server
            // answers and watches a rolling window
            let window = self.inner.opts.ping_interval + self.inner.opts.ping_timeout;
            let socket = self.clone();
            let timer = RefreshableTimer::start(window, async move {
                socket.on_close(CloseReason::PingTimeout, None).await;
            });
            self.inner.heartbeat.lock().expect("heartbeat lock").check = Some(timer);
        } else {
            self.schedule_ping();
        }
    }

    fn refresh_v3_heartbeat(&self) {
        let window = self.inner.opts.ping_interval + self.inner.opts.ping_timeout;
        let hb = self.inner.heartbeat.lock().expect("heartbeat lock");
        if let Some(check) = hb.check.as_ref() {
            check.reset(window);
        }
    }

    /// v4: arm the next ping; each ping arms the pong window
    fn schedule_ping(&self) {
        let socket = self.clone();
        let interval = self.inner.opts.ping_interval;
        let timer = Timer::after(interval, async move {
            socket.send_ping().await;
        });
        self.inner
            .heartbeat
            .lock()
            .expect("heartbeat lock")
            .ping_interval = Some(timer);
    }

    async fn send_ping(&self) {
        if self.ready_state() != ReadyState::Open {
            return;
        }
        let socket = self.clone();
        let timeout = self.inner.opts.ping_timeout;
        {
            let mut hb = self.inner.heartbeat.lock().expect("heartbeat lock");
            hb.pong_timeout = Some(Timer::after(timeout, async move {
                debug!(sid = %socket.inner.sid, "heartbeat window elapsed");
                socket.on_close(CloseReason::PingTimeout, None).await;
            }));
        }
        self.send_packet(Packet::ping(), None).await;
    }

    fn cancel_heartbeat(&self) {
        let mut hb = self.inner.heartbeat.lock().expect("heartbeat lock");
        if let Some(timer) = hb.ping_interval.take() {
            timer.cancel();
        }
        if let Some(timer) = hb.pong_timeout.take() {
            timer.cancel();
        }
        if let Some(timer) = hb.check.take() {
            timer.cancel();
        }
    }

    // ---- upgrade ----

    /// Supervise an upgrade probe on a candidate transport attached to this
    /// session. Answers the probe ping, commits on the `upgrade` packet and
    /// discards the previous transport.
    pub(crate) fn maybe_upgrade(
        &self,
        probe: Arc<dyn Transport>,
        mut probe_events: TransportEventRx,
    ) {
        let socket = self.clone();
        let upgrade_timeout = self.inner.opts.upgrade_timeout;
        tokio::spawn(async move {
            debug!(
                sid = %socket.inner.sid,
                candidate = %probe.kind(),
                "supervising upgrade probe"
            );

            let deadline = tokio::time::sleep(upgrade_timeout);
            tokio::pin!(deadline);
            // while the client pauses its polling transport, keep
            // completing poll cycles so a parked poll cannot stall the
            // handover
            let mut poll_check = tokio::time::interval(std::time::Duration::from_millis(100));

            let outcome = loop {
                tokio::select! {
                    _ = &mut deadline => break ProbeOutcome::Timeout,
                    _ = poll_check.tick() => {
                        socket.complete_poll_cycle_if_upgrading().await;
                    }
                    event = probe_events.recv() => match event {
                        Some(TransportEvent::Packet(packet)) => {
                            match packet.kind {
                                PacketType::Ping if packet.has_text("probe") => {
                                    probe.send(vec![Packet::pong_probe()]).await;
                                    socket.begin_upgrade(probe.kind()).await;
                                }
                                PacketType::Upgrade => {
                                    if socket.ready_state() == ReadyState::Closed {
                                        break ProbeOutcome::Abort;
                                    }
                                    break ProbeOutcome::Commit;
                                }
                                _ => {
                                    warn!(
                                        sid = %socket.inner.sid,
                                        kind = packet.kind.as_str(),
                                        "unexpected packet during probe"
                                    );
                                    break ProbeOutcome::Abort;
                                }
                            }
                        }
                        Some(TransportEvent::Error(_)) | Some(TransportEvent::Close) | None => {
                            break ProbeOutcome::Abort;
                        }
                        Some(_) => {}
                    }
                }
            };

            match outcome {
                ProbeOutcome::Commit => {
                    socket.commit_upgrade(probe, probe_events).await;
                }
                ProbeOutcome::Abort | ProbeOutcome::Timeout => {
                    debug!(sid = %socket.inner.sid, "upgrade probe abandoned");
                    {
                        let mut state = socket.inner.state.lock().expect("state lock");
                        state.upgrading = false;
                    }
                    probe.close().await;
                    // a close may have been parked behind the upgrade
                    let resume_close = {
                        let state = socket.inner.state.lock().expect("state lock");
                        state.close_pending
                            && state.ready_state == ReadyState::Closing
                            && state.write_buffer.is_empty()
                    };
                    if resume_close {
                        socket.close_transport().await;
                    }
                }
            }
        });
    }

    /// While a handover is in progress, a freshly parked poll must not sit
    /// on the old transport; answer it with a noop so the client can pause
    async fn complete_poll_cycle_if_upgrading(&self) {
        let upgrading = self.inner.state.lock().expect("state lock").upgrading;
        if !upgrading {
            return;
        }
        if let Some(current) = self.current_transport() {
            if current.kind() == TransportKind::Polling && current.writable() {
                current.send(vec![Packet::noop()]).await;
            }
        }
    }

    /// The probe ping arrived: announce the handover and quiesce polling
    async fn begin_upgrade(&self, candidate: TransportKind) {
        {
            let mut state = self.inner.state.lock().expect("state lock");
            state.upgrading = true;
        }
        self.emit(SocketEvent::Upgrading(candidate)).await;

        // force a polling cycle so the parked poll does not sit on the old
        // transport for a full heartbeat interval
        if let Some(current) = self.current_transport() {
            if current.kind() == TransportKind::Polling && current.writable() {
                debug!(sid = %self.inner.sid, "completing poll cycle for upgrade");
                current.send(vec![Packet::noop()]).await;
            }
        }
    }

    /// The `upgrade` packet arrived: the probe transport becomes
    /// authoritative, the previous one is discarded outright
    async fn commit_upgrade(&self, probe: Arc<dyn Transport>, events: TransportEventRx) {
        let old = self.detach_transport();
        {
            let mut state = self.inner.state.lock().expect("state lock");
            state.upgrading = false;
            state.upgraded = true;
        }
        let kind = probe.kind();
        self.attach_transport(probe, events);

        if let Some(old) = old {
            old.discard().await;
        }

        debug!(sid = %self.inner.sid, transport = %kind, "upgrade committed");
        self.emit(SocketEvent::Upgrade(kind)).await;
        self.flush().await;

        let resume_close = {
            let state = self.inner.state.lock().expect("state lock");
            state.ready_state == ReadyState::Closing && state.close_pending
        };
        if resume_close {
            self.close_transport().await;
        }
    }

    // ---- close ----

    async fn close_transport(&self) {
        if let Some(transport) = self.detach_transport() {
            transport.close().await;
        }
        self.on_close(CloseReason::ForcedClose, None).await;
    }

    /// Terminal transition. Idempotent: the first reason wins.
    pub(crate) async fn on_close(&self, reason: CloseReason, description: Option<String>) {
        {
            let mut state = self.inner.state.lock().expect("state lock");
            if state.ready_state == ReadyState::Closed {
                return;
            }
            state.ready_state = ReadyState::Closed;
        }

        debug!(sid = %self.inner.sid, reason = reason.as_str(), "session closed");
        self.cancel_heartbeat();
        let transport = self.detach_transport();
        if let Some(transport) = transport {
            transport.discard().await;
        }
        self.inner.registry.remove(&self.inner.sid).await;

        self.emit(SocketEvent::Close {
            reason,
            description,
        })
        .await;

        let mut state = self.inner.state.lock().expect("state lock");
        state.write_buffer.clear();
        state.pending_callbacks.clear();
    }
}
