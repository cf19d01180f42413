//! # Client Session
//!
//! The dialing side of the session state machine. A [`ClientSocket`] stays
//! in `opening` until the server's `open` packet delivers the handshake,
//! then answers heartbeats, buffers and flushes outbound messages, and
//! probes the advertised upgrade transports, giving WebTransport a short
//! head start over the other candidates.
//!
//! Transport swaps follow the same generation discipline as the server
//! side: events queued from a discarded transport never reach session
//! state.

use crate::client::transport::{
    ClientPollingTransport, ClientWebSocketTransport, ClientWebTransport, TcpDialer,
    WebTransportDialer,
};
use crate::client::Endpoint;
use crate::config::ClientOptions;
use crate::error::{EngineError, Result};
use crate::packet::{Packet, PacketData, PacketOptions, PacketType};
use crate::parser::PROTOCOL_V3;
use crate::session::{CloseReason, Handshake, ReadyState, SendCallback, SocketEvent};
use crate::transport::{Transport, TransportEvent, TransportEventRx, TransportKind};
use crate::util::{RefreshableTimer, Timer};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

enum ProbeOutcome {
    Commit,
    Fail(String),
}

struct MutableState {
    ready_state: ReadyState,
    sid: Option<String>,
    handshake: Option<Handshake>,
    upgrading: bool,
    upgraded: bool,
    close_pending: bool,
    write_buffer: VecDeque<(Packet, Option<SendCallback>)>,
    pending_callbacks: Vec<SendCallback>,
    /// Transports left to try while `opening`
    remaining_transports: VecDeque<TransportKind>,
}

struct HeartbeatTimers {
    /// v4: rolling window refreshed by server traffic
    watchdog: Option<RefreshableTimer>,
    /// v3: schedules the next client ping
    ping_interval: Option<Timer>,
    /// v3: window for the server's pong
    pong_timeout: Option<Timer>,
}

struct Inner {
    opts: ClientOptions,
    endpoint: Endpoint,
    state: StdMutex<MutableState>,
    transport: StdMutex<Option<Arc<dyn Transport>>>,
    generation: AtomicU64,
    flush_lock: tokio::sync::Mutex<()>,
    event_tx: mpsc::Sender<SocketEvent>,
    event_rx: StdMutex<Option<mpsc::Receiver<SocketEvent>>>,
    heartbeat: StdMutex<HeartbeatTimers>,
    /// Notified when an upgrade commits or the session closes; pending
    /// probes abort on it
    probe_cancel: Notify,
}

/// A client-side session handle. Cheap to clone; all clones refer to the
/// same session.
#[derive(Clone)]
pub struct ClientSocket {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ClientSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSocket")
            .field("sid", &self.sid())
            .field("ready_state", &self.ready_state().as_str())
            .finish()
    }
}

impl ClientSocket {
    /// Open a session against `uri`. The socket starts in `opening`; the
    /// `Open` event marks handshake completion.
    pub async fn connect(uri: &str, opts: ClientOptions) -> Result<ClientSocket> {
        let endpoint = Endpoint::parse(uri, &opts)?;

        let mut transports = opts.transports.clone();
        if transports.is_empty() {
            return Err(EngineError::transport_msg("no transports configured"));
        }
        if opts.remember_upgrade {
            // a previously successful upgrade lets us skip the polling
            // bootstrap and dial the framed transport directly
            if let Some(pos) = transports
                .iter()
                .position(|&kind| kind == TransportKind::Websocket)
            {
                let websocket = transports.remove(pos);
                transports.insert(0, websocket);
            }
        }

        let (event_tx, event_rx) = mpsc::channel(crate::defaults::EVENT_CHANNEL_CAPACITY);
        let socket = ClientSocket {
            inner: Arc::new(Inner {
                opts,
                endpoint,
                state: StdMutex::new(MutableState {
                    ready_state: ReadyState::Opening,
                    sid: None,
                    handshake: None,
                    upgrading: false,
                    upgraded: false,
                    close_pending: false,
                    write_buffer: VecDeque::new(),
                    pending_callbacks: Vec::new(),
                    remaining_transports: transports.into(),
                }),
                transport: StdMutex::new(None),
                generation: AtomicU64::new(0),
                flush_lock: tokio::sync::Mutex::new(()),
                event_tx,
                event_rx: StdMutex::new(Some(event_rx)),
                heartbeat: StdMutex::new(HeartbeatTimers {
                    watchdog: None,
                    ping_interval: None,
                    pong_timeout: None,
                }),
                probe_cancel: Notify::new(),
            }),
        };

        socket.open_next_transport().await?;
        Ok(socket)
    }

    /// Session id assigned by the server, once open
    pub fn sid(&self) -> Option<String> {
        self.inner.state.lock().expect("state lock").sid.clone()
    }

    /// Current lifecycle state
    pub fn ready_state(&self) -> ReadyState {
        self.inner.state.lock().expect("state lock").ready_state
    }

    /// Handshake received from the server, once open
    pub fn handshake(&self) -> Option<Handshake> {
        self.inner
            .state
            .lock()
            .expect("state lock")
            .handshake
            .clone()
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
    /// send acknowledgement
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

    /// Orderly close initiated by the application
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().expect("state lock");
            match state.ready_state {
                ReadyState::Opening => {
                    state.ready_state = ReadyState::Closing;
                }
                ReadyState::Open => {
                    state.ready_state = ReadyState::Closing;
                    if state.upgrading || !state.write_buffer.is_empty() {
                        state.close_pending = true;
                        return;
                    }
                }
                _ => return,
            }
        }
        self.close_transport().await;
    }

    // ---- internal machinery ----

    async fn emit(&self, event: SocketEvent) {
        let _ = self.inner.event_tx.send(event).await;
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner
            .transport
            .lock()
            .expect("transport lock")
            .clone()
    }

    fn attach_transport(&self, transport: Arc<dyn Transport>, events: TransportEventRx) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.transport.lock().expect("transport lock") = Some(transport);
        self.spawn_pump(generation, events);
    }

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

    fn create_transport(
        &self,
        kind: TransportKind,
        sid: Option<String>,
    ) -> (Arc<dyn Transport>, TransportEventRx) {
        let endpoint = self.inner.endpoint.clone();
        let opts = &self.inner.opts;
        match kind {
            TransportKind::Polling => {
                let (transport, events) = ClientPollingTransport::new(endpoint, opts, sid);
                (transport, events)
            }
            TransportKind::Websocket => {
                let (transport, events) = ClientWebSocketTransport::new(endpoint, opts, sid);
                (transport, events)
            }
            TransportKind::Webtransport => {
                let dialer: Arc<dyn WebTransportDialer> = opts
                    .webtransport_dialer
                    .clone()
                    .unwrap_or_else(|| Arc::new(TcpDialer));
                let (transport, events) = ClientWebTransport::new(endpoint, opts, sid, dialer);
                (transport, events)
            }
        }
    }

    /// Dial the next transport in the preference list
    async fn open_next_transport(&self) -> Result<()> {
        let kind = {
            let mut state = self.inner.state.lock().expect("state lock");
            state
                .remaining_transports
                .pop_front()
                .ok_or(EngineError::Closed)?
        };
        debug!(transport = %kind, "dialing");
        let (transport, events) = self.create_transport(kind, None);
        self.attach_transport(Arc::clone(&transport), events);
        transport.open().await;
        Ok(())
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.flush().await,
            TransportEvent::Ready => self.flush().await,
            TransportEvent::Drain => self.on_drain().await,
            TransportEvent::Packet(packet) => self.on_packet(packet).await,
            TransportEvent::Error(err) => self.on_transport_failure(err).await,
            TransportEvent::Close => {
                if self.ready_state() == ReadyState::Opening {
                    self.on_transport_failure(EngineError::transport_msg(
                        "transport closed before open",
                    ))
                    .await;
                } else {
                    self.on_close(CloseReason::TransportClose, None).await;
                }
            }
        }
    }

    async fn on_transport_failure(&self, err: EngineError) {
        if self.ready_state() == ReadyState::Opening {
            warn!(error = %err, "transport failed during opening");
            if let Some(transport) = self.detach_transport() {
                transport.discard().await;
            }

            let has_fallback = self.inner.opts.try_all_transports && {
                let state = self.inner.state.lock().expect("state lock");
                !state.remaining_transports.is_empty()
            };
            if has_fallback {
                if self.open_next_transport().await.is_ok() {
                    return;
                }
            }

            self.emit(SocketEvent::Error(err.description())).await;
            self.on_close(CloseReason::TransportError, Some(err.description()))
                .await;
            return;
        }

        warn!(error = %err, "transport error");
        let reason = match &err {
            EngineError::Parse(_) => CloseReason::ParseError,
            _ => CloseReason::TransportError,
        };
        let description = err.description();
        self.emit(SocketEvent::Error(description.clone())).await;
        if let Some(transport) = self.detach_transport() {
            transport.close().await;
        }
        self.on_close(reason, Some(description)).await;
    }

    async fn on_packet(&self, packet: Packet) {
        let ready_state = self.ready_state();
        if ready_state == ReadyState::Closed {
            return;
        }

        // any server traffic proves liveness
        self.refresh_watchdog();

        match packet.kind {
            PacketType::Open if ready_state == ReadyState::Opening => {
                let Some(json) = packet.data.as_ref().and_then(|d| d.as_text()) else {
                    self.on_close(CloseReason::ParseError, None).await;
                    return;
                };
                match serde_json::from_str::<Handshake>(json) {
                    Ok(handshake) => self.on_handshake(handshake).await,
                    Err(err) => {
                        warn!(error = %err, "malformed handshake");
                        self.on_close(CloseReason::ParseError, None).await;
                    }
                }
            }
            PacketType::Ping if self.inner.opts.protocol != PROTOCOL_V3 => {
                // v4: answer the server probe immediately
                self.emit(SocketEvent::Heartbeat).await;
                self.send_packet(Packet::pong(), None).await;
            }
            PacketType::Pong if self.inner.opts.protocol == PROTOCOL_V3 => {
                {
                    let mut hb = self.inner.heartbeat.lock().expect("heartbeat lock");
                    if let Some(timer) = hb.pong_timeout.take() {
                        timer.cancel();
                    }
                }
                self.schedule_v3_ping();
                self.emit(SocketEvent::Heartbeat).await;
            }
            PacketType::Message if ready_state == ReadyState::Open => {
                let data = packet
                    .data
                    .unwrap_or_else(|| PacketData::Text(String::new()));
                self.emit(SocketEvent::Message(data)).await;
            }
            PacketType::Close => {
                self.on_close(CloseReason::ServerClose, None).await;
            }
            PacketType::Error => {
                self.on_close(CloseReason::ParseError, None).await;
            }
            _ => {}
        }
    }

    async fn on_handshake(&self, handshake: Handshake) {
        debug!(sid = %handshake.sid, "handshake received");
        {
            let mut state = self.inner.state.lock().expect("state lock");
            state.sid = Some(handshake.sid.clone());
            state.handshake = Some(handshake.clone());
            state.ready_state = ReadyState::Open;
        }
        if let Some(transport) = self.current_transport() {
            transport.set_sid(&handshake.sid);
        }

        self.emit(SocketEvent::Open(handshake.clone())).await;
        self.start_heartbeat(&handshake);
        self.flush().await;

        if self.inner.opts.upgrade {
            let candidates: Vec<TransportKind> = handshake
                .upgrades
                .iter()
                .filter_map(|name| TransportKind::parse(name))
                .filter(|kind| self.inner.opts.transports.contains(kind))
                .collect();
            let webtransport_offered = candidates.contains(&TransportKind::Webtransport);
            for kind in candidates {
                self.spawn_probe(kind, webtransport_offered);
            }
        }

        // the application may have closed while the handshake was in flight
        let resume_close = {
            let state = self.inner.state.lock().expect("state lock");
            state.ready_state == ReadyState::Closing && state.write_buffer.is_empty()
        };
        if resume_close {
            self.close_transport().await;
        }
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
            self.flush().await;
        }
    }

    async fn send_packet(&self, packet: Packet, callback: Option<SendCallback>) {
        {
            let mut state = self.inner.state.lock().expect("state lock");
            match state.ready_state {
                ReadyState::Opening | ReadyState::Open => {}
                _ => return,
            }
            state.write_buffer.push_back((packet, callback));
        }
        self.flush().await;
    }

    /// Hand a contiguous prefix of the write buffer to the transport,
    /// bounded by the server-advertised `maxPayload` on polling.
    async fn flush(&self) {
        let _guard = self.inner.flush_lock.lock().await;

        let Some(transport) = self.current_transport() else {
            return;
        };

        let batch: Vec<Packet> = {
            let mut state = self.inner.state.lock().expect("state lock");
            let flushable = matches!(
                state.ready_state,
                ReadyState::Open | ReadyState::Closing
            );
            if !flushable
                || state.upgrading
                || state.write_buffer.is_empty()
                || !transport.writable()
            {
                return;
            }

            let max_payload = state
                .handshake
                .as_ref()
                .map(|h| h.max_payload as usize)
                .unwrap_or(crate::defaults::MAX_PAYLOAD);

            let count = if transport.supports_framing() {
                state.write_buffer.len()
            } else {
                let mut size = 0usize;
                let mut count = 0usize;
                for (packet, _) in state.write_buffer.iter() {
                    let cost = packet.encoded_size_estimate() + usize::from(count > 0);
                    if count > 0 && size + cost > max_payload {
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

        debug!(count = batch.len(), "flushing write buffer");
        self.emit(SocketEvent::Flush).await;
        transport.send(batch).await;
    }

    // ---- heartbeat ----

    fn start_heartbeat(&self, handshake: &Handshake) {
        if self.inner.opts.protocol == PROTOCOL_V3 {
            self.schedule_v3_ping();
        } else {
            let window = Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);
            let socket = self.clone();
            let watchdog = RefreshableTimer::start(window, async move {
                debug!("server went silent past the heartbeat window");
                socket.on_close(CloseReason::PingTimeout, None).await;
            });
            self.inner
                .heartbeat
                .lock()
                .expect("heartbeat lock")
                .watchdog = Some(watchdog);
        }
    }

    fn refresh_watchdog(&self) {
        let window = {
            let state = self.inner.state.lock().expect("state lock");
            state
                .handshake
                .as_ref()
                .map(|h| Duration::from_millis(h.ping_interval + h.ping_timeout))
        };
        if let Some(window) = window {
            let hb = self.inner.heartbeat.lock().expect("heartbeat lock");
            if let Some(watchdog) = hb.watchdog.as_ref() {
                watchdog.reset(window);
            }
        }
    }

    /// v3: the client drives the heartbeat
    fn schedule_v3_ping(&self) {
        let interval = {
            let state = self.inner.state.lock().expect("state lock");
            state
                .handshake
                .as_ref()
                .map(|h| Duration::from_millis(h.ping_interval))
        };
        let Some(interval) = interval else {
            return;
        };
        let socket = self.clone();
        let timer = Timer::after(interval, async move {
            socket.send_v3_ping().await;
        });
        self.inner
            .heartbeat
            .lock()
            .expect("heartbeat lock")
            .ping_interval = Some(timer);
    }

    async fn send_v3_ping(&self) {
        if self.ready_state() != ReadyState::Open {
            return;
        }
        let timeout = {
            let state = self.inner.state.lock().expect("state lock");
            state
                .handshake
                .as_ref()
                .map(|h| Duration::from_millis(h.ping_timeout))
        };
        let Some(timeout) = timeout else {
            return;
        };
        let socket = self.clone();
        {
            let mut hb = self.inner.heartbeat.lock().expect("heartbeat lock");
            hb.pong_timeout = Some(Timer::after(timeout, async move {
                socket.on_close(CloseReason::PingTimeout, None).await;
            }));
        }
        self.emit(SocketEvent::Heartbeat).await;
        self.send_packet(Packet::ping(), None).await;
    }

    fn cancel_heartbeat(&self) {
        let mut hb = self.inner.heartbeat.lock().expect("heartbeat lock");
        if let Some(timer) = hb.watchdog.take() {
            timer.cancel();
        }
        if let Some(timer) = hb.ping_interval.take() {
            timer.cancel();
        }
        if let Some(timer) = hb.pong_timeout.take() {
            timer.cancel();
        }
    }

    // ---- upgrade probes ----

    /// Mark the upgrade as in progress; refuses when another probe already
    /// committed or the session is no longer open
    fn begin_upgrade(&self) -> bool {
        let mut state = self.inner.state.lock().expect("state lock");
        if state.ready_state != ReadyState::Open || state.upgrading || state.upgraded {
            return false;
        }
        state.upgrading = true;
        true
    }

    fn spawn_probe(&self, kind: TransportKind, webtransport_offered: bool) {
        let socket = self.clone();
        tokio::spawn(async move {
            // WebTransport gets a head start when both upgrades are on offer
            if webtransport_offered && kind != TransportKind::Webtransport {
                tokio::time::sleep(crate::defaults::PROBE_DELAY).await;
            }
            if socket.ready_state() != ReadyState::Open || socket.upgraded() {
                return;
            }
            socket.probe(kind).await;
        });
    }

    async fn probe(&self, kind: TransportKind) {
        debug!(candidate = %kind, "probing upgrade transport");
        let sid = self.sid();
        let (transport, mut events) = self.create_transport(kind, sid);
        transport.open().await;

        let deadline = tokio::time::sleep(self.inner.opts.upgrade_timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                _ = &mut deadline => break ProbeOutcome::Fail("probe timeout".to_string()),
                _ = self.inner.probe_cancel.notified() => {
                    break ProbeOutcome::Fail("probe cancelled".to_string());
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Open) => {
                        transport.send(vec![Packet::ping_probe()]).await;
                    }
                    Some(TransportEvent::Packet(packet)) => {
                        if packet.kind == PacketType::Pong && packet.has_text("probe") {
                            break ProbeOutcome::Commit;
                        }
                        warn!(kind = packet.kind.as_str(), "unexpected probe packet");
                        break ProbeOutcome::Fail("probe error".to_string());
                    }
                    Some(TransportEvent::Error(err)) => {
                        break ProbeOutcome::Fail(format!("probe error: {}", err));
                    }
                    Some(TransportEvent::Close) | None => {
                        break ProbeOutcome::Fail("transport closed".to_string());
                    }
                    Some(_) => {}
                }
            }
        };

        match outcome {
            ProbeOutcome::Fail(description) => {
                debug!(candidate = %kind, reason = %description, "probe failed");
                transport.close().await;
                self.emit(SocketEvent::UpgradeError(description)).await;
            }
            ProbeOutcome::Commit => {
                if !self.begin_upgrade() {
                    transport.close().await;
                    return;
                }
                self.emit(SocketEvent::Upgrading(kind)).await;

                // quiesce the old transport before the handover
                let old = self.current_transport();
                if let Some(old) = &old {
                    old.pause().await;
                }
                if self.ready_state() == ReadyState::Closed {
                    transport.close().await;
                    return;
                }

                self.detach_transport();
                self.attach_transport(Arc::clone(&transport), events);
                transport.send(vec![Packet::upgrade()]).await;
                if let Some(old) = old {
                    old.discard().await;
                }

                {
                    let mut state = self.inner.state.lock().expect("state lock");
                    state.upgrading = false;
                    state.upgraded = true;
                }
                // cancel the other probes
                self.inner.probe_cancel.notify_waiters();

                debug!(transport = %kind, "upgrade committed");
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
    async fn on_close(&self, reason: CloseReason, description: Option<String>) {
        {
            let mut state = self.inner.state.lock().expect("state lock");
            if state.ready_state == ReadyState::Closed {
                return;
            }
            state.ready_state = ReadyState::Closed;
        }

        debug!(reason = reason.as_str(), "session closed");
        self.cancel_heartbeat();
        self.inner.probe_cancel.notify_waiters();
        if let Some(transport) = self.detach_transport() {
            transport.discard().await;
        }

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
