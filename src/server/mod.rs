//! # Base Server / Dispatcher
//!
//! The single HTTP entry point of the engine. For every incoming request
//! the dispatcher:
//!
//! 1. runs the ordered middleware chain (any middleware may terminate the
//!    request with a protocol error)
//! 2. verifies the request: transport enabled, Origin header characters
//!    valid, `sid` mapped to a live session with a matching transport
//! 3. routes it: to the existing session's transport (poll / data), to a
//!    fresh handshake, or to the WebSocket/WebTransport upgrade handler
//!
//! The dispatcher owns the session registry. Shutdown closes every
//! registered session; each session closes its transport.

pub mod socket;
pub mod transport;

pub use socket::Socket;

use crate::config::ServerOptions;
use crate::error::ProtocolErrorKind;
use crate::parser::{self, PROTOCOL_V3, PROTOCOL_V4};
use crate::server::transport::{PollingTransport, WebSocketTransport, WebTransportTransport};
use crate::session::ReadyState;
use crate::transport::{framing, BidiStream, RawRequest, RawResponse, Transport, TransportKind};
use crate::util::generate_sid;
use http::header::{
    HeaderValue, CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{Method, StatusCode};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Ordered request middleware: inspect the request, reject with a protocol
/// error to terminate it.
pub type Middleware =
    Arc<dyn Fn(&RawRequest) -> Result<(), ProtocolErrorKind> + Send + Sync + 'static>;

/// Events the server emits to the embedding application.
#[derive(Debug)]
pub enum ServerEvent {
    /// A new session completed its handshake
    Connection(Socket),
    /// A request was rejected before reaching a session
    ConnectionError {
        kind: ProtocolErrorKind,
        method: Method,
        path: String,
    },
}

/// sid → session mapping with an atomic session counter.
#[derive(Clone)]
pub(crate) struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Socket>>>,
    count: Arc<AtomicU64>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) async fn insert(&self, sid: String, socket: Socket) {
        let mut sessions = self.sessions.lock().await;
        if sessions.insert(sid, socket).is_none() {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) async fn remove(&self, sid: &str) {
        let mut sessions = self.sessions.lock().await;
        if sessions.remove(sid).is_some() {
            self.count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub(crate) async fn get(&self, sid: &str) -> Option<Socket> {
        self.sessions.lock().await.get(sid).cloned()
    }

    pub(crate) fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) async fn drain(&self) -> Vec<Socket> {
        let mut sessions = self.sessions.lock().await;
        sessions.drain().map(|(_, socket)| socket).collect()
    }
}

/// Envelope of the WebTransport upgrade request
#[derive(Debug, Deserialize)]
struct UpgradeEnvelope {
    sid: String,
}

/// Outcome of request verification
struct Verified {
    protocol: u8,
    kind: TransportKind,
    socket: Option<Socket>,
}

struct ServerInner {
    opts: ServerOptions,
    registry: SessionRegistry,
    middlewares: StdMutex<Vec<Middleware>>,
    event_tx: mpsc::Sender<ServerEvent>,
    event_rx: StdMutex<Option<mpsc::Receiver<ServerEvent>>>,
    shutdown: StdMutex<Option<oneshot::Sender<()>>>,
}

/// The engine server. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server with the given options
    pub fn new(opts: ServerOptions) -> Self {
        let (event_tx, event_rx) = mpsc::channel(crate::defaults::EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ServerInner {
                opts,
                registry: SessionRegistry::new(),
                middlewares: StdMutex::new(Vec::new()),
                event_tx,
                event_rx: StdMutex::new(Some(event_rx)),
                shutdown: StdMutex::new(None),
            }),
        }
    }

    /// Append a middleware to the chain. Middlewares run in registration
    /// order before any routing.
    pub fn add_middleware(&self, middleware: Middleware) {
        self.inner
            .middlewares
            .lock()
            .expect("middleware lock")
            .push(middleware);
    }

    /// Take the server event stream. Yields `None` after the first call.
    pub fn events(&self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.inner.event_rx.lock().expect("event rx lock").take()
    }

    /// Number of live sessions
    pub fn session_count(&self) -> u64 {
        self.inner.registry.count()
    }

    /// Look up a session by id
    pub async fn socket(&self, sid: &str) -> Option<Socket> {
        self.inner.registry.get(sid).await
    }

    /// Bind a listener and serve the endpoint until [`Server::close`].
    /// Returns the bound address.
    pub async fn serve(&self, addr: SocketAddr) -> crate::error::Result<SocketAddr> {
        let server = self.clone();
        let make = make_service_fn(move |conn: &AddrStream| {
            let server = server.clone();
            let remote = conn.remote_addr();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let server = server.clone();
                    async move {
                        Ok::<_, Infallible>(server.dispatch(req, Some(remote)).await)
                    }
                }))
            }
        });

        let builder = hyper::Server::try_bind(&addr)
            .map_err(|err| crate::error::EngineError::transport("bind error", err))?;
        let http = builder.serve(make);
        let local = http.local_addr();

        let (tx, rx) = oneshot::channel::<()>();
        *self.inner.shutdown.lock().expect("shutdown lock") = Some(tx);

        let graceful = http.with_graceful_shutdown(async {
            let _ = rx.await;
        });
        tokio::spawn(async move {
            if let Err(err) = graceful.await {
                warn!(error = %err, "http server terminated");
            }
        });

        info!(addr = %local, path = %self.inner.opts.path, "engine endpoint listening");
        Ok(local)
    }

    /// Shut the endpoint down: stop accepting requests and close every
    /// registered session.
    pub async fn close(&self) {
        info!("closing all open sessions");
        for socket in self.inner.registry.drain().await {
            socket.close().await;
        }
        if let Some(tx) = self.inner.shutdown.lock().expect("shutdown lock").take() {
            let _ = tx.send(());
        }
    }

    // ---- HTTP plumbing ----

    fn base_path(&self) -> &str {
        self.inner.opts.path.trim_end_matches('/')
    }

    fn matches_path(&self, path: &str) -> bool {
        let base = self.base_path();
        path == base || path.strip_prefix(base).is_some_and(|rest| rest.starts_with('/'))
    }

    /// Entry point for the embedding hyper service
    pub async fn dispatch(
        &self,
        req: Request<Body>,
        remote_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        if !self.matches_path(req.uri().path()) {
            return Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::empty())
                .expect("static response");
        }

        if is_websocket_upgrade(&req) {
            return self.handle_websocket_upgrade(req, remote_addr).await;
        }

        let (parts, body) = req.into_parts();
        let body = match hyper::body::to_bytes(body).await {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "failed to read request body");
                return into_hyper(RawResponse::protocol_error(ProtocolErrorKind::BadRequest));
            }
        };

        let raw = RawRequest {
            method: parts.method,
            path: parts.uri.path().to_string(),
            query: parse_query(parts.uri.query().unwrap_or("")),
            headers: parts.headers,
            body,
            remote_addr,
        };

        into_hyper(self.handle_request(raw).await)
    }

    /// Route a plain HTTP request (handshake, poll or data upload).
    ///
    /// Exposed for embedding layers that terminate HTTP themselves.
    pub async fn handle_request(&self, request: RawRequest) -> RawResponse {
        if let Err(kind) = self.run_middlewares(&request) {
            return self.reject(&request, kind).await;
        }

        let verified = match self.verify(&request, false).await {
            Ok(verified) => verified,
            Err(kind) => return self.reject(&request, kind).await,
        };

        match verified.socket {
            Some(socket) => match socket.current_transport() {
                Some(transport) => transport.handle_request(request).await,
                None => self.reject(&request, ProtocolErrorKind::UnknownSid).await,
            },
            None => self.handshake(verified.protocol, verified.kind, request).await,
        }
    }

    /// Hand an accepted WebTransport bidirectional stream to the engine.
    ///
    /// The first frame decides: an `open` packet with a `{"sid"}` payload
    /// attaches the stream to an existing session as an upgrade probe, an
    /// empty `open` performs a fresh handshake directly on WebTransport.
    pub async fn on_webtransport_stream(
        &self,
        stream: Box<dyn BidiStream>,
    ) -> crate::error::Result<()> {
        if !self
            .inner
            .opts
            .transports
            .contains(&TransportKind::Webtransport)
        {
            return Err(ProtocolErrorKind::UnknownTransport.into());
        }

        let mut stream = stream;
        let frame = framing::read_frame(&mut stream)
            .await
            .map_err(|err| crate::error::EngineError::transport("webtransport error", err))?
            .ok_or_else(|| {
                crate::error::EngineError::transport_msg("webtransport stream ended early")
            })?;
        let packet = parser::decode_packet(&frame, PROTOCOL_V4)?;
        if packet.kind != crate::packet::PacketType::Open {
            return Err(ProtocolErrorKind::BadRequest.into());
        }

        let envelope = packet
            .data
            .as_ref()
            .and_then(|data| data.as_text())
            .and_then(|text| serde_json::from_str::<UpgradeEnvelope>(text).ok());

        match envelope {
            Some(envelope) => {
                debug!(sid = %envelope.sid, "webtransport upgrade stream");
                let socket = self
                    .inner
                    .registry
                    .get(&envelope.sid)
                    .await
                    .ok_or(ProtocolErrorKind::UnknownSid)?;
                let (transport, events) =
                    WebTransportTransport::new(stream, socket.protocol());
                socket.maybe_upgrade(transport, events);
            }
            None => {
                debug!("fresh webtransport handshake");
                let sid = generate_sid();
                let (transport, events) = WebTransportTransport::new(stream, PROTOCOL_V4);
                let socket = Socket::open(
                    sid.clone(),
                    PROTOCOL_V4,
                    transport,
                    events,
                    self.inner.opts.clone(),
                    self.inner.registry.clone(),
                    None,
                )
                .await;
                self.inner.registry.insert(sid, socket.clone()).await;
                let _ = self
                    .inner
                    .event_tx
                    .send(ServerEvent::Connection(socket))
                    .await;
            }
        }
        Ok(())
    }

    // ---- verification & routing ----

    fn run_middlewares(&self, request: &RawRequest) -> Result<(), ProtocolErrorKind> {
        let middlewares = self
            .inner
            .middlewares
            .lock()
            .expect("middleware lock")
            .clone();
        for middleware in middlewares {
            middleware(request)?;
        }
        Ok(())
    }

    async fn reject(&self, request: &RawRequest, kind: ProtocolErrorKind) -> RawResponse {
        warn!(
            method = %request.method,
            path = %request.path,
            code = kind.code(),
            message = kind.message(),
            "request rejected"
        );
        let _ = self
            .inner
            .event_tx
            .send(ServerEvent::ConnectionError {
                kind,
                method: request.method.clone(),
                path: request.path.clone(),
            })
            .await;
        RawResponse::protocol_error(kind)
    }

    async fn verify(
        &self,
        request: &RawRequest,
        upgrade: bool,
    ) -> Result<Verified, ProtocolErrorKind> {
        let kind = request
            .query_param("transport")
            .and_then(TransportKind::parse)
            .ok_or(ProtocolErrorKind::UnknownTransport)?;
        if !self.inner.opts.transports.contains(&kind) {
            return Err(ProtocolErrorKind::UnknownTransport);
        }

        let protocol = match request.query_param("EIO") {
            Some("4") => PROTOCOL_V4,
            _ => PROTOCOL_V3,
        };
        if protocol == PROTOCOL_V3 && !self.inner.opts.allow_eio3 {
            return Err(ProtocolErrorKind::UnsupportedProtocolVersion);
        }

        if let Some(origin) = request.headers.get(http::header::ORIGIN) {
            if !header_value_is_clean(origin.as_bytes()) {
                return Err(ProtocolErrorKind::BadRequest);
            }
        }

        match request.query_param("sid") {
            Some(sid) => {
                let socket = self
                    .inner
                    .registry
                    .get(sid)
                    .await
                    .ok_or(ProtocolErrorKind::UnknownSid)?;
                let current = socket
                    .transport_kind()
                    .ok_or(ProtocolErrorKind::UnknownSid)?;
                if upgrade {
                    if !current.upgrades_to().contains(&kind) {
                        return Err(ProtocolErrorKind::BadRequest);
                    }
                } else if current != kind {
                    return Err(ProtocolErrorKind::BadRequest);
                }
                Ok(Verified {
                    protocol: socket.protocol(),
                    kind,
                    socket: Some(socket),
                })
            }
            None => {
                if !upgrade && request.method != Method::GET {
                    return Err(ProtocolErrorKind::BadHandshakeMethod);
                }
                if let Some(allow) = &self.inner.opts.allow_request {
                    if let Err(reason) = allow(request) {
                        debug!(reason = %reason, "request gated");
                        return Err(ProtocolErrorKind::Forbidden);
                    }
                }
                Ok(Verified {
                    protocol,
                    kind,
                    socket: None,
                })
            }
        }
    }

    /// Perform a fresh handshake over HTTP polling
    async fn handshake(
        &self,
        protocol: u8,
        kind: TransportKind,
        request: RawRequest,
    ) -> RawResponse {
        if kind != TransportKind::Polling {
            // framed transports handshake through their own accept paths
            return self.reject(&request, ProtocolErrorKind::BadRequest).await;
        }

        let supports_binary =
            protocol == PROTOCOL_V3 && request.query_param("b64").is_none();
        let (transport, events) = PollingTransport::new(
            protocol,
            supports_binary,
            self.inner.opts.max_http_buffer_size,
            self.inner.opts.close_timeout,
        );

        let sid = generate_sid();
        debug!(sid = %sid, protocol, "handshaking new polling session");
        let socket = Socket::open(
            sid.clone(),
            protocol,
            transport.clone(),
            events,
            self.inner.opts.clone(),
            self.inner.registry.clone(),
            request.remote_addr,
        )
        .await;
        self.inner.registry.insert(sid.clone(), socket.clone()).await;
        let _ = self
            .inner
            .event_tx
            .send(ServerEvent::Connection(socket))
            .await;

        let mut response = transport.handle_request(request).await;
        if let Some(cookie) = &self.inner.opts.cookie {
            let mut value = format!("{}={}; Path={}", cookie.name, sid, cookie.path);
            if cookie.http_only {
                value.push_str("; HttpOnly");
            }
            if let Ok(value) = HeaderValue::from_str(&value) {
                response = response.with_header(http::header::SET_COOKIE, value);
            }
        }
        response
    }

    /// Accept a WebSocket upgrade: verify, answer 101, then attach the
    /// upgraded stream as a fresh session or as an upgrade probe.
    async fn handle_websocket_upgrade(
        &self,
        mut req: Request<Body>,
        remote_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        let raw = RawRequest {
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            query: parse_query(req.uri().query().unwrap_or("")),
            headers: req.headers().clone(),
            body: bytes::Bytes::new(),
            remote_addr,
        };

        if let Err(kind) = self.run_middlewares(&raw) {
            return into_hyper(self.reject(&raw, kind).await);
        }
        let verified = match self.verify(&raw, true).await {
            Ok(verified) => verified,
            Err(kind) => return into_hyper(self.reject(&raw, kind).await),
        };
        if verified.kind != TransportKind::Websocket {
            return into_hyper(self.reject(&raw, ProtocolErrorKind::BadRequest).await);
        }

        let version_ok = req
            .headers()
            .get(SEC_WEBSOCKET_VERSION)
            .map(|v| v.as_bytes() == b"13")
            .unwrap_or(false);
        let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY).cloned() else {
            return into_hyper(self.reject(&raw, ProtocolErrorKind::BadRequest).await);
        };
        if !version_ok {
            return into_hyper(self.reject(&raw, ProtocolErrorKind::BadRequest).await);
        }

        let accept = derive_accept_key(key.as_bytes());
        let on_upgrade = hyper::upgrade::on(&mut req);

        let server = self.clone();
        let protocol = verified.protocol;
        let existing = verified.socket;
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(err) => {
                    warn!(error = %err, "websocket upgrade failed");
                    return;
                }
            };
            let ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
            let (transport, events) =
                WebSocketTransport::new(ws, protocol, server.inner.opts.per_message_deflate);

            match existing {
                Some(socket) => {
                    if socket.ready_state() == ReadyState::Closed {
                        transport.close().await;
                        return;
                    }
                    socket.maybe_upgrade(transport, events);
                }
                None => {
                    let sid = generate_sid();
                    debug!(sid = %sid, "handshaking new websocket session");
                    let socket = Socket::open(
                        sid.clone(),
                        protocol,
                        transport,
                        events,
                        server.inner.opts.clone(),
                        server.inner.registry.clone(),
                        remote_addr,
                    )
                    .await;
                    server.inner.registry.insert(sid, socket.clone()).await;
                    let _ = server
                        .inner
                        .event_tx
                        .send(ServerEvent::Connection(socket))
                        .await;
                }
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, HeaderValue::from_static("upgrade"))
            .header(UPGRADE, HeaderValue::from_static("websocket"))
            .header(
                http::header::SEC_WEBSOCKET_ACCEPT,
                HeaderValue::from_str(&accept).expect("accept key"),
            )
            .body(Body::empty())
            .expect("static response")
    }
}

/// Header values may only contain visible characters and spaces
fn header_value_is_clean(value: &[u8]) -> bool {
    value.iter().all(|&b| b >= 0x20 && b != 0x7f)
}

fn is_websocket_upgrade(req: &Request<Body>) -> bool {
    let connection_has_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let upgrade_is_websocket = req
        .headers()
        .get(UPGRADE)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"websocket"))
        .unwrap_or(false);
    connection_has_upgrade && upgrade_is_websocket
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

fn into_hyper(response: RawResponse) -> Response<Body> {
    let mut builder = Response::builder()
        .status(response.status)
        .header(CONTENT_TYPE, response.content_type);
    for (name, value) in response.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(response.body))
        .expect("response assembly")
}
