//! # Configuration
//!
//! Option structures for the two endpoints. Both follow the same
//! discipline: plain data with documented defaults, passed in explicitly at
//! construction. There is no process-global configuration; everything the
//! engine needs travels through these structs.

use crate::client::transport::webtransport::WebTransportDialer;
use crate::packet::PacketData;
use crate::transport::{RawRequest, TransportKind};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Request-gating callback: inspect an incoming handshake request and
/// reject it with a reason before any session state is allocated.
pub type AllowRequest =
    Arc<dyn Fn(&RawRequest) -> Result<(), String> + Send + Sync + 'static>;

/// Sticky-session cookie configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieOptions {
    /// Cookie name
    pub name: String,
    /// Cookie path attribute
    pub path: String,
    /// Emit the `HttpOnly` attribute
    pub http_only: bool,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            name: "io".to_string(),
            path: "/".to_string(),
            http_only: true,
        }
    }
}

/// Per-message deflate configuration for framed transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerMessageDeflate {
    /// Payloads below this many bytes are never compressed, even when a
    /// packet asks for compression
    pub threshold: usize,
}

impl Default for PerMessageDeflate {
    fn default() -> Self {
        Self {
            threshold: crate::defaults::COMPRESSION_THRESHOLD,
        }
    }
}

/// Server endpoint configuration.
#[derive(Clone)]
pub struct ServerOptions {
    /// HTTP mount path of the endpoint
    pub path: String,
    /// Interval between server heartbeat probes
    pub ping_interval: Duration,
    /// Grace period for the heartbeat answer
    pub ping_timeout: Duration,
    /// Time budget for a single upgrade probe
    pub upgrade_timeout: Duration,
    /// Grace period for an orderly polling shutdown before force-closing
    pub close_timeout: Duration,
    /// Advertised upper bound on the encoded size of a polling response
    pub max_payload: usize,
    /// Upper bound on the size of an accepted polling request body
    pub max_http_buffer_size: usize,
    /// Transports accepted for fresh handshakes
    pub transports: Vec<TransportKind>,
    /// Offer in-session transport upgrades
    pub allow_upgrades: bool,
    /// Accept peers speaking the legacy v3 wire revision
    pub allow_eio3: bool,
    /// Emit a sticky-session cookie on handshake responses
    pub cookie: Option<CookieOptions>,
    /// Compression settings for framed transports
    pub per_message_deflate: Option<PerMessageDeflate>,
    /// Message delivered together with the handshake payload
    pub initial_packet: Option<PacketData>,
    /// Request-gating callback run before handshakes and upgrades
    pub allow_request: Option<AllowRequest>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            path: crate::defaults::PATH.to_string(),
            ping_interval: crate::defaults::PING_INTERVAL,
            ping_timeout: crate::defaults::PING_TIMEOUT,
            upgrade_timeout: crate::defaults::UPGRADE_TIMEOUT,
            close_timeout: crate::defaults::CLOSE_TIMEOUT,
            max_payload: crate::defaults::MAX_PAYLOAD,
            max_http_buffer_size: crate::defaults::MAX_HTTP_BUFFER_SIZE,
            transports: vec![TransportKind::Polling, TransportKind::Websocket],
            allow_upgrades: true,
            allow_eio3: false,
            cookie: None,
            per_message_deflate: None,
            initial_packet: None,
            allow_request: None,
        }
    }
}

impl ServerOptions {
    /// Transports the given transport may upgrade to under this
    /// configuration
    pub fn upgrades_for(&self, kind: TransportKind) -> Vec<String> {
        if !self.allow_upgrades {
            return Vec::new();
        }
        kind.upgrades_to()
            .iter()
            .filter(|upgrade| self.transports.contains(upgrade))
            .map(|upgrade| upgrade.as_str().to_string())
            .collect()
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("path", &self.path)
            .field("ping_interval", &self.ping_interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("upgrade_timeout", &self.upgrade_timeout)
            .field("close_timeout", &self.close_timeout)
            .field("max_payload", &self.max_payload)
            .field("max_http_buffer_size", &self.max_http_buffer_size)
            .field("transports", &self.transports)
            .field("allow_upgrades", &self.allow_upgrades)
            .field("allow_eio3", &self.allow_eio3)
            .field("cookie", &self.cookie)
            .field("per_message_deflate", &self.per_message_deflate)
            .field("allow_request", &self.allow_request.is_some())
            .finish()
    }
}

/// Per-transport overrides a client may carry for individual transports.
#[derive(Debug, Clone, Default)]
pub struct TransportOverrides {
    /// Override the polling request timeout
    pub request_timeout: Option<Duration>,
    /// Replace the extra headers for this transport
    pub extra_headers: Option<Vec<(String, String)>>,
    /// Override cache-busting for this transport
    pub timestamp_requests: Option<bool>,
}

/// Client endpoint configuration.
#[derive(Clone)]
pub struct ClientOptions {
    /// HTTP mount path of the remote endpoint
    pub path: String,
    /// Append a trailing slash to the request path
    pub add_trailing_slash: bool,
    /// Ordered transport preference for the initial connection
    pub transports: Vec<TransportKind>,
    /// Probe the transports offered in the handshake
    pub upgrade: bool,
    /// Start directly on WebSocket when a prior session upgraded
    /// successfully, skipping the polling bootstrap
    pub remember_upgrade: bool,
    /// On a failed `opening`, fall through the remaining transports
    /// instead of failing fast
    pub try_all_transports: bool,
    /// Timeout applied to individual polling HTTP requests
    pub request_timeout: Option<Duration>,
    /// Time budget for a single upgrade probe
    pub upgrade_timeout: Duration,
    /// Headers attached to every request
    pub extra_headers: Vec<(String, String)>,
    /// Send credentials with cross-origin polling requests
    pub with_credentials: bool,
    /// Append a cache-busting timestamp to polling requests
    pub timestamp_requests: bool,
    /// Name of the cache-busting query parameter
    pub timestamp_param: String,
    /// Force base64 encoding for binary payloads even on binary-capable
    /// transports
    pub force_base64: bool,
    /// Compression settings for framed transports
    pub per_message_deflate: Option<PerMessageDeflate>,
    /// WebSocket subprotocols to offer
    pub protocols: Vec<String>,
    /// Per-transport option overrides
    pub transport_options: HashMap<TransportKind, TransportOverrides>,
    /// Close the session when the embedding environment announces teardown.
    /// Recorded for API parity; this environment has no unload signal, so
    /// the flag has no runtime effect.
    pub close_on_beforeunload: bool,
    /// Wire revision to speak (4, or 3 for legacy peers)
    pub protocol: u8,
    /// Dialer producing the bidirectional stream for WebTransport; the
    /// QUIC/TLS plumbing lives behind this seam
    pub webtransport_dialer: Option<Arc<dyn WebTransportDialer>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            path: crate::defaults::PATH.to_string(),
            add_trailing_slash: true,
            transports: vec![TransportKind::Polling, TransportKind::Websocket],
            upgrade: true,
            remember_upgrade: false,
            try_all_transports: false,
            request_timeout: None,
            upgrade_timeout: crate::defaults::UPGRADE_TIMEOUT,
            extra_headers: Vec::new(),
            with_credentials: false,
            timestamp_requests: true,
            timestamp_param: crate::defaults::TIMESTAMP_PARAM.to_string(),
            force_base64: false,
            per_message_deflate: None,
            protocols: Vec::new(),
            transport_options: HashMap::new(),
            close_on_beforeunload: false,
            protocol: crate::parser::PROTOCOL_V4,
            webtransport_dialer: None,
        }
    }
}

impl ClientOptions {
    /// Effective request timeout for a transport, honoring overrides
    pub fn request_timeout_for(&self, kind: TransportKind) -> Option<Duration> {
        self.transport_options
            .get(&kind)
            .and_then(|o| o.request_timeout)
            .or(self.request_timeout)
    }

    /// Effective extra headers for a transport, honoring overrides
    pub fn extra_headers_for(&self, kind: TransportKind) -> Vec<(String, String)> {
        self.transport_options
            .get(&kind)
            .and_then(|o| o.extra_headers.clone())
            .unwrap_or_else(|| self.extra_headers.clone())
    }

    /// Effective cache-busting flag for a transport, honoring overrides
    pub fn timestamp_requests_for(&self, kind: TransportKind) -> bool {
        self.transport_options
            .get(&kind)
            .and_then(|o| o.timestamp_requests)
            .unwrap_or(self.timestamp_requests)
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("path", &self.path)
            .field("add_trailing_slash", &self.add_trailing_slash)
            .field("transports", &self.transports)
            .field("upgrade", &self.upgrade)
            .field("remember_upgrade", &self.remember_upgrade)
            .field("try_all_transports", &self.try_all_transports)
            .field("request_timeout", &self.request_timeout)
            .field("upgrade_timeout", &self.upgrade_timeout)
            .field("with_credentials", &self.with_credentials)
            .field("timestamp_requests", &self.timestamp_requests)
            .field("timestamp_param", &self.timestamp_param)
            .field("force_base64", &self.force_base64)
            .field("protocols", &self.protocols)
            .field("protocol", &self.protocol)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_match_the_advertised_handshake() {
        let opts = ServerOptions::default();
        assert_eq!(opts.path, "/engine.io");
        assert_eq!(opts.ping_interval, Duration::from_millis(25_000));
        assert_eq!(opts.ping_timeout, Duration::from_millis(20_000));
        assert_eq!(opts.max_payload, 1_000_000);
        assert_eq!(opts.upgrade_timeout, Duration::from_secs(10));
        assert_eq!(opts.close_timeout, Duration::from_secs(30));
        assert!(opts.allow_upgrades);
        assert!(!opts.allow_eio3);
    }

    #[test]
    fn upgrades_respect_enabled_transports() {
        let mut opts = ServerOptions::default();
        assert_eq!(opts.upgrades_for(TransportKind::Polling), vec!["websocket"]);

        opts.transports.push(TransportKind::Webtransport);
        assert_eq!(
            opts.upgrades_for(TransportKind::Polling),
            vec!["websocket", "webtransport"]
        );

        opts.allow_upgrades = false;
        assert!(opts.upgrades_for(TransportKind::Polling).is_empty());

        opts.allow_upgrades = true;
        assert!(opts.upgrades_for(TransportKind::Websocket).is_empty());
    }

    #[test]
    fn client_transport_overrides_take_precedence() {
        let mut opts = ClientOptions {
            request_timeout: Some(Duration::from_secs(5)),
            ..ClientOptions::default()
        };
        opts.transport_options.insert(
            TransportKind::Polling,
            TransportOverrides {
                request_timeout: Some(Duration::from_secs(1)),
                ..TransportOverrides::default()
            },
        );

        assert_eq!(
            opts.request_timeout_for(TransportKind::Polling),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            opts.request_timeout_for(TransportKind::Websocket),
            Some(Duration::from_secs(5))
        );
    }
}
