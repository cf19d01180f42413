//! # Client Bootstrap
//!
//! Constructing a client session from a URI and options: endpoint parsing,
//! per-transport request URL construction, and the [`ClientSocket`] entry
//! point.

pub mod socket;
pub mod transport;

pub use socket::ClientSocket;

use crate::config::ClientOptions;
use crate::error::{EngineError, Result};
use crate::transport::TransportKind;
use crate::util::timestamp_token;

/// Open a session against `uri` with the given options.
///
/// The returned socket is in the `opening` state; the `Open` event on its
/// event stream marks handshake completion.
pub async fn connect(uri: &str, opts: ClientOptions) -> Result<ClientSocket> {
    ClientSocket::connect(uri, opts).await
}

/// Parsed server endpoint shared by all transports of one session.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    secure: bool,
    host: String,
    port: Option<u16>,
    path: String,
    protocol: u8,
    timestamp_param: String,
}

impl Endpoint {
    pub(crate) fn parse(uri: &str, opts: &ClientOptions) -> Result<Endpoint> {
        let url = url::Url::parse(uri).map_err(|err| EngineError::InvalidUrl(err.to_string()))?;

        let secure = matches!(url.scheme(), "https" | "wss");
        if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(EngineError::InvalidUrl(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| EngineError::InvalidUrl("missing host".to_string()))?
            .to_string();

        let mut path = opts.path.trim_end_matches('/').to_string();
        if opts.add_trailing_slash {
            path.push('/');
        }

        Ok(Endpoint {
            secure,
            host,
            port: url.port(),
            path,
            protocol: opts.protocol,
            timestamp_param: opts.timestamp_param.clone(),
        })
    }

    /// Host and port for a raw connection (WebTransport dialing)
    pub(crate) fn authority(&self) -> String {
        let port = self.port.unwrap_or(if self.secure { 443 } else { 80 });
        format!("{}:{}", self.host, port)
    }

    /// Build the request URL for one transport.
    ///
    /// Shape: `<scheme>://<host>[:<port>]<path>?EIO=<v>&transport=<name>`
    /// followed by the optional `sid`, `b64` and timestamp parameters.
    /// Default ports (80/443) are elided.
    pub(crate) fn request_url(
        &self,
        kind: TransportKind,
        sid: Option<&str>,
        b64: bool,
        timestamp: bool,
    ) -> String {
        let scheme = match kind {
            TransportKind::Polling => {
                if self.secure {
                    "https"
                } else {
                    "http"
                }
            }
            TransportKind::Websocket => {
                if self.secure {
                    "wss"
                } else {
                    "ws"
                }
            }
            TransportKind::Webtransport => "https",
        };

        let mut url = format!("{}://{}", scheme, self.host);
        if let Some(port) = self.port {
            let default = if self.secure { 443 } else { 80 };
            if port != default {
                url.push_str(&format!(":{}", port));
            }
        }
        url.push_str(&self.path);
        url.push_str(&format!("?EIO={}&transport={}", self.protocol, kind));
        if let Some(sid) = sid {
            url.push_str(&format!("&sid={}", sid));
        }
        if b64 {
            url.push_str("&b64=1");
        }
        if timestamp {
            url.push_str(&format!("&{}={}", self.timestamp_param, timestamp_token()));
        }
        url
    }
}
