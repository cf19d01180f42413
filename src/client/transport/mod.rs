//! # Client-Side Transports
//!
//! Concrete [`Transport`](crate::transport::Transport) implementations for
//! the dialing side. Unlike their server counterparts these own the
//! connection establishment: `open` dials, and the transport reports
//! `Open` on its event channel once packets can flow.

pub mod polling;
pub mod websocket;
pub mod webtransport;

pub use polling::ClientPollingTransport;
pub use websocket::ClientWebSocketTransport;
pub use webtransport::{ClientWebTransport, TcpDialer, WebTransportDialer};
