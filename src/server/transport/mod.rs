//! # Server-Side Transports
//!
//! Concrete [`Transport`](crate::transport::Transport) implementations for
//! the accepting side. Each is created around a connection the dispatcher
//! has already accepted and feeds decoded packets upward through its event
//! channel.

pub mod polling;
pub mod websocket;
pub mod webtransport;

pub use polling::PollingTransport;
pub use websocket::WebSocketTransport;
pub use webtransport::WebTransportTransport;
