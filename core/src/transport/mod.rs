//! Push channel: one live link per session, typed events, reconnect and keepalive
use crate::error::TransportError;
use async_trait::async_trait;

mod adapter;
mod websocket;

pub use adapter::{backoff_delay, TransportAdapter, TransportEvent, TransportHandle, TransportSettings};
pub use websocket::WsDialer;

/// Opens push links for an identity.
///
/// Production uses [`WsDialer`]; tests plug in an in-memory link.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, identity: &str) -> Result<Box<dyn PushLink>, TransportError>;
}

/// One established bidirectional text link
#[async_trait]
pub trait PushLink: Send + 'static {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound text frame, `None` once the peer closed the link.
    ///
    /// Must be cancel-safe: the adapter polls it inside `select!`.
    async fn recv_text(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}
