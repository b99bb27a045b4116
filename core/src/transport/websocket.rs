//! WebSocket implementation of the push link
use super::{Dialer, PushLink};
use crate::config::Config;
use crate::error::TransportError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Dials `{ws_base_url}/ws/{identity}`
#[derive(Debug, Clone)]
pub struct WsDialer {
    base_url: String,
}

impl WsDialer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.ws_base_url.clone())
    }

    pub fn url_for(&self, identity: &str) -> String {
        format!(
            "{}/ws/{}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(identity)
        )
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, identity: &str) -> Result<Box<dyn PushLink>, TransportError> {
        let url = self.url_for(identity);
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionLost(format!("connect {}: {}", url, e)))?;
        debug!(%url, "push channel handshake complete");
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushLink for WsLink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))
    }

    async fn recv_text(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("ignoring non-utf8 binary frame"),
                },
                Ok(WsMessage::Close(frame)) => {
                    debug!(?frame, "push channel closed by server");
                    return None;
                }
                // Control frames; tungstenite answers pings itself
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::ConnectionLost(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for_identity() {
        let dialer = WsDialer::new("ws://host/chat/api/");
        assert_eq!(dialer.url_for("alice"), "ws://host/chat/api/ws/alice");
        assert_eq!(dialer.url_for("al ice"), "ws://host/chat/api/ws/al%20ice");
    }
}
