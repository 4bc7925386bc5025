use std::time::Instant;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::warn;

use crate::protocol::{JoinRequest, MessageIn, ServerMessage};

#[derive(Debug)]
pub struct TransportError(pub String);

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport error: {}", self.0)
    }
}

impl std::error::Error for TransportError {}

/// Text-message transport under the signaling channel. The axum WebSocket is
/// the production implementation; tests inject an in-memory duplex.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Writes are serialized by the implementation (mutex-guarded sink).
    async fn send(&self, text: String) -> Result<(), TransportError>;
    /// Next text frame; `None` once the peer is gone.
    async fn recv(&self) -> Option<String>;
    async fn close(&self);
}

pub struct WsTransport {
    tx: Mutex<SplitSink<WebSocket, Message>>,
    rx: Mutex<SplitStream<WebSocket>>,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        let (tx, rx) = socket.split();
        WsTransport {
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        }
    }
}

#[async_trait]
impl SignalingTransport for WsTransport {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        self.tx
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError(e.to_string()))
    }

    async fn recv(&self) -> Option<String> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.next().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return None,
            }
        }
    }

    async fn close(&self) {
        let _ = self.tx.lock().await.send(Message::Close(None)).await;
    }
}

#[derive(Debug)]
pub enum JoinReadError {
    /// Socket died before any message: nothing to answer.
    SocketClosed,
    /// First message was not a parsable join envelope.
    NotAJoin,
    /// Join envelope carried an unusable payload.
    BadPayload(serde_json::Error),
}

impl std::fmt::Display for JoinReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinReadError::SocketClosed => write!(f, "socket closed before join"),
            JoinReadError::NotAJoin => write!(f, "first message was not a join"),
            JoinReadError::BadPayload(e) => write!(f, "join payload: {}", e),
        }
    }
}

impl std::error::Error for JoinReadError {}

/// Message-oriented channel bootstrapping a session: enforces join-first,
/// serializes outbound writes, parses the `{kind, payload}` envelope.
pub struct WsChannel {
    transport: std::sync::Arc<dyn SignalingTransport>,
    pub created_at: Instant,
}

impl WsChannel {
    pub fn new(transport: std::sync::Arc<dyn SignalingTransport>) -> Self {
        WsChannel {
            transport,
            created_at: Instant::now(),
        }
    }

    /// The first message must be a join; its payload is sanitized and bound
    /// to the server-assigned origin.
    pub async fn read_join(&self, origin: &str) -> Result<JoinRequest, JoinReadError> {
        let text = self
            .transport
            .recv()
            .await
            .ok_or(JoinReadError::SocketClosed)?;
        let envelope: MessageIn =
            serde_json::from_str(&text).map_err(|_| JoinReadError::NotAJoin)?;
        if envelope.kind != "join" {
            return Err(JoinReadError::NotAJoin);
        }
        let join: JoinRequest =
            serde_json::from_str(&envelope.payload).map_err(JoinReadError::BadPayload)?;
        Ok(join.sanitized(origin))
    }

    /// Next inbound envelope; unparsable frames are logged and skipped.
    pub async fn receive(&self) -> Option<MessageIn> {
        loop {
            let text = self.transport.recv().await?;
            match serde_json::from_str::<MessageIn>(&text) {
                Ok(m) => return Some(m),
                Err(e) => {
                    warn!(error = %e, "unparsable_ws_message");
                    continue;
                }
            }
        }
    }

    pub async fn send(&self, message: &ServerMessage) -> Result<(), TransportError> {
        let text = serde_json::to_string(message)
            .map_err(|e| TransportError(format!("serialize: {}", e)))?;
        self.transport.send(text).await
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    #[tokio::test]
    async fn test_read_join_accepts_join_first() {
        let (transport, client) = MockTransport::pair();
        let channel = WsChannel::new(transport);
        client.send_message("join", r#"{"roomId":"r1","userId":"u 1!"}"#);

        let join = channel.read_join("https://o.example").await.unwrap();
        assert_eq!(join.user_id, "u1");
        assert_eq!(join.origin, "https://o.example");
    }

    #[tokio::test]
    async fn test_read_join_rejects_other_first_message() {
        let (transport, client) = MockTransport::pair();
        let channel = WsChannel::new(transport);
        client.send_message("candidate", "{}");

        let err = channel.read_join("o").await.unwrap_err();
        assert!(matches!(err, JoinReadError::NotAJoin));
    }

    #[tokio::test]
    async fn test_read_join_socket_closed() {
        let (transport, client) = MockTransport::pair();
        drop(client);
        let channel = WsChannel::new(transport);
        let err = channel.read_join("o").await.unwrap_err();
        assert!(matches!(err, JoinReadError::SocketClosed));
    }

    #[tokio::test]
    async fn test_send_and_receive_envelopes() {
        let (transport, mut client) = MockTransport::pair();
        let channel = WsChannel::new(transport);

        channel.send(&ServerMessage::Start).await.unwrap();
        let msg = client.next_message().await.unwrap();
        assert_eq!(msg["kind"], "start");

        client.send_message("candidate", "the-candidate");
        let received = channel.receive().await.unwrap();
        assert_eq!(received.kind, "candidate");
        assert_eq!(received.payload, "the-candidate");
    }

    #[tokio::test]
    async fn test_receive_skips_garbage_frames() {
        let (transport, client) = MockTransport::pair();
        let channel = WsChannel::new(transport);
        client.send_raw("not json at all");
        client.send_message("answer", "sdp");
        let received = channel.receive().await.unwrap();
        assert_eq!(received.kind, "answer");
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (transport, _client) = MockTransport::pair();
        let channel = WsChannel::new(transport);
        channel.close().await;
        assert!(channel.send(&ServerMessage::Start).await.is_err());
    }
}
