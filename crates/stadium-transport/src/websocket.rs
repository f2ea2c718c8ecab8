//! WebSocket client transport.
//!
//! This module provides a WebSocket-based transport using tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::traits::{Connection, SessionId, Transport, TransportError};

/// WebSocket client transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Create a WebSocket transport.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, response) = connect_async(url).await.map_err(|e| match e {
            WsError::Url(e) => TransportError::InvalidUrl(e.to_string()),
            WsError::Io(e) => TransportError::Io(e),
            other => TransportError::ConnectFailed(other.to_string()),
        })?;

        let conn = WebSocketConnection::new(stream);
        debug!(session = %conn.id, status = %response.status(), "WebSocket handshake completed");
        Ok(Box::new(conn))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// A WebSocket session.
pub struct WebSocketConnection {
    id: SessionId,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    is_open: bool,
}

impl WebSocketConnection {
    fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self {
            id: SessionId::generate(),
            stream,
            is_open: true,
        }
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &SessionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Ok(Some(text)),
                    Err(e) => {
                        warn!(session = %self.id, "Dropping non-UTF-8 binary frame: {}", e);
                    }
                },
                Some(Ok(Message::Ping(_))) => {
                    // tungstenite queues the Pong; flush it out now.
                    if let Err(e) = self.stream.flush().await {
                        self.is_open = false;
                        return Err(TransportError::SendFailed(e.to_string()));
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    match frame {
                        Some(frame) => info!(
                            session = %self.id,
                            code = u16::from(frame.code),
                            reason = %frame.reason,
                            "WebSocket closed by peer"
                        ),
                        None => info!(session = %self.id, "WebSocket closed by peer"),
                    }
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!(session = %self.id, "WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    warn!(session = %self.id, "WebSocket error: {}", e);
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(());
        }

        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(format!("Failed to close: {}", e))),
        }
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    #[tokio::test]
    async fn test_exchange_with_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();

            ws.send(Message::Text("ping".into())).await.unwrap();
            let reply = ws.next().await.unwrap().unwrap();
            assert_eq!(reply, Message::Text("pong".into()));

            ws.send(Message::Ping(b"hb".to_vec())).await.unwrap();
            ws.send(Message::Binary(vec![0xff, 0xfe])).await.unwrap();
            ws.send(Message::Binary(br#"{"topic":"A","message":{}}"#.to_vec()))
                .await
                .unwrap();
            ws.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            })))
            .await
            .unwrap();

            // Drain until the client's close reply arrives.
            let mut saw_pong = false;
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Pong(payload) = msg {
                    assert_eq!(payload, b"hb".to_vec());
                    saw_pong = true;
                }
            }
            saw_pong
        });

        let transport = WebSocketTransport::new();
        let mut conn = transport.connect(&format!("ws://{addr}/ws")).await.unwrap();
        assert!(conn.is_open());

        assert_eq!(conn.recv().await.unwrap().as_deref(), Some("ping"));
        conn.send_text("pong".into()).await.unwrap();

        // The invalid binary frame is skipped.
        assert_eq!(
            conn.recv().await.unwrap().as_deref(),
            Some(r#"{"topic":"A","message":{}}"#)
        );
        assert_eq!(conn.recv().await.unwrap(), None);
        assert!(!conn.is_open());
        assert!(matches!(
            conn.send_text("late".into()).await,
            Err(TransportError::ConnectionClosed)
        ));

        drop(conn);
        assert!(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = WebSocketTransport::new()
            .connect(&format!("ws://{addr}/ws"))
            .await;
        assert!(matches!(
            result,
            Err(TransportError::Io(_) | TransportError::ConnectFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let result = WebSocketTransport::new().connect("http://").await;
        assert!(result.is_err());
    }
}
