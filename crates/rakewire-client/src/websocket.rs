//! WebSocket connector.
//!
//! This module provides a [`Connector`] backed by tokio-tungstenite. The
//! bearer token travels in the `Authorization` header of the upgrade request.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rakewire_protocol::{codec, ClientFrame, ServerFrame};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::traits::{ClientError, Connector, FrameSink, FrameStream, Session};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a Rakewire server over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    token: Option<String>,
}

impl WebSocketConnector {
    /// Create a connector for `url` (for example `ws://localhost:8080/ws`).
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
        }
    }

    /// Authenticate with a bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Target URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Session, ClientError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;

        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _response) = connect_async(request).await.map_err(|e| match e {
            WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
                ClientError::Unauthorized
            }
            other => ClientError::ConnectFailed(other.to_string()),
        })?;

        debug!(url = %self.url, "WebSocket connected");

        let (sink, stream) = socket.split();
        Ok(Session {
            sink: Box::new(WebSocketSink { sink }),
            stream: Box::new(WebSocketFrames { stream }),
        })
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

struct WebSocketSink {
    sink: SplitSink<Socket, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: &ClientFrame) -> Result<(), ClientError> {
        let text = codec::encode_client(frame)?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| ClientError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        self.sink
            .close()
            .await
            .map_err(|e| ClientError::SendFailed(format!("Failed to close: {e}")))
    }
}

struct WebSocketFrames {
    stream: SplitStream<Socket>,
}

#[async_trait]
impl FrameStream for WebSocketFrames {
    async fn recv(&mut self) -> Result<ServerFrame, ClientError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(codec::decode_server(&text)?),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Received close frame");
                    return Err(match frame {
                        Some(frame) => ClientError::Closed {
                            code: frame.code.into(),
                            reason: frame.reason.into_owned(),
                        },
                        None => ClientError::ConnectionClosed,
                    });
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    return Err(ClientError::ConnectionClosed);
                }
                Some(Err(e)) => return Err(ClientError::ReceiveFailed(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_builder() {
        let connector = WebSocketConnector::new("ws://localhost:8080/ws").with_token("abc");
        assert_eq!(connector.url(), "ws://localhost:8080/ws");
        assert_eq!(connector.token.as_deref(), Some("abc"));
        assert_eq!(connector.name(), "websocket");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = WebSocketConnector::new(format!("ws://127.0.0.1:{port}/ws"));
        assert!(matches!(
            connector.connect().await,
            Err(ClientError::ConnectFailed(_))
        ));
    }
}
