//! JSON-over-`WebSocket` connection to the authority server.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lockstep_types::{ClientMessage, ServerMessage};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};

use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An open connection speaking the room protocol.
pub struct ServerConnection {
    ws: WsStream,
}

impl ServerConnection {
    /// Open a connection to `url`, giving up after `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let attempt = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|elapsed| ClientError::Connect {
                url: url.to_owned(),
                reason: format!("no handshake within {} ms ({elapsed})", timeout.as_millis()),
            })?;
        let (ws, _response) = attempt.map_err(|e| ClientError::Connect {
            url: url.to_owned(),
            reason: e.to_string(),
        })?;
        info!(url, "connected to server");
        Ok(Self { ws })
    }

    /// Send one client frame.
    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
        let json = serde_json::to_string(message)?;
        self.ws
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    /// Receive the next server frame.
    ///
    /// Returns `Ok(None)` when the server closes the connection. Frames
    /// that are not valid server messages are logged and skipped. Safe to
    /// cancel between frames.
    pub async fn recv(&mut self) -> Result<Option<ServerMessage>, ClientError> {
        loop {
            let Some(frame) = self.ws.next().await else {
                return Ok(None);
            };
            match frame.map_err(|e| ClientError::Transport(e.to_string()))? {
                Message::Text(text) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => debug!(error = %e, "skipping unrecognised frame"),
                },
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
    }

    /// Close the connection politely.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        self.ws
            .close(None)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn stalled_handshake_times_out() {
        // Accepted by the kernel backlog, never answered.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let result = ServerConnection::connect(&url, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ClientError::Connect { reason, .. }) if reason.contains("100 ms")));
    }
}
