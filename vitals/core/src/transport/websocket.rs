//! WebSocket Transport
//!
//! Server side of a WebSocket connection. Text frames carry control
//! messages and readings; ping/pong is answered by tungstenite itself and
//! binary frames are ignored.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use super::{ChannelTransport, TransportError};

/// Transport over an accepted WebSocket connection
pub struct WebSocketTransport<S> {
    stream: WebSocketStream<S>,
    peer: String,
    closed: bool,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run the server handshake on `stream`
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Protocol`] if the handshake fails.
    pub async fn accept(
        stream: S,
        peer: impl Into<String>,
        max_message_size: usize,
    ) -> Result<Self, TransportError> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(max_message_size);
        config.max_frame_size = Some(max_message_size);

        let stream = tokio_tungstenite::accept_async_with_config(stream, Some(config))
            .await
            .map_err(|e| TransportError::Protocol(format!("handshake failed: {e}")))?;

        Ok(Self {
            stream,
            peer: peer.into(),
            closed: false,
        })
    }
}

#[async_trait]
impl<S> ChannelTransport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Close(frame))) => {
                    debug!(peer = %self.peer, ?frame, "Peer closed WebSocket");
                    return Ok(None);
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!(peer = %self.peer, "Ignoring binary frame");
                }
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(WsError::Io(e))) => return Err(TransportError::Io(e)),
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| {
                if is_closed(&e) {
                    TransportError::ConnectionClosed
                } else {
                    TransportError::SendFailed(e.to_string())
                }
            })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // A peer-initiated close was already answered by tungstenite
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(e) if is_closed(&e) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(e.to_string())),
        }
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Errors meaning the closing handshake already started
fn is_closed(err: &WsError) -> bool {
    matches!(
        err,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::SendAfterClosing)
    )
}
