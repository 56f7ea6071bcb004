//! In-Process Transport
//!
//! Channel-backed transport used when the client lives in the same process,
//! mostly by tests driving a session end to end.
//!
//! # Usage
//!
//! ```ignore
//! let (transport, mut client) = InProcessTransport::new_pair();
//! tokio::spawn(session.run(shutdown));
//!
//! client.send("start rpm").await?;
//! assert_eq!(client.recv().await, Some("Started rpm.".into()));
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ChannelTransport, TransportError};

const DEFAULT_CAPACITY: usize = 100;

/// Session side of an in-process channel
#[derive(Debug)]
pub struct InProcessTransport {
    inbound: mpsc::Receiver<String>,
    outbound: Option<mpsc::Sender<String>>,
}

/// Client side of an in-process channel
#[derive(Debug)]
pub struct InProcessClient {
    to_session: Option<mpsc::Sender<String>>,
    from_session: mpsc::Receiver<String>,
}

impl InProcessTransport {
    /// Create a connected transport/client pair
    #[must_use]
    pub fn new_pair() -> (Self, InProcessClient) {
        Self::new_pair_with_capacity(DEFAULT_CAPACITY)
    }

    /// Create with custom channel capacity
    #[must_use]
    pub fn new_pair_with_capacity(capacity: usize) -> (Self, InProcessClient) {
        let (to_session, inbound) = mpsc::channel(capacity.max(1));
        let (outbound, from_session) = mpsc::channel(capacity.max(1));

        let transport = Self {
            inbound,
            outbound: Some(outbound),
        };
        let client = InProcessClient {
            to_session: Some(to_session),
            from_session,
        };

        (transport, client)
    }
}

#[async_trait]
impl ChannelTransport for InProcessTransport {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.inbound.recv().await)
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?;
        outbound
            .send(text)
            .await
            .map_err(|_| TransportError::SendFailed("client dropped".to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outbound = None;
        self.inbound.close();
        Ok(())
    }

    fn peer(&self) -> String {
        "in-process".to_string()
    }
}

impl InProcessClient {
    /// Send a message to the session
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the session side is
    /// gone or the client already closed.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        let tx = self
            .to_session
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?;
        tx.send(text.into())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Next message from the session; `None` once the session closed
    pub async fn recv(&mut self) -> Option<String> {
        self.from_session.recv().await
    }

    /// Next message, or `None` if nothing arrives within `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.from_session.recv())
            .await
            .ok()
            .flatten()
    }

    /// Message already queued, if any
    pub fn try_recv(&mut self) -> Option<String> {
        self.from_session.try_recv().ok()
    }

    /// Close the client side; the session sees end of stream
    pub fn close(&mut self) {
        self.to_session = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_process_roundtrip() {
        let (mut transport, mut client) = InProcessTransport::new_pair();

        client.send("start rpm").await.unwrap();
        assert_eq!(transport.recv().await.unwrap(), Some("start rpm".to_string()));

        transport.send("Started rpm.".to_string()).await.unwrap();
        assert_eq!(client.recv().await, Some("Started rpm.".to_string()));
    }

    #[tokio::test]
    async fn test_client_close_is_end_of_stream() {
        let (mut transport, mut client) = InProcessTransport::new_pair();
        client.close();
        assert_eq!(transport.recv().await.unwrap(), None);
        assert!(client.send("late").await.is_err());
    }

    #[tokio::test]
    async fn test_transport_close_is_idempotent() {
        let (mut transport, mut client) = InProcessTransport::new_pair();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        assert!(matches!(
            transport.send("x".to_string()).await,
            Err(TransportError::ConnectionClosed)
        ));
        assert_eq!(client.recv().await, None);
    }
}
