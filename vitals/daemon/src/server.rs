//! Daemon Server Implementation
//!
//! This module provides the core server loop for the vitals daemon:
//! - Accepts TCP connections and upgrades them to WebSocket
//! - Runs one [`Session`] per connection
//! - Grants the telemetry source to one session at a time
//! - Shuts every session down before returning
//!
//! # Source Ownership
//!
//! ```text
//!                      DaemonServer
//!                           │
//!          ┌────────────────┼────────────────┐
//!          │                │                │
//!      client A         client B         client C
//!    (holds lease)    (refused: busy)  (refused: busy)
//!          │
//!       Session ──► TelemetrySource (vehicle)
//! ```
//!
//! The vehicle connection cannot be shared, so the first session holds the
//! source lease until it ends. Later clients get an explanatory message and
//! are disconnected.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use vitals_core::{
    create_source_factory, CommandRegistry, Session, SessionConfig, SourceFactory, VitalsConfig,
    WebSocketTransport,
};

/// Identifies one accepted connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state tracking
struct ConnectionState {
    /// When the connection was accepted
    connected_at: Instant,
    /// Remote address
    peer: SocketAddr,
    /// Whether this connection holds the source lease
    owns_source: bool,
}

/// State shared by the accept loop and connection handlers
struct Shared {
    config: VitalsConfig,
    commands: Arc<CommandRegistry>,
    factory: Arc<dyn SourceFactory>,
    source_lease: Arc<Semaphore>,
    connection_states: DashMap<ConnectionId, ConnectionState>,
}

/// The main daemon server
pub struct DaemonServer {
    shared: Arc<Shared>,
    tracker: TaskTracker,
    next_id: AtomicU64,
}

impl DaemonServer {
    /// Create a server using the source selected by `config`
    pub fn new(config: VitalsConfig) -> Self {
        let factory = create_source_factory(&config.source);
        Self::with_factory(config, factory)
    }

    /// Create a server with an explicit source factory
    pub fn with_factory(config: VitalsConfig, factory: Arc<dyn SourceFactory>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                commands: Arc::new(CommandRegistry::standard()),
                factory,
                source_lease: Arc::new(Semaphore::new(1)),
                connection_states: DashMap::new(),
            }),
            tracker: TaskTracker::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let address = self.shared.config.server.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind to {address}"))?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from `listener` until `shutdown` fires
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener.local_addr().context("Listener has no local address")?;
        info!(
            address = %local,
            sensors = self.shared.commands.len(),
            "Listening for connections"
        );

        loop {
            let (stream, peer) = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            if self.shared.connection_states.len() >= self.shared.config.server.max_connections {
                warn!(%peer, "Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let conn_id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
            self.shared.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer,
                    owns_source: false,
                },
            );

            info!(
                conn_id = %conn_id,
                %peer,
                active_connections = self.shared.connection_states.len(),
                "New connection accepted"
            );

            self.tracker.spawn(
                Self::handle_connection(
                    conn_id,
                    stream,
                    peer,
                    Arc::clone(&self.shared),
                    shutdown.clone(),
                )
                .instrument(info_span!("connection", %conn_id)),
            );
        }

        self.shutdown().await;
        Ok(())
    }

    /// Handle one client connection from handshake to teardown
    async fn handle_connection(
        conn_id: ConnectionId,
        stream: TcpStream,
        peer: SocketAddr,
        shared: Arc<Shared>,
        shutdown: CancellationToken,
    ) {
        let server = &shared.config.server;
        let handshake = tokio::time::timeout(
            server.handshake_timeout,
            WebSocketTransport::accept(stream, peer.to_string(), server.max_message_size),
        );
        let transport = tokio::select! {
            () = shutdown.cancelled() => {
                debug!("Shutdown during WebSocket handshake");
                shared.connection_states.remove(&conn_id);
                return;
            }
            result = handshake => match result {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => {
                    warn!(error = %e, "WebSocket handshake failed");
                    shared.connection_states.remove(&conn_id);
                    return;
                }
                Err(_) => {
                    warn!(
                        timeout_secs = server.handshake_timeout.as_secs_f64(),
                        "WebSocket handshake timed out"
                    );
                    shared.connection_states.remove(&conn_id);
                    return;
                }
            },
        };

        match Arc::clone(&shared.source_lease).try_acquire_owned() {
            Ok(lease) => {
                if let Some(mut state) = shared.connection_states.get_mut(&conn_id) {
                    state.owns_source = true;
                }

                let config = SessionConfig::from_config(&shared.config);
                match Session::establish(
                    transport,
                    shared.factory.as_ref(),
                    Arc::clone(&shared.commands),
                    config,
                )
                .await
                {
                    Ok(session) => {
                        let summary = session.run(shutdown).await;
                        info!(
                            session_id = %summary.id,
                            reason = %summary.end_reason,
                            streams_started = summary.streams_started,
                            frames_sent = summary.frames_sent,
                            peak_queries = summary.gate.peak_in_flight,
                            duration_secs = summary.duration.as_secs(),
                            "Session finished"
                        );
                    }
                    Err(e) => warn!(error = %e, "Session setup failed"),
                }
                drop(lease);
            }
            Err(_) => {
                let holder = shared
                    .connection_states
                    .iter()
                    .find(|entry| entry.value().owns_source)
                    .map(|entry| *entry.key());
                warn!(holder = ?holder, "Telemetry source busy, refusing client");

                let mut transport = transport;
                Session::refuse(&mut transport, "already in use by another client").await;
            }
        }

        let uptime = shared
            .connection_states
            .remove(&conn_id)
            .map(|(_, state)| state.connected_at.elapsed());
        info!(
            uptime_secs = uptime.map(|u| u.as_secs()),
            active_connections = shared.connection_states.len(),
            "Connection handler finished"
        );
    }

    /// Wait for every connection handler to run its session teardown
    async fn shutdown(&self) {
        info!(
            active_connections = self.connection_count(),
            "Initiating graceful shutdown"
        );
        self.tracker.close();
        self.tracker.wait().await;
        info!("Shutdown complete");
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.shared.connection_states.len()
    }

    /// Peers of open connections
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.shared
            .connection_states
            .iter()
            .map(|entry| entry.value().peer)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> VitalsConfig {
        let mut config = VitalsConfig::default();
        config.streaming.update_interval = Duration::from_millis(50);
        config.streaming.command_timeout = Duration::from_millis(500);
        config
    }

    type Running = (
        Arc<DaemonServer>,
        SocketAddr,
        CancellationToken,
        tokio::task::JoinHandle<Result<()>>,
    );

    async fn start_server() -> Running {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(DaemonServer::new(test_config()));
        let shutdown = CancellationToken::new();

        let task = {
            let server = Arc::clone(&server);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.serve(listener, shutdown).await })
        };
        (server, addr, shutdown, task)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .unwrap();
        client
    }

    async fn next_text(client: &mut Client) -> Option<String> {
        loop {
            match tokio::time::timeout(WAIT, client.next()).await.ok()?? {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(7).to_string(), "conn-7");
    }

    #[tokio::test]
    async fn test_client_streams_readings() {
        let (server, addr, shutdown, task) = start_server().await;
        let mut client = connect(addr).await;

        client.send(Message::Text("start rpm".to_string())).await.unwrap();
        assert_eq!(next_text(&mut client).await.as_deref(), Some("Started rpm."));
        assert_eq!(next_text(&mut client).await.as_deref(), Some("rpm: 850"));
        assert_eq!(next_text(&mut client).await.as_deref(), Some("rpm: 870"));
        assert_eq!(server.connection_count(), 1);
        assert_eq!(server.peers().len(), 1);

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_not_blocked_by_pending_handshake() {
        let (server, addr, shutdown, task) = start_server().await;

        // TCP connected, upgrade request never sent
        let _silent = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(WAIT, async {
            while server.connection_count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut config = test_config();
        config.server.handshake_timeout = Duration::from_millis(200);
        let server = Arc::new(DaemonServer::new(config));
        let shutdown = CancellationToken::new();
        let task = {
            let server = Arc::clone(&server);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.serve(listener, shutdown).await })
        };

        let _silent = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(WAIT, async {
            while server.connection_count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // The handler gives up on its own and frees the slot
        tokio::time::timeout(WAIT, async {
            while server.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_second_client_is_refused() {
        let (_server, addr, shutdown, task) = start_server().await;

        let mut first = connect(addr).await;
        first.send(Message::Text("start speed".to_string())).await.unwrap();
        assert_eq!(next_text(&mut first).await.as_deref(), Some("Started speed."));

        let mut second = connect(addr).await;
        let notice = next_text(&mut second).await.unwrap();
        assert!(notice.starts_with("Telemetry source unavailable"), "{notice}");
        assert_eq!(next_text(&mut second).await, None);

        // The first session is untouched
        assert!(next_text(&mut first).await.unwrap().starts_with("speed: "));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_lease_released_after_disconnect() {
        let (server, addr, shutdown, task) = start_server().await;

        let mut first = connect(addr).await;
        first.send(Message::Text("start rpm".to_string())).await.unwrap();
        assert_eq!(next_text(&mut first).await.as_deref(), Some("Started rpm."));
        first.close(None).await.unwrap();
        drop(first);

        tokio::time::timeout(WAIT, async {
            while server.connection_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let mut second = connect(addr).await;
        second.send(Message::Text("start rpm".to_string())).await.unwrap();
        assert_eq!(next_text(&mut second).await.as_deref(), Some("Started rpm."));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
