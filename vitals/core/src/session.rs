//! Session Management
//!
//! A session is one client connection bound to one telemetry source. It owns
//! everything the connection needs: the stream registry, the concurrency
//! gate, the outbound frame channel and the source handle. Nothing is shared
//! between sessions, so several can coexist without cross-talk.
//!
//! # Lifecycle
//!
//! ```text
//! establish ──► Active ──(channel closed | shutdown token | send failure)──►
//!              ShuttingDown ──(loops joined, source closed)──► Closed
//! ```
//!
//! [`Session::run`] is the dispatcher: it handles control messages in
//! arrival order and forwards frames queued by the polling loops. Every exit
//! path goes through [`Session::shutdown`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::commands::CommandRegistry;
use crate::config::{StreamingSettings, VitalsConfig};
use crate::gate::{ConcurrencyGate, GateStats};
use crate::protocol::{Action, ControlError, ControlMessage, Reply};
use crate::source::{SourceError, SourceFactory, TelemetrySource};
use crate::streaming::{
    spawn_polling_loop, PollingContext, StreamHandle, StreamRegisterError, StreamRegistry,
};
use crate::transport::{ChannelTransport, TransportError};

// ============================================================================
// Configuration and identity
// ============================================================================

/// Per-session limits and timings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Time between two queries of one stream
    pub update_interval: Duration,
    /// Upper bound on one query
    pub command_timeout: Duration,
    /// Gate capacity
    pub max_concurrent_tasks: usize,
    /// Stream cap
    pub max_concurrent_streams: usize,
    /// Outbound frames buffered before loops wait
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_streaming(&StreamingSettings::default(), 256)
    }
}

impl SessionConfig {
    /// Build from streaming settings
    #[must_use]
    pub fn from_streaming(streaming: &StreamingSettings, channel_capacity: usize) -> Self {
        Self {
            update_interval: streaming.update_interval,
            command_timeout: streaming.command_timeout,
            max_concurrent_tasks: streaming.max_concurrent_tasks,
            max_concurrent_streams: streaming.max_concurrent_streams,
            channel_capacity,
        }
    }

    /// Build from the daemon configuration
    #[must_use]
    pub fn from_config(config: &VitalsConfig) -> Self {
        Self::from_streaming(&config.streaming, config.server.channel_capacity)
    }
}

/// Unique session identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new identifier
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        write!(f, "session-{}", &simple[..8])
    }
}

/// Session state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Handling messages
    Active,
    /// Teardown in progress
    ShuttingDown,
    /// Loops joined, source and channel closed
    Closed,
}

/// Why a session ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndReason {
    /// Client closed the channel
    ChannelClosed,
    /// Reading from or writing to the channel failed
    TransportFailed(String),
    /// Process termination requested
    ShutdownRequested,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelClosed => write!(f, "channel closed"),
            Self::TransportFailed(e) => write!(f, "transport failed: {e}"),
            Self::ShutdownRequested => write!(f, "shutdown requested"),
        }
    }
}

/// What a finished session did
#[derive(Clone, Debug)]
pub struct SessionSummary {
    /// Session identifier
    pub id: SessionId,
    /// Streams started over the session's lifetime
    pub streams_started: u64,
    /// Control messages handled
    pub messages_handled: u64,
    /// Data frames delivered to the client
    pub frames_sent: u64,
    /// Gate statistics at the end
    pub gate: GateStats,
    /// Why the session ended
    pub end_reason: EndReason,
    /// Session lifetime
    pub duration: Duration,
}

/// Errors that end a session before it starts
#[derive(Debug, Error)]
pub enum SessionError {
    /// The telemetry source could not be opened
    #[error("could not open telemetry source: {0}")]
    SourceUnavailable(#[source] SourceError),

    /// The channel failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ============================================================================
// Session
// ============================================================================

/// One client connection and the streams it runs
pub struct Session<T: ChannelTransport> {
    id: SessionId,
    config: SessionConfig,
    state: SessionState,
    transport: T,
    registry: StreamRegistry,
    commands: Arc<CommandRegistry>,
    source: Arc<dyn TelemetrySource>,
    source_closed: bool,
    gate: Arc<ConcurrencyGate>,
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: mpsc::Receiver<String>,
    messages_handled: u64,
    frames_sent: u64,
    started_at: Instant,
}

impl<T: ChannelTransport> Session<T> {
    /// Create a session around an already opened source
    #[must_use]
    pub fn new(
        transport: T,
        source: Arc<dyn TelemetrySource>,
        commands: Arc<CommandRegistry>,
        config: SessionConfig,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.channel_capacity.max(1));
        Self {
            id: SessionId::new(),
            state: SessionState::Active,
            transport,
            registry: StreamRegistry::new(config.max_concurrent_streams),
            commands,
            source,
            source_closed: false,
            gate: Arc::new(ConcurrencyGate::new(config.max_concurrent_tasks)),
            outbound_tx,
            outbound_rx,
            messages_handled: 0,
            frames_sent: 0,
            started_at: Instant::now(),
            config,
        }
    }

    /// Open a source through `factory` and create the session
    ///
    /// # Errors
    ///
    /// If the source cannot be opened the client is told why, the channel is
    /// closed and [`SessionError::SourceUnavailable`] is returned.
    pub async fn establish(
        mut transport: T,
        factory: &dyn SourceFactory,
        commands: Arc<CommandRegistry>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        match factory.open().await {
            Ok(source) => {
                info!(peer = %transport.peer(), source = %source.name(), "Telemetry source opened");
                Ok(Self::new(transport, source, commands, config))
            }
            Err(e) => {
                let reason = match &e {
                    SourceError::Unavailable(why) => why.clone(),
                    other => other.to_string(),
                };
                warn!(peer = %transport.peer(), error = %e, "Telemetry source unavailable");
                Self::refuse(&mut transport, &reason).await;
                Err(SessionError::SourceUnavailable(e))
            }
        }
    }

    /// Tell the client the source is unavailable and close the channel
    pub async fn refuse(transport: &mut T, reason: &str) {
        let notice = format!("Telemetry source unavailable: {reason}");
        if let Err(e) = transport.send(notice).await {
            debug!(error = %e, "Could not deliver refusal");
        }
        if let Err(e) = transport.close().await {
            debug!(error = %e, "Could not close refused channel");
        }
    }

    /// Session identifier
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Limits and timings in effect
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Names of live streams, sorted
    #[must_use]
    pub fn active_streams(&self) -> Vec<String> {
        self.registry.active_names()
    }

    /// Gate statistics
    #[must_use]
    pub fn gate_stats(&self) -> GateStats {
        self.gate.stats()
    }

    /// Serve the client until the channel closes or `shutdown` fires
    ///
    /// Always runs [`shutdown`](Self::shutdown) before returning.
    pub async fn run(mut self, shutdown: CancellationToken) -> SessionSummary {
        let span = info_span!("session", session_id = %self.id, peer = %self.transport.peer());
        async move {
            info!("Session started");
            let end_reason = self.serve(&shutdown).await;
            self.shutdown().await;

            let summary = SessionSummary {
                id: self.id,
                streams_started: self.registry.total_streams_started(),
                messages_handled: self.messages_handled,
                frames_sent: self.frames_sent,
                gate: self.gate.stats(),
                end_reason,
                duration: self.started_at.elapsed(),
            };
            info!(
                reason = %summary.end_reason,
                streams = summary.streams_started,
                frames = summary.frames_sent,
                "Session ended"
            );
            summary
        }
        .instrument(span)
        .await
    }

    async fn serve(&mut self, shutdown: &CancellationToken) -> EndReason {
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return EndReason::ShutdownRequested,
                Some(frame) = self.outbound_rx.recv() => {
                    if let Err(e) = self.forward(frame).await {
                        return EndReason::TransportFailed(e.to_string());
                    }
                }
                inbound = self.transport.recv() => match inbound {
                    Ok(Some(text)) => {
                        let reply = self.handle_message(&text).await;
                        if let Err(e) = self.send_reply(reply).await {
                            return EndReason::TransportFailed(e.to_string());
                        }
                    }
                    Ok(None) => return EndReason::ChannelClosed,
                    Err(e) => return EndReason::TransportFailed(e.to_string()),
                },
            }
        }
    }

    async fn forward(&mut self, frame: String) -> Result<(), TransportError> {
        self.transport.send(frame).await?;
        self.frames_sent += 1;
        Ok(())
    }

    /// Send a reply to the client
    ///
    /// A `Stopped` reply goes out after every frame already queued, so
    /// nothing from the stopped stream can follow it. Other replies go out
    /// first so a new stream's frames never precede its `Started`.
    async fn send_reply(&mut self, reply: Reply) -> Result<(), TransportError> {
        if matches!(reply, Reply::Stopped(_)) {
            while let Ok(frame) = self.outbound_rx.try_recv() {
                self.forward(frame).await?;
            }
        }
        self.transport.send(reply.to_string()).await
    }

    /// Apply one control message and return the reply
    pub async fn handle_message(&mut self, text: &str) -> Reply {
        self.messages_handled += 1;

        let message = match ControlMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(input = %text.trim(), "Rejected control message");
                return Reply::Rejected(e);
            }
        };

        match message.action {
            Action::Start => self.start_stream(&message.command),
            Action::Stop => self.stop_stream(&message.command).await,
        }
    }

    fn start_stream(&mut self, name: &str) -> Reply {
        let Some(descriptor) = self.commands.lookup(name).cloned() else {
            return ControlError::UnknownCommand(name.to_string()).into();
        };

        let reaped = self.registry.reap_finished();
        if reaped > 0 {
            debug!(reaped, "Dropped finished streams");
        }

        if let Err(e) = self.registry.admit(name) {
            return self.admission_reply(name, e);
        }

        let handle = spawn_polling_loop(descriptor, self.polling_context());
        match self.registry.insert(handle) {
            Ok(()) => {
                info!(
                    command = %name,
                    active = self.registry.len(),
                    limit = self.registry.max_streams(),
                    "Stream started"
                );
                Reply::Started(name.to_string())
            }
            Err((e, handle)) => {
                handle.cancel();
                self.admission_reply(name, e)
            }
        }
    }

    fn admission_reply(&self, name: &str, err: StreamRegisterError) -> Reply {
        match err {
            StreamRegisterError::AlreadyRunning => Reply::AlreadyRunning(name.to_string()),
            StreamRegisterError::MaxStreamsReached { limit } => {
                debug!(command = %name, limit, "Stream cap reached");
                ControlError::CapacityExceeded { limit }.into()
            }
        }
    }

    async fn stop_stream(&mut self, name: &str) -> Reply {
        let Some(handle) = self.registry.get_mut(name) else {
            return Reply::NotRunning(name.to_string());
        };

        // Removed only after the loop is observed to have exited
        handle.cancel();
        handle.wait().await;
        self.registry.remove(name);

        info!(command = %name, active = self.registry.len(), "Stream stopped");
        Reply::Stopped(name.to_string())
    }

    fn polling_context(&self) -> PollingContext {
        PollingContext {
            source: Arc::clone(&self.source),
            gate: Arc::clone(&self.gate),
            outbound: self.outbound_tx.clone(),
            update_interval: self.config.update_interval,
            command_timeout: self.config.command_timeout,
        }
    }

    /// Stop every stream, close the source once and close the channel
    ///
    /// Idempotent. Loop termination is awaited for all streams in parallel
    /// before the source is released.
    pub async fn shutdown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::ShuttingDown;

        let handles = self.registry.drain();
        let stopped = handles.len();
        for handle in &handles {
            handle.cancel();
        }
        join_all(handles.into_iter().map(StreamHandle::stop)).await;

        let mut discarded = 0usize;
        while self.outbound_rx.try_recv().is_ok() {
            discarded += 1;
        }
        self.gate.close();

        if !self.source_closed {
            self.source_closed = true;
            match self.source.close().await {
                Ok(()) => debug!(source = %self.source.name(), "Telemetry source closed"),
                Err(e) => warn!(
                    source = %self.source.name(),
                    error = %e,
                    "Closing telemetry source failed"
                ),
            }
        }

        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "Closing channel failed");
        }

        self.state = SessionState::Closed;
        info!(stopped, discarded, "Session shut down");
    }
}

impl<T: ChannelTransport> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("streams", &self.registry.active_names())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SimulatedFactory, SimulatedSource};
    use crate::transport::InProcessTransport;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct Unreachable;

    #[async_trait]
    impl SourceFactory for Unreachable {
        async fn open(&self) -> Result<Arc<dyn TelemetrySource>, SourceError> {
            Err(SourceError::Unavailable("no adapter".to_string()))
        }
    }

    fn session(max_streams: usize) -> (Session<InProcessTransport>, Arc<SimulatedSource>) {
        let (transport, _client) = InProcessTransport::new_pair();
        let source = Arc::new(SimulatedSource::new());
        let config = SessionConfig {
            max_concurrent_streams: max_streams,
            ..SessionConfig::default()
        };
        let session = Session::new(
            transport,
            Arc::clone(&source) as Arc<dyn TelemetrySource>,
            Arc::new(CommandRegistry::standard()),
            config,
        );
        (session, source)
    }

    #[tokio::test]
    async fn test_start_stop_replies() {
        let (mut session, _source) = session(4);

        assert_eq!(session.handle_message("start rpm").await, Reply::Started("rpm".into()));
        assert_eq!(
            session.handle_message("START RPM").await,
            Reply::AlreadyRunning("rpm".into())
        );
        assert_eq!(session.active_streams(), vec!["rpm".to_string()]);

        assert_eq!(session.handle_message("stop rpm").await, Reply::Stopped("rpm".into()));
        assert_eq!(session.handle_message("stop rpm").await, Reply::NotRunning("rpm".into()));
        assert!(session.active_streams().is_empty());

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejections_leave_state_alone() {
        let (mut session, _source) = session(1);

        assert_eq!(
            session.handle_message("start").await,
            Reply::Rejected(ControlError::MalformedMessage)
        );
        assert_eq!(
            session.handle_message("start oil_pressure").await,
            Reply::Rejected(ControlError::UnknownCommand("oil_pressure".into()))
        );
        assert!(session.active_streams().is_empty());

        session.handle_message("start rpm").await;
        assert_eq!(
            session.handle_message("start speed").await,
            Reply::Rejected(ControlError::CapacityExceeded { limit: 1 })
        );
        assert_eq!(session.active_streams(), vec!["rpm".to_string()]);

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (mut session, source) = session(4);
        session.handle_message("start rpm").await;
        session.handle_message("start speed").await;

        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.active_streams().is_empty());
        assert!(source.is_closed());

        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_establish_refuses_without_source() {
        let (transport, mut client) = InProcessTransport::new_pair();
        let result = Session::establish(
            transport,
            &Unreachable,
            Arc::new(CommandRegistry::standard()),
            SessionConfig::default(),
        )
        .await;

        assert!(matches!(result, Err(SessionError::SourceUnavailable(_))));
        assert_eq!(
            client.recv().await,
            Some("Telemetry source unavailable: no adapter".to_string())
        );
        assert_eq!(client.recv().await, None);
    }

    #[tokio::test]
    async fn test_establish_with_simulated_source() {
        let (transport, _client) = InProcessTransport::new_pair();
        let mut session = tokio_test::assert_ok!(
            Session::establish(
                transport,
                &SimulatedFactory::new(),
                Arc::new(CommandRegistry::standard()),
                SessionConfig::default(),
            )
            .await
        );

        assert_eq!(session.state(), SessionState::Active);
        assert!(session.id().to_string().starts_with("session-"));
        session.shutdown().await;
    }
}
