//! Stream handles and loop lifecycle

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Lifecycle of one polling loop
///
/// `Idle -> Running -> Cancelling -> Stopped`. `Stopped` is terminal; a
/// restarted stream gets a new handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    /// Spawned, first cycle not yet begun
    Idle,
    /// Polling
    Running,
    /// Stop requested, current cycle finishing
    Cancelling,
    /// Loop has exited
    Stopped,
}

impl LoopState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Cancelling,
            _ => Self::Stopped,
        }
    }

    /// Whether the loop has exited
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Stopped => "stopped",
        };
        write!(f, "{label}")
    }
}

/// Shared lifecycle flag written by the loop and read by the dispatcher
#[derive(Clone, Debug, Default)]
pub struct LoopStatus(Arc<AtomicU8>);

impl LoopStatus {
    /// Current state
    #[must_use]
    pub fn get(&self) -> LoopState {
        LoopState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// `Idle -> Running`; ignored once cancellation began
    pub fn mark_running(&self) {
        let _ = self.0.compare_exchange(
            LoopState::Idle as u8,
            LoopState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// `Idle | Running -> Cancelling`
    pub fn mark_cancelling(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match LoopState::from_u8(raw) {
                    LoopState::Idle | LoopState::Running => Some(LoopState::Cancelling as u8),
                    _ => None,
                }
            });
    }

    /// Any state -> `Stopped`
    pub fn mark_stopped(&self) {
        self.0.store(LoopState::Stopped as u8, Ordering::Release);
    }
}

/// Registry entry for one live stream
///
/// Dropping a handle cancels its loop.
pub struct StreamHandle {
    command: String,
    token: CancellationToken,
    status: LoopStatus,
    task: Option<JoinHandle<()>>,
    started_at: Instant,
}

impl StreamHandle {
    /// Wrap a spawned loop
    #[must_use]
    pub fn new(
        command: impl Into<String>,
        token: CancellationToken,
        status: LoopStatus,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            command: command.into(),
            token,
            status,
            task: Some(task),
            started_at: Instant::now(),
        }
    }

    /// Sensor this stream polls
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Current loop state
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.status.get()
    }

    /// How long the stream has existed
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Whether the loop has exited (normally or by panic)
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal() || self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Signal cancellation without waiting
    pub fn cancel(&self) {
        self.status.mark_cancelling();
        self.token.cancel();
    }

    /// Wait until the loop has exited
    ///
    /// Termination is observed, not assumed: this returns only after the
    /// task is done, so the loop can emit nothing afterwards.
    pub async fn wait(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(command = %self.command, error = %e, "Polling loop ended abnormally");
            }
        }
        self.status.mark_stopped();
    }

    /// Cancel and wait for termination
    pub async fn stop(mut self) {
        self.cancel();
        self.wait().await;
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("command", &self.command)
            .field("state", &self.state())
            .field("uptime", &self.uptime())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let status = LoopStatus::default();
        assert_eq!(status.get(), LoopState::Idle);

        status.mark_running();
        assert_eq!(status.get(), LoopState::Running);

        status.mark_cancelling();
        assert_eq!(status.get(), LoopState::Cancelling);

        // Cancellation is not undone by a late mark_running
        status.mark_running();
        assert_eq!(status.get(), LoopState::Cancelling);

        status.mark_stopped();
        assert_eq!(status.get(), LoopState::Stopped);

        status.mark_cancelling();
        assert_eq!(status.get(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_waits_for_task() {
        let token = CancellationToken::new();
        let status = LoopStatus::default();
        let task = {
            let token = token.clone();
            let status = status.clone();
            tokio::spawn(async move {
                status.mark_running();
                token.cancelled().await;
                status.mark_stopped();
            })
        };

        let handle = StreamHandle::new("rpm", token.clone(), status.clone(), task);
        assert_eq!(handle.command(), "rpm");
        handle.stop().await;

        assert!(token.is_cancelled());
        assert_eq!(status.get(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let token = CancellationToken::new();
        let task = tokio::spawn(std::future::pending::<()>());
        let handle = StreamHandle::new("speed", token.clone(), LoopStatus::default(), task);
        drop(handle);
        assert!(token.is_cancelled());
    }
}
