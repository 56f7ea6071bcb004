//! Per-sensor polling loop
//!
//! One loop per active stream. Each cycle waits for the next tick, takes a
//! gate slot, queries the source, releases the slot and queues one frame on
//! the session's outbound channel. The ticker is reset once the frame is
//! queued, so the next query starts a full interval after the last reading
//! no matter how long the query took. Cancellation is checked at every await
//! point so a stop never waits out a full interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use super::handle::{LoopStatus, StreamHandle};
use crate::commands::CommandDescriptor;
use crate::gate::ConcurrencyGate;
use crate::protocol::{ReadingValue, TelemetryReading};
use crate::source::{SourceError, TelemetrySource};

/// Everything a polling loop shares with its session
#[derive(Clone)]
pub struct PollingContext {
    /// Session's telemetry source
    pub source: Arc<dyn TelemetrySource>,
    /// Session's concurrency gate
    pub gate: Arc<ConcurrencyGate>,
    /// Frames go here; the session forwards them to the client
    pub outbound: mpsc::Sender<String>,
    /// Time between queries
    pub update_interval: Duration,
    /// Upper bound on a single query
    pub command_timeout: Duration,
}

impl std::fmt::Debug for PollingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingContext")
            .field("source", &self.source.name())
            .field("update_interval", &self.update_interval)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

/// Spawn the loop for `descriptor` and return its handle
#[must_use]
pub fn spawn_polling_loop(descriptor: CommandDescriptor, ctx: PollingContext) -> StreamHandle {
    let token = CancellationToken::new();
    let status = LoopStatus::default();
    let name = descriptor.name().to_string();

    let span = info_span!("poll", command = %name);
    let task = tokio::spawn(
        run_loop(descriptor, ctx, token.clone(), status.clone()).instrument(span),
    );

    StreamHandle::new(name, token, status, task)
}

async fn run_loop(
    descriptor: CommandDescriptor,
    ctx: PollingContext,
    token: CancellationToken,
    status: LoopStatus,
) {
    status.mark_running();
    debug!("Polling loop started");

    let mut ticker = tokio::time::interval(ctx.update_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycles: u64 = 0;

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let permit = tokio::select! {
            biased;
            () = token.cancelled() => break,
            permit = ctx.gate.acquire() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(error = %e, "Gate unavailable, stopping loop");
                    break;
                }
            },
        };

        let value = read_once(&descriptor, &ctx).await;
        drop(permit);

        let frame = TelemetryReading::new(descriptor.name(), value).to_frame();
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            sent = ctx.outbound.send(frame) => {
                if sent.is_err() {
                    debug!("Outbound channel closed");
                    break;
                }
            }
        }

        // Next cycle is a full interval after this reading
        ticker.reset();
        cycles += 1;
    }

    status.mark_stopped();
    debug!(cycles, "Polling loop stopped");
}

/// One query, bounded by the command timeout
///
/// Failures never end the loop; they become `Error` readings.
async fn read_once(descriptor: &CommandDescriptor, ctx: &PollingContext) -> ReadingValue {
    let query = ctx.source.query(descriptor, ctx.command_timeout);
    match tokio::time::timeout(ctx.command_timeout, query).await {
        Ok(Ok(Some(value))) => ReadingValue::Value(value),
        Ok(Ok(None)) => ReadingValue::NoData,
        Ok(Err(e)) => {
            warn!(error = %e, "Sensor query failed");
            ReadingValue::Error
        }
        Err(_) => {
            warn!(error = %SourceError::Timeout(ctx.command_timeout), "Sensor query failed");
            ReadingValue::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandRegistry;
    use crate::source::SimulatedSource;
    use async_trait::async_trait;

    /// Source that never answers
    struct Stalled;

    #[async_trait]
    impl TelemetrySource for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn query(
            &self,
            _command: &CommandDescriptor,
            _timeout: Duration,
        ) -> Result<Option<f64>, SourceError> {
            std::future::pending().await
        }

        async fn close(&self) -> Result<(), SourceError> {
            Ok(())
        }
    }

    fn context(
        source: Arc<dyn TelemetrySource>,
        capacity: usize,
    ) -> (PollingContext, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        let ctx = PollingContext {
            source,
            gate: Arc::new(ConcurrencyGate::new(capacity)),
            outbound: tx,
            update_interval: Duration::from_secs(1),
            command_timeout: Duration::from_secs(2),
        };
        (ctx, rx)
    }

    fn rpm() -> CommandDescriptor {
        CommandRegistry::standard().lookup("rpm").cloned().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_one_frame_per_interval() {
        let (ctx, mut rx) = context(Arc::new(SimulatedSource::new()), 1);
        let gate = Arc::clone(&ctx.gate);
        let handle = spawn_polling_loop(rpm(), ctx);

        // First tick fires immediately
        assert_eq!(rx.recv().await.unwrap(), "rpm: 850");
        assert_eq!(rx.recv().await.unwrap(), "rpm: 870");
        assert_eq!(rx.recv().await.unwrap(), "rpm: 890");

        handle.stop().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(gate.stats().total_acquires, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_error_reading() {
        let (ctx, mut rx) = context(Arc::new(Stalled), 1);
        let gate = Arc::clone(&ctx.gate);
        let handle = spawn_polling_loop(rpm(), ctx);

        assert_eq!(rx.recv().await.unwrap(), "rpm: Error");
        assert_eq!(gate.available(), 1);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_query_still_waits_full_interval() {
        let (ctx, mut rx) = context(Arc::new(Stalled), 1);
        let start = tokio::time::Instant::now();
        let handle = spawn_polling_loop(rpm(), ctx);

        // Each query times out after 2s, then the loop waits the 1s interval
        let mut emitted = Vec::new();
        for _ in 0..3 {
            assert_eq!(rx.recv().await.unwrap(), "rpm: Error");
            emitted.push(start.elapsed().as_secs());
        }
        assert_eq!(emitted, vec![2, 5, 8]);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_waiting_for_gate() {
        let (ctx, mut rx) = context(Arc::new(SimulatedSource::new()), 1);
        let gate = Arc::clone(&ctx.gate);
        let held = gate.try_acquire().expect("slot");

        let handle = spawn_polling_loop(rpm(), ctx);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());

        handle.stop().await;
        drop(held);
        assert!(rx.try_recv().is_err());
        assert_eq!(gate.stats().total_acquires, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_ends_loop() {
        let (ctx, rx) = context(Arc::new(SimulatedSource::new()), 1);
        drop(rx);
        let mut handle = spawn_polling_loop(rpm(), ctx);
        handle.wait().await;
        assert!(handle.state().is_terminal());
    }
}
