//! Telemetry Source Abstraction
//!
//! The session stream manager never talks to hardware directly. It consumes
//! a [`TelemetrySource`]: an exclusive handle to one physical sensor
//! connection that answers one query for one sensor at a time.
//!
//! # Design Philosophy
//!
//! - Implementations own wire protocol and decoding details
//! - `query` may be called from several polling loops; callers bound
//!   concurrency with the [`ConcurrencyGate`](crate::gate::ConcurrencyGate),
//!   implementations serialize whatever remains
//! - `close` is idempotent and releases the physical resource
//!
//! Sources are opened per session through a [`SourceFactory`], so an open
//! failure can abort session setup cleanly.

mod elm327;
mod simulated;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::commands::CommandDescriptor;
use crate::config::{SourceKind, SourceSettings};

pub use elm327::{parse_response, Elm327Factory, Elm327Source};
pub use simulated::{SimulatedFactory, SimulatedSource};

/// Errors raised by a telemetry source
#[derive(Debug, Error)]
pub enum SourceError {
    /// Query did not complete in time
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    /// The device answered with an error or an unparseable response
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// The source could not be opened
    #[error("telemetry source unavailable: {0}")]
    Unavailable(String),

    /// The source was already closed
    #[error("telemetry source closed")]
    Closed,

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exclusive-access handle to a physical sensor connection
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Short description for logs (e.g. "elm327 192.168.0.10:35000")
    fn name(&self) -> &str;

    /// Query one sensor
    ///
    /// Returns `Ok(None)` when the device answered without a value.
    /// Implementations should give up after `timeout`; callers enforce it
    /// as well.
    async fn query(
        &self,
        command: &CommandDescriptor,
        timeout: Duration,
    ) -> Result<Option<f64>, SourceError>;

    /// Release the physical resource (idempotent)
    async fn close(&self) -> Result<(), SourceError>;
}

/// Opens a fresh source for a new session
#[async_trait]
pub trait SourceFactory: Send + Sync {
    /// Open the source
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Unavailable`] (or an I/O error) if the
    /// device cannot be reached or initialized.
    async fn open(&self) -> Result<Arc<dyn TelemetrySource>, SourceError>;
}

/// Build the factory selected by configuration
#[must_use]
pub fn create_source_factory(settings: &SourceSettings) -> Arc<dyn SourceFactory> {
    match settings.kind {
        SourceKind::Simulated => Arc::new(SimulatedFactory::new()),
        SourceKind::Elm327 => Arc::new(Elm327Factory::new(
            settings.address.clone(),
            settings.connect_timeout,
        )),
    }
}
