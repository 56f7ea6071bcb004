//! Simulated telemetry source
//!
//! Produces deterministic, plausible readings for every standard sensor so the
//! daemon runs without hardware. Each sensor walks a small sawtooth around an
//! idle-engine baseline, e.g. `rpm` yields 850, 870, 890, ... then wraps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{SourceError, SourceFactory, TelemetrySource};
use crate::commands::CommandDescriptor;

/// Sawtooth profile: `base + step * (n % span)`
#[derive(Clone, Copy, Debug)]
struct Profile {
    base: f64,
    step: f64,
    span: u32,
}

fn profile_for(name: &str) -> Option<Profile> {
    let (base, step, span) = match name {
        "rpm" => (850.0, 20.0, 10),
        "speed" => (0.0, 5.0, 20),
        "engine_load" => (22.0, 1.5, 8),
        "coolant_temp" => (88.0, 1.0, 5),
        "intake_pressure" => (33.0, 2.0, 6),
        "timing_advance" => (8.0, 0.5, 8),
        "intake_temp" => (24.0, 1.0, 4),
        "maf" => (3.2, 0.15, 10),
        "throttle_pos" => (14.5, 0.8, 6),
        "run_time" => (0.0, 1.0, u32::MAX),
        "fuel_level" => (62.0, -0.1, 50),
        "barometric_pressure" => (101.0, 0.0, 1),
        _ => return None,
    };
    Some(Profile { base, step, span })
}

/// In-memory source with deterministic values
pub struct SimulatedSource {
    ticks: Mutex<HashMap<String, u32>>,
    closed: AtomicBool,
}

impl SimulatedSource {
    /// Create an open simulated source
    #[must_use]
    pub fn new() -> Self {
        Self {
            ticks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySource for SimulatedSource {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn query(
        &self,
        command: &CommandDescriptor,
        _timeout: Duration,
    ) -> Result<Option<f64>, SourceError> {
        if self.is_closed() {
            return Err(SourceError::Closed);
        }

        // Sensors without a profile behave like a vehicle that lacks them
        let Some(profile) = profile_for(command.name()) else {
            return Ok(None);
        };

        let n = {
            let mut ticks = self.ticks.lock();
            let tick = ticks.entry(command.name().to_string()).or_insert(0);
            let n = *tick;
            *tick = tick.wrapping_add(1);
            n
        };

        Ok(Some(profile.base + profile.step * f64::from(n % profile.span)))
    }

    async fn close(&self) -> Result<(), SourceError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens a fresh [`SimulatedSource`] per session
#[derive(Clone, Debug, Default)]
pub struct SimulatedFactory;

impl SimulatedFactory {
    /// Create the factory
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SourceFactory for SimulatedFactory {
    async fn open(&self) -> Result<Arc<dyn TelemetrySource>, SourceError> {
        Ok(Arc::new(SimulatedSource::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CommandRegistry, Decoder};

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_rpm_sequence() {
        let source = SimulatedSource::new();
        let registry = CommandRegistry::standard();
        let rpm = registry.lookup("rpm").unwrap();

        let mut values = Vec::new();
        for _ in 0..3 {
            values.push(source.query(rpm, TIMEOUT).await.unwrap());
        }
        assert_eq!(values, vec![Some(850.0), Some(870.0), Some(890.0)]);
    }

    #[tokio::test]
    async fn test_every_standard_command_has_a_value() {
        let source = SimulatedSource::new();
        let registry = CommandRegistry::standard();
        for name in registry.names() {
            let command = registry.lookup(name).unwrap();
            assert!(
                source.query(command, TIMEOUT).await.unwrap().is_some(),
                "{name} should have a simulated value"
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_sensor_has_no_data() {
        let source = SimulatedSource::new();
        let oil =
            CommandDescriptor::new("oil_temp", 0x5C, "degC", "Oil temperature", Decoder::Temperature);
        assert_eq!(source.query(&oil, TIMEOUT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_source_rejects_queries() {
        let source = SimulatedSource::new();
        source.close().await.unwrap();
        source.close().await.unwrap();
        assert!(source.is_closed());

        let registry = CommandRegistry::standard();
        let result = source.query(registry.lookup("speed").unwrap(), TIMEOUT).await;
        assert!(matches!(result, Err(SourceError::Closed)));
    }
}
