//! Concurrency Gate
//!
//! Counting admission control in front of the telemetry source. A polling
//! loop must hold a [`GatePermit`] while its query is in flight; the permit
//! releases its slot when dropped, so every exit path (success, error,
//! timeout, cancellation) gives the slot back.
//!
//! The gate bounds concurrent *physical* queries. It is independent of the
//! per-session cap on logical streams and may be smaller than it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Gate errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GateError {
    /// The gate was closed while waiting
    #[error("concurrency gate closed")]
    Closed,
}

/// Counters kept by the gate
#[derive(Default)]
struct GateCounters {
    total_acquires: AtomicU64,
    total_releases: AtomicU64,
    total_wait_time_ms: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Snapshot of gate statistics
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateStats {
    /// Number of slots
    pub capacity: usize,
    /// Slots currently free
    pub available: usize,
    /// Permits currently held
    pub in_flight: usize,
    /// Highest number of permits held at once
    pub peak_in_flight: usize,
    /// Permits handed out
    pub total_acquires: u64,
    /// Permits returned
    pub total_releases: u64,
    /// Mean time spent waiting for a slot
    pub avg_wait_time_ms: u64,
}

/// Bounds the number of simultaneous queries against one source
pub struct ConcurrencyGate {
    semaphore: Semaphore,
    capacity: usize,
    counters: GateCounters,
}

impl ConcurrencyGate {
    /// Create a gate with `capacity` slots (at least one)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            counters: GateCounters::default(),
        }
    }

    /// Total number of slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free slot
    ///
    /// Cancel-safe: dropping the future before it resolves leaves the gate
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Closed`] if the gate was closed.
    pub async fn acquire(&self) -> Result<GatePermit<'_>, GateError> {
        let wait_start = Instant::now();
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| GateError::Closed)?;

        let waited = u64::try_from(wait_start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.counters
            .total_wait_time_ms
            .fetch_add(waited, Ordering::Relaxed);
        Ok(self.admit(permit))
    }

    /// Take a slot if one is free right now
    #[must_use]
    pub fn try_acquire(&self) -> Option<GatePermit<'_>> {
        self.semaphore.try_acquire().ok().map(|p| self.admit(p))
    }

    /// Close the gate; pending and future acquires fail
    pub fn close(&self) {
        self.semaphore.close();
    }

    fn admit<'a>(&'a self, permit: SemaphorePermit<'a>) -> GatePermit<'a> {
        self.counters.total_acquires.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.counters.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters
            .peak_in_flight
            .fetch_max(in_flight, Ordering::Relaxed);
        GatePermit {
            _permit: permit,
            gate: self,
        }
    }

    /// Get statistics
    #[must_use]
    pub fn stats(&self) -> GateStats {
        let acquires = self.counters.total_acquires.load(Ordering::Relaxed);
        let wait_time = self.counters.total_wait_time_ms.load(Ordering::Relaxed);
        GateStats {
            capacity: self.capacity,
            available: self.available(),
            in_flight: self.counters.in_flight.load(Ordering::Acquire),
            peak_in_flight: self.counters.peak_in_flight.load(Ordering::Relaxed),
            total_acquires: acquires,
            total_releases: self.counters.total_releases.load(Ordering::Relaxed),
            avg_wait_time_ms: if acquires > 0 { wait_time / acquires } else { 0 },
        }
    }
}

impl std::fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyGate")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}

/// A held gate slot (RAII guard)
#[derive(Debug)]
pub struct GatePermit<'a> {
    _permit: SemaphorePermit<'a>,
    gate: &'a ConcurrencyGate,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.gate.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.gate
            .counters
            .total_releases
            .fetch_add(1, Ordering::Relaxed);
    }
}
