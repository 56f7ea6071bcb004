//! Streaming Infrastructure for Sensor Polling
//!
//! Each active stream is an independent polling loop owned by its session.
//! The session dispatcher keeps the loops in a [`StreamRegistry`]; every loop
//! pushes frames into one outbound channel that the session forwards to the
//! client.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      StreamRegistry                       │
//! │   ┌──────────────┐   ┌──────────────┐                     │
//! │   │ StreamHandle │   │ StreamHandle │   ...               │
//! │   │   ("rpm")    │   │  ("speed")   │                     │
//! │   └──────┬───────┘   └──────┬───────┘                     │
//! └──────────┼──────────────────┼─────────────────────────────┘
//!            │ cancel token     │
//!            ▼                  ▼
//!      polling loop       polling loop ──► ConcurrencyGate ──► TelemetrySource
//!            │                  │
//!            └───────┬──────────┘
//!                    ▼
//!            outbound channel ──► transport
//! ```
//!
//! # Features
//!
//! - **Independent streams**: start and stop one sensor without touching others
//! - **Prompt cancellation**: a stop interrupts the tick wait, the gate wait and
//!   the send, never only at the top of a cycle
//! - **Observed termination**: [`StreamHandle::stop`] returns after the loop
//!   task has exited

mod handle;
mod polling;
mod registry;

pub use handle::{LoopState, LoopStatus, StreamHandle};
pub use polling::{spawn_polling_loop, PollingContext};
pub use registry::{StreamRegisterError, StreamRegistry};
