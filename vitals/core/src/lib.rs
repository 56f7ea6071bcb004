//! Vitals Core - Session Stream Manager for Live Vehicle Telemetry
//!
//! This crate holds everything between a client channel and the vehicle's
//! telemetry source: control message parsing, per-sensor polling loops,
//! admission control and ordered teardown. The daemon only accepts
//! connections and hands each one to a [`Session`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Session                               │
//! │                                                               │
//! │  transport.recv() ──► dispatcher ──► StreamRegistry           │
//! │                          │              │  (one handle per    │
//! │                          │              │   sensor, capped)   │
//! │                          ▼              ▼                     │
//! │                       replies     polling loops ──► Gate ──► Source
//! │                          │              │                     │
//! │                          └──── outbound channel ──► transport.send()
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Control Protocol
//!
//! Clients send `start <sensor>` / `stop <sensor>` as text messages and
//! receive one reply per message plus a data frame `"<sensor>: <value>"` per
//! poll cycle, where `<value>` is a number, `N/A` or `Error`.
//!
//! # Module Overview
//!
//! - [`commands`]: Static catalogue of OBD-II sensors and their decoders
//! - [`protocol`]: Control message parsing, replies, data frames
//! - [`gate`]: Concurrency gate bounding physical queries
//! - [`source`]: Telemetry source trait, simulated and ELM327 sources
//! - [`streaming`]: Polling loops, stream handles, stream registry
//! - [`session`]: Dispatcher and shutdown coordinator
//! - [`transport`]: Client channel abstraction (in-process, WebSocket)
//! - [`config`]: TOML, environment and CLI configuration

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod commands;
pub mod config;
pub mod gate;
pub mod protocol;
pub mod session;
pub mod source;
pub mod streaming;
pub mod transport;

pub use commands::{CommandDescriptor, CommandRegistry, Decoder, STANDARD_COMMANDS};
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, ServerSettings, SourceKind, SourceSettings, StreamingSettings, VitalsConfig,
};
pub use gate::{ConcurrencyGate, GateError, GatePermit, GateStats};
pub use protocol::{Action, ControlError, ControlMessage, ReadingValue, Reply, TelemetryReading};
pub use session::{
    EndReason, Session, SessionConfig, SessionError, SessionId, SessionState, SessionSummary,
};
pub use source::{
    create_source_factory, Elm327Factory, Elm327Source, SimulatedFactory, SimulatedSource,
    SourceError, SourceFactory, TelemetrySource,
};
pub use streaming::{LoopState, StreamHandle, StreamRegistry};
pub use transport::{ChannelTransport, InProcessClient, InProcessTransport, TransportError};
#[cfg(feature = "websocket")]
pub use transport::WebSocketTransport;
