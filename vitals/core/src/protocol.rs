//! Client Control Protocol
//!
//! Plain text lines exchanged with the connected client:
//!
//! - Inbound control messages: `start <command>` / `stop <command>`
//! - Outbound replies, one per control message (see [`Reply`])
//! - Outbound data frames: `<command>: <value>` (see [`TelemetryReading`])
//!
//! Parsing is case-insensitive and requires exactly two whitespace-separated
//! tokens.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

// ============================================================================
// Inbound
// ============================================================================

/// Control action requested by the client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Begin streaming a sensor
    Start,
    /// Stop streaming a sensor
    Stop,
}

impl FromStr for Action {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            _ => Err(ControlError::MalformedMessage),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// A parsed control message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlMessage {
    /// Requested action
    pub action: Action,
    /// Sensor name, lowercased
    pub command: String,
}

impl ControlMessage {
    /// Parse one inbound text line
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::MalformedMessage`] unless the line is exactly
    /// an action followed by a command name.
    pub fn parse(line: &str) -> Result<Self, ControlError> {
        let mut tokens = line.split_whitespace();
        let (Some(action), Some(command), None) = (tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(ControlError::MalformedMessage);
        };

        Ok(Self {
            action: action.parse()?,
            command: command.to_ascii_lowercase(),
        })
    }
}

impl FromStr for ControlMessage {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// Outbound replies
// ============================================================================

/// Rejected control messages
///
/// None of these affect running streams or the session's lifetime.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    /// Not exactly `<start|stop> <command>`
    #[error("Invalid command format. Use: start <command> or stop <command>")]
    MalformedMessage,

    /// Command name is not in the catalogue
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// The session already runs the maximum number of streams
    #[error("Too many concurrent tasks ({limit} running). Stop a stream before starting another.")]
    CapacityExceeded {
        /// Configured stream limit
        limit: usize,
    },
}

/// Reply sent for every control message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Stream launched
    Started(String),
    /// Stream was already live; nothing changed
    AlreadyRunning(String),
    /// Stream fully terminated
    Stopped(String),
    /// No live stream with that name; nothing changed
    NotRunning(String),
    /// Message rejected
    Rejected(ControlError),
}

impl From<ControlError> for Reply {
    fn from(err: ControlError) -> Self {
        Self::Rejected(err)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started(name) => write!(f, "Started {name}."),
            Self::AlreadyRunning(name) => write!(f, "{name} task is already running."),
            Self::Stopped(name) => write!(f, "Stopped {name} stream."),
            Self::NotRunning(name) => write!(f, "No running task for {name}."),
            Self::Rejected(err) => write!(f, "{err}"),
        }
    }
}

// ============================================================================
// Outbound data
// ============================================================================

/// Value carried by a reading
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReadingValue {
    /// Decoded magnitude
    Value(f64),
    /// The source answered but had no value for this sensor
    NoData,
    /// The query failed or timed out
    Error,
}

impl fmt::Display for ReadingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Two decimals at most; whole numbers print without a fraction
            Self::Value(v) => write!(f, "{}", (v * 100.0).round() / 100.0),
            Self::NoData => write!(f, "N/A"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// One poll result for one stream
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryReading {
    /// Sensor name
    pub command: String,
    /// Value or sentinel
    pub value: ReadingValue,
    /// When the query completed
    pub timestamp: DateTime<Utc>,
}

impl TelemetryReading {
    /// Create a reading stamped now
    pub fn new(command: impl Into<String>, value: ReadingValue) -> Self {
        Self {
            command: command.into(),
            value,
            timestamp: Utc::now(),
        }
    }

    /// Render as an outbound data frame
    #[must_use]
    pub fn to_frame(&self) -> String {
        format!("{}: {}", self.command, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_start() {
        let msg = ControlMessage::parse("start rpm").unwrap();
        assert_eq!(msg.action, Action::Start);
        assert_eq!(msg.command, "rpm");
    }

    #[test]
    fn test_parse_case_insensitive_and_whitespace() {
        let msg: ControlMessage = "  STOP   Speed \n".parse().unwrap();
        assert_eq!(msg.action, Action::Stop);
        assert_eq!(msg.command, "speed");
    }

    #[test]
    fn test_parse_rejects_wrong_token_count() {
        for line in ["", "start", "start rpm now", "   "] {
            assert_eq!(
                ControlMessage::parse(line),
                Err(ControlError::MalformedMessage),
                "line {line:?}"
            );
        }
    }

    #[test]
    fn test_parse_rejects_unknown_action() {
        assert_eq!(
            ControlMessage::parse("pause rpm"),
            Err(ControlError::MalformedMessage)
        );
    }

    #[test]
    fn test_reply_text() {
        assert_eq!(Reply::Started("rpm".into()).to_string(), "Started rpm.");
        assert_eq!(
            Reply::AlreadyRunning("rpm".into()).to_string(),
            "rpm task is already running."
        );
        assert_eq!(Reply::Stopped("rpm".into()).to_string(), "Stopped rpm stream.");
        assert_eq!(
            Reply::NotRunning("speed".into()).to_string(),
            "No running task for speed."
        );
        assert_eq!(
            Reply::from(ControlError::UnknownCommand("warp".into())).to_string(),
            "Unknown command: warp"
        );
        assert!(Reply::from(ControlError::CapacityExceeded { limit: 1 })
            .to_string()
            .starts_with("Too many concurrent tasks"));
        assert!(Reply::from(ControlError::MalformedMessage)
            .to_string()
            .starts_with("Invalid command format"));
    }

    #[test]
    fn test_frames() {
        assert_eq!(
            TelemetryReading::new("rpm", ReadingValue::Value(850.0)).to_frame(),
            "rpm: 850"
        );
        assert_eq!(
            TelemetryReading::new("throttle_pos", ReadingValue::Value(36.078_431)).to_frame(),
            "throttle_pos: 36.08"
        );
        assert_eq!(
            TelemetryReading::new("speed", ReadingValue::NoData).to_frame(),
            "speed: N/A"
        );
        assert_eq!(
            TelemetryReading::new("speed", ReadingValue::Error).to_frame(),
            "speed: Error"
        );
    }
}
