//! Sensor Command Catalogue
//!
//! Static registry of the sensors a client may stream. Each
//! [`CommandDescriptor`] names a sensor, carries the OBD-II mode 01 PID used
//! to query it, and knows how to turn the raw response bytes into a value.
//!
//! The registry is built once at startup and shared read-only by every
//! session. Lookups are case-insensitive and return `None` for unknown names.

use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Decoding
// ============================================================================

/// How raw response bytes become a numeric magnitude
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decoder {
    /// `A * 100 / 255`
    Percent,
    /// `A - 40` (degrees Celsius)
    Temperature,
    /// `A` as-is
    Byte,
    /// `(256A + B) / 4` (engine RPM)
    QuarterWord,
    /// `256A + B`
    Word,
    /// `(256A + B) / 100` (mass air flow, g/s)
    CentiWord,
    /// `A / 2 - 64` (degrees before TDC)
    TimingAdvance,
}

impl Decoder {
    /// Number of data bytes the decoder consumes
    #[must_use]
    pub fn byte_len(self) -> usize {
        match self {
            Self::Percent | Self::Temperature | Self::Byte | Self::TimingAdvance => 1,
            Self::QuarterWord | Self::Word | Self::CentiWord => 2,
        }
    }

    /// Decode raw data bytes (the bytes after the mode/PID echo)
    ///
    /// Returns `None` if fewer bytes than required were supplied.
    #[must_use]
    pub fn decode(self, data: &[u8]) -> Option<f64> {
        if data.len() < self.byte_len() {
            return None;
        }
        let a = f64::from(data[0]);
        let word = || f64::from(u16::from_be_bytes([data[0], data[1]]));

        let value = match self {
            Self::Percent => a * 100.0 / 255.0,
            Self::Temperature => a - 40.0,
            Self::Byte => a,
            Self::QuarterWord => word() / 4.0,
            Self::Word => word(),
            Self::CentiWord => word() / 100.0,
            Self::TimingAdvance => a / 2.0 - 64.0,
        };
        Some(value)
    }
}

// ============================================================================
// Command Descriptor
// ============================================================================

/// Immutable description of one streamable sensor
#[derive(Clone, Debug, PartialEq)]
pub struct CommandDescriptor {
    name: &'static str,
    pid: u8,
    unit: &'static str,
    description: &'static str,
    decoder: Decoder,
}

impl CommandDescriptor {
    /// Create a mode 01 descriptor
    #[must_use]
    pub const fn new(
        name: &'static str,
        pid: u8,
        unit: &'static str,
        description: &'static str,
        decoder: Decoder,
    ) -> Self {
        Self {
            name,
            pid,
            unit,
            description,
            decoder,
        }
    }

    /// Client-facing name (lowercase)
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Mode 01 parameter ID
    #[must_use]
    pub fn pid(&self) -> u8 {
        self.pid
    }

    /// Unit of the decoded value
    #[must_use]
    pub fn unit(&self) -> &'static str {
        self.unit
    }

    /// Human-readable description
    #[must_use]
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Decoder for raw response bytes
    #[must_use]
    pub fn decoder(&self) -> Decoder {
        self.decoder
    }

    /// Request line sent to an ELM327-style adapter (without terminator)
    #[must_use]
    pub fn request(&self) -> String {
        format!("01{:02X}", self.pid)
    }

    /// Decode the data bytes of a response to this command
    #[must_use]
    pub fn decode(&self, data: &[u8]) -> Option<f64> {
        self.decoder.decode(data)
    }
}

impl fmt::Display for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (PID {:02X}, {})", self.name, self.pid, self.unit)
    }
}

/// Standard mode 01 sensors known to the daemon
#[rustfmt::skip]
pub const STANDARD_COMMANDS: &[CommandDescriptor] = &[
    CommandDescriptor::new("engine_load", 0x04, "%", "Calculated engine load", Decoder::Percent),
    CommandDescriptor::new("coolant_temp", 0x05, "degC", "Engine coolant temperature", Decoder::Temperature),
    CommandDescriptor::new("intake_pressure", 0x0B, "kPa", "Intake manifold pressure", Decoder::Byte),
    CommandDescriptor::new("rpm", 0x0C, "rpm", "Engine speed", Decoder::QuarterWord),
    CommandDescriptor::new("speed", 0x0D, "km/h", "Vehicle speed", Decoder::Byte),
    CommandDescriptor::new("timing_advance", 0x0E, "deg", "Timing advance", Decoder::TimingAdvance),
    CommandDescriptor::new("intake_temp", 0x0F, "degC", "Intake air temperature", Decoder::Temperature),
    CommandDescriptor::new("maf", 0x10, "g/s", "Mass air flow rate", Decoder::CentiWord),
    CommandDescriptor::new("throttle_pos", 0x11, "%", "Throttle position", Decoder::Percent),
    CommandDescriptor::new("run_time", 0x1F, "s", "Run time since engine start", Decoder::Word),
    CommandDescriptor::new("fuel_level", 0x2F, "%", "Fuel tank level input", Decoder::Percent),
    CommandDescriptor::new("barometric_pressure", 0x33, "kPa", "Absolute barometric pressure", Decoder::Byte),
];

// ============================================================================
// Registry
// ============================================================================

/// Read-only lookup table of known sensors
#[derive(Clone, Debug, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<&'static str, CommandDescriptor>,
}

impl CommandRegistry {
    /// Registry containing [`STANDARD_COMMANDS`]
    #[must_use]
    pub fn standard() -> Self {
        Self::with_commands(STANDARD_COMMANDS.iter().cloned())
    }

    /// Registry containing exactly the given descriptors
    pub fn with_commands(commands: impl IntoIterator<Item = CommandDescriptor>) -> Self {
        Self {
            commands: commands.into_iter().map(|c| (c.name, c)).collect(),
        }
    }

    /// Look up a sensor by name, ignoring case
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.get(name.to_ascii_lowercase().as_str())
    }

    /// Whether a sensor with this name exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// All sensor names, sorted
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.commands.keys().copied()
    }

    /// Number of known sensors
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = CommandRegistry::standard();
        assert_eq!(registry.lookup("RPM").map(CommandDescriptor::pid), Some(0x0C));
        assert_eq!(registry.lookup("Speed").map(CommandDescriptor::pid), Some(0x0D));
        assert!(registry.lookup("warp_drive").is_none());
    }

    #[test]
    fn test_standard_names_unique() {
        let registry = CommandRegistry::standard();
        assert_eq!(registry.len(), STANDARD_COMMANDS.len());
    }

    #[test]
    fn test_request_line() {
        let registry = CommandRegistry::standard();
        assert_eq!(registry.lookup("rpm").unwrap().request(), "010C");
        assert_eq!(registry.lookup("barometric_pressure").unwrap().request(), "0133");
    }

    #[test]
    fn test_decoders() {
        assert_eq!(Decoder::QuarterWord.decode(&[0x0D, 0x48]), Some(850.0));
        assert_eq!(Decoder::Temperature.decode(&[0x7B]), Some(83.0));
        assert_eq!(Decoder::Percent.decode(&[0xFF]), Some(100.0));
        assert_eq!(Decoder::TimingAdvance.decode(&[0x80]), Some(0.0));
        assert_eq!(Decoder::CentiWord.decode(&[0x01, 0xF4]), Some(5.0));
        assert_eq!(Decoder::Word.decode(&[0x01, 0x00]), Some(256.0));
    }

    #[test]
    fn test_decoder_short_input() {
        assert_eq!(Decoder::QuarterWord.decode(&[0x0D]), None);
        assert_eq!(Decoder::Byte.decode(&[]), None);
    }

    #[test]
    fn test_custom_registry() {
        let registry = CommandRegistry::with_commands([CommandDescriptor::new(
            "rpm",
            0x0C,
            "rpm",
            "Engine speed",
            Decoder::QuarterWord,
        )]);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["rpm"]);
        assert!(!registry.contains("speed"));
    }
}
