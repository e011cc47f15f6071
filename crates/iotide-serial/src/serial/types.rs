//! Shared types for the device link crate.
//!
//! Covers port configuration, port descriptors, connection snapshots, the
//! persisted last-device record, and the error type shared by every layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Baud rate used when the caller does not pick one.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Port Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    #[serde(rename = "7")]
    Seven,
    #[serde(rename = "8")]
    Eight,
}

impl Default for DataBits {
    fn default() -> Self {
        Self::Eight
    }
}

impl DataBits {
    pub fn value(&self) -> u8 {
        match self {
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl Default for Parity {
    fn default() -> Self {
        Self::None
    }
}

impl Parity {
    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "N",
            Self::Odd => "O",
            Self::Even => "E",
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2")]
    Two,
}

impl Default for StopBits {
    fn default() -> Self {
        Self::One
    }
}

impl StopBits {
    pub fn label(&self) -> &'static str {
        match self {
            Self::One => "1",
            Self::Two => "2",
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowControl {
    None,
    /// Software flow control (XON/XOFF).
    XonXoff,
    /// Hardware flow control (RTS/CTS).
    RtsCts,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::None
    }
}

/// Complete serial port configuration.
///
/// The defaults are what every board the IDE talks to expects: 115200 baud,
/// 8 data bits, no parity, 1 stop bit, no flow control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialConfig {
    /// OS port name (e.g. `COM3`, `/dev/ttyUSB0`).
    pub port_name: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub data_bits: DataBits,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub stop_bits: StopBits,
    #[serde(default)]
    pub flow_control: FlowControl,
    /// Blocking read timeout used by the in-process reader thread.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_read_timeout() -> u64 {
    100
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            flow_control: FlowControl::default(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

impl SerialConfig {
    /// Default 8N1 configuration for `port_name` at `baud_rate`.
    pub fn for_port(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Short-hand like "115200 8N1".
    pub fn shorthand(&self) -> String {
        format!(
            "{} {}{}{}",
            self.baud_rate,
            self.data_bits.value(),
            self.parity.label(),
            self.stop_bits.label()
        )
    }
}

/// Line terminator appended by the REPL layer to every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LineEnding {
    /// `\n`
    Lf,
    /// `\r\n`
    CrLf,
    /// `\r`
    Cr,
}

impl Default for LineEnding {
    fn default() -> Self {
        Self::Lf
    }
}

impl LineEnding {
    /// Byte sequence for this line ending.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Lf => b"\n",
            Self::CrLf => b"\r\n",
            Self::Cr => b"\r",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Port Information
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Physical kind of a discovered port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortType {
    UsbSerial,
    Native,
    Bluetooth,
    Virtual,
    Unknown,
}

impl PortType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::UsbSerial => "USB Serial",
            Self::Native => "Native",
            Self::Bluetooth => "Bluetooth",
            Self::Virtual => "Virtual",
            Self::Unknown => "Unknown",
        }
    }
}

/// Snapshot of one discoverable serial endpoint, taken at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDescriptor {
    /// Backend-specific path or identifier.
    pub path: String,
    pub port_type: PortType,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    /// Human-readable name for pickers.
    pub display_name: String,
}

impl PortDescriptor {
    /// Descriptor that carries only a path, e.g. for a user-typed port name.
    pub fn from_path(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            display_name: path.clone(),
            path,
            port_type: PortType::Unknown,
            manufacturer: None,
            product: None,
            serial_number: None,
            vid: None,
            pid: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which transport implementation carries the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendKind {
    HostProcess,
    InProcess,
    Simulated,
}

impl BackendKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::HostProcess => "host-process",
            Self::InProcess => "in-process",
            Self::Simulated => "simulated",
        }
    }
}

/// The single live link to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub backend: BackendKind,
    pub port: PortDescriptor,
    pub baud_rate: u32,
    pub connected_at: DateTime<Utc>,
}

/// Persisted record of the last device that connected successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastDeviceRecord {
    pub path: String,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
    /// Save time in Unix milliseconds.
    pub timestamp: i64,
}

impl LastDeviceRecord {
    /// Records older than this are ignored by auto-connect.
    pub const MAX_AGE_MS: i64 = 7 * 24 * 60 * 60 * 1000;

    pub fn from_descriptor(port: &PortDescriptor, saved_at: DateTime<Utc>) -> Self {
        Self {
            path: port.path.clone(),
            manufacturer: port.manufacturer.clone(),
            serial_number: port.serial_number.clone(),
            timestamp: saved_at.timestamp_millis(),
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() - self.timestamp >= Self::MAX_AGE_MS
    }

    /// Descriptor used to reopen the recorded device.
    pub fn to_descriptor(&self) -> PortDescriptor {
        let mut port = PortDescriptor::from_path(self.path.clone());
        port.manufacturer = self.manufacturer.clone();
        port.serial_number = self.serial_number.clone();
        port
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Error kinds specific to device link operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SerialErrorKind {
    /// Neither transport backend is available in this environment.
    TransportNotSupported,
    /// The port is missing, busy, or access was denied.
    PortUnavailable,
    NotConnected,
    Timeout,
    /// The link dropped while an operation was in flight.
    Disconnected,
    IoError,
    /// The device answered with something unusable.
    DeviceError,
    StorageError,
    /// The host-process bridge violated its wire format.
    ProtocolError,
    InvalidConfig,
}

/// Structured device link error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialError {
    pub kind: SerialErrorKind,
    pub message: String,
    pub port_name: Option<String>,
}

impl std::fmt::Display for SerialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for SerialError {}

impl SerialError {
    pub fn new(kind: SerialErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            port_name: None,
        }
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port_name = Some(port.into());
        self
    }

    pub fn not_connected() -> Self {
        Self::new(SerialErrorKind::NotConnected, "Device not connected")
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            SerialErrorKind::Timeout,
            format!("Command timeout after {} ms", timeout_ms),
        )
    }

    pub fn disconnected() -> Self {
        Self::new(SerialErrorKind::Disconnected, "Device disconnected")
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(SerialErrorKind::IoError, message)
    }

    pub fn is(&self, kind: SerialErrorKind) -> bool {
        self.kind == kind
    }

    /// Operator-facing message.
    pub fn user_message(&self) -> String {
        match self.kind {
            SerialErrorKind::NotConnected => "Device not connected".to_string(),
            SerialErrorKind::Timeout => format!("Timed out: {}", self.message),
            SerialErrorKind::TransportNotSupported => {
                format!("Serial access not supported: {}", self.message)
            }
            SerialErrorKind::PortUnavailable => match &self.port_name {
                Some(port) => format!("Port {} unavailable: {}", port, self.message),
                None => format!("Port unavailable: {}", self.message),
            },
            SerialErrorKind::Disconnected => "Device disconnected".to_string(),
            _ => format!("Device error: {}", self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_config_defaults_are_115200_8n1() {
        let cfg = SerialConfig::default();
        assert_eq!(cfg.baud_rate, 115_200);
        assert_eq!(cfg.data_bits, DataBits::Eight);
        assert_eq!(cfg.parity, Parity::None);
        assert_eq!(cfg.stop_bits, StopBits::One);
        assert_eq!(cfg.flow_control, FlowControl::None);
        assert_eq!(cfg.shorthand(), "115200 8N1");
    }

    #[test]
    fn test_config_deserialize_fills_defaults() {
        let cfg: SerialConfig = serde_json::from_str(r#"{"portName":"COM4"}"#).unwrap();
        assert_eq!(cfg.port_name, "COM4");
        assert_eq!(cfg.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(cfg.read_timeout_ms, 100);
    }

    #[test]
    fn test_line_ending_bytes() {
        assert_eq!(LineEnding::Lf.bytes(), b"\n");
        assert_eq!(LineEnding::CrLf.bytes(), b"\r\n");
        assert_eq!(LineEnding::Cr.bytes(), b"\r");
        assert_eq!(LineEnding::default(), LineEnding::Lf);
    }

    #[test]
    fn test_last_device_record_json_shape() {
        let record = LastDeviceRecord {
            path: "/dev/ttyUSB0".to_string(),
            manufacturer: Some("Silicon Labs".to_string()),
            serial_number: Some("0001".to_string()),
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["path"], "/dev/ttyUSB0");
        assert_eq!(json["serialNumber"], "0001");
        assert_eq!(json["timestamp"], 1_700_000_000_000i64);
    }

    #[test]
    fn test_last_device_record_staleness() {
        let now = Utc::now();
        let port = PortDescriptor::from_path("COM3");
        let fresh = LastDeviceRecord::from_descriptor(&port, now - Duration::days(6));
        let stale = LastDeviceRecord::from_descriptor(&port, now - Duration::days(8));
        assert!(!fresh.is_stale(now));
        assert!(stale.is_stale(now));
    }

    #[test]
    fn test_serial_error_user_messages_are_distinct() {
        let nc = SerialError::not_connected().user_message();
        let to = SerialError::timeout(2000).user_message();
        let dev = SerialError::io("broken pipe").user_message();
        assert!(nc.contains("not connected"));
        assert!(to.contains("Timed out"));
        assert!(dev.starts_with("Device error"));
        assert_ne!(nc, to);
    }

    #[test]
    fn test_serial_error_with_port() {
        let err = SerialError::new(SerialErrorKind::PortUnavailable, "busy").with_port("COM9");
        assert_eq!(err.port_name.as_deref(), Some("COM9"));
        assert!(err.user_message().contains("COM9"));
        assert!(err.is(SerialErrorKind::PortUnavailable));
    }
}
