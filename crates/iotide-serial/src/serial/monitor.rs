//! Serial monitor capture.
//!
//! Records the traffic of the active session into a bounded in-memory log
//! and exports it as plain text, timestamped lines, a hex dump or CSV.

use crate::serial::events::{EventKind, ListenerId, SerialEvent};
use crate::serial::session::SerialSessionManager;
use crate::serial::transport::lock;
use crate::serial::types::*;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Default number of entries kept in memory.
pub const DEFAULT_CAPACITY: usize = 10_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Entries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Data direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataDirection {
    Tx,
    Rx,
}

impl DataDirection {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tx => "TX",
            Self::Rx => "RX",
        }
    }

    pub fn arrow(&self) -> &'static str {
        match self {
            Self::Tx => "-->",
            Self::Rx => "<--",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub direction: DataDirection,
    pub text: String,
}

impl LogEntry {
    pub fn new(direction: DataDirection, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            direction,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExportFormat {
    #[default]
    PlainText,
    Timestamped,
    HexDump,
    Csv,
}

impl std::str::FromStr for ExportFormat {
    type Err = SerialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "plaintext" | "text" => Ok(Self::PlainText),
            "timestamped" => Ok(Self::Timestamped),
            "hex" | "hexdump" => Ok(Self::HexDump),
            "csv" => Ok(Self::Csv),
            other => Err(SerialError::new(
                SerialErrorKind::InvalidConfig,
                format!("Unknown export format '{}'", other),
            )),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Formatters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Format bytes as a hex dump (offset + hex + ASCII).
pub fn hex_dump(data: &[u8], offset: usize) -> String {
    let mut output = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        output.push_str(&format!("{:08X}  ", offset + i * 16));
        for (j, byte) in chunk.iter().enumerate() {
            output.push_str(&format!("{:02X} ", byte));
            if j == 7 {
                output.push(' ');
            }
        }
        for j in chunk.len()..16 {
            output.push_str("   ");
            if j == 7 {
                output.push(' ');
            }
        }
        output.push_str(" |");
        output.extend(chunk.iter().map(|&b| printable_char(b)));
        output.push_str("|\n");
    }
    output
}

/// Format a single byte as a printable character or dot.
pub fn printable_char(byte: u8) -> char {
    if byte.is_ascii_graphic() || byte == b' ' {
        byte as char
    } else {
        '.'
    }
}

pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(" ")
}

pub fn format_plain(entry: &LogEntry, direction_markers: bool) -> String {
    if direction_markers {
        format!("{} {}", entry.direction.arrow(), entry.text)
    } else {
        entry.text.clone()
    }
}

pub fn format_timestamped(entry: &LogEntry, direction_markers: bool) -> String {
    let ts = entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f");
    if direction_markers {
        format!("[{}] {} {}", ts, entry.direction.label(), entry.text)
    } else {
        format!("[{}] {}", ts, entry.text)
    }
}

pub fn format_hex_dump(entry: &LogEntry, offset: usize, direction_markers: bool) -> String {
    let mut output = String::new();
    if direction_markers {
        output.push_str(&format!(
            "--- {} {} bytes {} ---\n",
            entry.direction.label(),
            entry.text.len(),
            entry.timestamp.format("%H:%M:%S%.3f")
        ));
    }
    output.push_str(&hex_dump(entry.text.as_bytes(), offset));
    output
}

/// CSV: timestamp, direction, length, hex, ascii.
pub fn format_csv(entry: &LogEntry) -> String {
    let bytes = entry.text.as_bytes();
    let ascii: String = bytes.iter().map(|&b| printable_char(b)).collect();
    format!(
        "{},{},{},{},\"{}\"",
        entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        entry.direction.label(),
        bytes.len(),
        bytes_to_hex(bytes),
        ascii.replace('"', "\"\"")
    )
}

pub fn csv_header() -> &'static str {
    "Timestamp,Direction,Length,Hex,ASCII"
}

/// `serial-log-YYYY-MM-DD.txt`
pub fn default_export_file_name(date: NaiveDate) -> String {
    format!("serial-log-{}.txt", date.format("%Y-%m-%d"))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Monitor log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounded capture of session traffic. Cloning shares the same buffer.
#[derive(Clone)]
pub struct MonitorLog {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl Default for MonitorLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MonitorLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// Record every `data` event of `session` as an RX entry.
    pub fn attach(&self, session: &SerialSessionManager) -> ListenerId {
        let log = self.clone();
        session.on(EventKind::Data, move |event| {
            if let SerialEvent::Data(text) = event {
                log.record(LogEntry::new(DataDirection::Rx, text.clone()));
            }
        })
    }

    pub fn detach(&self, session: &SerialSessionManager, id: ListenerId) {
        session.off(EventKind::Data, id);
    }

    pub fn record_rx(&self, text: impl Into<String>) {
        self.record(LogEntry::new(DataDirection::Rx, text));
    }

    pub fn record_tx(&self, text: impl Into<String>) {
        self.record(LogEntry::new(DataDirection::Tx, text));
    }

    pub fn record(&self, entry: LogEntry) {
        let mut entries = lock(&self.entries);
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        lock(&self.entries).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    /// Render the whole log in `format`.
    pub fn export(&self, format: ExportFormat, direction_markers: bool) -> String {
        let entries = self.entries();
        let mut out = String::new();
        match format {
            ExportFormat::PlainText => {
                for e in &entries {
                    out.push_str(&format_plain(e, direction_markers));
                    out.push('\n');
                }
            }
            ExportFormat::Timestamped => {
                for e in &entries {
                    out.push_str(&format_timestamped(e, direction_markers));
                    out.push('\n');
                }
            }
            ExportFormat::HexDump => {
                let mut offset = 0;
                for e in &entries {
                    out.push_str(&format_hex_dump(e, offset, direction_markers));
                    offset += e.text.len();
                }
            }
            ExportFormat::Csv => {
                out.push_str(csv_header());
                out.push('\n');
                for e in &entries {
                    out.push_str(&format_csv(e));
                    out.push('\n');
                }
            }
        }
        out
    }

    /// Write an export into `dir` under the default dated file name.
    pub fn write_export(
        &self,
        dir: &Path,
        format: ExportFormat,
        direction_markers: bool,
    ) -> Result<PathBuf, SerialError> {
        let path = dir.join(default_export_file_name(Utc::now().date_naive()));
        self.write_export_to(&path, format, direction_markers)?;
        Ok(path)
    }

    pub fn write_export_to(
        &self,
        path: &Path,
        format: ExportFormat,
        direction_markers: bool,
    ) -> Result<(), SerialError> {
        std::fs::write(path, self.export(format, direction_markers)).map_err(|e| {
            SerialError::new(
                SerialErrorKind::StorageError,
                format!("Failed to write {}: {}", path.display(), e),
            )
        })?;
        log::info!("Exported {} monitor entries to {}", self.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::device_store::LastDeviceStore;
    use crate::serial::transport::SimulatedTransport;
    use std::time::Duration;

    #[test]
    fn test_default_export_file_name() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(default_export_file_name(date), "serial-log-2024-03-07.txt");
    }

    #[test]
    fn test_hex_dump_format() {
        let dump = hex_dump(b"Hello, World!", 0);
        assert!(dump.starts_with("00000000  48 65 6C 6C"));
        assert!(dump.contains("|Hello, World!|"));
    }

    #[test]
    fn test_printable_char() {
        assert_eq!(printable_char(b'A'), 'A');
        assert_eq!(printable_char(0x00), '.');
        assert_eq!(printable_char(0xFF), '.');
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let log = MonitorLog::new(2);
        log.record_rx("a");
        log.record_rx("b");
        log.record_tx("c");
        let texts: Vec<_> = log.entries().into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[test]
    fn test_plain_export_with_markers() {
        let log = MonitorLog::default();
        log.record_tx("print(1)");
        log.record_rx("1");
        assert_eq!(log.export(ExportFormat::PlainText, true), "--> print(1)\n<-- 1\n");
        assert_eq!(log.export(ExportFormat::PlainText, false), "print(1)\n1\n");
    }

    #[test]
    fn test_csv_export_escapes_quotes() {
        let log = MonitorLog::default();
        log.record_rx("say \"hi\"");
        let csv = log.export(ExportFormat::Csv, false);
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some(csv_header()));
        let row = lines.next().unwrap();
        assert!(row.contains(",RX,8,"));
        assert!(row.ends_with("\"say \"\"hi\"\"\""));
    }

    #[test]
    fn test_export_format_parsing() {
        assert_eq!("hex".parse::<ExportFormat>().unwrap(), ExportFormat::HexDump);
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("pdf".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn test_write_export_uses_dated_name() {
        let dir = tempfile::tempdir().unwrap();
        let log = MonitorLog::default();
        log.record_rx("boot ok");
        let path = log.write_export(dir.path(), ExportFormat::Timestamped, true).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("serial-log-") && name.ends_with(".txt"));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("RX boot ok"));
    }

    #[tokio::test]
    async fn test_attach_records_session_data() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedTransport::new();
        let session = SerialSessionManager::new(sim.clone(), LastDeviceStore::in_dir(dir.path()));
        let log = MonitorLog::default();
        let id = log.attach(&session);

        session
            .connect(Some(SimulatedTransport::default_port()), 115_200)
            .await
            .unwrap();
        sim.inject_rx(b"MicroPython v1.22\r\n");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].direction, DataDirection::Rx);

        log.detach(&session, id);
        sim.inject_rx(b"more");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(log.len(), 1);
    }
}
