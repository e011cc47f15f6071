//! Persistence for the last device that connected successfully.
//!
//! The record lives in a small JSON file named after the storage key
//! `iot-ide-last-device`. Anything that cannot be read back cleanly
//! (missing, unreadable, malformed, older than seven days) is treated as
//! "no record".

use crate::serial::types::*;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Storage key of the last-device record.
pub const LAST_DEVICE_KEY: &str = "iot-ide-last-device";

#[derive(Debug, Clone)]
pub struct LastDeviceStore {
    file: PathBuf,
}

impl LastDeviceStore {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self { file: file.into() }
    }

    /// Store the record as `<dir>/iot-ide-last-device.json`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(format!("{}.json", LAST_DEVICE_KEY)))
    }

    /// `<data dir>/iotide/iot-ide-last-device.json`, falling back to the
    /// working directory when the platform has no data directory.
    pub fn default_location() -> Self {
        let base = dirs::data_dir()
            .map(|d| d.join("iotide"))
            .unwrap_or_else(|| PathBuf::from("."));
        Self::in_dir(base)
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    pub fn load(&self) -> Option<LastDeviceRecord> {
        self.load_at(Utc::now())
    }

    /// Load, judging staleness against `now`.
    pub fn load_at(&self, now: DateTime<Utc>) -> Option<LastDeviceRecord> {
        let raw = match std::fs::read_to_string(&self.file) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("Cannot read {}: {}", self.file.display(), e);
                return None;
            }
        };
        let record: LastDeviceRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Ignoring malformed last-device record: {}", e);
                return None;
            }
        };
        if record.is_stale(now) {
            log::debug!("Last-device record for {} is stale", record.path);
            return None;
        }
        Some(record)
    }

    pub fn save(&self, port: &PortDescriptor) -> Result<(), SerialError> {
        self.save_record(&LastDeviceRecord::from_descriptor(port, Utc::now()))
    }

    pub fn save_record(&self, record: &LastDeviceRecord) -> Result<(), SerialError> {
        let storage_err = |e: &dyn std::fmt::Display| {
            SerialError::new(SerialErrorKind::StorageError, format!("{}: {}", self.file.display(), e))
        };
        if let Some(parent) = self.file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| storage_err(&e))?;
        }
        let json = serde_json::to_string_pretty(record).map_err(|e| storage_err(&e))?;
        std::fs::write(&self.file, json).map_err(|e| storage_err(&e))?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), SerialError> {
        match std::fs::remove_file(&self.file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SerialError::new(SerialErrorKind::StorageError, e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(path: &str, saved_at: DateTime<Utc>) -> LastDeviceRecord {
        LastDeviceRecord {
            path: path.to_string(),
            manufacturer: Some("FTDI".to_string()),
            serial_number: None,
            timestamp: saved_at.timestamp_millis(),
        }
    }

    #[test]
    fn test_file_named_after_storage_key() {
        let store = LastDeviceStore::in_dir("/tmp/x");
        assert!(store.path().ends_with("iot-ide-last-device.json"));
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LastDeviceStore::in_dir(dir.path()).load().is_none());
    }

    #[test]
    fn test_round_trip_fresh_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = LastDeviceStore::in_dir(dir.path().join("nested"));
        let now = Utc::now();
        store.save_record(&record("COM7", now - Duration::days(1))).unwrap();
        let loaded = store.load_at(now).unwrap();
        assert_eq!(loaded.path, "COM7");
    }

    #[test]
    fn test_stale_record_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = LastDeviceStore::in_dir(dir.path());
        let now = Utc::now();
        store.save_record(&record("COM7", now - Duration::days(8))).unwrap();
        assert!(store.load_at(now).is_none());
    }

    #[test]
    fn test_malformed_record_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = LastDeviceStore::in_dir(dir.path());
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LastDeviceStore::in_dir(dir.path());
        store.save(&PortDescriptor::from_path("COM1")).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(store.load().is_none());
    }
}
