//! In-process transport backed by the `serialport` crate.
//!
//! The port is opened in this process. A dedicated reader thread performs
//! blocking reads on a cloned handle and pushes chunks to the subscriber;
//! writes run on the blocking pool.

use crate::serial::port_scanner::descriptor_from_os;
use crate::serial::transport::{lock, SerialTransport, SinkSlot};
use crate::serial::types::*;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

type PortHandle = Box<dyn serialport::SerialPort>;

// ── Config conversions ─────────────────────────────────────────────

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::XonXoff => serialport::FlowControl::Software,
            FlowControl::RtsCts => serialport::FlowControl::Hardware,
        }
    }
}

fn map_open_error(err: serialport::Error, port: &str) -> SerialError {
    let kind = match err.kind() {
        serialport::ErrorKind::InvalidInput => SerialErrorKind::InvalidConfig,
        serialport::ErrorKind::NoDevice | serialport::ErrorKind::Io(_) => {
            SerialErrorKind::PortUnavailable
        }
        serialport::ErrorKind::Unknown => SerialErrorKind::IoError,
    };
    SerialError::new(kind, format!("Failed to open serial port {}: {}", port, err)).with_port(port)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  InProcessTransport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Detached reader thread; it exits within one read timeout of `stop`.
struct Reader {
    stop: Arc<AtomicBool>,
    _thread: JoinHandle<()>,
}

pub struct InProcessTransport {
    writer: Arc<Mutex<Option<PortHandle>>>,
    reader: Mutex<Option<Reader>>,
    open: Arc<AtomicBool>,
    slot: Arc<SinkSlot>,
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self {
            writer: Arc::new(Mutex::new(None)),
            reader: Mutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
            slot: Arc::new(SinkSlot::default()),
        }
    }

    fn spawn_reader(&self, mut port: PortHandle, port_name: String) -> Result<Reader, SerialError> {
        let stop = Arc::new(AtomicBool::new(false));
        let open = self.open.clone();
        let slot = self.slot.clone();
        let stop_flag = stop.clone();

        let thread = std::thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || {
                let mut buf = [0u8; 1024];
                loop {
                    if stop_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    match port.read(&mut buf) {
                        Ok(0) => continue,
                        Ok(n) => slot.data(buf[..n].to_vec()),
                        Err(e)
                            if e.kind() == std::io::ErrorKind::TimedOut
                                || e.kind() == std::io::ErrorKind::Interrupted =>
                        {
                            continue
                        }
                        Err(e) => {
                            if !stop_flag.load(Ordering::SeqCst) {
                                log::warn!("Serial read error on {}: {}", port_name, e);
                                open.store(false, Ordering::SeqCst);
                                slot.closed(e.to_string());
                            }
                            break;
                        }
                    }
                }
                log::debug!("Reader thread for {} finished", port_name);
            })
            .map_err(|e| SerialError::io(format!("Cannot start reader thread: {}", e)))?;

        Ok(Reader { stop, _thread: thread })
    }

    fn stop_reader(&self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.stop.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait::async_trait]
impl SerialTransport for InProcessTransport {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    fn subscribe(&self, sink: crate::serial::transport::TransportSink) {
        self.slot.set(sink);
    }

    async fn open(&self, port: &PortDescriptor, config: &SerialConfig) -> Result<(), SerialError> {
        if self.open.load(Ordering::SeqCst) {
            return Err(
                SerialError::new(SerialErrorKind::PortUnavailable, "Port already open")
                    .with_port(&port.path),
            );
        }

        let path = port.path.clone();
        let cfg = config.clone();
        let handle = tokio::task::spawn_blocking(move || {
            serialport::new(&path, cfg.baud_rate)
                .data_bits(cfg.data_bits.into())
                .parity(cfg.parity.into())
                .stop_bits(cfg.stop_bits.into())
                .flow_control(cfg.flow_control.into())
                .timeout(Duration::from_millis(cfg.read_timeout_ms))
                .open()
                .map_err(|e| map_open_error(e, &path))
        })
        .await
        .map_err(|e| SerialError::io(format!("Task join error: {}", e)))??;

        let reader_handle = handle
            .try_clone()
            .map_err(|e| map_open_error(e, &port.path))?;

        self.slot.arm();
        *lock(&self.writer) = Some(handle);
        self.open.store(true, Ordering::SeqCst);
        let reader = self.spawn_reader(reader_handle, port.path.clone())?;
        *lock(&self.reader) = Some(reader);

        log::info!("Opened {} at {}", port.path, config.shorthand());
        Ok(())
    }

    async fn close(&self) -> Result<(), SerialError> {
        self.slot.disarm();
        self.open.store(false, Ordering::SeqCst);
        self.stop_reader();
        lock(&self.writer).take();
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<usize, SerialError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SerialError::new(SerialErrorKind::NotConnected, "Port not open"));
        }
        let writer = self.writer.clone();
        let bytes = data.to_vec();
        tokio::task::spawn_blocking(move || -> Result<usize, SerialError> {
            let mut guard = lock(&writer);
            let port = guard
                .as_mut()
                .ok_or_else(|| SerialError::new(SerialErrorKind::NotConnected, "Port not open"))?;
            port.write_all(&bytes)
                .and_then(|_| port.flush())
                .map_err(|e| SerialError::io(format!("Write failed: {}", e)))?;
            Ok(bytes.len())
        })
        .await
        .map_err(|e| SerialError::io(format!("Task join error: {}", e)))?
    }

    async fn list_ports(&self) -> Result<Vec<PortDescriptor>, SerialError> {
        tokio::task::spawn_blocking(|| -> Result<Vec<PortDescriptor>, SerialError> {
            let ports = serialport::available_ports()
                .map_err(|e| SerialError::io(format!("Failed to list serial ports: {}", e)))?;
            Ok(ports.iter().map(descriptor_from_os).collect())
        })
        .await
        .map_err(|e| SerialError::io(format!("Task join error: {}", e)))?
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_conversions() {
        assert_eq!(serialport::DataBits::from(DataBits::Eight), serialport::DataBits::Eight);
        assert_eq!(serialport::Parity::from(Parity::Even), serialport::Parity::Even);
        assert_eq!(serialport::StopBits::from(StopBits::One), serialport::StopBits::One);
        assert_eq!(
            serialport::FlowControl::from(FlowControl::None),
            serialport::FlowControl::None
        );
    }

    #[tokio::test]
    async fn test_write_without_open_is_not_connected() {
        let t = InProcessTransport::new();
        let err = t.write(b"x").await.unwrap_err();
        assert_eq!(err.kind, SerialErrorKind::NotConnected);
        assert!(!t.is_open());
        assert_eq!(t.kind(), BackendKind::InProcess);
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let t = InProcessTransport::new();
        let port = PortDescriptor::from_path("/dev/iotide-does-not-exist");
        let err = t
            .open(&port, &SerialConfig::for_port(&port.path, 115_200))
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind,
            SerialErrorKind::PortUnavailable | SerialErrorKind::IoError
        ));
        assert!(!t.is_open());
    }

    #[tokio::test]
    async fn test_close_without_open_is_ok() {
        let t = InProcessTransport::new();
        t.close().await.unwrap();
        t.close().await.unwrap();
    }
}
