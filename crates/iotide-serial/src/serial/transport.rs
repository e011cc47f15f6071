//! Serial transport abstraction.
//!
//! Every backend (host-process bridge, in-process `serialport`, simulated
//! device) implements [`SerialTransport`]. Transports are push-based: bytes
//! read from the device are delivered to a [`TransportSink`] registered with
//! `subscribe`, in arrival order and in whatever fragment sizes the backend
//! happens to produce.

use crate::serial::types::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Event pushed by a transport to its subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw bytes received from the device.
    Data(Vec<u8>),
    /// Non-fatal error reported by the backend.
    Error(String),
    /// The link was lost. Sent at most once per open; never sent for an
    /// explicit `close()`.
    Closed(String),
}

pub type TransportSink = mpsc::UnboundedSender<TransportEvent>;

/// Platform-agnostic serial transport.
///
/// Implementations must be `Send + Sync` so they can be held behind an
/// `Arc` and used from multiple async tasks.
#[async_trait::async_trait]
pub trait SerialTransport: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Register the sink that receives events for the next open.
    fn subscribe(&self, sink: TransportSink);

    /// Open `port` exclusively with `config`.
    async fn open(&self, port: &PortDescriptor, config: &SerialConfig) -> Result<(), SerialError>;

    /// Release the port. Idempotent.
    async fn close(&self) -> Result<(), SerialError>;

    /// Write raw bytes. Nothing is appended.
    async fn write(&self, data: &[u8]) -> Result<usize, SerialError>;

    async fn list_ports(&self) -> Result<Vec<PortDescriptor>, SerialError>;

    fn is_open(&self) -> bool;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Sink slot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds the subscriber of a transport and guarantees that `Closed` is
/// delivered at most once per open.
#[derive(Default)]
pub(crate) struct SinkSlot {
    sink: Mutex<Option<TransportSink>>,
    closed: AtomicBool,
}

impl SinkSlot {
    pub fn set(&self, sink: TransportSink) {
        *lock(&self.sink) = Some(sink);
    }

    /// Re-arm the `Closed` guard for a fresh open.
    pub fn arm(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Suppress any further `Closed` (explicit close).
    pub fn disarm(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn data(&self, bytes: Vec<u8>) {
        self.send(TransportEvent::Data(bytes));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.send(TransportEvent::Error(message.into()));
    }

    /// Returns `true` when this call delivered the `Closed` event.
    pub fn closed(&self, reason: impl Into<String>) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.send(TransportEvent::Closed(reason.into()));
        true
    }

    fn send(&self, event: TransportEvent) {
        if let Some(sink) = lock(&self.sink).as_ref() {
            // A dropped receiver means nobody is listening any more.
            let _ = sink.send(event);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated transport (for testing & offline use)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scripted device behaviour: maps one write to the chunks the device
/// sends back.
pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

/// A fully in-memory transport useful for unit tests and offline demos.
pub struct SimulatedTransport {
    ports: Mutex<Vec<PortDescriptor>>,
    unavailable: Mutex<HashSet<String>>,
    open: AtomicBool,
    opened: Mutex<Option<(PortDescriptor, SerialConfig)>>,
    open_attempts: Mutex<Vec<String>>,
    responder: Mutex<Option<Responder>>,
    tx_log: Mutex<Vec<Vec<u8>>>,
    fail_writes: AtomicBool,
    fail_listing: AtomicBool,
    slot: SinkSlot,
}

impl SimulatedTransport {
    /// A simulated board on [`SimulatedTransport::default_port`] that never
    /// answers.
    pub fn new() -> Arc<Self> {
        Self::with_ports(vec![Self::default_port()])
    }

    pub fn with_ports(ports: Vec<PortDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            ports: Mutex::new(ports),
            unavailable: Mutex::new(HashSet::new()),
            open: AtomicBool::new(false),
            opened: Mutex::new(None),
            open_attempts: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            tx_log: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            fail_listing: AtomicBool::new(false),
            slot: SinkSlot::default(),
        })
    }

    pub fn default_port() -> PortDescriptor {
        PortDescriptor {
            path: "/dev/ttySIM0".to_string(),
            port_type: PortType::Virtual,
            manufacturer: Some("Espressif".to_string()),
            product: Some("Simulated Board".to_string()),
            serial_number: Some("SIM-0001".to_string()),
            vid: Some(0x303A),
            pid: Some(0x1001),
            display_name: "Simulated Board (/dev/ttySIM0)".to_string(),
        }
    }

    // ── Scripting ──────────────────────────────────────────────────

    pub fn set_responder(&self, responder: Responder) {
        *lock(&self.responder) = Some(responder);
    }

    /// Make `open` fail for `path` as if another program held the port.
    pub fn set_unavailable(&self, path: impl Into<String>) {
        lock(&self.unavailable).insert(path.into());
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Push bytes as if the device had sent them.
    pub fn inject_rx(&self, data: &[u8]) {
        if self.is_open() {
            self.slot.data(data.to_vec());
        }
    }

    /// Simulate the cable being pulled: the port closes and `Closed` is
    /// delivered once.
    pub fn simulate_unplug(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            *lock(&self.opened) = None;
            self.slot.closed("device unplugged");
        }
    }

    // ── Inspection ─────────────────────────────────────────────────

    /// Every write, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.tx_log).clone()
    }

    /// All written bytes concatenated.
    pub fn written_bytes(&self) -> Vec<u8> {
        lock(&self.tx_log).concat()
    }

    /// Paths passed to `open`, successful or not, in call order.
    pub fn open_attempts(&self) -> Vec<String> {
        lock(&self.open_attempts).clone()
    }

    pub fn opened_config(&self) -> Option<SerialConfig> {
        lock(&self.opened).as_ref().map(|(_, cfg)| cfg.clone())
    }

    // ── Canned responders ──────────────────────────────────────────

    /// Echo each written line followed by `\r\n`, then send the `>>> `
    /// prompt as a separate chunk. An interrupt (0x03) yields a fresh prompt.
    pub fn echo_repl() -> Responder {
        Arc::new(|data: &[u8]| {
            if data == [0x03] {
                return vec![b"\r\n>>> ".to_vec()];
            }
            let text = String::from_utf8_lossy(data);
            let mut chunks: Vec<Vec<u8>> = text
                .split_terminator('\n')
                .map(|line| format!("{}\r\n", line.trim_end_matches('\r')).into_bytes())
                .collect();
            chunks.push(b">>> ".to_vec());
            chunks
        })
    }

    /// Like [`echo_repl`](Self::echo_repl) but answers known lines with a
    /// canned output, sent together with the echo and the prompt.
    pub fn repl_with_replies(replies: Vec<(String, String)>) -> Responder {
        Arc::new(move |data: &[u8]| {
            if data == [0x03] {
                return vec![b"\r\n>>> ".to_vec()];
            }
            let text = String::from_utf8_lossy(data);
            let mut out = String::new();
            for line in text.split_terminator('\n') {
                let line = line.trim_end_matches('\r');
                out.push_str(line);
                out.push_str("\r\n");
                if let Some((_, reply)) = replies.iter().find(|(cmd, _)| cmd == line) {
                    out.push_str(reply);
                    out.push_str("\r\n");
                }
            }
            let prompt = if text.trim_end().ends_with(':') { "... " } else { ">>> " };
            out.push_str(prompt);
            vec![out.into_bytes()]
        })
    }
}

#[async_trait::async_trait]
impl SerialTransport for SimulatedTransport {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    fn subscribe(&self, sink: TransportSink) {
        self.slot.set(sink);
    }

    async fn open(&self, port: &PortDescriptor, config: &SerialConfig) -> Result<(), SerialError> {
        lock(&self.open_attempts).push(port.path.clone());
        if self.open.load(Ordering::SeqCst) {
            return Err(
                SerialError::new(SerialErrorKind::PortUnavailable, "Port already open")
                    .with_port(&port.path),
            );
        }
        if lock(&self.unavailable).contains(&port.path) {
            return Err(
                SerialError::new(SerialErrorKind::PortUnavailable, "Port is busy")
                    .with_port(&port.path),
            );
        }
        if !lock(&self.ports).iter().any(|p| p.path == port.path) {
            return Err(
                SerialError::new(SerialErrorKind::PortUnavailable, "No such port")
                    .with_port(&port.path),
            );
        }
        *lock(&self.opened) = Some((port.clone(), config.clone()));
        self.slot.arm();
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), SerialError> {
        self.slot.disarm();
        self.open.store(false, Ordering::SeqCst);
        *lock(&self.opened) = None;
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<usize, SerialError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SerialError::new(SerialErrorKind::NotConnected, "Port not open"));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SerialError::io("simulated write failure"));
        }
        lock(&self.tx_log).push(data.to_vec());

        let responder = lock(&self.responder).clone();
        if let Some(responder) = responder {
            for chunk in responder(data) {
                self.slot.data(chunk);
            }
        }
        Ok(data.len())
    }

    async fn list_ports(&self) -> Result<Vec<PortDescriptor>, SerialError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(SerialError::io("simulated enumeration failure"));
        }
        Ok(lock(&self.ports).clone())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened() -> (Arc<SimulatedTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let t = SimulatedTransport::new();
        let (tx, rx) = mpsc::unbounded_channel();
        t.subscribe(tx);
        (t, rx)
    }

    #[tokio::test]
    async fn test_simulated_transport_open_close() {
        let (t, _rx) = opened();
        assert!(!t.is_open());
        let port = SimulatedTransport::default_port();
        t.open(&port, &SerialConfig::for_port(&port.path, 115_200))
            .await
            .unwrap();
        assert!(t.is_open());
        t.close().await.unwrap();
        assert!(!t.is_open());
        // Idempotent.
        t.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_simulated_transport_unknown_port_fails() {
        let (t, _rx) = opened();
        let err = t
            .open(&PortDescriptor::from_path("/dev/nothing"), &SerialConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, SerialErrorKind::PortUnavailable);
        assert_eq!(err.port_name.as_deref(), Some("/dev/nothing"));
    }

    #[tokio::test]
    async fn test_simulated_transport_write_requires_open() {
        let (t, _rx) = opened();
        let err = t.write(b"x").await.unwrap_err();
        assert_eq!(err.kind, SerialErrorKind::NotConnected);
        assert!(t.written().is_empty());
    }

    #[tokio::test]
    async fn test_echo_repl_sends_echo_then_prompt() {
        let (t, mut rx) = opened();
        t.set_responder(SimulatedTransport::echo_repl());
        t.open(&SimulatedTransport::default_port(), &SerialConfig::default())
            .await
            .unwrap();

        t.write(b"1+1\n").await.unwrap();
        assert_eq!(rx.recv().await, Some(TransportEvent::Data(b"1+1\r\n".to_vec())));
        assert_eq!(rx.recv().await, Some(TransportEvent::Data(b">>> ".to_vec())));
        assert_eq!(t.written(), vec![b"1+1\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_unplug_emits_closed_once() {
        let (t, mut rx) = opened();
        t.open(&SimulatedTransport::default_port(), &SerialConfig::default())
            .await
            .unwrap();
        t.simulate_unplug();
        t.simulate_unplug();
        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed(_))));
        assert!(rx.try_recv().is_err());
        assert!(!t.is_open());
    }

    #[tokio::test]
    async fn test_explicit_close_does_not_emit_closed() {
        let (t, mut rx) = opened();
        t.open(&SimulatedTransport::default_port(), &SerialConfig::default())
            .await
            .unwrap();
        t.close().await.unwrap();
        t.simulate_unplug();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_busy_port_is_rejected() {
        let (t, _rx) = opened();
        t.set_unavailable("/dev/ttySIM0");
        let err = t
            .open(&SimulatedTransport::default_port(), &SerialConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, SerialErrorKind::PortUnavailable);
        assert_eq!(t.open_attempts(), vec!["/dev/ttySIM0".to_string()]);
    }

    #[test]
    fn test_repl_with_replies_uses_continuation_prompt_after_colon() {
        let responder = SimulatedTransport::repl_with_replies(vec![]);
        let chunks = responder(b"for i in range(3):\n");
        let text = String::from_utf8(chunks.concat()).unwrap();
        assert!(text.ends_with("... "));
    }
}
