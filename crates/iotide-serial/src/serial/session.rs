//! Serial session management.
//!
//! [`SerialSessionManager`] owns at most one live connection. It normalizes
//! every backend behind one interface, relays transport events to the event
//! table and implements the auto-connect policy.
//!
//! Each connection gets a generation number. The relay task of a connection
//! only acts while its generation is current, so late events from a closed
//! connection are dropped.

use crate::serial::device_store::LastDeviceStore;
use crate::serial::events::{EventKind, EventTable, ListenerId, SerialEvent};
use crate::serial::port_scanner::PortDiscovery;
use crate::serial::transport::{lock, SerialTransport, TransportEvent};
use crate::serial::types::*;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Byte counters for the current connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub bytes_rx: u64,
    pub bytes_tx: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Incremental UTF-8 decoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Decodes a byte stream as UTF-8, holding back an incomplete trailing
/// sequence until the next chunk. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Active {
    info: ConnectionInfo,
    generation: u64,
    relay: JoinHandle<()>,
}

struct Shared {
    transport: Arc<dyn SerialTransport>,
    discovery: PortDiscovery,
    events: EventTable,
    active: Mutex<Option<Active>>,
    state_tx: watch::Sender<SessionState>,
    generation: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
    bytes_rx: AtomicU64,
    bytes_tx: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    /// Read-side loss of the device for connection `generation`.
    async fn connection_lost(&self, generation: u64, reason: &str) {
        let lost = {
            let mut active = lock(&self.active);
            match active.as_ref() {
                Some(a) if a.generation == generation => active.take(),
                _ => None,
            }
        };
        if let Some(lost) = lost {
            self.generation.fetch_add(1, Ordering::SeqCst);
            log::warn!("Lost connection to {}: {}", lost.info.port.path, reason);
            if let Err(e) = self.transport.close().await {
                log::debug!("Close after loss failed: {}", e);
            }
            self.set_state(SessionState::Disconnected);
            self.events.emit(&SerialEvent::Disconnected);
        }
    }
}

async fn relay(shared: Weak<Shared>, generation: u64, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
    let mut decoder = Utf8Decoder::default();
    while let Some(event) = rx.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        if shared.generation.load(Ordering::SeqCst) != generation {
            break;
        }
        match event {
            TransportEvent::Data(bytes) => {
                shared.bytes_rx.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                let text = decoder.push(&bytes);
                if !text.is_empty() {
                    shared.events.emit(&SerialEvent::Data(text));
                }
            }
            TransportEvent::Error(message) => {
                log::warn!("Serial error: {}", message);
                shared.events.emit(&SerialEvent::Error(message));
            }
            TransportEvent::Closed(reason) => {
                shared.connection_lost(generation, &reason).await;
                break;
            }
        }
    }
}

/// Write failures that mean the device or the link to it is gone.
fn is_link_loss(err: &SerialError) -> bool {
    matches!(
        err.kind,
        SerialErrorKind::NotConnected | SerialErrorKind::Disconnected | SerialErrorKind::IoError
    )
}

/// Owner of the single device connection.
#[derive(Clone)]
pub struct SerialSessionManager {
    shared: Arc<Shared>,
}

impl SerialSessionManager {
    pub fn new(transport: Arc<dyn SerialTransport>, store: LastDeviceStore) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                discovery: PortDiscovery::new(transport.clone(), store),
                transport,
                events: EventTable::new(),
                active: Mutex::new(None),
                state_tx,
                generation: AtomicU64::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
                bytes_rx: AtomicU64::new(0),
                bytes_tx: AtomicU64::new(0),
            }),
        }
    }

    // ── Connection lifecycle ───────────────────────────────────────

    /// Connect to `port`, or auto-connect when `port` is `None`.
    ///
    /// Any existing connection is closed first. Concurrent calls are
    /// serialized.
    pub async fn connect(
        &self,
        port: Option<PortDescriptor>,
        baud_rate: u32,
    ) -> Result<ConnectionInfo, SerialError> {
        let _guard = self.shared.connect_lock.lock().await;
        self.close_active().await;
        match port {
            Some(port) => self.open_port(port, baud_rate).await,
            None => self.auto_connect_locked(baud_rate).await,
        }
    }

    /// Last device first, then enumerated ports in rank order, at the
    /// default baud rate.
    pub async fn auto_connect(&self) -> Result<ConnectionInfo, SerialError> {
        self.connect(None, DEFAULT_BAUD_RATE).await
    }

    pub async fn disconnect(&self) -> Result<(), SerialError> {
        self.close_active().await;
        Ok(())
    }

    /// Explicit teardown.
    pub async fn shutdown(&self) {
        self.close_active().await;
        log::debug!("Session manager shut down");
    }

    async fn auto_connect_locked(&self, baud_rate: u32) -> Result<ConnectionInfo, SerialError> {
        let discovery = &self.shared.discovery;
        let ranked = discovery.ranked_ports().await;

        let mut candidates: Vec<PortDescriptor> = Vec::with_capacity(ranked.len() + 1);
        if let Some(record) = discovery.load_last_device() {
            let last = ranked
                .iter()
                .find(|p| p.path == record.path)
                .cloned()
                .unwrap_or_else(|| record.to_descriptor());
            candidates.push(last);
        }
        for port in ranked {
            if !candidates.iter().any(|c| c.path == port.path) {
                candidates.push(port);
            }
        }

        if candidates.is_empty() {
            return Err(SerialError::new(
                SerialErrorKind::PortUnavailable,
                "No serial ports found",
            ));
        }

        let mut last_err = None;
        for port in candidates {
            log::info!("Auto-connect: trying {}", port.display_name);
            match self.open_port(port, baud_rate).await {
                Ok(info) => return Ok(info),
                Err(e) => {
                    log::warn!("Auto-connect: {}", e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            SerialError::new(SerialErrorKind::PortUnavailable, "No port could be opened")
        }))
    }

    async fn open_port(
        &self,
        port: PortDescriptor,
        baud_rate: u32,
    ) -> Result<ConnectionInfo, SerialError> {
        let shared = &self.shared;
        shared.set_state(SessionState::Connecting);

        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        shared.transport.subscribe(tx);

        let config = SerialConfig::for_port(&port.path, baud_rate);
        if let Err(e) = shared.transport.open(&port, &config).await {
            shared.set_state(SessionState::Disconnected);
            return Err(e);
        }

        let info = ConnectionInfo {
            backend: shared.transport.kind(),
            port,
            baud_rate,
            connected_at: Utc::now(),
        };
        if let Err(e) = shared.discovery.save_last_device(&info.port) {
            log::warn!("Could not remember last device: {}", e);
        }

        shared.bytes_rx.store(0, Ordering::Relaxed);
        shared.bytes_tx.store(0, Ordering::Relaxed);
        {
            let mut active = lock(&shared.active);
            let relay = tokio::spawn(relay(Arc::downgrade(shared), generation, rx));
            *active = Some(Active { info: info.clone(), generation, relay });
        }
        shared.set_state(SessionState::Connected);
        log::info!(
            "Connected to {} at {} baud ({})",
            info.port.path,
            baud_rate,
            info.backend.label()
        );
        Ok(info)
    }

    /// Close the active connection, emitting `Disconnected` once if there
    /// was one.
    async fn close_active(&self) {
        let shared = &self.shared;
        let active = lock(&shared.active).take();
        shared.generation.fetch_add(1, Ordering::SeqCst);
        let Some(active) = active else {
            shared.set_state(SessionState::Disconnected);
            return;
        };
        active.relay.abort();
        if let Err(e) = shared.transport.close().await {
            log::warn!("Error closing {}: {}", active.info.port.path, e);
        }
        shared.set_state(SessionState::Disconnected);
        log::info!("Disconnected from {}", active.info.port.path);
        shared.events.emit(&SerialEvent::Disconnected);
    }

    // ── I/O ────────────────────────────────────────────────────────

    /// Write raw bytes to the device.
    pub async fn send(&self, data: &[u8]) -> Result<(), SerialError> {
        if self.state() != SessionState::Connected {
            return Err(SerialError::not_connected());
        }
        if let Err(e) = self.shared.transport.write(data).await {
            self.write_failed(&e).await;
            return Err(e);
        }
        self.shared.bytes_tx.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Report a failed write as an `error` event. Failures that mean the
    /// device is gone also tear the connection down.
    async fn write_failed(&self, err: &SerialError) {
        let shared = &self.shared;
        log::warn!("Write failed: {}", err);
        shared.events.emit(&SerialEvent::Error(err.message.clone()));

        if is_link_loss(err) {
            let generation = lock(&shared.active).as_ref().map(|a| a.generation);
            if let Some(generation) = generation {
                shared.connection_lost(generation, &err.message).await;
            }
        }
    }

    // ── Events ─────────────────────────────────────────────────────

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&SerialEvent) + Send + Sync + 'static,
    {
        self.shared.events.on(kind, listener)
    }

    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.shared.events.off(kind, id)
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.shared.events.listener_count(kind)
    }

    // ── Introspection ──────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn connection(&self) -> Option<ConnectionInfo> {
        lock(&self.shared.active).as_ref().map(|a| a.info.clone())
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_rx: self.shared.bytes_rx.load(Ordering::Relaxed),
            bytes_tx: self.shared.bytes_tx.load(Ordering::Relaxed),
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.shared.transport.kind()
    }

    pub fn discovery(&self) -> &PortDiscovery {
        &self.shared.discovery
    }
}
