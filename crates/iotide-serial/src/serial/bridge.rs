//! Host-process transport.
//!
//! A separate bridge process owns the physical port. This process talks to
//! it over line-delimited JSON on the bridge's stdin/stdout:
//!
//! ```text
//! -> {"id":1,"op":"connect","path":"/dev/ttyUSB0","baudRate":115200}
//! <- {"type":"response","id":1,"success":true}
//! -> {"id":2,"op":"sendData","data":"MSsxCg=="}
//! <- {"type":"response","id":2,"success":true}
//! <- {"type":"dataReceived","data":"MSsxDQo="}
//! <- {"type":"disconnected"}
//! ```
//!
//! [`HostProcessTransport`] is the client side; [`serve`] is the bridge side
//! and runs inside the `serial-bridge` binary on top of any other transport.

use crate::serial::transport::{lock, SerialTransport, SinkSlot, TransportEvent, TransportSink};
use crate::serial::types::*;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

/// Upper bound on a single bridge round trip.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Wire format
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum BridgeOp {
    ListPorts,
    Connect {
        path: String,
        #[serde(rename = "baudRate")]
        baud_rate: u32,
    },
    /// Base64-encoded raw bytes.
    SendData { data: String },
    Disconnect,
    IsConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub id: u64,
    #[serde(flatten)]
    pub op: BridgeOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeMessage {
    Response {
        id: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ports: Option<Vec<PortDescriptor>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connected: Option<bool>,
    },
    DataReceived { data: String },
    Error { message: String },
    Disconnected,
}

impl BridgeMessage {
    fn ok(id: u64) -> Self {
        Self::Response { id, success: true, error: None, ports: None, connected: None }
    }

    fn failed(id: u64, error: impl Into<String>) -> Self {
        Self::Response { id, success: false, error: Some(error.into()), ports: None, connected: None }
    }
}

pub fn encode_bytes(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn decode_bytes(data: &str) -> Result<Vec<u8>, SerialError> {
    STANDARD
        .decode(data)
        .map_err(|e| SerialError::new(SerialErrorKind::ProtocolError, format!("Invalid base64 payload: {}", e)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Client side
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
struct Reply {
    success: bool,
    error: Option<String>,
    ports: Option<Vec<PortDescriptor>>,
    connected: Option<bool>,
}

struct BridgeLink {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    outgoing: mpsc::UnboundedSender<String>,
    alive: AtomicBool,
    open: AtomicBool,
    slot: SinkSlot,
}

/// Removes a request from the pending map when dropped.
struct PendingEntry<'a> {
    link: &'a BridgeLink,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock(&self.link.pending).remove(&self.id);
    }
}

impl BridgeLink {
    fn handle_line(&self, line: &str) {
        let message: BridgeMessage = match serde_json::from_str(line) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Ignoring malformed bridge message: {} ({})", line, e);
                return;
            }
        };
        match message {
            BridgeMessage::Response { id, success, error, ports, connected } => {
                match lock(&self.pending).remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(Reply { success, error, ports, connected });
                    }
                    None => log::debug!("Bridge response for unknown request {}", id),
                }
            }
            BridgeMessage::DataReceived { data } => match decode_bytes(&data) {
                Ok(bytes) => self.slot.data(bytes),
                Err(e) => self.slot.error(e.message),
            },
            BridgeMessage::Error { message } => self.slot.error(message),
            BridgeMessage::Disconnected => {
                if self.open.swap(false, Ordering::SeqCst) {
                    self.slot.closed("device disconnected");
                }
            }
        }
    }

    /// The bridge went away: close the link and fail everything pending.
    fn shutdown(&self, reason: &str) {
        self.alive.store(false, Ordering::SeqCst);
        if self.open.swap(false, Ordering::SeqCst) {
            self.slot.closed(reason);
        }
        lock(&self.pending).clear();
    }
}

/// Transport that delegates to a serial bridge process.
pub struct HostProcessTransport {
    link: Arc<BridgeLink>,
    child: Mutex<Option<tokio::process::Child>>,
}

impl HostProcessTransport {
    /// Spawn `program` and talk to it over its stdin/stdout.
    pub fn spawn(program: &Path) -> Result<Arc<Self>, SerialError> {
        let mut child = tokio::process::Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SerialError::new(
                    SerialErrorKind::TransportNotSupported,
                    format!("Cannot start serial bridge {}: {}", program.display(), e),
                )
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            return Err(SerialError::new(
                SerialErrorKind::TransportNotSupported,
                "Serial bridge pipes unavailable",
            ));
        };

        log::info!("Started serial bridge {}", program.display());
        let transport = Self::from_streams(stdout, stdin);
        *lock(&transport.child) = Some(child);
        Ok(transport)
    }

    /// Talk to a bridge over arbitrary streams.
    pub fn from_streams<R, W>(reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let link = Arc::new(BridgeLink {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outgoing: out_tx,
            alive: AtomicBool::new(true),
            open: AtomicBool::new(false),
            slot: SinkSlot::default(),
        });

        // ── Writer task ────────────────────────────────────────────
        let write_link = link.clone();
        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = out_rx.recv().await {
                let res = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = res {
                    log::error!("Bridge write failed: {}", e);
                    write_link.shutdown("serial bridge closed its input");
                    break;
                }
            }
        });

        // ── Reader task ────────────────────────────────────────────
        let read_link = link.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => read_link.handle_line(&line),
                    Ok(None) => {
                        log::warn!("Serial bridge exited");
                        break;
                    }
                    Err(e) => {
                        log::error!("Bridge read failed: {}", e);
                        break;
                    }
                }
            }
            read_link.shutdown("serial bridge exited");
        });

        Arc::new(Self { link, child: Mutex::new(None) })
    }

    async fn request(&self, op: BridgeOp) -> Result<Reply, SerialError> {
        if !self.link.alive.load(Ordering::SeqCst) {
            return Err(SerialError::io("Serial bridge is not running"));
        }
        let id = self.link.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&BridgeRequest { id, op })
            .map_err(|e| SerialError::new(SerialErrorKind::ProtocolError, e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.link.pending).insert(id, tx);
        // Dropped on every exit, including when the caller gives up first.
        let _entry = PendingEntry { link: &self.link, id };
        if self.link.outgoing.send(line).is_err() {
            return Err(SerialError::io("Serial bridge is not running"));
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SerialError::new(
                SerialErrorKind::Disconnected,
                "Serial bridge exited before replying",
            )),
            Err(_) => Err(SerialError::timeout(REQUEST_TIMEOUT.as_millis() as u64)),
        }
    }

    fn reply_error(reply: &Reply, kind: SerialErrorKind) -> SerialError {
        SerialError::new(kind, reply.error.clone().unwrap_or_else(|| "Bridge request failed".into()))
    }
}

#[async_trait::async_trait]
impl SerialTransport for HostProcessTransport {
    fn kind(&self) -> BackendKind {
        BackendKind::HostProcess
    }

    fn subscribe(&self, sink: TransportSink) {
        self.link.slot.set(sink);
    }

    async fn open(&self, port: &PortDescriptor, config: &SerialConfig) -> Result<(), SerialError> {
        let reply = self
            .request(BridgeOp::Connect { path: port.path.clone(), baud_rate: config.baud_rate })
            .await
            .map_err(|e| e.with_port(&port.path))?;
        if !reply.success {
            return Err(Self::reply_error(&reply, SerialErrorKind::PortUnavailable).with_port(&port.path));
        }
        self.link.slot.arm();
        self.link.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), SerialError> {
        self.link.slot.disarm();
        if !self.link.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        match self.request(BridgeOp::Disconnect).await {
            Ok(reply) if !reply.success => {
                log::warn!("Bridge disconnect failed: {:?}", reply.error);
            }
            Err(e) => log::warn!("Bridge disconnect failed: {}", e),
            Ok(_) => {}
        }
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<usize, SerialError> {
        if !self.link.open.load(Ordering::SeqCst) {
            return Err(SerialError::new(SerialErrorKind::NotConnected, "Port not open"));
        }
        let reply = self.request(BridgeOp::SendData { data: encode_bytes(data) }).await?;
        if !reply.success {
            return Err(Self::reply_error(&reply, SerialErrorKind::IoError));
        }
        Ok(data.len())
    }

    async fn list_ports(&self) -> Result<Vec<PortDescriptor>, SerialError> {
        let reply = self.request(BridgeOp::ListPorts).await?;
        if !reply.success {
            return Err(Self::reply_error(&reply, SerialErrorKind::IoError));
        }
        Ok(reply.ports.unwrap_or_default())
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }
}

impl HostProcessTransport {
    /// Ask the bridge whether it holds an open port.
    pub async fn bridge_connected(&self) -> Result<bool, SerialError> {
        let reply = self.request(BridgeOp::IsConnected).await?;
        Ok(reply.connected.unwrap_or(false))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Bridge side
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serve bridge requests from `input`, answering on `output`, until
/// `input` reaches EOF. Device events are interleaved on `output`.
pub async fn serve<R, W>(
    transport: Arc<dyn SerialTransport>,
    input: R,
    output: W,
) -> Result<(), SerialError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<BridgeMessage>();

    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(message) = out_rx.recv().await {
            let mut line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(e) => {
                    log::error!("Cannot encode bridge message: {}", e);
                    continue;
                }
            };
            line.push('\n');
            if let Err(e) = output.write_all(line.as_bytes()).await {
                log::error!("Bridge output closed: {}", e);
                break;
            }
            let _ = output.flush().await;
        }
    });

    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    transport.subscribe(ev_tx);
    let events_out = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = ev_rx.recv().await {
            let message = match event {
                TransportEvent::Data(bytes) => BridgeMessage::DataReceived { data: encode_bytes(&bytes) },
                TransportEvent::Error(message) => BridgeMessage::Error { message },
                TransportEvent::Closed(reason) => {
                    log::warn!("Device link closed: {}", reason);
                    BridgeMessage::Disconnected
                }
            };
            if events_out.send(message).is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(input).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("Bridge input failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<BridgeRequest>(&line) {
            Ok(request) => handle_request(transport.as_ref(), request).await,
            Err(e) => {
                log::warn!("Malformed bridge request: {}", e);
                match serde_json::from_str::<serde_json::Value>(&line)
                    .ok()
                    .and_then(|v| v.get("id").and_then(serde_json::Value::as_u64))
                {
                    Some(id) => BridgeMessage::failed(id, format!("Malformed request: {}", e)),
                    None => continue,
                }
            }
        };
        if out_tx.send(reply).is_err() {
            break;
        }
    }

    log::info!("Bridge input closed, releasing port");
    let _ = transport.close().await;
    forwarder.abort();
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

async fn handle_request(transport: &dyn SerialTransport, request: BridgeRequest) -> BridgeMessage {
    let id = request.id;
    match request.op {
        BridgeOp::ListPorts => match transport.list_ports().await {
            Ok(ports) => BridgeMessage::Response {
                id,
                success: true,
                error: None,
                ports: Some(ports),
                connected: None,
            },
            Err(e) => BridgeMessage::failed(id, e.message),
        },
        BridgeOp::Connect { path, baud_rate } => {
            if transport.is_open() {
                let _ = transport.close().await;
            }
            let port = PortDescriptor::from_path(&path);
            match transport.open(&port, &SerialConfig::for_port(&path, baud_rate)).await {
                Ok(()) => BridgeMessage::ok(id),
                Err(e) => BridgeMessage::failed(id, e.message),
            }
        }
        BridgeOp::SendData { data } => {
            let bytes = match decode_bytes(&data) {
                Ok(bytes) => bytes,
                Err(e) => return BridgeMessage::failed(id, e.message),
            };
            match transport.write(&bytes).await {
                Ok(_) => BridgeMessage::ok(id),
                Err(e) => BridgeMessage::failed(id, e.message),
            }
        }
        BridgeOp::Disconnect => match transport.close().await {
            Ok(()) => BridgeMessage::ok(id),
            Err(e) => BridgeMessage::failed(id, e.message),
        },
        BridgeOp::IsConnected => BridgeMessage::Response {
            id,
            success: true,
            error: None,
            ports: None,
            connected: Some(transport.is_open()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::device_store::LastDeviceStore;
    use crate::serial::repl::ReplClient;
    use crate::serial::session::SerialSessionManager;
    use crate::serial::transport::SimulatedTransport;
    use serde_json::json;

    fn wired(sim: Arc<SimulatedTransport>) -> Arc<HostProcessTransport> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        tokio::spawn(serve(sim, server_read, server_write));
        HostProcessTransport::from_streams(client_read, client_write)
    }

    #[test]
    fn test_request_wire_format() {
        let req = BridgeRequest {
            id: 3,
            op: BridgeOp::Connect { path: "COM3".into(), baud_rate: 115_200 },
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"id": 3, "op": "connect", "path": "COM3", "baudRate": 115200})
        );
        let list = BridgeRequest { id: 1, op: BridgeOp::ListPorts };
        assert_eq!(serde_json::to_value(&list).unwrap(), json!({"id": 1, "op": "listPorts"}));
    }

    #[test]
    fn test_message_wire_format() {
        assert_eq!(
            serde_json::to_value(BridgeMessage::Disconnected).unwrap(),
            json!({"type": "disconnected"})
        );
        assert_eq!(
            serde_json::to_value(BridgeMessage::ok(9)).unwrap(),
            json!({"type": "response", "id": 9, "success": true})
        );
        let parsed: BridgeMessage =
            serde_json::from_str(r#"{"type":"dataReceived","data":"aGk="}"#).unwrap();
        assert_eq!(parsed, BridgeMessage::DataReceived { data: "aGk=".into() });
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        let err = decode_bytes("***").unwrap_err();
        assert_eq!(err.kind, SerialErrorKind::ProtocolError);
    }

    #[tokio::test]
    async fn test_round_trip_through_bridge() {
        let sim = SimulatedTransport::new();
        sim.set_responder(SimulatedTransport::echo_repl());
        let host = wired(sim.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        host.subscribe(tx);

        let ports = host.list_ports().await.unwrap();
        assert_eq!(ports[0].path, "/dev/ttySIM0");

        host.open(&ports[0], &SerialConfig::for_port(&ports[0].path, 115_200))
            .await
            .unwrap();
        assert!(host.is_open());
        assert!(host.bridge_connected().await.unwrap());

        host.write(b"1+1\n").await.unwrap();
        let mut received = Vec::new();
        while !String::from_utf8_lossy(&received).contains(">>>") {
            match rx.recv().await {
                Some(TransportEvent::Data(bytes)) => received.extend(bytes),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(String::from_utf8_lossy(&received), "1+1\r\n>>> ");
        assert_eq!(sim.written(), vec![b"1+1\n".to_vec()]);

        sim.simulate_unplug();
        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed(_))));
        assert!(!host.is_open());
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let sim = SimulatedTransport::new();
        sim.set_unavailable("/dev/ttySIM0");
        let host = wired(sim);
        let err = host
            .open(&SimulatedTransport::default_port(), &SerialConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, SerialErrorKind::PortUnavailable);
        assert!(!host.is_open());
    }

    #[tokio::test]
    async fn test_bridge_exit_closes_transport() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let host = HostProcessTransport::from_streams(client_read, client_write);
        let (tx, mut rx) = mpsc::unbounded_channel();
        host.subscribe(tx);

        // Fake bridge: accept the connect, then exit.
        let (server_read, mut server_write) = tokio::io::split(server);
        let fake = tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let req: BridgeRequest = serde_json::from_str(&line).unwrap();
            let reply = serde_json::to_string(&BridgeMessage::ok(req.id)).unwrap();
            server_write.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
            server_write.flush().await.unwrap();
            drop(lines);
            drop(server_write);
        });

        host.open(&PortDescriptor::from_path("COM1"), &SerialConfig::default())
            .await
            .unwrap();
        fake.await.unwrap();

        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed(_))));
        assert!(!host.is_open());
        assert!(host.write(b"x").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_deadline_covers_stalled_bridge_write() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let host = HostProcessTransport::from_streams(client_read, client_write);

        // Fake bridge: accept the connect, then read requests without replying.
        let (server_read, mut server_write) = tokio::io::split(server);
        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let req: BridgeRequest = serde_json::from_str(&line).unwrap();
            let reply = serde_json::to_string(&BridgeMessage::ok(req.id)).unwrap();
            server_write.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
            server_write.flush().await.unwrap();
            while let Ok(Some(_)) = lines.next_line().await {}
            drop(server_write);
        });

        let session = SerialSessionManager::new(host.clone(), LastDeviceStore::in_dir(dir.path()));
        session
            .connect(Some(PortDescriptor::from_path("COM1")), 115_200)
            .await
            .unwrap();
        let repl = ReplClient::new(session);

        let started = tokio::time::Instant::now();
        let err = repl
            .send_command_and_wait("1+1", Duration::from_millis(2000))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.kind, SerialErrorKind::Timeout);
        assert!(err.message.contains("2000"));
        assert!(elapsed >= Duration::from_millis(2000));
        assert!(elapsed < Duration::from_millis(2100));
        assert!(lock(&host.link.pending).is_empty());
    }
}
